use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::analyzer::AnalyzerType;
use crate::policy::{ExecutionConfig, RecoveryConfig};

/// Top-level orchestrator configuration (TOML).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Database and sample storage locations.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Background loop tunables.
    #[serde(default)]
    pub engine: EngineSettings,
    /// Startup recovery scanner.
    #[serde(default)]
    pub recovery: RecoveryConfig,
    /// Execution parameters used when a batch is started without its own.
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Log output.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Analyzer instances upserted into the store at startup.
    #[serde(default)]
    pub instances: Vec<InstanceSeed>,
}

/// Storage locations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file.
    pub database_path: PathBuf,
    /// Sample directory (holds `catalog.json` and one blob per sample id).
    pub samples_dir: PathBuf,
    /// Upper bound for a single store call.
    pub store_timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("samplefarm.db"),
            samples_dir: PathBuf::from("samples"),
            store_timeout_secs: 10,
        }
    }
}

/// Background loop tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Global cap on concurrent submissions and polls.
    pub max_concurrency: usize,
    /// Sleep of an idle dispatch loop before it looks for work again.
    pub dispatch_idle_ms: u64,
    /// Poller wake-up tick (each batch still honors its own poll interval).
    pub poll_tick_ms: u64,
    /// Health checker wake-up tick.
    pub health_tick_secs: u64,
    /// Failed-task sweep tick.
    pub sweep_tick_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 16,
            dispatch_idle_ms: 1_000,
            poll_tick_ms: 1_000,
            health_tick_secs: 5,
            sweep_tick_secs: 300,
        }
    }
}

/// Log output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
    /// Also append logs to this file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

/// Analyzer instance declared in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSeed {
    /// Unique instance name.
    pub name: String,
    /// Backend family.
    pub analyzer: AnalyzerType,
    /// Base URL, e.g. `http://10.0.0.5:8000/apiv2`.
    pub base_url: String,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether the instance receives work.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Per-request timeout; family default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    /// Concurrent task cap; family default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_tasks: Option<u32>,
    /// Health probe interval; family default when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_interval: Option<u64>,
}

fn default_true() -> bool {
    true
}

impl InstanceSeed {
    fn normalize(&mut self) {
        self.name = self.name.trim().to_string();
        self.base_url = self.base_url.trim().trim_end_matches('/').to_string();
        self.description = self.description.as_ref().map(|s| s.trim().to_string());
        if matches!(self.description.as_deref(), Some(s) if s.is_empty()) {
            self.description = None;
        }
    }
}

impl OrchestratorConfig {
    /// Read and validate a TOML config file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("loading config: {}", path.display()))
    }

    /// Parse and validate TOML text.
    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        let mut cfg: OrchestratorConfig = toml::from_str(raw).context("parsing TOML")?;
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load `path` when given (it must exist), otherwise the default location
    /// when present, otherwise built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        let path = default_config_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    /// Write the config atomically (temp file + rename).
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let dir = path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("invalid config path: {}", path.display()))?;
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }

        let mut cfg = self.clone();
        cfg.normalize();

        let raw = toml::to_string_pretty(&cfg)?;
        let tmp = path.with_extension("toml.tmp");
        std::fs::write(&tmp, raw)?;
        std::fs::rename(tmp, path)?;
        Ok(())
    }

    fn normalize(&mut self) {
        self.logging.level = self.logging.level.trim().to_string();
        if self.logging.level.is_empty() {
            self.logging.level = LoggingConfig::default().level;
        }
        for seed in &mut self.instances {
            seed.normalize();
        }
    }

    /// Reject invalid settings with a readable message.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.engine.max_concurrency == 0 {
            anyhow::bail!("engine.max_concurrency must be >= 1");
        }
        if self.storage.store_timeout_secs == 0 {
            anyhow::bail!("storage.store_timeout_secs must be >= 1");
        }
        self.recovery.validate()?;
        self.execution.validate()?;

        let mut names = std::collections::HashSet::new();
        for seed in &self.instances {
            if seed.name.is_empty() {
                anyhow::bail!("instances: name must not be empty");
            }
            if !names.insert(seed.name.as_str()) {
                anyhow::bail!("instances: duplicate name {:?}", seed.name);
            }
            if !(seed.base_url.starts_with("http://") || seed.base_url.starts_with("https://")) {
                anyhow::bail!(
                    "instances.{}: base_url must start with http:// or https://",
                    seed.name
                );
            }
            // A submission may run for the whole request timeout.
            let timeout = seed
                .timeout_seconds
                .unwrap_or_else(|| seed.analyzer.default_timeout_secs());
            if timeout > self.recovery.stuck_submitting_threshold_secs {
                anyhow::bail!(
                    "instances.{}: timeout_seconds ({timeout}) exceeds recovery.stuck_submitting_threshold_secs ({})",
                    seed.name,
                    self.recovery.stuck_submitting_threshold_secs
                );
            }
        }
        Ok(())
    }
}

fn xdg_config_home() -> anyhow::Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME") {
        let dir = PathBuf::from(dir);
        if dir.as_os_str().is_empty() {
            anyhow::bail!("XDG_CONFIG_HOME is set but empty");
        }
        return Ok(dir);
    }

    let home = std::env::var_os("HOME").ok_or_else(|| anyhow::anyhow!("HOME is not set"))?;
    let home = PathBuf::from(home);
    if home.as_os_str().is_empty() {
        anyhow::bail!("HOME is set but empty");
    }
    Ok(home.join(".config"))
}

/// Default config location: `$XDG_CONFIG_HOME/samplefarm/orchestrator.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
    Ok(xdg_config_home()?.join("samplefarm").join("orchestrator.toml"))
}
