use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use uuid::Uuid;

use samplefarm_core::{AnalyzerType, ExecutionConfig};
use samplefarm_engine::model::{MasterTaskStatus, SubTaskStatus};
use samplefarm_engine::samples::SampleFilter;

fn parse_json(input: &str) -> Result<serde_json::Value, String> {
    let value: serde_json::Value =
        serde_json::from_str(input).map_err(|err| format!("invalid JSON: {err}"))?;
    if !value.is_object() {
        return Err("expected a JSON object".to_string());
    }
    Ok(value)
}

#[derive(Debug, Clone, Parser)]
#[command(name = "sforch", version, about = "Malware sample analysis orchestrator")]
pub struct Cli {
    /// Config file (TOML). Defaults to `$XDG_CONFIG_HOME/samplefarm/orchestrator.toml`.
    #[arg(long, env = "SFORCH_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// SQLite database; overrides `storage.database_path`.
    #[arg(long, env = "SFORCH_DATABASE", global = true)]
    pub database: Option<PathBuf>,

    /// Sample directory; overrides `storage.samples_dir`.
    #[arg(long, env = "SFORCH_SAMPLES_DIR", global = true)]
    pub samples_dir: Option<PathBuf>,

    /// Log filter when `RUST_LOG` is unset; overrides `logging.level`.
    #[arg(long, env = "SFORCH_LOG_LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Log JSON lines.
    #[arg(long, env = "SFORCH_LOG_JSON", global = true, default_value_t = false)]
    pub log_json: bool,

    /// Print command output as JSON.
    #[arg(long, global = true, default_value_t = false)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Run the orchestration engine until interrupted.
    Serve {
        /// Skip the recovery scanner for this run.
        #[arg(long, default_value_t = false)]
        no_recovery: bool,
    },
    /// Create a master task from sample ids or a sample filter.
    Create(CreateArgs),
    /// Add samples to a batch that has not finished.
    AddSamples {
        master: Uuid,
        #[arg(required = true)]
        samples: Vec<String>,
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        priority: i32,
    },
    /// Start a batch (or replace the execution parameters of a running one).
    Execute(ExecuteArgs),
    Pause {
        master: Uuid,
        #[arg(long)]
        reason: Option<String>,
    },
    Resume {
        master: Uuid,
    },
    Cancel {
        master: Uuid,
    },
    /// Per-state counts and progress of a batch.
    Status {
        master: Uuid,
    },
    /// Full master task record.
    Show {
        master: Uuid,
    },
    /// List master tasks, newest first.
    List {
        #[arg(long)]
        status: Option<MasterTaskStatus>,
        #[arg(long)]
        analyzer: Option<AnalyzerType>,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 20)]
        page_size: u32,
    },
    /// List the sub-tasks of a batch in dispatch order.
    Subtasks {
        master: Uuid,
        #[arg(long)]
        status: Option<SubTaskStatus>,
        /// Substring of sample id, remote task id or error message.
        #[arg(long)]
        keyword: Option<String>,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 50)]
        page_size: u32,
    },
    /// Stored analysis result of a sub-task.
    Result {
        sub_task: Uuid,
    },
    /// Follow a batch until it finishes.
    Watch {
        master: Uuid,
        #[arg(long, default_value_t = 1_000)]
        interval_ms: u64,
    },
    /// Delete a finished batch with its sub-tasks and results.
    Delete {
        master: Uuid,
    },
    /// Summarize the samples a filter selects without creating a task.
    Preview {
        #[arg(long, default_value_t = AnalyzerType::Cape)]
        analyzer: AnalyzerType,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Every stored result of one sample, newest first.
    History {
        sample: String,
        #[arg(long, default_value_t = 1)]
        page: u32,
        #[arg(long, default_value_t = 20)]
        page_size: u32,
    },
    /// Sub-task outcome statistics.
    Stats {
        #[arg(long)]
        analyzer: Option<AnalyzerType>,
        #[arg(long)]
        instance: Option<Uuid>,
        /// Only sub-tasks created in the last N days.
        #[arg(long)]
        days: Option<u32>,
    },
    /// Manage analyzer instances.
    #[command(subcommand)]
    Instance(InstanceCommand),
    /// Run one recovery scan and exit.
    Recover,
}

#[derive(Debug, Clone, Args)]
pub struct CreateArgs {
    #[arg(long)]
    pub name: String,

    #[arg(long, default_value_t = AnalyzerType::Cape)]
    pub analyzer: AnalyzerType,

    /// Create a single-sample task instead of a batch.
    #[arg(long, default_value_t = false)]
    pub single: bool,

    /// Sample id (repeatable). When absent the filter flags select samples.
    #[arg(long = "sample", value_name = "ID")]
    pub samples: Vec<String>,

    #[command(flatten)]
    pub filter: FilterArgs,

    /// Restrict the batch to these instances (repeatable).
    #[arg(long = "instance", value_name = "ID")]
    pub instances: Vec<Uuid>,

    /// Backend parameters as a JSON object.
    #[arg(long, value_parser = parse_json)]
    pub parameters: Option<serde_json::Value>,

    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub priority: i32,

    /// Start the batch right away with the configured execution defaults.
    #[arg(long, default_value_t = false)]
    pub execute: bool,
}

impl CreateArgs {
    pub fn filter(&self) -> SampleFilter {
        self.filter.to_filter()
    }
}

/// Sample filter flags.
#[derive(Debug, Clone, Default, Args)]
pub struct FilterArgs {
    #[arg(long)]
    pub file_name: Option<String>,
    #[arg(long)]
    pub sample_type: Option<String>,
    /// MD5, SHA-1 or SHA-256.
    #[arg(long)]
    pub hash: Option<String>,
    #[arg(long)]
    pub label: Option<String>,
    #[arg(long)]
    pub source: Option<String>,
    #[arg(long)]
    pub created_after: Option<DateTime<Utc>>,
    #[arg(long)]
    pub created_before: Option<DateTime<Utc>>,
    #[arg(long)]
    pub container: Option<bool>,
}

impl FilterArgs {
    pub fn to_filter(&self) -> SampleFilter {
        SampleFilter {
            file_name: self.file_name.clone(),
            sample_type: self.sample_type.clone(),
            hash: self.hash.clone(),
            label: self.label.clone(),
            source: self.source.clone(),
            created_after: self.created_after,
            created_before: self.created_before,
            is_container: self.container,
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct ExecuteArgs {
    pub master: Uuid,

    #[arg(long)]
    pub poll_interval_secs: Option<u64>,
    /// Give up on a remote analysis after this long (0 = never).
    #[arg(long)]
    pub max_wait_secs: Option<u64>,
    #[arg(long)]
    pub submit_interval_ms: Option<u64>,
    #[arg(long)]
    pub max_attempts: Option<u32>,
    #[arg(long)]
    pub initial_backoff_secs: Option<u64>,
    #[arg(long)]
    pub no_retry: bool,
    /// CAPE guest machine.
    #[arg(long)]
    pub machine: Option<String>,
    /// CAPE options string.
    #[arg(long)]
    pub options: Option<String>,
    /// CFG label.
    #[arg(long)]
    pub label: Option<i64>,
}

impl ExecuteArgs {
    /// Overlay the flags on `base`.
    pub fn apply(&self, mut base: ExecutionConfig) -> ExecutionConfig {
        if let Some(v) = self.poll_interval_secs {
            base.poll_interval_secs = v;
        }
        if let Some(v) = self.max_wait_secs {
            base.max_wait_secs = v;
        }
        if let Some(v) = self.submit_interval_ms {
            base.submit_interval_ms = v;
        }
        if let Some(v) = self.max_attempts {
            base.retry.max_attempts = v;
        }
        if let Some(v) = self.initial_backoff_secs {
            base.retry.initial_backoff_secs = v;
        }
        if self.no_retry {
            base.retry.enabled = false;
        }
        if let Some(v) = &self.machine {
            base.machine = Some(v.clone());
        }
        if let Some(v) = &self.options {
            base.options = Some(v.clone());
        }
        if let Some(v) = self.label {
            base.label = v;
        }
        base
    }
}

#[derive(Debug, Clone, Subcommand)]
pub enum InstanceCommand {
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        analyzer: AnalyzerType,
        #[arg(long)]
        base_url: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        timeout_seconds: Option<u64>,
        #[arg(long)]
        max_concurrent_tasks: Option<u32>,
        #[arg(long)]
        health_check_interval: Option<u64>,
        /// Register the instance disabled.
        #[arg(long, default_value_t = false)]
        disabled: bool,
    },
    List {
        #[arg(long)]
        analyzer: Option<AnalyzerType>,
    },
    Enable {
        id: Uuid,
    },
    Disable {
        id: Uuid,
    },
    Remove {
        id: Uuid,
    },
}
