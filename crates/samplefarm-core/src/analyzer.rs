use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Sandbox backend family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AnalyzerType {
    /// Dynamic behavior sandbox (CAPE).
    Cape,
    /// Static control-flow-graph extractor.
    Cfg,
}

impl AnalyzerType {
    /// Every supported family.
    pub const ALL: [AnalyzerType; 2] = [AnalyzerType::Cape, AnalyzerType::Cfg];

    /// Stable upper-case name, as stored.
    pub fn as_str(self) -> &'static str {
        match self {
            AnalyzerType::Cape => "CAPE",
            AnalyzerType::Cfg => "CFG",
        }
    }

    /// Family default for an instance's request timeout.
    pub fn default_timeout_secs(self) -> u64 {
        300
    }

    /// Family default for an instance's concurrent task cap.
    pub fn default_max_concurrent(self) -> u32 {
        match self {
            AnalyzerType::Cape => 5,
            AnalyzerType::Cfg => 2,
        }
    }

    /// Family default for the health-check interval.
    pub fn default_health_check_interval_secs(self) -> u64 {
        60
    }
}

impl fmt::Display for AnalyzerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unknown analyzer family name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown analyzer type: {0:?}")]
pub struct UnknownAnalyzer(pub String);

impl FromStr for AnalyzerType {
    type Err = UnknownAnalyzer;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CAPE" => Ok(AnalyzerType::Cape),
            "CFG" => Ok(AnalyzerType::Cfg),
            _ => Err(UnknownAnalyzer(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("cape".parse::<AnalyzerType>().unwrap(), AnalyzerType::Cape);
        assert_eq!(" CFG ".parse::<AnalyzerType>().unwrap(), AnalyzerType::Cfg);
        assert!("yara".parse::<AnalyzerType>().is_err());
    }

    #[test]
    fn serializes_upper_case() {
        assert_eq!(serde_json::to_string(&AnalyzerType::Cfg).unwrap(), "\"CFG\"");
    }
}
