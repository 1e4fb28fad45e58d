#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Shared configuration and policy types for the `samplefarm` orchestrator.

/// Analyzer family identifiers.
pub mod analyzer;
/// On-disk orchestrator configuration.
pub mod config;
/// Retry, sweep, execution and recovery policies.
pub mod policy;

pub use analyzer::AnalyzerType;
pub use config::OrchestratorConfig;
pub use policy::{
    ExecutionConfig, FailedTaskRetryPolicy, PolicyError, RecoveryConfig, RetryDecision,
    RetryPolicy,
};
