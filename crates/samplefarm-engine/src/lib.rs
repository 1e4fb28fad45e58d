#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Orchestration core for `sforch`: batch and sub-task state machines, the
//! durable store, sandbox adapters, and the background engine that
//! dispatches, polls, probes and recovers.

/// Public API for the engine crate.
pub mod api;

pub mod backend;
pub mod model;
pub mod preview;
pub mod recovery;
pub mod samples;
pub mod service;
pub mod store;

mod claims;
mod control;
mod dispatcher;
mod engine;
mod health;
mod poller;
mod pool;
mod rate_limit;
mod retry;

#[cfg(test)]
mod testing;

pub use api::{EngineConfig, EngineEvent, EngineHandle, StatusSnapshot, start_engine};
pub use backend::{Backends, SandboxClient};
pub use preview::TaskPreview;
pub use recovery::{RecoveryStats, SweepStats};
pub use samples::{DirectorySampleSource, SampleSource};
pub use service::{BatchExecute, CreateMasterTask, SampleSelection, ServiceError, TaskService};
pub use store::{StoreError, TaskStore};
