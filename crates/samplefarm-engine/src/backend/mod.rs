//! Sandbox client adapters: one implementation of [`SandboxClient`] per
//! analyzer family.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use samplefarm_core::{ExecutionConfig, RetryPolicy};

use crate::model::{AnalyzerInstance, AnalyzerType};
use crate::samples::SamplePayload;

mod cape;
mod cfg;

pub use cape::CapeClient;
pub use cfg::CfgClient;

/// Failure of a single call to a sandbox backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Connection refused, reset, DNS failure, ...
    #[error("transport error: {0}")]
    Transport(String),
    /// The request exceeded the instance's timeout.
    #[error("request timed out")]
    Timeout,
    /// Non-success HTTP status.
    #[error("http {status}: {body}")]
    Http {
        /// Status code.
        status: u16,
        /// Truncated response body.
        body: String,
    },
    /// The backend answered but refused the request.
    #[error("rejected by backend: {0}")]
    Rejected(String),
    /// The remote task is unknown to the backend.
    #[error("remote task not found: {0}")]
    NotFound(String),
    /// The result exists but is not ready to be fetched yet.
    #[error("result not ready: {0}")]
    NotReady(String),
    /// The response could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),
}

impl BackendError {
    /// Whether the failure is worth retrying.
    ///
    /// Network trouble, timeouts, 5xx and 429 are transient; a rejection is
    /// transient only when its message matches one of the policy's retryable
    /// patterns.
    pub fn is_transient(&self, policy: &RetryPolicy) -> bool {
        match self {
            BackendError::Transport(_) | BackendError::Timeout | BackendError::NotReady(_) => true,
            BackendError::Http { status, body } => {
                *status >= 500 || *status == 429 || *status == 408 || policy.is_retryable_message(body)
            }
            BackendError::Rejected(msg) | BackendError::Decode(msg) => {
                policy.is_retryable_message(msg)
            }
            BackendError::NotFound(_) => false,
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BackendError::Timeout
        } else if err.is_decode() {
            BackendError::Decode(err.to_string())
        } else {
            BackendError::Transport(err.to_string())
        }
    }
}

/// Coarse remote state reported by a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteState {
    /// Queued or still being analyzed.
    Running,
    /// Finished; the result can be fetched.
    Complete,
    /// The backend gave up on the task.
    Failed {
        /// Whether resubmitting may succeed.
        transient: bool,
    },
}

/// Result of polling one remote task.
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePoll {
    /// Mapped state.
    pub state: RemoteState,
    /// Backend status string as reported.
    pub raw_status: String,
    /// Raw response body.
    pub payload: serde_json::Value,
}

/// Output of a finished remote task.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultPayload {
    /// Small summary extracted from the report.
    pub summary: serde_json::Value,
    /// Full report.
    pub report: serde_json::Value,
}

/// Per-submission parameters sent alongside the sample.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitParams {
    /// CAPE machine name.
    pub machine: Option<String>,
    /// CAPE option string.
    pub options: Option<String>,
    /// CFG label.
    pub label: i64,
    /// Extra text fields taken from the batch parameters.
    pub extra: BTreeMap<String, String>,
}

impl SubmitParams {
    /// Combine a batch's execution config with its free-form parameters.
    ///
    /// Only scalar values of a JSON object are forwarded.
    pub fn new(execution: &ExecutionConfig, parameters: Option<&serde_json::Value>) -> Self {
        let mut extra = BTreeMap::new();
        if let Some(serde_json::Value::Object(map)) = parameters {
            for (key, value) in map {
                let text = match value {
                    serde_json::Value::String(s) => s.clone(),
                    serde_json::Value::Number(n) => n.to_string(),
                    serde_json::Value::Bool(b) => b.to_string(),
                    _ => continue,
                };
                extra.insert(key.clone(), text);
            }
        }
        Self {
            machine: execution.machine.clone(),
            options: execution.options.clone(),
            label: execution.label,
            extra,
        }
    }
}

/// Uniform submit / poll / fetch contract of an analyzer family.
#[async_trait]
pub trait SandboxClient: Send + Sync {
    /// Family served by this adapter.
    fn analyzer(&self) -> AnalyzerType;

    /// Submit a sample and return the remote task id.
    ///
    /// A backend reporting that the task already exists is a success.
    async fn submit(
        &self,
        instance: &AnalyzerInstance,
        sample: &SamplePayload,
        params: &SubmitParams,
    ) -> Result<String, BackendError>;

    /// Query the remote state of a task.
    async fn poll(
        &self,
        instance: &AnalyzerInstance,
        external_task_id: &str,
    ) -> Result<RemotePoll, BackendError>;

    /// Fetch the result of a completed task.
    async fn fetch_result(
        &self,
        instance: &AnalyzerInstance,
        external_task_id: &str,
    ) -> Result<ResultPayload, BackendError>;

    /// Reachability probe.
    async fn health_check(&self, instance: &AnalyzerInstance) -> Result<(), BackendError>;
}

/// Adapters keyed by analyzer family.
#[derive(Clone, Default)]
pub struct Backends {
    clients: HashMap<AnalyzerType, Arc<dyn SandboxClient>>,
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut families: Vec<_> = self.clients.keys().collect();
        families.sort();
        f.debug_struct("Backends").field("families", &families).finish()
    }
}

impl Backends {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Both HTTP adapters sharing one connection pool.
    pub fn http(http: reqwest::Client) -> Self {
        Self::new()
            .with(Arc::new(CapeClient::new(http.clone())))
            .with(Arc::new(CfgClient::new(http)))
    }

    /// Register (or replace) the adapter for its family.
    pub fn with(mut self, client: Arc<dyn SandboxClient>) -> Self {
        self.clients.insert(client.analyzer(), client);
        self
    }

    /// Adapter for `analyzer`, if registered.
    pub fn get(&self, analyzer: AnalyzerType) -> Option<Arc<dyn SandboxClient>> {
        self.clients.get(&analyzer).cloned()
    }
}

/// Join a base URL and a path with exactly one slash between them.
pub(crate) fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// First `max` characters of a response body, for error messages.
pub(crate) fn preview(body: &str, max: usize) -> String {
    body.chars().take(max).collect()
}

/// Read a response into `(status, body text)`.
pub(crate) async fn read_body(
    res: reqwest::Response,
) -> Result<(reqwest::StatusCode, String), BackendError> {
    let status = res.status();
    let body = res.text().await?;
    Ok((status, body))
}

/// Parse a body as JSON, keeping non-JSON text as a string value.
pub(crate) fn json_or_text(body: &str) -> serde_json::Value {
    serde_json::from_str(body).unwrap_or_else(|_| serde_json::Value::String(body.to_string()))
}
