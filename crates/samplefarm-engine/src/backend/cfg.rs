use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use serde_json::{Value, json};

use super::{
    BackendError, RemotePoll, RemoteState, ResultPayload, SandboxClient, SubmitParams, join_url,
    json_or_text, preview, read_body,
};
use crate::model::{AnalyzerInstance, AnalyzerType};
use crate::samples::SamplePayload;

/// Control-flow-graph extractor. Remote tasks are keyed by the sample's
/// SHA-256, which makes resubmission idempotent.
#[derive(Debug, Clone)]
pub struct CfgClient {
    http: reqwest::Client,
}

impl CfgClient {
    /// Adapter sharing `http`'s connection pool.
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

fn already_exists(status: StatusCode, body: &str) -> bool {
    status == StatusCode::BAD_REQUEST
        && (body.contains("已存在") || body.to_ascii_lowercase().contains("already exist"))
}

fn check_submit(status: StatusCode, body: &str, task_id: &str) -> Result<String, BackendError> {
    if status.is_success() {
        return Ok(task_id.to_string());
    }
    if already_exists(status, body) {
        tracing::info!(task_id, "remote task already exists; treating submission as done");
        return Ok(task_id.to_string());
    }
    if status == StatusCode::BAD_REQUEST || status == StatusCode::UNPROCESSABLE_ENTITY {
        return Err(BackendError::Rejected(preview(body, 400)));
    }
    Err(BackendError::Http {
        status: status.as_u16(),
        body: preview(body, 400),
    })
}

fn map_status(raw: &str) -> RemoteState {
    match raw {
        "completed" => RemoteState::Complete,
        "failed" => RemoteState::Failed { transient: false },
        _ => RemoteState::Running,
    }
}

fn parse_status(status: StatusCode, body: &str, task_id: &str) -> Result<RemotePoll, BackendError> {
    if status == StatusCode::NOT_FOUND {
        return Err(BackendError::NotFound(task_id.to_string()));
    }
    if !status.is_success() {
        return Err(BackendError::Http {
            status: status.as_u16(),
            body: preview(body, 400),
        });
    }
    let payload = json_or_text(body);
    let raw_status = payload
        .get("status")
        .and_then(Value::as_str)
        .ok_or_else(|| BackendError::Decode("status response has no status".to_string()))?
        .to_string();
    let mut state = map_status(&raw_status);
    if let RemoteState::Failed { transient } = &mut state {
        // A failure message naming infrastructure trouble is worth another try.
        let message = payload.get("message").and_then(Value::as_str).unwrap_or("");
        let lower = message.to_ascii_lowercase();
        *transient = ["timeout", "connection", "unavailable", "out of memory"]
            .iter()
            .any(|p| lower.contains(p));
    }
    Ok(RemotePoll {
        state,
        raw_status,
        payload,
    })
}

fn parse_result(status: StatusCode, body: &str, task_id: &str) -> Result<ResultPayload, BackendError> {
    if status == StatusCode::NOT_FOUND {
        return Err(BackendError::NotFound(task_id.to_string()));
    }
    if !status.is_success() {
        return Err(BackendError::Http {
            status: status.as_u16(),
            body: preview(body, 400),
        });
    }
    let report = json_or_text(body);
    let files: Vec<&str> = report
        .get("result_files")
        .and_then(Value::as_object)
        .map(|files| files.keys().map(String::as_str).collect())
        .unwrap_or_default();
    let summary = json!({
        "task_id": task_id,
        "status": report.get("status").cloned().unwrap_or(Value::Null),
        "message": report.get("message").cloned().unwrap_or(Value::Null),
        "result_files": files,
    });
    Ok(ResultPayload { summary, report })
}

#[async_trait]
impl SandboxClient for CfgClient {
    fn analyzer(&self) -> AnalyzerType {
        AnalyzerType::Cfg
    }

    async fn submit(
        &self,
        instance: &AnalyzerInstance,
        sample: &SamplePayload,
        params: &SubmitParams,
    ) -> Result<String, BackendError> {
        let part = Part::bytes(sample.bytes.to_vec())
            .file_name(sample.file_name.clone())
            .mime_str("application/octet-stream")?;
        let form = Form::new()
            .part("file", part)
            .text("task_id", sample.sha256.clone())
            .text("label", params.label.to_string());

        let res = self
            .http
            .post(join_url(&instance.base_url, "preprocess_pe"))
            .timeout(instance.timeout())
            .multipart(form)
            .send()
            .await?;
        let (status, body) = read_body(res).await?;
        check_submit(status, &body, &sample.sha256)
    }

    async fn poll(
        &self,
        instance: &AnalyzerInstance,
        external_task_id: &str,
    ) -> Result<RemotePoll, BackendError> {
        let res = self
            .http
            .get(join_url(&instance.base_url, &format!("task/{external_task_id}")))
            .timeout(instance.timeout())
            .send()
            .await?;
        let (status, body) = read_body(res).await?;
        parse_status(status, &body, external_task_id)
    }

    async fn fetch_result(
        &self,
        instance: &AnalyzerInstance,
        external_task_id: &str,
    ) -> Result<ResultPayload, BackendError> {
        let res = self
            .http
            .get(join_url(&instance.base_url, &format!("result/{external_task_id}")))
            .timeout(instance.timeout())
            .send()
            .await?;
        let (status, body) = read_body(res).await?;
        parse_result(status, &body, external_task_id)
    }

    async fn health_check(&self, instance: &AnalyzerInstance) -> Result<(), BackendError> {
        let res = self
            .http
            .get(join_url(&instance.base_url, "system/status"))
            .timeout(instance.timeout())
            .send()
            .await?;
        let (status, body) = read_body(res).await?;
        if status.is_success() {
            return Ok(());
        }
        Err(BackendError::Http {
            status: status.as_u16(),
            body: preview(&body, 200),
        })
    }
}
