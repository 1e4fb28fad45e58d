use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::{Value, json};

use super::{
    BackendError, RemotePoll, RemoteState, ResultPayload, SandboxClient, SubmitParams, join_url,
    json_or_text, preview, read_body,
};
use crate::model::{AnalyzerInstance, AnalyzerType};
use crate::samples::SamplePayload;

/// Task id that never exists; probing it tells whether the API answers.
const HEALTH_PROBE_TASK_ID: u32 = 99_999;

#[derive(Debug, Deserialize)]
struct CreateResponse {
    #[serde(default)]
    error: bool,
    data: Option<CreateData>,
    errors: Option<Vec<Value>>,
    error_value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateData {
    task_id: Option<i64>,
    task_ids: Option<Vec<i64>>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    #[serde(default)]
    error: bool,
    data: Option<String>,
    error_value: Option<String>,
}

/// Dynamic-behavior sandbox (CAPE API v2).
#[derive(Debug, Clone)]
pub struct CapeClient {
    http: reqwest::Client,
}

impl CapeClient {
    /// Adapter sharing `http`'s connection pool.
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

fn parse_create(status: StatusCode, body: &str) -> Result<String, BackendError> {
    if !status.is_success() {
        return Err(BackendError::Http {
            status: status.as_u16(),
            body: preview(body, 400),
        });
    }
    let res: CreateResponse =
        serde_json::from_str(body).map_err(|e| BackendError::Decode(e.to_string()))?;

    if res.error {
        let mut messages = Vec::new();
        if let Some(v) = res.error_value {
            messages.push(v);
        }
        for item in res.errors.unwrap_or_default() {
            match item {
                Value::String(s) => messages.push(s),
                Value::Object(obj) => messages.push(
                    obj.iter()
                        .map(|(k, v)| format!("{k}: {v}"))
                        .collect::<Vec<_>>()
                        .join(", "),
                ),
                other => messages.push(other.to_string()),
            }
        }
        if messages.is_empty() {
            messages.push("unknown error".to_string());
        }
        return Err(BackendError::Rejected(messages.join(" | ")));
    }

    let data = res
        .data
        .ok_or_else(|| BackendError::Decode("response has no data".to_string()))?;
    data.task_id
        .or_else(|| data.task_ids.and_then(|ids| ids.into_iter().next()))
        .map(|id| id.to_string())
        .ok_or_else(|| BackendError::Decode("response has no task id".to_string()))
}

/// Map a CAPE task status. `completed` means analysis is done; the report may
/// still be in processing, which the fetch reports as not ready.
fn map_status(raw: &str) -> RemoteState {
    match raw {
        "completed" | "reported" => RemoteState::Complete,
        "failed" | "failed_analysis" | "failed_processing" | "failed_reporting" => {
            RemoteState::Failed { transient: true }
        }
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
    let res: StatusResponse =
        serde_json::from_value(payload.clone()).map_err(|e| BackendError::Decode(e.to_string()))?;
    if res.error {
        let msg = res.error_value.unwrap_or_else(|| "unknown error".to_string());
        if msg.to_ascii_lowercase().contains("does not exist") {
            return Err(BackendError::NotFound(task_id.to_string()));
        }
        return Err(BackendError::Rejected(msg));
    }
    let raw_status = res
        .data
        .ok_or_else(|| BackendError::Decode("status response has no data".to_string()))?;
    Ok(RemotePoll {
        state: map_status(&raw_status),
        raw_status,
        payload,
    })
}

fn parse_report(status: StatusCode, body: &str) -> Result<ResultPayload, BackendError> {
    if !status.is_success() {
        return Err(BackendError::Http {
            status: status.as_u16(),
            body: preview(body, 400),
        });
    }
    let report: Value =
        serde_json::from_str(body).map_err(|e| BackendError::Decode(e.to_string()))?;
    if report.get("error").and_then(Value::as_bool).unwrap_or(false) {
        let msg = report
            .get("error_value")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        if msg.contains("still being analyzed") {
            return Err(BackendError::NotReady(msg));
        }
        return Err(BackendError::Rejected(msg));
    }
    Ok(ResultPayload {
        summary: summarize(&report),
        report,
    })
}

fn severity(score: f64) -> &'static str {
    if score >= 8.0 {
        "critical"
    } else if score >= 6.0 {
        "high"
    } else if score >= 4.0 {
        "medium"
    } else {
        "low"
    }
}

fn verdict(score: f64) -> &'static str {
    if score >= 7.0 {
        "malicious"
    } else if score >= 3.0 {
        "suspicious"
    } else {
        "clean"
    }
}

fn summarize(report: &Value) -> Value {
    let score = report["malscore"]
        .as_f64()
        .or_else(|| report["info"]["score"].as_f64());
    let signatures: Vec<&str> = report["signatures"]
        .as_array()
        .map(|sigs| sigs.iter().filter_map(|s| s["name"].as_str()).collect())
        .unwrap_or_default();
    let domains = report["network"]["domains"]
        .as_array()
        .map(Vec::len)
        .unwrap_or(0);

    json!({
        "malscore": score,
        "severity": score.map(severity),
        "verdict": score.map(verdict),
        "detections": report["detections"].clone(),
        "signature_count": signatures.len(),
        "signatures": signatures,
        "domain_count": domains,
        "duration_secs": report["info"]["duration"].as_i64(),
    })
}

#[async_trait]
impl SandboxClient for CapeClient {
    fn analyzer(&self) -> AnalyzerType {
        AnalyzerType::Cape
    }

    async fn submit(
        &self,
        instance: &AnalyzerInstance,
        sample: &SamplePayload,
        params: &SubmitParams,
    ) -> Result<String, BackendError> {
        if sample.bytes.is_empty() {
            return Err(BackendError::Rejected(format!(
                "sample {} is empty",
                sample.file_name
            )));
        }
        let part = Part::bytes(sample.bytes.to_vec())
            .file_name(sample.file_name.clone())
            .mime_str("application/octet-stream")?;
        let mut form = Form::new().part("file", part);
        if let Some(machine) = &params.machine {
            form = form.text("machine", machine.clone());
        }
        if let Some(options) = &params.options {
            form = form.text("options", options.clone());
        }
        for (key, value) in &params.extra {
            form = form.text(key.clone(), value.clone());
        }

        let res = self
            .http
            .post(join_url(&instance.base_url, "tasks/create/file/"))
            .timeout(instance.timeout())
            .multipart(form)
            .send()
            .await?;
        let (status, body) = read_body(res).await?;
        parse_create(status, &body)
    }

    async fn poll(
        &self,
        instance: &AnalyzerInstance,
        external_task_id: &str,
    ) -> Result<RemotePoll, BackendError> {
        let res = self
            .http
            .get(join_url(
                &instance.base_url,
                &format!("tasks/status/{external_task_id}/"),
            ))
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
            .get(join_url(
                &instance.base_url,
                &format!("tasks/get/report/{external_task_id}/"),
            ))
            .timeout(instance.timeout())
            .send()
            .await?;
        let (status, body) = read_body(res).await?;
        parse_report(status, &body)
    }

    async fn health_check(&self, instance: &AnalyzerInstance) -> Result<(), BackendError> {
        let res = self
            .http
            .get(join_url(
                &instance.base_url,
                &format!("tasks/status/{HEALTH_PROBE_TASK_ID}/"),
            ))
            .timeout(instance.timeout())
            .send()
            .await?;
        let status = res.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let body = res.text().await.unwrap_or_default();
        Err(BackendError::Http {
            status: status.as_u16(),
            body: preview(&body, 200),
        })
    }
}
