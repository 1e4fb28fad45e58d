//! In-process fakes for engine tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use samplefarm_core::{ExecutionConfig, RetryPolicy};
use serde_json::json;

use crate::api::EngineConfig;
use crate::backend::{
    BackendError, Backends, RemotePoll, RemoteState, ResultPayload, SandboxClient, SubmitParams,
};
use crate::engine::Shared;
use crate::model::{
    AnalyzerInstance, AnalyzerType, InstanceHealth, MasterTask, NewInstance, SubTask, TaskKind,
};
use crate::samples::{
    SampleError, SampleFilter, SamplePayload, SampleRecord, SampleSource, sha256_hex,
};
use crate::store::{NewMasterTask, SubTaskQuery, TaskStore};

/// Scripted sandbox. Queued answers are used first; afterwards submits
/// succeed, polls report `running` and fetches return a small report.
#[derive(Default)]
pub(crate) struct FakeSandbox {
    analyzer: Option<AnalyzerType>,
    next_id: AtomicU32,
    submitted: Mutex<Vec<String>>,
    submit_script: Mutex<VecDeque<Result<String, BackendError>>>,
    poll_script: Mutex<VecDeque<Result<RemotePoll, BackendError>>>,
    fetch_script: Mutex<VecDeque<Result<ResultPayload, BackendError>>>,
    unhealthy: AtomicBool,
    submit_delay_ms: AtomicU64,
}

impl FakeSandbox {
    pub(crate) fn new(analyzer: AnalyzerType) -> Arc<Self> {
        Arc::new(Self {
            analyzer: Some(analyzer),
            ..Self::default()
        })
    }

    pub(crate) fn submitted_samples(&self) -> Vec<String> {
        let mut out = self.submitted.lock().map(|v| v.clone()).unwrap_or_default();
        out.sort();
        out
    }

    pub(crate) fn push_poll(&self, res: Result<RemotePoll, BackendError>) {
        self.poll_script.lock().unwrap().push_back(res);
    }

    pub(crate) fn push_fetch(&self, res: Result<ResultPayload, BackendError>) {
        self.fetch_script.lock().unwrap().push_back(res);
    }

    pub(crate) fn set_healthy(&self, healthy: bool) {
        self.unhealthy.store(!healthy, Ordering::SeqCst);
    }

    /// Make every submission take `delay` before it answers.
    pub(crate) fn set_submit_delay(&self, delay: Duration) {
        self.submit_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

pub(crate) fn scripted_submit(fake: &FakeSandbox, res: Result<String, BackendError>) {
    fake.submit_script.lock().unwrap().push_back(res);
}

pub(crate) fn remote(state: RemoteState, raw: &str) -> RemotePoll {
    RemotePoll {
        state,
        raw_status: raw.to_string(),
        payload: json!({ "data": raw }),
    }
}

#[async_trait]
impl SandboxClient for FakeSandbox {
    fn analyzer(&self) -> AnalyzerType {
        self.analyzer.unwrap_or(AnalyzerType::Cape)
    }

    async fn submit(
        &self,
        _instance: &AnalyzerInstance,
        sample: &SamplePayload,
        _params: &SubmitParams,
    ) -> Result<String, BackendError> {
        let delay = self.submit_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if let Some(res) = self.submit_script.lock().unwrap().pop_front() {
            return res;
        }
        self.submitted.lock().unwrap().push(sample.sample_id.clone());
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("ext-{n}"))
    }

    async fn poll(
        &self,
        _instance: &AnalyzerInstance,
        _external_task_id: &str,
    ) -> Result<RemotePoll, BackendError> {
        self.poll_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(remote(RemoteState::Running, "running")))
    }

    async fn fetch_result(
        &self,
        _instance: &AnalyzerInstance,
        external_task_id: &str,
    ) -> Result<ResultPayload, BackendError> {
        self.fetch_script.lock().unwrap().pop_front().unwrap_or_else(|| {
            Ok(ResultPayload {
                summary: json!({ "malscore": 4.5 }),
                report: json!({ "info": { "id": external_task_id } }),
            })
        })
    }

    async fn health_check(&self, _instance: &AnalyzerInstance) -> Result<(), BackendError> {
        if self.unhealthy.load(Ordering::SeqCst) {
            Err(BackendError::Transport("connection refused".into()))
        } else {
            Ok(())
        }
    }
}

/// Sample source holding a fixed set of ids.
pub(crate) struct MemorySamples {
    samples: HashMap<String, Vec<u8>>,
}

impl MemorySamples {
    pub(crate) fn with_ids(ids: &[&str]) -> Self {
        Self {
            samples: ids
                .iter()
                .map(|id| (id.to_string(), format!("MZ {id}").into_bytes()))
                .collect(),
        }
    }
}

#[async_trait]
impl SampleSource for MemorySamples {
    async fn resolve(&self, sample_id: &str) -> Result<SamplePayload, SampleError> {
        let bytes = self
            .samples
            .get(sample_id)
            .ok_or_else(|| SampleError::NotFound(sample_id.to_string()))?;
        Ok(SamplePayload::new(sample_id, format!("{sample_id}.exe"), bytes.clone()))
    }

    async fn select(&self, _filter: &SampleFilter) -> Result<Vec<String>, SampleError> {
        let mut ids: Vec<String> = self.samples.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn contains(&self, sample_id: &str) -> Result<bool, SampleError> {
        Ok(self.samples.contains_key(sample_id))
    }

    /// One `.exe` record per id, sized by its bytes.
    async fn records(&self, filter: &SampleFilter) -> Result<Vec<SampleRecord>, SampleError> {
        let mut records: Vec<SampleRecord> = self
            .samples
            .iter()
            .map(|(id, bytes)| SampleRecord {
                id: id.clone(),
                file_name: format!("{id}.exe"),
                sample_type: Some("PE32".to_string()),
                md5: None,
                sha1: None,
                sha256: Some(sha256_hex(bytes)),
                labels: Vec::new(),
                source: Some("memory".to_string()),
                created_at: Utc::now(),
                is_container: false,
                path: None,
                file_size: Some(bytes.len() as u64),
            })
            .filter(|r| filter.matches(r))
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }
}

/// Fast retries without jitter, no submission spacing.
pub(crate) fn fast_execution() -> ExecutionConfig {
    ExecutionConfig {
        poll_interval_secs: 1,
        submit_interval_ms: 0,
        retry: RetryPolicy {
            jitter: false,
            ..RetryPolicy::default()
        },
        ..ExecutionConfig::default()
    }
}

/// Engine state over an in-memory store with fake CAPE and CFG backends.
pub(crate) struct Harness {
    pub(crate) shared: Arc<Shared>,
    pub(crate) cape: Arc<FakeSandbox>,
    pub(crate) execution: ExecutionConfig,
}

impl Harness {
    pub(crate) async fn new() -> Self {
        Self::with_execution(fast_execution()).await
    }

    pub(crate) async fn with_execution(execution: ExecutionConfig) -> Self {
        let store = TaskStore::open_in_memory().unwrap();
        let cape = FakeSandbox::new(AnalyzerType::Cape);
        let backends = Backends::new()
            .with(cape.clone())
            .with(FakeSandbox::new(AnalyzerType::Cfg));
        let samples = Arc::new(MemorySamples::with_ids(&["a", "b", "c", "d", "e"]));
        let cfg = EngineConfig {
            default_execution: execution.clone(),
            ..EngineConfig::default()
        };
        Self {
            shared: Shared::for_tests(cfg, store, backends, samples),
            cape,
            execution,
        }
    }

    pub(crate) fn store(&self) -> &TaskStore {
        &self.shared.store
    }

    /// A healthy CAPE instance.
    pub(crate) async fn instance(&self, name: &str, max: u32) -> AnalyzerInstance {
        let mut new = NewInstance::with_defaults(name, AnalyzerType::Cape, format!("http://{name}"));
        new.max_concurrent_tasks = max;
        let inst = self.store().add_instance(&new, Utc::now()).unwrap();
        self.store()
            .record_health(inst.id, InstanceHealth::Healthy, Utc::now())
            .unwrap();
        self.store().instance(inst.id).unwrap()
    }

    /// A running CAPE batch over `samples`.
    pub(crate) async fn batch(&self, samples: &[&str]) -> MasterTask {
        let master = self
            .store()
            .create_master_task(
                &NewMasterTask {
                    name: "batch".to_string(),
                    analyzer_type: AnalyzerType::Cape,
                    task_type: TaskKind::Batch,
                    sample_ids: samples.iter().map(|s| s.to_string()).collect(),
                    instance_ids: Vec::new(),
                    parameters: None,
                    sample_filter: None,
                    priority: 0,
                },
                Utc::now(),
            )
            .unwrap();
        self.store()
            .start_master(master.id, &self.execution, Utc::now())
            .unwrap()
    }

    pub(crate) fn sub_tasks(&self, master_id: uuid::Uuid) -> Vec<SubTask> {
        self.store()
            .list_sub_tasks(
                master_id,
                &SubTaskQuery {
                    page_size: 500,
                    ..SubTaskQuery::default()
                },
            )
            .unwrap()
            .items
    }
}
