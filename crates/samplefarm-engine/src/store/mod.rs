//! SQLite-backed durable store.
//!
//! Every state transition is a single guarded statement or transaction; the
//! `(master_task_id, sample_id)` uniqueness constraint and the master count
//! check live in the schema.

use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, ErrorCode, Row};
use uuid::Uuid;

use crate::model::{MasterTask, SubTask};

mod instances;
mod reports;
mod tasks;

pub use reports::StatsQuery;
pub use tasks::{MasterQuery, NewMasterTask, OutstandingPage, SubTaskQuery, SweepCandidate};

const SCHEMA_VERSION: i64 = 1;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS master_tasks (
    id                TEXT PRIMARY KEY,
    name              TEXT NOT NULL,
    analyzer_type     TEXT NOT NULL CHECK (analyzer_type IN ('CAPE', 'CFG')),
    task_type         TEXT NOT NULL CHECK (task_type IN ('batch', 'single')),
    total_samples     INTEGER NOT NULL DEFAULT 0,
    completed_samples INTEGER NOT NULL DEFAULT 0,
    failed_samples    INTEGER NOT NULL DEFAULT 0,
    status            TEXT NOT NULL,
    progress          REAL NOT NULL DEFAULT 0,
    instance_ids      TEXT NOT NULL DEFAULT '[]',
    parameters        TEXT,
    execution         TEXT,
    sample_filter     TEXT,
    result_summary    TEXT,
    paused_at         TEXT,
    pause_reason      TEXT,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL,
    CHECK (completed_samples + failed_samples <= total_samples)
);

CREATE INDEX IF NOT EXISTS idx_master_tasks_status ON master_tasks (status);

CREATE TABLE IF NOT EXISTS sub_tasks (
    id                TEXT PRIMARY KEY,
    master_task_id    TEXT NOT NULL REFERENCES master_tasks (id) ON DELETE CASCADE,
    sample_id         TEXT NOT NULL,
    analyzer_type     TEXT NOT NULL CHECK (analyzer_type IN ('CAPE', 'CFG')),
    instance_id       TEXT,
    external_task_id  TEXT,
    status            TEXT NOT NULL,
    paused_from       TEXT,
    priority          INTEGER NOT NULL DEFAULT 0,
    retry_count       INTEGER NOT NULL DEFAULT 0,
    sweep_count       INTEGER NOT NULL DEFAULT 0,
    failure_transient INTEGER NOT NULL DEFAULT 0,
    next_attempt_at   TEXT,
    parameters        TEXT,
    error_message     TEXT,
    created_at        TEXT NOT NULL,
    started_at        TEXT,
    completed_at      TEXT,
    updated_at        TEXT NOT NULL,
    UNIQUE (master_task_id, sample_id)
);

CREATE INDEX IF NOT EXISTS idx_sub_tasks_master_status ON sub_tasks (master_task_id, status);
CREATE INDEX IF NOT EXISTS idx_sub_tasks_status_updated ON sub_tasks (status, updated_at);
CREATE INDEX IF NOT EXISTS idx_sub_tasks_instance ON sub_tasks (instance_id, status);

CREATE TABLE IF NOT EXISTS analyzer_instances (
    id                    TEXT PRIMARY KEY,
    name                  TEXT NOT NULL UNIQUE,
    analyzer_type         TEXT NOT NULL CHECK (analyzer_type IN ('CAPE', 'CFG')),
    base_url              TEXT NOT NULL,
    description           TEXT,
    enabled               INTEGER NOT NULL DEFAULT 1,
    timeout_seconds       INTEGER NOT NULL,
    max_concurrent_tasks  INTEGER NOT NULL,
    health_check_interval INTEGER NOT NULL,
    status                TEXT NOT NULL DEFAULT 'unknown',
    last_health_check     TEXT,
    created_at            TEXT NOT NULL,
    updated_at            TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cape_analysis_results (
    sub_task_id      TEXT PRIMARY KEY REFERENCES sub_tasks (id) ON DELETE CASCADE,
    external_task_id TEXT NOT NULL,
    malscore         REAL,
    summary          TEXT NOT NULL,
    report           TEXT NOT NULL,
    created_at       TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cfg_analysis_results (
    sub_task_id      TEXT PRIMARY KEY REFERENCES sub_tasks (id) ON DELETE CASCADE,
    external_task_id TEXT NOT NULL,
    summary          TEXT NOT NULL,
    report           TEXT NOT NULL,
    created_at       TEXT NOT NULL
);
"#;

/// Errors returned by [`TaskStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// SQLite reported an error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// A uniqueness constraint rejected the write.
    #[error("duplicate: {0}")]
    Duplicate(String),
    /// The referenced row does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind.
        entity: &'static str,
        /// Requested id.
        id: String,
    },
    /// The requested state change is not an edge of the state machine.
    #[error("illegal transition for {entity} {id}: {from} -> {to}")]
    InvalidTransition {
        /// Entity kind.
        entity: &'static str,
        /// Row id.
        id: String,
        /// Current state.
        from: String,
        /// Requested state.
        to: String,
    },
    /// The row is referenced by live work.
    #[error("{0}")]
    InUse(String),
    /// Stored data could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),
    /// The store call did not finish in time.
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    /// The blocking store task panicked or was cancelled.
    #[error("store task failed: {0}")]
    Join(String),
    /// A previous store call panicked while holding the connection.
    #[error("store connection lock poisoned")]
    Poisoned,
}

impl StoreError {
    /// Map a constraint violation to [`StoreError::Duplicate`].
    fn from_write(err: rusqlite::Error, what: impl FnOnce() -> String) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
                StoreError::Duplicate(what())
            }
            _ => StoreError::Database(err),
        }
    }

    /// Not-found helper.
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

/// Durable store for tasks, sub-tasks, instances and results.
#[derive(Clone)]
pub struct TaskStore {
    conn: Arc<Mutex<Connection>>,
    timeout: Duration,
}

impl std::fmt::Debug for TaskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStore")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl TaskStore {
    /// Default bound for a single [`TaskStore::call`].
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Open (creating if needed) a database file.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)
                    .map_err(|e| StoreError::Corrupt(format!("create {}: {e}", dir.display())))?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", true)?;

        let version: i64 = conn.pragma_query_value(None, "user_version", |r| r.get(0))?;
        if version > SCHEMA_VERSION {
            return Err(StoreError::Corrupt(format!(
                "schema version {version} is newer than supported {SCHEMA_VERSION}"
            )));
        }
        conn.execute_batch(SCHEMA)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            timeout: Self::DEFAULT_TIMEOUT,
        })
    }

    /// Replace the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        if !timeout.is_zero() {
            self.timeout = timeout;
        }
        self
    }

    /// Run a synchronous store operation on the blocking pool, bounded by the
    /// store timeout. The connection lock is only taken inside `f`.
    pub async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&TaskStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = self.clone();
        let task = tokio::task::spawn_blocking(move || f(&store));
        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(res)) => res,
            Ok(Err(err)) => Err(StoreError::Join(err.to_string())),
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

#[cfg(test)]
impl TaskStore {
    /// Run raw SQL, for tests that need a row no public operation produces.
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<usize, StoreError> {
        Ok(self.lock()?.execute(sql, [])?)
    }
}

pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion<E>(err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
}

fn col_ts(row: &Row<'_>, name: &str) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(name)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(conversion)
}

fn col_ts_opt(row: &Row<'_>, name: &str) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(name)?;
    raw.map(|raw| {
        DateTime::parse_from_rfc3339(&raw)
            .map(|d| d.with_timezone(&Utc))
            .map_err(conversion)
    })
    .transpose()
}

fn col_uuid(row: &Row<'_>, name: &str) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(name)?;
    Uuid::parse_str(&raw).map_err(conversion)
}

fn col_uuid_opt(row: &Row<'_>, name: &str) -> rusqlite::Result<Option<Uuid>> {
    let raw: Option<String> = row.get(name)?;
    raw.map(|raw| Uuid::parse_str(&raw).map_err(conversion))
        .transpose()
}

fn col_parse<T>(row: &Row<'_>, name: &str) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(name)?;
    raw.parse().map_err(conversion)
}

fn col_json_opt(row: &Row<'_>, name: &str) -> rusqlite::Result<Option<serde_json::Value>> {
    let raw: Option<String> = row.get(name)?;
    raw.map(|raw| serde_json::from_str(&raw).map_err(conversion))
        .transpose()
}

fn json_text(value: Option<&serde_json::Value>) -> Option<String> {
    value.map(|v| v.to_string())
}

const MASTER_COLUMNS: &str = "id, name, analyzer_type, task_type, total_samples, completed_samples, \
     failed_samples, status, progress, instance_ids, parameters, execution, sample_filter, \
     result_summary, paused_at, pause_reason, created_at, updated_at";

const SUB_COLUMNS: &str = "id, master_task_id, sample_id, analyzer_type, instance_id, external_task_id, \
     status, paused_from, priority, retry_count, sweep_count, failure_transient, next_attempt_at, \
     parameters, error_message, created_at, started_at, completed_at, updated_at";

fn master_from_row(row: &Row<'_>) -> rusqlite::Result<MasterTask> {
    let instance_ids: String = row.get("instance_ids")?;
    let instance_ids: Vec<Uuid> = serde_json::from_str(&instance_ids).map_err(conversion)?;
    let execution = col_json_opt(row, "execution")?
        .map(serde_json::from_value)
        .transpose()
        .map_err(conversion)?;

    Ok(MasterTask {
        id: col_uuid(row, "id")?,
        name: row.get("name")?,
        analyzer_type: col_parse(row, "analyzer_type")?,
        task_type: col_parse(row, "task_type")?,
        total_samples: row.get("total_samples")?,
        completed_samples: row.get("completed_samples")?,
        failed_samples: row.get("failed_samples")?,
        status: col_parse(row, "status")?,
        progress: row.get("progress")?,
        instance_ids,
        parameters: col_json_opt(row, "parameters")?,
        execution,
        sample_filter: col_json_opt(row, "sample_filter")?,
        result_summary: col_json_opt(row, "result_summary")?,
        paused_at: col_ts_opt(row, "paused_at")?,
        pause_reason: row.get("pause_reason")?,
        created_at: col_ts(row, "created_at")?,
        updated_at: col_ts(row, "updated_at")?,
    })
}

fn sub_task_from_row(row: &Row<'_>) -> rusqlite::Result<SubTask> {
    let paused_from: Option<String> = row.get("paused_from")?;
    Ok(SubTask {
        id: col_uuid(row, "id")?,
        master_task_id: col_uuid(row, "master_task_id")?,
        sample_id: row.get("sample_id")?,
        analyzer_type: col_parse(row, "analyzer_type")?,
        instance_id: col_uuid_opt(row, "instance_id")?,
        external_task_id: row.get("external_task_id")?,
        status: col_parse(row, "status")?,
        paused_from: paused_from
            .map(|s| s.parse().map_err(conversion))
            .transpose()?,
        priority: row.get("priority")?,
        retry_count: row.get("retry_count")?,
        sweep_count: row.get("sweep_count")?,
        failure_transient: row.get("failure_transient")?,
        next_attempt_at: col_ts_opt(row, "next_attempt_at")?,
        parameters: col_json_opt(row, "parameters")?,
        error_message: row.get("error_message")?,
        created_at: col_ts(row, "created_at")?,
        started_at: col_ts_opt(row, "started_at")?,
        completed_at: col_ts_opt(row, "completed_at")?,
        updated_at: col_ts(row, "updated_at")?,
    })
}

fn invalid_transition(
    entity: &'static str,
    id: Uuid,
    from: impl std::fmt::Display,
    to: impl std::fmt::Display,
) -> StoreError {
    let err = StoreError::InvalidTransition {
        entity,
        id: id.to_string(),
        from: from.to_string(),
        to: to.to_string(),
    };
    tracing::error!(%id, entity, error = %err, "invariant violation: rejected state transition");
    err
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reopening_a_file_keeps_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db").join("farm.sqlite");
        drop(TaskStore::open(&path).unwrap());
        let store = TaskStore::open(&path).unwrap();
        let conn = store.lock().unwrap();
        let version: i64 = conn
            .pragma_query_value(None, "user_version", |r| r.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn newer_schema_is_refused() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1)
            .unwrap();
        assert!(matches!(TaskStore::init(conn), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn timestamps_sort_lexicographically() {
        let a = DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        let b = a + chrono::Duration::microseconds(1);
        assert!(ts(a) < ts(b));
        assert_eq!(ts(a).len(), ts(b).len());
    }

    #[tokio::test]
    async fn call_runs_on_blocking_pool() {
        let store = TaskStore::open_in_memory().unwrap();
        let n = store
            .call(|s| {
                let conn = s.lock()?;
                Ok(conn.query_row("SELECT count(*) FROM master_tasks", [], |r| {
                    r.get::<_, i64>(0)
                })?)
            })
            .await
            .unwrap();
        assert_eq!(n, 0);
    }
}
