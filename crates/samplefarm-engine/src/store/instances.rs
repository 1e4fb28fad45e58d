use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use uuid::Uuid;

use super::{StoreError, TaskStore, col_parse, col_ts, col_ts_opt, col_uuid, ts};
use crate::model::{AnalyzerInstance, AnalyzerType, InstanceHealth, NewInstance};

const INSTANCE_COLUMNS: &str = "id, name, analyzer_type, base_url, description, enabled, \
     timeout_seconds, max_concurrent_tasks, health_check_interval, status, last_health_check, \
     created_at, updated_at";

fn instance_from_row(row: &Row<'_>) -> rusqlite::Result<AnalyzerInstance> {
    Ok(AnalyzerInstance {
        id: col_uuid(row, "id")?,
        name: row.get("name")?,
        analyzer_type: col_parse(row, "analyzer_type")?,
        base_url: row.get("base_url")?,
        description: row.get("description")?,
        enabled: row.get("enabled")?,
        timeout_seconds: row.get::<_, i64>("timeout_seconds")?.max(0) as u64,
        max_concurrent_tasks: row.get("max_concurrent_tasks")?,
        health_check_interval: row.get::<_, i64>("health_check_interval")?.max(0) as u64,
        status: col_parse(row, "status")?,
        last_health_check: col_ts_opt(row, "last_health_check")?,
        created_at: col_ts(row, "created_at")?,
        updated_at: col_ts(row, "updated_at")?,
    })
}

fn load_instance(conn: &rusqlite::Connection, id: Uuid) -> Result<AnalyzerInstance, StoreError> {
    conn.query_row(
        &format!("SELECT {INSTANCE_COLUMNS} FROM analyzer_instances WHERE id = ?1"),
        params![id.to_string()],
        instance_from_row,
    )
    .optional()?
    .ok_or_else(|| StoreError::not_found("instance", id))
}

fn secs(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

impl TaskStore {
    /// Register a new instance; its health starts `unknown`.
    pub fn add_instance(
        &self,
        new: &NewInstance,
        now: DateTime<Utc>,
    ) -> Result<AnalyzerInstance, StoreError> {
        let conn = self.lock()?;
        let id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO analyzer_instances
             (id, name, analyzer_type, base_url, description, enabled, timeout_seconds,
              max_concurrent_tasks, health_check_interval, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'unknown', ?10, ?10)",
            params![
                id.to_string(),
                new.name,
                new.analyzer_type.as_str(),
                new.base_url,
                new.description,
                new.enabled,
                secs(new.timeout_seconds),
                new.max_concurrent_tasks,
                secs(new.health_check_interval),
                ts(now),
            ],
        )
        .map_err(|e| StoreError::from_write(e, || format!("instance name {:?}", new.name)))?;
        load_instance(&conn, id)
    }

    /// Insert or update an instance by name, keeping its id and health.
    pub fn upsert_instance(
        &self,
        new: &NewInstance,
        now: DateTime<Utc>,
    ) -> Result<AnalyzerInstance, StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO analyzer_instances
             (id, name, analyzer_type, base_url, description, enabled, timeout_seconds,
              max_concurrent_tasks, health_check_interval, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'unknown', ?10, ?10)
             ON CONFLICT (name) DO UPDATE SET
                 analyzer_type = excluded.analyzer_type,
                 base_url = excluded.base_url,
                 description = excluded.description,
                 enabled = excluded.enabled,
                 timeout_seconds = excluded.timeout_seconds,
                 max_concurrent_tasks = excluded.max_concurrent_tasks,
                 health_check_interval = excluded.health_check_interval,
                 updated_at = excluded.updated_at",
            params![
                Uuid::new_v4().to_string(),
                new.name,
                new.analyzer_type.as_str(),
                new.base_url,
                new.description,
                new.enabled,
                secs(new.timeout_seconds),
                new.max_concurrent_tasks,
                secs(new.health_check_interval),
                ts(now),
            ],
        )?;
        let id: String = conn.query_row(
            "SELECT id FROM analyzer_instances WHERE name = ?1",
            params![new.name],
            |r| r.get(0),
        )?;
        let id = Uuid::parse_str(&id).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        load_instance(&conn, id)
    }

    /// Fetch one instance.
    pub fn instance(&self, id: Uuid) -> Result<AnalyzerInstance, StoreError> {
        let conn = self.lock()?;
        load_instance(&conn, id)
    }

    /// Instances, optionally restricted to one family, ordered by name.
    pub fn list_instances(
        &self,
        analyzer: Option<AnalyzerType>,
    ) -> Result<Vec<AnalyzerInstance>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM analyzer_instances
             WHERE (?1 IS NULL OR analyzer_type = ?1)
             ORDER BY name ASC"
        ))?;
        let rows = stmt
            .query_map(params![analyzer.map(|a| a.as_str())], instance_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Enable or disable an instance.
    pub fn set_instance_enabled(
        &self,
        id: Uuid,
        enabled: bool,
        now: DateTime<Utc>,
    ) -> Result<AnalyzerInstance, StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE analyzer_instances SET enabled = ?2, updated_at = ?3 WHERE id = ?1",
            params![id.to_string(), enabled, ts(now)],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("instance", id));
        }
        load_instance(&conn, id)
    }

    /// Record the outcome of a health probe.
    pub fn record_health(
        &self,
        id: Uuid,
        health: InstanceHealth,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE analyzer_instances SET status = ?2, last_health_check = ?3 WHERE id = ?1",
            params![id.to_string(), health.as_str(), ts(now)],
        )?;
        Ok(())
    }

    /// Remove an instance with no live work assigned.
    pub fn remove_instance(&self, id: Uuid) -> Result<(), StoreError> {
        let conn = self.lock()?;
        load_instance(&conn, id)?;
        let live: i64 = conn.query_row(
            "SELECT count(*) FROM sub_tasks
             WHERE instance_id = ?1 AND status IN ('submitting', 'submitted', 'analyzing', 'paused')",
            params![id.to_string()],
            |r| r.get(0),
        )?;
        if live > 0 {
            return Err(StoreError::InUse(format!(
                "instance {id} still has {live} live sub-task(s); disable it first"
            )));
        }
        conn.execute(
            "DELETE FROM analyzer_instances WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(())
    }

    /// Live sub-tasks (`submitting`, `submitted`, `analyzing`) per instance.
    /// Rows paused from one of those states still hold their remote slot.
    pub fn inflight_by_instance(&self) -> Result<HashMap<Uuid, u32>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(
            "SELECT instance_id, count(*) FROM sub_tasks
             WHERE instance_id IS NOT NULL
               AND (status IN ('submitting', 'submitted', 'analyzing')
                    OR (status = 'paused'
                        AND paused_from IN ('submitting', 'submitted', 'analyzing')))
             GROUP BY instance_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((col_uuid(row, "instance_id")?, row.get::<_, u32>(1)?))
        })?;
        let mut out = HashMap::new();
        for row in rows {
            let (id, n) = row?;
            out.insert(id, n);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewMasterTask;
    use crate::model::TaskKind;

    #[test]
    fn add_rejects_duplicate_name_and_upsert_updates() {
        let store = TaskStore::open_in_memory().unwrap();
        let new = NewInstance::with_defaults("cape-1", AnalyzerType::Cape, "http://a:8000/apiv2");
        let inst = store.add_instance(&new, Utc::now()).unwrap();
        assert_eq!(inst.status, InstanceHealth::Unknown);
        assert_eq!(inst.max_concurrent_tasks, 5);
        assert!(matches!(
            store.add_instance(&new, Utc::now()),
            Err(StoreError::Duplicate(_))
        ));

        store
            .record_health(inst.id, InstanceHealth::Healthy, Utc::now())
            .unwrap();
        let updated = store
            .upsert_instance(
                &NewInstance {
                    base_url: "http://b:8000/apiv2".to_string(),
                    ..new
                },
                Utc::now(),
            )
            .unwrap();
        assert_eq!(updated.id, inst.id);
        assert_eq!(updated.base_url, "http://b:8000/apiv2");
        assert_eq!(updated.status, InstanceHealth::Healthy);
    }

    #[test]
    fn inflight_counts_and_removal_guard() {
        let store = TaskStore::open_in_memory().unwrap();
        let inst = store
            .add_instance(
                &NewInstance::with_defaults("cfg-1", AnalyzerType::Cfg, "http://c:17777"),
                Utc::now(),
            )
            .unwrap();
        let master = store
            .create_master_task(
                &NewMasterTask {
                    name: "m".to_string(),
                    analyzer_type: AnalyzerType::Cfg,
                    task_type: TaskKind::Batch,
                    sample_ids: vec!["a".to_string(), "b".to_string()],
                    instance_ids: Vec::new(),
                    parameters: None,
                    sample_filter: None,
                    priority: 0,
                },
                Utc::now(),
            )
            .unwrap();
        store
            .start_master(master.id, &Default::default(), Utc::now())
            .unwrap();
        store
            .claim_next_pending(master.id, inst.id, Utc::now())
            .unwrap()
            .unwrap();

        assert_eq!(store.inflight_by_instance().unwrap().get(&inst.id), Some(&1));
        assert!(matches!(store.remove_instance(inst.id), Err(StoreError::InUse(_))));

        // A paused submission still occupies the instance; a paused pending row does not.
        store.pause_master(master.id, None, Utc::now()).unwrap();
        assert_eq!(store.inflight_by_instance().unwrap().get(&inst.id), Some(&1));
        store.resume_master(master.id, Utc::now()).unwrap();

        let disabled = store.set_instance_enabled(inst.id, false, Utc::now()).unwrap();
        assert!(!disabled.enabled);
        assert_eq!(store.list_instances(Some(AnalyzerType::Cfg)).unwrap().len(), 1);
        assert!(store.list_instances(Some(AnalyzerType::Cape)).unwrap().is_empty());
    }
}
