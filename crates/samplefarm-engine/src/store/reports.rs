use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::tasks::page_bounds;
use super::{StoreError, TaskStore, col_json_opt, col_parse, col_ts, col_ts_opt, col_uuid, ts};
use crate::model::{
    AnalysisStats, AnalyzerType, Page, SampleAnalysis, SubTaskStatus, TaskStatistics,
};

/// Results of both families as one relation.
const ALL_RESULTS: &str = "SELECT sub_task_id, external_task_id, malscore, summary, created_at
         FROM cape_analysis_results
     UNION ALL
     SELECT sub_task_id, external_task_id, NULL, summary, created_at
         FROM cfg_analysis_results";

/// Statistics filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsQuery {
    /// Restrict to one family.
    pub analyzer_type: Option<AnalyzerType>,
    /// Restrict to sub-tasks assigned to one instance.
    pub instance_id: Option<Uuid>,
    /// Only sub-tasks created at or after this time.
    pub since: Option<DateTime<Utc>>,
}

impl TaskStore {
    /// Stored results of `sample_id` across every batch, newest first, with
    /// an aggregate over all of them.
    pub fn sample_history(
        &self,
        sample_id: &str,
        page: u32,
        page_size: u32,
    ) -> Result<(Page<SampleAnalysis>, AnalysisStats), StoreError> {
        let conn = self.lock()?;
        let (page, page_size, offset) = page_bounds(page, page_size);

        let stats = conn.query_row(
            &format!(
                "SELECT COUNT(*) AS total, AVG(r.malscore) AS avg_score,
                        MAX(r.malscore) AS max_score, MAX(r.created_at) AS latest
                 FROM ({ALL_RESULTS}) r
                 JOIN sub_tasks s ON s.id = r.sub_task_id
                 WHERE s.sample_id = ?1"
            ),
            params![sample_id],
            |row| {
                Ok(AnalysisStats {
                    total_analyses: row.get::<_, i64>("total")?.max(0) as u64,
                    average_malscore: row.get("avg_score")?,
                    max_malscore: row.get("max_score")?,
                    latest_analysis: col_ts_opt(row, "latest")?,
                })
            },
        )?;

        let mut stmt = conn.prepare(&format!(
            "SELECT r.sub_task_id, s.master_task_id, m.name AS master_name, s.analyzer_type,
                    r.external_task_id, r.malscore, r.summary, r.created_at
             FROM ({ALL_RESULTS}) r
             JOIN sub_tasks s ON s.id = r.sub_task_id
             JOIN master_tasks m ON m.id = s.master_task_id
             WHERE s.sample_id = ?1
             ORDER BY r.created_at DESC, r.sub_task_id
             LIMIT ?2 OFFSET ?3"
        ))?;
        let items = stmt
            .query_map(params![sample_id, page_size, offset], |row| {
                Ok(SampleAnalysis {
                    sub_task_id: col_uuid(row, "sub_task_id")?,
                    master_task_id: col_uuid(row, "master_task_id")?,
                    master_name: row.get("master_name")?,
                    analyzer_type: col_parse(row, "analyzer_type")?,
                    external_task_id: row.get("external_task_id")?,
                    malscore: row.get("malscore")?,
                    summary: col_json_opt(row, "summary")?.unwrap_or_default(),
                    created_at: col_ts(row, "created_at")?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((
            Page {
                items,
                total: stats.total_analyses,
                page,
                page_size,
            },
            stats,
        ))
    }

    /// Outcome counts and mean analysis time of the sub-tasks matching
    /// `query`, as of `now`.
    pub fn task_statistics(
        &self,
        query: &StatsQuery,
        now: DateTime<Utc>,
    ) -> Result<TaskStatistics, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT status, started_at, completed_at FROM sub_tasks
             WHERE (?1 IS NULL OR analyzer_type = ?1)
               AND (?2 IS NULL OR instance_id = ?2)
               AND (?3 IS NULL OR created_at >= ?3)
               AND created_at <= ?4",
        )?;
        let rows = stmt.query_map(
            params![
                query.analyzer_type.map(|a| a.as_str()),
                query.instance_id.map(|id| id.to_string()),
                query.since.map(ts),
                ts(now),
            ],
            |row| {
                Ok((
                    col_parse::<SubTaskStatus>(row, "status")?,
                    col_ts_opt(row, "started_at")?,
                    col_ts_opt(row, "completed_at")?,
                ))
            },
        )?;

        let mut stats = TaskStatistics {
            period_start: query.since,
            period_end: now,
            total: 0,
            completed: 0,
            failed: 0,
            cancelled: 0,
            outstanding: 0,
            success_rate: 0.0,
            average_duration_secs: None,
        };
        let (mut timed, mut seconds) = (0u64, 0f64);
        for row in rows {
            let (status, started_at, completed_at) = row?;
            stats.total += 1;
            match status {
                SubTaskStatus::Completed => {
                    stats.completed += 1;
                    if let (Some(start), Some(end)) = (started_at, completed_at) {
                        timed += 1;
                        seconds += (end - start).num_milliseconds().max(0) as f64 / 1000.0;
                    }
                }
                SubTaskStatus::Failed => stats.failed += 1,
                SubTaskStatus::Cancelled => stats.cancelled += 1,
                _ => stats.outstanding += 1,
            }
        }
        let decided = stats.completed + stats.failed;
        if decided > 0 {
            stats.success_rate =
                (stats.completed as f64 * 100.0 / decided as f64 * 100.0).round() / 100.0;
        }
        if timed > 0 {
            stats.average_duration_secs = Some(seconds / timed as f64);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::model::{AnalysisResult, MasterTask, TaskKind};
    use crate::store::NewMasterTask;

    fn running(store: &TaskStore, name: &str, analyzer: AnalyzerType, samples: &[&str]) -> MasterTask {
        let master = store
            .create_master_task(
                &NewMasterTask {
                    name: name.to_string(),
                    analyzer_type: analyzer,
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
        store
            .start_master(master.id, &samplefarm_core::ExecutionConfig::default(), Utc::now())
            .unwrap()
    }

    /// Claim, submit and complete the next sub-task of `master`.
    fn complete_next(
        store: &TaskStore,
        master: &MasterTask,
        instance: Uuid,
        summary: serde_json::Value,
        started: DateTime<Utc>,
        finished: DateTime<Utc>,
    ) -> Uuid {
        let sub = store
            .claim_next_pending(master.id, instance, started)
            .unwrap()
            .unwrap();
        store.record_submitted(sub.id, "77", started).unwrap();
        store
            .complete_sub_task(
                &AnalysisResult {
                    sub_task_id: sub.id,
                    analyzer_type: master.analyzer_type,
                    external_task_id: "77".to_string(),
                    summary,
                    report: serde_json::json!({}),
                    created_at: finished,
                },
                finished,
            )
            .unwrap();
        sub.id
    }

    #[test]
    fn history_spans_batches_and_families() {
        let store = TaskStore::open_in_memory().unwrap();
        let now = Utc::now();
        let inst = Uuid::new_v4();
        let first = running(&store, "monday", AnalyzerType::Cape, &["a"]);
        let second = running(&store, "tuesday", AnalyzerType::Cape, &["a", "b"]);
        let static_run = running(&store, "static", AnalyzerType::Cfg, &["a"]);

        complete_next(&store, &first, inst, serde_json::json!({"malscore": 2.0}), now, now - Duration::hours(3));
        complete_next(&store, &second, inst, serde_json::json!({"malscore": 8.0}), now, now - Duration::hours(2));
        complete_next(&store, &static_run, inst, serde_json::json!({"families": 1}), now, now - Duration::hours(1));

        let (page, stats) = store.sample_history("a", 1, 2).unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].master_name, "static");
        assert_eq!(page.items[0].analyzer_type, AnalyzerType::Cfg);
        assert_eq!(page.items[0].malscore, None);
        assert_eq!(page.items[1].master_name, "tuesday");
        assert_eq!(page.items[1].malscore, Some(8.0));

        assert_eq!(stats.total_analyses, 3);
        assert_eq!(stats.average_malscore, Some(5.0));
        assert_eq!(stats.max_malscore, Some(8.0));
        assert!(stats.latest_analysis.is_some());

        let (rest, _) = store.sample_history("a", 2, 2).unwrap();
        assert_eq!(rest.items.len(), 1);
        assert_eq!(rest.items[0].master_name, "monday");

        let (none, stats) = store.sample_history("b", 1, 20).unwrap();
        assert!(none.items.is_empty());
        assert_eq!(stats, AnalysisStats::default());
    }

    #[test]
    fn statistics_count_outcomes_and_mean_duration() {
        let store = TaskStore::open_in_memory().unwrap();
        let now = Utc::now();
        let inst = Uuid::new_v4();
        let master = running(&store, "m", AnalyzerType::Cape, &["a", "b", "c", "d"]);
        complete_next(&store, &master, inst, serde_json::json!({}), now - Duration::seconds(100), now - Duration::seconds(40));
        complete_next(&store, &master, inst, serde_json::json!({}), now - Duration::seconds(100), now - Duration::seconds(80));
        let failing = store
            .claim_next_pending(master.id, inst, Utc::now())
            .unwrap()
            .unwrap();
        store
            .record_failure(failing.id, "unsupported file", false, None, Utc::now())
            .unwrap();

        let stats = store.task_statistics(&StatsQuery::default(), Utc::now()).unwrap();
        assert_eq!(stats.total, 4);
        assert_eq!((stats.completed, stats.failed, stats.cancelled), (2, 1, 0));
        assert_eq!(stats.outstanding, 1);
        assert_eq!(stats.success_rate, 66.67);
        assert_eq!(stats.average_duration_secs, Some(40.0));

        let other_family = StatsQuery {
            analyzer_type: Some(AnalyzerType::Cfg),
            ..StatsQuery::default()
        };
        assert_eq!(store.task_statistics(&other_family, Utc::now()).unwrap().total, 0);

        let other_instance = StatsQuery {
            instance_id: Some(Uuid::new_v4()),
            ..StatsQuery::default()
        };
        assert_eq!(store.task_statistics(&other_instance, Utc::now()).unwrap().total, 0);

        let future = StatsQuery {
            since: Some(Utc::now() + Duration::hours(1)),
            ..StatsQuery::default()
        };
        let empty = store.task_statistics(&future, Utc::now()).unwrap();
        assert_eq!(empty.total, 0);
        assert_eq!(empty.success_rate, 0.0);
        assert_eq!(empty.average_duration_secs, None);
    }
}
