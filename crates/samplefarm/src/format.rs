use serde::Serialize;

use samplefarm_engine::TaskPreview;
use samplefarm_engine::model::{
    AnalysisResult, AnalyzerInstance, MasterTask, RuntimeStatus, SampleAnalysis,
    SampleAnalysisHistory, SubTask, TaskStatistics,
};

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn short(id: &uuid::Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

pub fn master_line(m: &MasterTask) -> String {
    format!(
        "{}  {:<9} {:<4} {:>5}/{:<5} failed {:<4} {:>5.1}%  {}",
        m.id,
        m.status.as_str(),
        m.analyzer_type.as_str(),
        m.completed_samples,
        m.total_samples,
        m.failed_samples,
        m.progress,
        m.name
    )
}

pub fn master_detail(m: &MasterTask) -> String {
    let mut out = master_line(m);
    out.push_str(&format!("\n  kind       {}", m.task_type));
    out.push_str(&format!("\n  created    {}", m.created_at.to_rfc3339()));
    out.push_str(&format!("\n  updated    {}", m.updated_at.to_rfc3339()));
    if let Some(at) = m.paused_at {
        let reason = m.pause_reason.as_deref().unwrap_or("-");
        out.push_str(&format!("\n  paused     {} ({reason})", at.to_rfc3339()));
    }
    if !m.instance_ids.is_empty() {
        let ids: Vec<String> = m.instance_ids.iter().map(short).collect();
        out.push_str(&format!("\n  instances  {}", ids.join(", ")));
    }
    if let Some(summary) = &m.result_summary {
        out.push_str(&format!("\n  summary    {summary}"));
    }
    out
}

pub fn sub_task_line(s: &SubTask) -> String {
    let remote = s.external_task_id.as_deref().unwrap_or("-");
    let mut line = format!(
        "{}  {:<10} {:<24} remote {:<10} retries {}",
        s.id,
        s.status.as_str(),
        s.sample_id,
        remote,
        s.retry_count
    );
    if let Some(err) = s.error_message.as_deref() {
        let kind = if s.failure_transient { "transient" } else { "permanent" };
        line.push_str(&format!("  [{kind}] {err}"));
    }
    line
}

pub fn instance_line(i: &AnalyzerInstance) -> String {
    format!(
        "{}  {:<4} {:<16} {:<9} {:<8} max {:<3} {}",
        i.id,
        i.analyzer_type.as_str(),
        i.name,
        i.status.as_str(),
        if i.enabled { "enabled" } else { "disabled" },
        i.max_concurrent_tasks,
        i.base_url
    )
}

pub fn status_block(s: &RuntimeStatus) -> String {
    let c = &s.counts;
    let mut out = format!(
        "{}  {}  {:.1}% of {}",
        s.master_task_id,
        s.status.as_str(),
        s.progress_percentage,
        s.total_samples
    );
    for (label, n) in [
        ("pending", c.pending),
        ("submitting", c.submitting),
        ("submitted", c.submitted),
        ("analyzing", c.analyzing),
        ("paused", c.paused),
        ("completed", c.completed),
        ("failed", c.failed),
        ("cancelled", c.cancelled),
    ] {
        out.push_str(&format!("\n  {label:<11}{n}"));
    }
    out
}

pub fn result_text(r: &AnalysisResult) -> anyhow::Result<String> {
    Ok(format!(
        "{} {} remote {}\n{}",
        r.sub_task_id,
        r.analyzer_type,
        r.external_task_id,
        serde_json::to_string_pretty(&r.summary)?
    ))
}

pub fn preview_block(p: &TaskPreview) -> String {
    let estimate = p
        .estimated_duration_minutes
        .map_or_else(|| "-".to_string(), |m| format!("~{m} min"));
    let mut out = format!(
        "{} samples, {} bytes, {} eligible {} instance(s), estimate {estimate}",
        p.total_samples,
        p.total_size,
        p.eligible_instances,
        p.analyzer.as_str()
    );
    if !p.file_type_distribution.is_empty() {
        out.push_str("\n  file types");
        for t in &p.file_type_distribution {
            out.push_str(&format!("\n    {:<10} {:>6}  {} bytes", t.file_type, t.count, t.size));
        }
    }
    for (title, entries) in [
        ("sample types", &p.sample_type_distribution),
        ("sources", &p.source_distribution),
    ] {
        if entries.is_empty() {
            continue;
        }
        out.push_str(&format!("\n  {title}"));
        for v in entries {
            out.push_str(&format!("\n    {:<24} {:>6}", v.value, v.count));
        }
    }
    out
}

pub fn history_header(h: &SampleAnalysisHistory) -> String {
    let score = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |s| format!("{s:.1}"));
    format!(
        "{}  {} analyses  avg score {}  max score {}",
        h.sample_id,
        h.stats.total_analyses,
        score(h.stats.average_malscore),
        score(h.stats.max_malscore)
    )
}

pub fn analysis_line(a: &SampleAnalysis) -> String {
    let score = a.malscore.map_or_else(|| "-".to_string(), |s| format!("{s:.1}"));
    format!(
        "{}  {:<4} score {:<5} remote {:<10} {} ({})",
        a.created_at.to_rfc3339(),
        a.analyzer_type.as_str(),
        score,
        a.external_task_id,
        a.master_name,
        short(&a.master_task_id)
    )
}

pub fn stats_block(s: &TaskStatistics) -> String {
    let since = s
        .period_start
        .map_or_else(|| "the beginning".to_string(), |t| t.to_rfc3339());
    let mean = s
        .average_duration_secs
        .map_or_else(|| "-".to_string(), |d| format!("{d:.1}s"));
    let mut out = format!("since {since}: {} sub-task(s)", s.total);
    for (label, value) in [
        ("completed", s.completed.to_string()),
        ("failed", s.failed.to_string()),
        ("cancelled", s.cancelled.to_string()),
        ("outstanding", s.outstanding.to_string()),
        ("success", format!("{:.2}%", s.success_rate)),
        ("mean time", mean),
    ] {
        out.push_str(&format!("\n  {label:<12}{value}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use samplefarm_core::AnalyzerType;
    use samplefarm_engine::model::{StatusCounts, SubTaskStatus};
    use uuid::Uuid;

    #[test]
    fn sub_task_line_shows_failure_kind() {
        let now = Utc::now();
        let sub = SubTask {
            id: Uuid::nil(),
            master_task_id: Uuid::nil(),
            sample_id: "s-1".into(),
            analyzer_type: AnalyzerType::Cape,
            instance_id: None,
            external_task_id: Some("42".into()),
            status: SubTaskStatus::Failed,
            paused_from: None,
            priority: 0,
            retry_count: 3,
            sweep_count: 0,
            failure_transient: true,
            next_attempt_at: None,
            parameters: None,
            error_message: Some("cape: http 503: busy".into()),
            created_at: now,
            started_at: None,
            completed_at: Some(now),
            updated_at: now,
        };
        let line = sub_task_line(&sub);
        assert!(line.contains("failed"));
        assert!(line.contains("remote 42"));
        assert!(line.ends_with("[transient] cape: http 503: busy"));
    }

    #[test]
    fn preview_block_skips_empty_sections() {
        let preview = TaskPreview {
            analyzer: AnalyzerType::Cape,
            total_samples: 2,
            total_size: 300,
            file_type_distribution: vec![samplefarm_engine::preview::FileTypeCount {
                file_type: "exe".into(),
                count: 2,
                size: 300,
            }],
            sample_type_distribution: Vec::new(),
            source_distribution: vec![samplefarm_engine::preview::ValueCount {
                value: "feed".into(),
                count: 2,
            }],
            eligible_instances: 1,
            estimated_duration_minutes: Some(6),
        };
        let block = preview_block(&preview);
        assert!(block.starts_with("2 samples, 300 bytes, 1 eligible CAPE instance(s), estimate ~6 min"));
        assert!(block.contains("file types"));
        assert!(!block.contains("sample types"));
        assert!(block.contains("sources"));
    }

    #[test]
    fn stats_block_without_period_or_timings() {
        let stats = TaskStatistics {
            period_start: None,
            period_end: Utc::now(),
            total: 4,
            completed: 2,
            failed: 1,
            cancelled: 0,
            outstanding: 1,
            success_rate: 66.67,
            average_duration_secs: None,
        };
        let block = stats_block(&stats);
        assert!(block.starts_with("since the beginning: 4 sub-task(s)"));
        assert!(block.contains("success     66.67%"));
        assert!(block.contains("mean time   -"));
    }

    #[test]
    fn status_block_lists_every_state() {
        let s = RuntimeStatus {
            master_task_id: Uuid::nil(),
            status: samplefarm_engine::model::MasterTaskStatus::Paused,
            total_samples: 3,
            counts: StatusCounts {
                paused: 2,
                completed: 1,
                ..StatusCounts::default()
            },
            progress_percentage: 33.333,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            paused_at: None,
            pause_reason: None,
        };
        let block = status_block(&s);
        assert!(block.starts_with(&format!("{}  paused  33.3% of 3", Uuid::nil())));
        assert_eq!(block.lines().count(), 9);
        assert!(block.contains("paused     2"));
    }
}
