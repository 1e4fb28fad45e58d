use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use samplefarm_engine::model::{RuntimeStatus, StatusCounts};

/// Progress display for `sforch watch`: one bar over the batch's samples
/// plus a per-state breakdown.
pub(crate) struct WatchUi {
    bar: ProgressBar,
    last_line: Option<String>,
    plain: bool,
}

impl WatchUi {
    /// `interactive` selects the live bar; otherwise each change prints one line.
    pub(crate) fn new(name: &str, total: u32, interactive: bool) -> Self {
        let bar = ProgressBar::new(u64::from(total));
        if interactive {
            bar.set_draw_target(ProgressDrawTarget::stderr());
            let style = ProgressStyle::with_template(
                "{prefix} {bar:30.cyan/blue} {pos}/{len} {msg}\u{1b}[0K",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#--");
            bar.set_style(style);
            bar.set_prefix(name.to_string());
        } else {
            bar.set_draw_target(ProgressDrawTarget::hidden());
        }
        Self {
            bar,
            last_line: None,
            plain: !interactive,
        }
    }

    pub(crate) fn update(&mut self, status: &RuntimeStatus) {
        let line = breakdown(status);
        self.bar.set_length(u64::from(status.total_samples));
        self.bar.set_position(finished(&status.counts));
        if self.plain && self.last_line.as_deref() != Some(line.as_str()) {
            println!("{line}");
        }
        self.bar.set_message(line.clone());
        self.last_line = Some(line);
    }

    pub(crate) fn finish(&self) {
        self.bar.abandon();
    }
}

fn finished(counts: &StatusCounts) -> u64 {
    u64::from(counts.completed) + u64::from(counts.failed) + u64::from(counts.cancelled)
}

/// One-line summary, e.g. `running 40.0% | queued 3 remote 2 paused 0 | ok 4 failed 1 cancelled 0`.
pub(crate) fn breakdown(status: &RuntimeStatus) -> String {
    let c = &status.counts;
    format!(
        "{} {:.1}% | queued {} remote {} paused {} | ok {} failed {} cancelled {}",
        status.status.as_str(),
        status.progress_percentage,
        c.pending + c.submitting,
        c.submitted + c.analyzing,
        c.paused,
        c.completed,
        c.failed,
        c.cancelled,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use samplefarm_engine::model::MasterTaskStatus;
    use uuid::Uuid;

    fn status(counts: StatusCounts) -> RuntimeStatus {
        RuntimeStatus {
            master_task_id: Uuid::new_v4(),
            status: MasterTaskStatus::Running,
            total_samples: 10,
            counts,
            progress_percentage: 40.0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            paused_at: None,
            pause_reason: None,
        }
    }

    #[test]
    fn breakdown_groups_states() {
        let s = status(StatusCounts {
            pending: 2,
            submitting: 1,
            submitted: 1,
            analyzing: 1,
            completed: 4,
            failed: 1,
            ..StatusCounts::default()
        });
        assert_eq!(
            breakdown(&s),
            "running 40.0% | queued 3 remote 2 paused 0 | ok 4 failed 1 cancelled 0"
        );
        assert_eq!(finished(&s.counts), 5);
    }

    #[test]
    fn hidden_bar_tracks_position() {
        let mut ui = WatchUi::new("nightly", 10, false);
        ui.plain = false;
        ui.update(&status(StatusCounts {
            completed: 3,
            cancelled: 1,
            ..StatusCounts::default()
        }));
        assert_eq!(ui.bar.position(), 4);
        assert_eq!(ui.bar.length(), Some(10));
        ui.finish();
    }
}
