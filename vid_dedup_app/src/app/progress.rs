//! Terminal progress rendering for the pipeline phases.

use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;

use vid_dedup_lib::{Phase, ProgressSink};

use crate::app::app_cfg::ReportVerbosity;

pub struct TerminalProgress {
    enabled: bool,
    current: Mutex<Option<ProgressBar>>,
}

impl TerminalProgress {
    #[must_use]
    pub fn new(verbosity: ReportVerbosity) -> Self {
        Self {
            //verbose logging and progress bars fight over the terminal
            enabled: verbosity == ReportVerbosity::Default,
            current: Mutex::new(None),
        }
    }

    fn finish_current(&self) {
        if let Some(bar) = self.current.lock().take() {
            bar.finish();
        }
    }

    fn phase_label(phase: Phase) -> &'static str {
        match phase {
            Phase::Discover => "Querying files",
            Phase::Hash => "Hashing videos",
            Phase::Index => "Building search index",
            Phase::Search => "Finding potential duplicates",
        }
    }
}

impl ProgressSink for TerminalProgress {
    fn begin(&self, phase: Phase, total: u64) {
        if !self.enabled {
            return;
        }
        self.finish_current();

        let bar = if total > 0 {
            let bar = ProgressBar::new(total);
            bar.set_style(
                ProgressStyle::with_template(
                    "{msg:28} [{bar:40}] {pos}/{len} ({eta})",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
            );
            bar
        } else {
            let bar = ProgressBar::new_spinner();
            bar.enable_steady_tick(std::time::Duration::from_millis(120));
            bar
        };
        bar.set_message(Self::phase_label(phase));
        *self.current.lock() = Some(bar);
    }

    fn advance(&self, _phase: Phase) {
        if let Some(bar) = self.current.lock().as_ref() {
            bar.inc(1);
        }
    }
}

impl Drop for TerminalProgress {
    fn drop(&mut self) {
        self.finish_current();
    }
}
