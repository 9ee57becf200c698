//! Throttled progress reporting.
//!
//! [`ProgressReporter`] decides *when* to report; a [`ProgressSink`] decides
//! *how*. Workers call [`ProgressReporter::report`] after every consumed
//! reply, concurrently, so the throttle state lives behind one lock.

use std::{
    io::{self, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use tracing::info;

use crate::common::DEFAULT_PROGRESS_THRESHOLD;

/// Frames of the rotating activity indicator.
const SPINNER: [char; 4] = ['◐', '◓', '◑', '◒'];

/// One emitted progress update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub completed: u64,
    pub total: u64,
    pub indicator: char,
}

impl ProgressUpdate {
    pub fn percent(&self) -> u64 {
        if self.total == 0 {
            return 0;
        }
        self.completed.saturating_mul(100) / self.total
    }

    pub fn is_final(&self) -> bool {
        self.completed == self.total
    }
}

/// Renders progress updates.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, update: &ProgressUpdate);
}

#[derive(Debug)]
struct ReporterState {
    last_emitted: u64,
    spinner: usize,
    final_emitted: bool,
}

/// Rate-limits `(completed, total)` notifications.
///
/// While `total` is still growing an update is emitted only when at least
/// `threshold` items completed since the last emitted one, and never with
/// `completed == total`. Once the total is final, the update with
/// `completed == total` is emitted exactly once.
pub struct ProgressReporter {
    threshold: u64,
    state: Mutex<ReporterState>,
    sink: Arc<dyn ProgressSink>,
}

impl ProgressReporter {
    /// A zero threshold is coerced to the default.
    pub fn new(threshold: u64, sink: Arc<dyn ProgressSink>) -> Self {
        let threshold = if threshold == 0 {
            DEFAULT_PROGRESS_THRESHOLD
        } else {
            threshold
        };
        Self {
            threshold,
            state: Mutex::new(ReporterState {
                last_emitted: 0,
                spinner: 0,
                final_emitted: false,
            }),
            sink,
        }
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Offer one observation. `total_is_final` tells whether `total` can
    /// still grow. Returns whether the observation was emitted.
    pub fn report(&self, completed: u64, total: u64, total_is_final: bool) -> bool {
        if total == 0 {
            return false;
        }
        let mut state = self.state.lock();
        if completed >= total {
            if !total_is_final || state.final_emitted {
                return false;
            }
            state.final_emitted = true;
        } else if completed.saturating_sub(state.last_emitted) < self.threshold {
            // Reports may arrive out of order; a stale one never moves the
            // throttle backwards.
            return false;
        }
        state.last_emitted = state.last_emitted.max(completed);
        let indicator = SPINNER[state.spinner];
        state.spinner = (state.spinner + 1) % SPINNER.len();

        self.sink.emit(&ProgressUpdate {
            completed,
            total,
            indicator,
        });
        true
    }

    /// Emit the final update if the last completion was observed before the
    /// total was known to be final.
    pub fn finish(&self, completed: u64, total: u64) -> bool {
        self.report(completed, total, true)
    }

    /// Forget the throttle state.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.last_emitted = 0;
        state.spinner = 0;
        state.final_emitted = false;
    }
}

/// Logs progress through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn emit(&self, update: &ProgressUpdate) {
        info!(
            completed = update.completed,
            total = update.total,
            "Progress {}% {} / {}",
            update.percent(),
            update.completed,
            update.total
        );
    }
}

/// Draws a boxed progress bar on stdout.
#[derive(Debug)]
pub struct ConsoleProgressBar {
    width: usize,
    /// A frame is on screen and the next one replaces it.
    drawn: AtomicBool,
}

impl ConsoleProgressBar {
    const DEFAULT_WIDTH: usize = 120;
    const MIN_BAR: usize = 20;

    pub fn new(width: usize) -> Self {
        Self {
            width,
            drawn: AtomicBool::new(false),
        }
    }

    /// Size the bar from the `COLUMNS` environment variable.
    pub fn from_env() -> Self {
        let width = std::env::var("COLUMNS")
            .ok()
            .and_then(|columns| columns.trim().parse().ok())
            .unwrap_or(Self::DEFAULT_WIDTH);
        Self::new(width)
    }

    /// The three lines of the bar, without cursor control sequences.
    pub fn render(&self, update: &ProgressUpdate) -> String {
        let status = format!(
            "{}% {} / {} {}",
            update.percent(),
            group_thousands(update.completed),
            group_thousands(update.total),
            update.indicator
        );
        let status_len = status.chars().count();
        let bar = Self::MIN_BAR.max(self.width.saturating_sub(status_len + 10));
        let filled = if update.total == 0 {
            0
        } else {
            ((update.completed.min(update.total) as u128 * bar as u128) / update.total as u128)
                as usize
        };

        let mut out = String::new();
        out.push('┌');
        out.push_str(&"─".repeat(bar));
        out.push('┐');
        out.push_str(&" ".repeat(self.width.saturating_sub(bar + 2)));
        out.push('\n');

        out.push('║');
        out.push_str(&"█".repeat(filled));
        out.push_str(&"░".repeat(bar - filled));
        out.push_str("║ ");
        out.push_str(&status);
        out.push_str(&" ".repeat(self.width.saturating_sub(bar + status_len + 3)));
        out.push('\n');

        out.push('└');
        out.push_str(&"─".repeat(bar));
        out.push('┘');
        out.push_str(&" ".repeat(self.width.saturating_sub(bar + 3)));
        out
    }

    /// The bytes written for one update, cursor control included.
    ///
    /// The first frame is drawn below the current line; every later one moves
    /// up over the previous frame and clears it. The final frame ends the
    /// line so the next bar starts fresh.
    fn compose(&self, update: &ProgressUpdate) -> String {
        let frame = self.render(update);
        let redraw = if update.is_final() {
            self.drawn.swap(false, Ordering::AcqRel)
        } else {
            self.drawn.swap(true, Ordering::AcqRel)
        };
        let mut out = if redraw {
            format!("\r\x1b[2A\x1b[J{frame}")
        } else {
            format!("\r{frame}")
        };
        if update.is_final() {
            out.push('\n');
        }
        out
    }
}

impl ProgressSink for ConsoleProgressBar {
    fn emit(&self, update: &ProgressUpdate) {
        let out = self.compose(update);
        let mut stdout = io::stdout().lock();
        let _ = stdout.write_all(out.as_bytes());
        let _ = stdout.flush();
    }
}

/// `1234567` -> `1,234,567`.
pub fn group_thousands(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        updates: Mutex<Vec<ProgressUpdate>>,
    }

    impl ProgressSink for RecordingSink {
        fn emit(&self, update: &ProgressUpdate) {
            self.updates.lock().push(*update);
        }
    }

    #[test]
    fn test_throttle_sequential() {
        let sink = Arc::new(RecordingSink::default());
        let reporter = ProgressReporter::new(10, sink.clone());

        let total = 95;
        for completed in 1..=total {
            reporter.report(completed, total, true);
        }

        let updates = sink.updates.lock();
        let completed: Vec<u64> = updates.iter().map(|u| u.completed).collect();
        assert_eq!(completed, vec![10, 20, 30, 40, 50, 60, 70, 80, 90, 95]);
        assert!(updates.len() as u64 <= total.div_ceil(10) + 1);
        assert_eq!(updates.iter().filter(|u| u.is_final()).count(), 1);
    }

    #[test]
    fn test_final_always_emitted() {
        let sink = Arc::new(RecordingSink::default());
        let reporter = ProgressReporter::new(10, sink.clone());
        assert!(!reporter.report(1, 3, true));
        assert!(!reporter.report(2, 3, true));
        assert!(reporter.report(3, 3, true));
        assert_eq!(sink.updates.lock().len(), 1);
    }

    #[test]
    fn test_growing_total_never_looks_final() {
        let sink = Arc::new(RecordingSink::default());
        let reporter = ProgressReporter::new(10, sink.clone());
        // Consumers caught up with a producer that is still loading
        for completed in 1..=25 {
            reporter.report(completed, completed, false);
        }
        assert!(reporter.finish(25, 25));
        assert!(!reporter.finish(25, 25));

        let updates = sink.updates.lock();
        assert!(updates.len() as u64 <= 25u64.div_ceil(10) + 1);
        assert_eq!(updates.iter().filter(|u| u.is_final()).count(), 1);
        assert_eq!(updates.last().map(|u| u.completed), Some(25));
    }

    #[test]
    fn test_final_emitted_once() {
        let sink = Arc::new(RecordingSink::default());
        let reporter = ProgressReporter::new(10, sink.clone());
        assert!(reporter.report(3, 3, true));
        assert!(!reporter.finish(3, 3));
        assert_eq!(sink.updates.lock().len(), 1);
    }

    #[test]
    fn test_stale_report_is_suppressed() {
        let sink = Arc::new(RecordingSink::default());
        let reporter = ProgressReporter::new(10, sink.clone());
        assert!(reporter.report(20, 100, true));
        assert!(!reporter.report(15, 100, true));
        assert!(!reporter.report(29, 100, true));
        assert!(reporter.report(30, 100, true));
    }

    #[test]
    fn test_spinner_rotates() {
        let sink = Arc::new(RecordingSink::default());
        let reporter = ProgressReporter::new(1, sink.clone());
        for completed in 1..=5 {
            reporter.report(completed, 5, true);
        }
        let indicators: Vec<char> = sink.updates.lock().iter().map(|u| u.indicator).collect();
        assert_eq!(indicators, vec!['◐', '◓', '◑', '◒', '◐']);
    }

    #[test]
    fn test_zero_threshold_and_total() {
        let sink = Arc::new(RecordingSink::default());
        let reporter = ProgressReporter::new(0, sink.clone());
        assert_eq!(reporter.threshold(), DEFAULT_PROGRESS_THRESHOLD);
        assert!(!reporter.report(0, 0, true));
        assert!(sink.updates.lock().is_empty());
    }

    #[test]
    fn test_concurrent_reports_bounded() {
        let sink = Arc::new(RecordingSink::default());
        let reporter = Arc::new(ProgressReporter::new(10, sink.clone()));
        let counter = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let total = 1000;

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reporter = reporter.clone();
                let counter = counter.clone();
                std::thread::spawn(move || loop {
                    let completed = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                    if completed > total {
                        break;
                    }
                    reporter.report(completed, total, true);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let updates = sink.updates.lock();
        assert!(updates.len() as u64 <= total.div_ceil(10) + 1);
        assert_eq!(updates.iter().filter(|u| u.completed == total).count(), 1);
    }

    #[test]
    fn test_render() {
        let bar = ConsoleProgressBar::new(60);
        let frame = bar.render(&ProgressUpdate {
            completed: 1500,
            total: 3000,
            indicator: '◐',
        });
        let lines: Vec<&str> = frame.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with('┌'));
        assert!(lines[1].contains("50% 1,500 / 3,000 ◐"));
        assert!(lines[2].starts_with('└'));

        // 60 columns leave a 31 cell bar next to the status text
        let filled = lines[1].chars().filter(|c| *c == '█').count();
        let empty = lines[1].chars().filter(|c| *c == '░').count();
        assert_eq!((filled, empty), (15, 16));
    }

    #[test]
    fn test_first_frame_keeps_earlier_output() {
        let bar = ConsoleProgressBar::new(60);
        let update = |completed| ProgressUpdate {
            completed,
            total: 20,
            indicator: '◐',
        };

        let first = bar.compose(&update(10));
        assert!(first.starts_with("\r┌"));
        assert!(!first.contains("\x1b[2A"));

        let last = bar.compose(&update(20));
        assert!(last.starts_with("\r\x1b[2A\x1b[J┌"));
        assert!(last.ends_with('\n'));

        // A new bar after the final frame starts below the old one
        assert!(!bar.compose(&update(10)).contains("\x1b[2A"));
    }

    #[test]
    fn test_group_thousands() {
        assert_eq!(group_thousands(0), "0");
        assert_eq!(group_thousands(999), "999");
        assert_eq!(group_thousands(1000), "1,000");
        assert_eq!(group_thousands(1234567), "1,234,567");
    }
}
