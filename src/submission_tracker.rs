//! Wraps queue submission with counting, optional latency recording, and a
//! bounded source histogram. Phase and enablement are process-wide mutable
//! scalars, matching the source system's module-level globals.

use std::cell::RefCell;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::perf_guards::with_perf_guards;

/// The three phases a submission can be attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Prefill,
    Decode,
    Other,
}

impl Default for Phase {
    fn default() -> Self {
        Phase::Other
    }
}

/// A single source tag is allowed to accumulate entries in the histogram up
/// to this bound before the tracker stops minting new buckets (it keeps
/// updating existing ones), preventing unbounded growth from a runaway
/// heuristic tag generator.
const MAX_HISTOGRAM_ENTRIES: usize = 256;

#[derive(Debug, Clone, Default)]
pub struct PhaseStats {
    pub count: u64,
    pub total_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

impl PhaseStats {
    fn record(&mut self, duration_ms: f64) {
        if self.count == 0 {
            self.min_ms = duration_ms;
            self.max_ms = duration_ms;
        } else {
            self.min_ms = self.min_ms.min(duration_ms);
            self.max_ms = self.max_ms.max(duration_ms);
        }
        self.count += 1;
        self.total_ms += duration_ms;
    }

    pub fn average_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_ms / self.count as f64
        }
    }
}

#[derive(Default)]
struct TrackerState {
    enabled: bool,
    phase: Phase,
    global: PhaseStats,
    per_phase: HashMap<Phase, PhaseStats>,
    source_histogram: HashMap<String, u64>,
}

/// Observes every submission that passes through `record_submission`.
pub struct SubmissionTracker {
    state: RefCell<TrackerState>,
}

impl SubmissionTracker {
    pub fn new() -> Self {
        Self {
            state: RefCell::new(TrackerState::default()),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.state.borrow_mut().enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.state.borrow().enabled
    }

    pub fn set_phase(&self, phase: Phase) {
        self.state.borrow_mut().phase = phase;
    }

    pub fn phase(&self) -> Phase {
        self.state.borrow().phase
    }

    /// Wraps an actual queue submission. `source` is an explicit caller tag;
    /// when absent the heuristic fallback `"unattributed"` is used, since
    /// this crate does not walk a captured backtrace to infer call sites.
    pub fn record_submission(&self, elapsed: Duration, source: Option<&str>) {
        with_perf_guards(|guards| guards.note_submit());

        let mut state = self.state.borrow_mut();
        if !state.enabled {
            return;
        }
        let duration_ms = elapsed.as_secs_f64() * 1000.0;
        state.global.record(duration_ms);
        let phase = state.phase;
        state.per_phase.entry(phase).or_default().record(duration_ms);

        let tag = source.unwrap_or("unattributed").to_string();
        if state.source_histogram.contains_key(&tag) || state.source_histogram.len() < MAX_HISTOGRAM_ENTRIES {
            *state.source_histogram.entry(tag).or_insert(0) += 1;
        }
    }

    /// Convenience that times `f` with a monotonic clock and records it.
    pub fn time_submission<T>(&self, source: Option<&str>, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let result = f();
        self.record_submission(start.elapsed(), source);
        result
    }

    pub fn global_stats(&self) -> PhaseStats {
        self.state.borrow().global.clone()
    }

    pub fn phase_stats(&self, phase: Phase) -> PhaseStats {
        self.state.borrow().per_phase.get(&phase).cloned().unwrap_or_default()
    }

    pub fn source_histogram(&self) -> HashMap<String, u64> {
        self.state.borrow().source_histogram.clone()
    }

    pub fn reset(&self) {
        *self.state.borrow_mut() = TrackerState::default();
    }
}

impl Default for SubmissionTracker {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static TRACKER: SubmissionTracker = SubmissionTracker::default();
}

/// Runs `f` with a reference to the process-wide Submission Tracker
/// instance. Every real `queue.submit()` call in this crate routes through
/// this accessor so the counters and histogram it owns reflect actual GPU
/// dispatch, not just its own unit tests.
pub fn with_submission_tracker<R>(f: impl FnOnce(&SubmissionTracker) -> R) -> R {
    TRACKER.with(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_tracker_still_notifies_perf_guards_but_records_nothing() {
        let tracker = SubmissionTracker::new();
        tracker.record_submission(Duration::from_millis(5), Some("x"));
        assert_eq!(tracker.global_stats().count, 0);
    }

    #[test]
    fn enabled_tracker_accumulates_global_and_phase_stats() {
        let tracker = SubmissionTracker::new();
        tracker.set_enabled(true);
        tracker.set_phase(Phase::Decode);
        tracker.record_submission(Duration::from_millis(10), Some("kernel_a"));
        tracker.record_submission(Duration::from_millis(20), Some("kernel_a"));

        let global = tracker.global_stats();
        assert_eq!(global.count, 2);
        assert_eq!(global.min_ms, 10.0);
        assert_eq!(global.max_ms, 20.0);

        let decode = tracker.phase_stats(Phase::Decode);
        assert_eq!(decode.count, 2);
        assert_eq!(tracker.phase_stats(Phase::Prefill).count, 0);

        assert_eq!(*tracker.source_histogram().get("kernel_a").unwrap(), 2);
    }

    #[test]
    fn reset_clears_everything() {
        let tracker = SubmissionTracker::new();
        tracker.set_enabled(true);
        tracker.record_submission(Duration::from_millis(1), None);
        tracker.reset();
        assert_eq!(tracker.global_stats().count, 0);
        assert!(tracker.source_histogram().is_empty());
    }
}
