//! Process-wide policy object gating readbacks and allocation/submission
//! tracking, with presets mirroring the three deployment postures the
//! engine runs under: production, debug, and benchmark.

use std::cell::Cell;
use std::time::{Duration, Instant};

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PerfGuardsConfig {
    pub allow_gpu_readback: bool,
    pub track_submit_count: bool,
    pub track_allocations: bool,
    pub log_expensive_ops: bool,
    pub strict_mode: bool,
}

impl PerfGuardsConfig {
    pub fn production() -> Self {
        Self {
            allow_gpu_readback: false,
            track_submit_count: false,
            track_allocations: false,
            log_expensive_ops: false,
            strict_mode: true,
        }
    }

    pub fn debug() -> Self {
        Self {
            allow_gpu_readback: true,
            track_submit_count: true,
            track_allocations: true,
            log_expensive_ops: true,
            strict_mode: false,
        }
    }

    pub fn benchmark() -> Self {
        Self {
            allow_gpu_readback: true,
            track_submit_count: true,
            track_allocations: true,
            log_expensive_ops: false,
            strict_mode: false,
        }
    }
}

impl Default for PerfGuardsConfig {
    fn default() -> Self {
        Self::production()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PerfCounters {
    pub submits: u64,
    pub allocations: u64,
    pub readbacks: u64,
}

/// Owns the live config plus the counters it gates. Interior-mutable so a
/// single process-wide instance (see `perf_guards()`) can be shared by
/// `Rc` clone without a borrow checker fight at every call site.
pub struct PerfGuards {
    config: Cell<PerfGuardsConfig>,
    counters: Cell<PerfCounters>,
    session_start: Cell<Instant>,
}

impl PerfGuards {
    pub fn new(config: PerfGuardsConfig) -> Self {
        Self {
            config: Cell::new(config),
            counters: Cell::new(PerfCounters::default()),
            session_start: Cell::new(Instant::now()),
        }
    }

    pub fn config(&self) -> PerfGuardsConfig {
        self.config.get()
    }

    pub fn set_config(&self, config: PerfGuardsConfig) {
        self.config.set(config);
    }

    pub fn enable_production_mode(&self) {
        self.set_config(PerfGuardsConfig::production());
    }

    pub fn enable_debug_mode(&self) {
        self.set_config(PerfGuardsConfig::debug());
    }

    pub fn enable_benchmark_mode(&self) {
        self.set_config(PerfGuardsConfig::benchmark());
    }

    /// Returns whether a readback may proceed. In strict mode a denial is
    /// surfaced as `ReadbackBlocked` instead of a silent `false`.
    pub fn allow_readback(&self) -> Result<bool> {
        let config = self.config.get();
        if config.allow_gpu_readback {
            self.note_readback();
            return Ok(true);
        }
        if config.strict_mode {
            return Err(CoreError::ReadbackBlocked);
        }
        Ok(false)
    }

    fn note_readback(&self) {
        let mut counters = self.counters.get();
        counters.readbacks += 1;
        self.counters.set(counters);
        if self.config.get().log_expensive_ops {
            log::debug!("gpu-core: readback #{}", counters.readbacks);
        }
    }

    pub fn note_submit(&self) {
        if !self.config.get().track_submit_count {
            return;
        }
        let mut counters = self.counters.get();
        counters.submits += 1;
        self.counters.set(counters);
        if self.config.get().log_expensive_ops {
            log::debug!("gpu-core: submit #{}", counters.submits);
        }
    }

    pub fn note_allocation(&self) {
        if !self.config.get().track_allocations {
            return;
        }
        let mut counters = self.counters.get();
        counters.allocations += 1;
        self.counters.set(counters);
        if self.config.get().log_expensive_ops {
            log::debug!("gpu-core: allocation #{}", counters.allocations);
        }
    }

    pub fn counters(&self) -> PerfCounters {
        self.counters.get()
    }

    pub fn session_uptime(&self) -> Duration {
        self.session_start.get().elapsed()
    }

    /// Resets the submit/allocation/readback counters and restarts the
    /// session clock, per the documented reset scope.
    pub fn reset_counters(&self) {
        self.counters.set(PerfCounters::default());
        self.session_start.set(Instant::now());
    }
}

impl Default for PerfGuards {
    fn default() -> Self {
        Self::new(PerfGuardsConfig::default())
    }
}

thread_local! {
    static GUARDS: PerfGuards = PerfGuards::default();
}

/// Runs `f` with a reference to the process-wide Perf Guards instance.
pub fn with_perf_guards<R>(f: impl FnOnce(&PerfGuards) -> R) -> R {
    GUARDS.with(f)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn production_then_debug_then_production_round_trips() {
        let guards = PerfGuards::default();
        guards.enable_production_mode();
        guards.enable_debug_mode();
        guards.enable_production_mode();
        assert_eq!(guards.config(), PerfGuardsConfig::production());
    }

    #[test]
    fn strict_mode_turns_denial_into_error() {
        let guards = PerfGuards::new(PerfGuardsConfig::production());
        assert!(matches!(guards.allow_readback(), Err(CoreError::ReadbackBlocked)));
    }

    #[test]
    fn non_strict_denial_returns_false() {
        let mut config = PerfGuardsConfig::production();
        config.strict_mode = false;
        let guards = PerfGuards::new(config);
        assert_eq!(guards.allow_readback().unwrap(), false);
    }

    #[test]
    fn reset_counters_zeroes_everything() {
        let guards = PerfGuards::new(PerfGuardsConfig::debug());
        guards.note_submit();
        guards.note_allocation();
        std::thread::sleep(Duration::from_millis(5));
        let uptime_before_reset = guards.session_uptime();
        guards.reset_counters();
        let counters = guards.counters();
        assert_eq!(counters.submits, 0);
        assert_eq!(counters.allocations, 0);
        assert!(guards.session_uptime() < uptime_before_reset);
    }
}
