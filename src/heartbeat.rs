//! Heartbeat tick telemetry.
//!
//! Periodic ticks snapshot interpreter activity for time-series analysis.
//! A capture is pure with respect to VM state: it reads the live counters
//! and mutates nothing but its own delta baselines.

use std::fmt::Write as _;

/// Nominal tick interval when the caller does not set one.
pub const DEFAULT_TICK_NS: u64 = 100_000_000;

/// Heartbeat reporting mode selected on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeartbeatMode {
    #[default]
    Off,
    /// Aggregates at end of run only.
    Summary,
    /// Per-tick CSV rows.
    Full,
}

/// Rolling execution window used to age heat statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct RollingWindow {
    pub total_executions: u64,
    pub effective_window_size: u32,
    pub is_warm: bool,
}

impl RollingWindow {
    const FULL_WIDTH: u64 = 1024;

    pub fn note_executions(&mut self, n: u64) {
        self.total_executions += n;
        self.effective_window_size = self.total_executions.min(Self::FULL_WIDTH) as u32;
        self.is_warm = self.total_executions >= Self::FULL_WIDTH;
    }
}

/// Delta baselines plus tick bookkeeping.
#[derive(Debug, Clone, Copy, Default)]
pub struct Heartbeat {
    pub tick_count: u64,
    pub run_start_ns: u64,
    pub tick_target_ns: u64,
    pub window: RollingWindow,
    last_tick_ns: u64,
    last_cache_hits: u64,
    last_bucket_hits: u64,
    last_word_executions: u64,
}

/// One captured tick. `avg_word_heat` is the only float and exists purely
/// for display.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickSnapshot {
    pub tick_number: u64,
    pub elapsed_ns: u64,
    pub tick_interval_ns: u64,
    pub cache_hits_delta: u64,
    pub bucket_hits_delta: u64,
    pub word_executions_delta: u64,
    pub hot_word_count: u64,
    pub avg_word_heat: f64,
    pub window_width: u32,
    pub estimated_jitter_ns: u64,
}

/// Live counter values a capture reads. Collected by the VM.
#[derive(Debug, Clone, Copy)]
pub struct TickInput {
    pub now_ns: u64,
    pub cache_hits: u64,
    pub bucket_hits: u64,
    pub word_executions: u64,
    pub hot_word_count: u64,
    pub avg_word_heat: f64,
}

impl Heartbeat {
    pub fn start(&mut self, now_ns: u64) {
        self.run_start_ns = now_ns;
        self.last_tick_ns = now_ns;
    }

    /// Capture a tick and advance the delta baselines.
    pub fn capture(&mut self, input: TickInput) -> TickSnapshot {
        self.tick_count += 1;
        let interval = input.now_ns.saturating_sub(self.last_tick_ns);
        self.last_tick_ns = input.now_ns;

        let nominal = if self.tick_target_ns != 0 {
            self.tick_target_ns
        } else {
            DEFAULT_TICK_NS
        };

        let snapshot = TickSnapshot {
            tick_number: self.tick_count,
            elapsed_ns: input.now_ns.saturating_sub(self.run_start_ns),
            tick_interval_ns: interval,
            cache_hits_delta: input.cache_hits.saturating_sub(self.last_cache_hits),
            bucket_hits_delta: input.bucket_hits.saturating_sub(self.last_bucket_hits),
            word_executions_delta: input.word_executions.saturating_sub(self.last_word_executions),
            hot_word_count: input.hot_word_count,
            avg_word_heat: input.avg_word_heat,
            window_width: self.window.effective_window_size,
            estimated_jitter_ns: interval.abs_diff(nominal),
        };

        self.last_cache_hits = input.cache_hits;
        self.last_bucket_hits = input.bucket_hits;
        self.last_word_executions = input.word_executions;
        snapshot
    }
}

impl TickSnapshot {
    /// CSV row matching the streaming format: no header, one line per tick.
    #[must_use]
    pub fn csv_row(&self) -> String {
        let mut row = String::new();
        let _ = write!(
            row,
            "{},{},{},{},{},{},{},{:.6},{},{}",
            self.tick_number,
            self.elapsed_ns,
            self.tick_interval_ns,
            self.cache_hits_delta,
            self.bucket_hits_delta,
            self.word_executions_delta,
            self.hot_word_count,
            self.avg_word_heat,
            self.window_width,
            self.estimated_jitter_ns,
        );
        row
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(now: u64, execs: u64) -> TickInput {
        TickInput {
            now_ns: now,
            cache_hits: execs / 2,
            bucket_hits: execs / 4,
            word_executions: execs,
            hot_word_count: 3,
            avg_word_heat: 1.5,
        }
    }

    #[test]
    fn deltas_advance_between_ticks() {
        let mut hb = Heartbeat::default();
        hb.start(1_000);

        let t1 = hb.capture(input(2_000, 100));
        assert_eq!(1, t1.tick_number);
        assert_eq!(1_000, t1.elapsed_ns);
        assert_eq!(100, t1.word_executions_delta);
        assert_eq!(50, t1.cache_hits_delta);

        let t2 = hb.capture(input(3_500, 160));
        assert_eq!(2, t2.tick_number);
        assert_eq!(1_500, t2.tick_interval_ns);
        assert_eq!(60, t2.word_executions_delta);
        assert_eq!(30, t2.cache_hits_delta);
    }

    #[test]
    fn capture_reads_but_does_not_invent_state() {
        let mut hb = Heartbeat::default();
        hb.start(0);
        let snap = hb.capture(input(10, 4));
        assert_eq!(3, snap.hot_word_count);
        assert_eq!(4, snap.word_executions_delta);
        let row = snap.csv_row();
        assert_eq!(10, row.split(',').count());
    }

    #[test]
    fn rolling_window_warms_up() {
        let mut window = RollingWindow::default();
        window.note_executions(10);
        assert_eq!(10, window.effective_window_size);
        assert!(!window.is_warm);
        window.note_executions(2000);
        assert_eq!(1024, window.effective_window_size);
        assert!(window.is_warm);
    }
}
