//! Progress counters for a scan and the periodic status line.
//!
//! Workers never touch the counters directly. They send one [`Event`] per finished id to the
//! [`ProgressMonitor`] task, which is the only writer of [`ProgressState`].

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    PermanentlyFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub id: i64,
    pub outcome: Outcome,
}

#[derive(Debug, Clone)]
pub struct ProgressState {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub start_time: Instant,
    /// Highest id finished so far.
    pub position: Option<i64>,
    range_start: i64,
    range_end: i64,
    /// Ids of the range finished by earlier runs.
    resumed: u64,
}

impl ProgressState {
    pub fn new(range_start: i64, range_end: i64) -> Self {
        Self {
            processed: 0,
            succeeded: 0,
            failed: 0,
            start_time: Instant::now(),
            position: None,
            range_start,
            range_end,
            resumed: 0,
        }
    }

    /// Counts every id before `first_id` as already covered by an earlier run.
    pub fn resumed_from(mut self, first_id: i64) -> Self {
        let skipped = i128::from(first_id) - i128::from(self.range_start);
        self.resumed = u64::try_from(skipped.max(0)).unwrap_or(u64::MAX).min(self.total());
        self
    }

    pub fn record(&mut self, event: Event) {
        self.processed += 1;
        match event.outcome {
            Outcome::Succeeded => self.succeeded += 1,
            Outcome::PermanentlyFailed => self.failed += 1,
        }
        self.position = self.position.max(Some(event.id));
    }

    pub fn total(&self) -> u64 {
        let span = i128::from(self.range_end) - i128::from(self.range_start) + 1;
        u64::try_from(span.max(0)).unwrap_or(u64::MAX)
    }

    /// Ids of the whole range finished, this run and earlier ones.
    pub fn covered(&self) -> u64 {
        self.resumed.saturating_add(self.processed)
    }

    pub fn percentage(&self) -> f64 {
        match self.total() {
            0 => 100.0,
            total => self.covered() as f64 / total as f64 * 100.0,
        }
    }

    /// Share of finished ids that produced a parcel, unknown before the first one.
    pub fn success_rate(&self) -> Option<f64> {
        (self.processed > 0).then(|| self.succeeded as f64 / self.processed as f64 * 100.0)
    }

    /// Cumulative ids per second over `elapsed`.
    pub fn throughput(&self, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs > 0.0 {
            self.processed as f64 / secs
        } else {
            0.0
        }
    }

    /// Remaining ids over current throughput; `None` while the rate is still zero.
    pub fn eta(&self, elapsed: Duration) -> Option<Duration> {
        let rate = self.throughput(elapsed);
        if rate <= 0.0 {
            return None;
        }
        let remaining = self.total().saturating_sub(self.covered());
        Some(Duration::from_secs_f64(remaining as f64 / rate))
    }

    pub fn format_status(&self, elapsed: Duration) -> String {
        let position = self
            .position
            .map_or_else(|| "-".to_string(), |p| p.to_string());
        let eta = self
            .eta(elapsed)
            .map_or_else(|| "unknown".to_string(), format_duration);
        let rate = self
            .success_rate()
            .map_or_else(|| "-".to_string(), |r| format!("{r:.2}%"));
        format!(
            "Progress: {position}/{} ({:.2}%) | Succeeded: {} | Failed: {} | Success rate: {rate} | {:.0} ids/sec | ETA: {eta}",
            self.range_end,
            self.percentage(),
            self.succeeded,
            self.failed,
            self.throughput(elapsed),
        )
    }
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (h, m, s) = (secs / 3600, secs / 60 % 60, secs % 60);
    if h > 0 {
        format!("{h}h {m:02}m {s:02}s")
    } else if m > 0 {
        format!("{m}m {s:02}s")
    } else {
        format!("{s}s")
    }
}

/// Owns the counters and emits a status line every `report_every` ids or `report_interval`.
pub struct ProgressMonitor {
    state: ProgressState,
    report_every: u64,
    report_interval: Duration,
}

impl ProgressMonitor {
    pub fn new(state: ProgressState, report_every: u64, report_interval: Duration) -> Self {
        Self {
            state,
            report_every: report_every.max(1),
            report_interval,
        }
    }

    /// Runs until every sender is dropped and returns the final counters.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Event>) -> ProgressState {
        let mut ticker = interval(self.report_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        let mut last_reported = 0;

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => {
                        self.state.record(event);
                        if self.state.processed % self.report_every == 0 {
                            self.report();
                            last_reported = self.state.processed;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    if self.state.processed != last_reported {
                        self.report();
                        last_reported = self.state.processed;
                    }
                }
            }
        }

        self.report();
        self.state
    }

    fn report(&self) {
        info!("{}", self.state.format_status(self.state.start_time.elapsed()));
    }
}
