#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use pc_types::ScalarValue;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Checkpointed phase of one update cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    ShapeUpdate,
    AggregateUpdate,
}

/// Outcome of a long-running phase. Cancellation is a normal outcome, not
/// an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Progress {
    Completed,
    Cancelled,
}

impl Progress {
    #[must_use]
    pub fn is_cancelled(self) -> bool {
        self == Self::Cancelled
    }

    /// `Cancelled` if either side was cancelled.
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        if self.is_cancelled() || other.is_cancelled() {
            Self::Cancelled
        } else {
            Self::Completed
        }
    }
}

/// Receives percentage updates; each phase independently goes 0 to 100.
pub trait ProgressSink: Send + Sync {
    fn report(&self, phase: Phase, percent: u8);
}

impl<F> ProgressSink for F
where
    F: Fn(Phase, u8) + Send + Sync,
{
    fn report(&self, phase: Phase, percent: u8) {
        self(phase, percent);
    }
}

/// Shared cancellation flag; clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.cancelled.store(false, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Progress sink plus cancellation predicate handed to every long phase.
#[derive(Clone, Default)]
pub struct ProgressChannel {
    sink: Option<Arc<dyn ProgressSink>>,
    token: CancellationToken,
}

impl fmt::Debug for ProgressChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressChannel")
            .field("has_sink", &self.sink.is_some())
            .field("token", &self.token)
            .finish()
    }
}

impl ProgressChannel {
    /// Channel with no sink that is never cancelled.
    #[must_use]
    pub fn silent() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_sink(mut self, sink: impl ProgressSink + 'static) -> Self {
        self.sink = Some(Arc::new(sink));
        self
    }

    #[must_use]
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn report(&self, phase: Phase, percent: u8) {
        if let Some(sink) = &self.sink {
            sink.report(phase, percent.min(100));
        }
    }

    /// Starts a phase over `total` units of work and reports 0%.
    #[must_use]
    pub fn phase(&self, phase: Phase, total: usize) -> PhaseTracker<'_> {
        self.report(phase, 0);
        PhaseTracker {
            channel: self,
            phase,
            total,
            done: 0,
            last_percent: 0,
        }
    }
}

/// Per-phase checkpoint counter. Each `tick` is one bounded unit of work,
/// e.g. one processed tree node.
#[derive(Debug)]
pub struct PhaseTracker<'a> {
    channel: &'a ProgressChannel,
    phase: Phase,
    total: usize,
    done: usize,
    last_percent: u8,
}

impl PhaseTracker<'_> {
    /// Records one unit of work. Returns `false` once cancellation has been
    /// requested, in which case the caller stops at the current unit.
    pub fn tick(&mut self) -> bool {
        self.done += 1;
        if self.total > 0 {
            let percent = ((self.done.min(self.total) * 100) / self.total) as u8;
            if percent != self.last_percent && percent < 100 {
                self.last_percent = percent;
                self.channel.report(self.phase, percent);
            }
        }
        !self.channel.is_cancelled()
    }

    #[must_use]
    pub fn done(&self) -> usize {
        self.done
    }

    /// Closes the phase, reporting 100% when it ran to completion.
    pub fn finish(self, progress: Progress) -> Progress {
        if progress == Progress::Completed {
            self.channel.report(self.phase, 100);
        }
        progress
    }
}

/// One recomputed aggregate cell whose value changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateChange {
    pub node: usize,
    pub column: usize,
    pub old: ScalarValue,
    pub new: ScalarValue,
}

/// Append-only record of aggregate changes for downstream delta consumers.
/// Pushes are dropped while tracking is disabled.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeLedger {
    enabled: bool,
    records: Vec<AggregateChange>,
}

impl ChangeLedger {
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            records: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn push(&mut self, change: AggregateChange) {
        if self.enabled {
            self.records.push(change);
        }
    }

    #[must_use]
    pub fn records(&self) -> &[AggregateChange] {
        &self.records
    }

    pub fn drain(&mut self) -> Vec<AggregateChange> {
        std::mem::take(&mut self.records)
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    pub enabled: bool,
    /// Fewer columns than this run serially.
    pub min_columns: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_columns: 4,
        }
    }
}

impl ParallelConfig {
    #[must_use]
    pub fn serial() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_min_columns(mut self, n: usize) -> Self {
        self.min_columns = n.max(1);
        self
    }

    #[must_use]
    pub fn should_parallelize(&self, columns: usize) -> bool {
        self.enabled && columns >= self.min_columns
    }
}

/// Summary of one update cycle across its phases.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub started_unix_ms: u64,
    pub finished_unix_ms: u64,
    pub progress: Progress,
    pub input_rows: usize,
    pub strands: usize,
    pub nodes_created: usize,
    pub nodes_removed: usize,
    pub aggregate_changes: usize,
}

impl CycleReport {
    #[must_use]
    pub fn begin(input_rows: usize) -> Self {
        let now = now_unix_ms().unwrap_or_default();
        Self {
            started_unix_ms: now,
            finished_unix_ms: now,
            progress: Progress::Completed,
            input_rows,
            strands: 0,
            nodes_created: 0,
            nodes_removed: 0,
            aggregate_changes: 0,
        }
    }

    pub fn finish(&mut self, progress: Progress) {
        self.finished_unix_ms = now_unix_ms().unwrap_or(self.started_unix_ms);
        self.progress = progress;
    }

    /// Single-line JSON form for host logs.
    pub fn to_json_line(&self) -> Result<String, RuntimeError> {
        serde_json::to_string(self).map_err(|err| RuntimeError::Encode(err.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("system clock is before UNIX_EPOCH")]
    ClockSkew,
    #[error("cycle report encoding failed: {0}")]
    Encode(String),
}

fn now_unix_ms() -> Result<u64, RuntimeError> {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| RuntimeError::ClockSkew)?
        .as_millis();
    Ok(ms as u64)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use pc_types::ScalarValue;

    use super::{
        AggregateChange, CancellationToken, ChangeLedger, CycleReport, ParallelConfig, Phase,
        Progress, ProgressChannel,
    };

    #[test]
    fn tracker_reports_percentages_and_completion() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let channel = ProgressChannel::silent().with_sink(move |phase: Phase, pct: u8| {
            sink_seen.lock().expect("lock").push((phase, pct));
        });

        let mut tracker = channel.phase(Phase::ShapeUpdate, 4);
        for _ in 0..4 {
            assert!(tracker.tick());
        }
        assert_eq!(tracker.finish(Progress::Completed), Progress::Completed);

        let seen = seen.lock().expect("lock");
        assert_eq!(seen.first(), Some(&(Phase::ShapeUpdate, 0)));
        assert_eq!(seen.last(), Some(&(Phase::ShapeUpdate, 100)));
        assert!(seen.contains(&(Phase::ShapeUpdate, 50)));
    }

    #[test]
    fn cancellation_is_observed_by_clones() {
        let token = CancellationToken::new();
        let channel = ProgressChannel::silent().with_token(token.clone());
        let mut tracker = channel.phase(Phase::AggregateUpdate, 10);
        assert!(tracker.tick());
        token.cancel();
        assert!(!tracker.tick());
        assert_eq!(tracker.done(), 2);
    }

    #[test]
    fn ledger_drops_changes_when_disabled() {
        let change = AggregateChange {
            node: 0,
            column: 1,
            old: ScalarValue::int64(1),
            new: ScalarValue::int64(2),
        };
        let mut off = ChangeLedger::new(false);
        off.push(change.clone());
        assert!(off.records().is_empty());

        let mut on = ChangeLedger::new(true);
        on.push(change.clone());
        assert_eq!(on.drain(), vec![change]);
        assert!(on.records().is_empty());
    }

    #[test]
    fn parallel_threshold() {
        let config = ParallelConfig::default().with_min_columns(3);
        assert!(!config.should_parallelize(2));
        assert!(config.should_parallelize(3));
        assert!(!ParallelConfig::serial().should_parallelize(100));
    }

    #[test]
    fn cycle_report_encodes_to_one_line() {
        let mut report = CycleReport::begin(3);
        report.finish(Progress::Cancelled);
        let line = report.to_json_line().expect("encode");
        assert!(line.contains("\"progress\":\"cancelled\""));
        assert!(!line.contains('\n'));
        assert!(Progress::Completed.and(Progress::Cancelled).is_cancelled());
    }
}
