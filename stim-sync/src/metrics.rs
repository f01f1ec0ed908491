//! Pipeline metrics
//!
//! Counters are bumped from both pipeline threads without locking; each one
//! sits on its own cache line. The cycle history is a bounded ring behind a
//! short-lived mutex.

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// How a cycle ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Displayed,
    /// No free buffer at trigger time
    DroppedCapacity,
    /// Camera underrun
    DroppedAcquisition,
    /// Result ready too long after its target display time
    DroppedLate,
    /// Projector still latched on the previous pattern
    DroppedBusy,
    /// Still queued when the drain grace period ran out
    Abandoned,
}

/// Bookkeeping for one cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleRecord {
    pub sequence: u64,
    pub trigger_at: Instant,
    pub captured_at: Option<Instant>,
    pub processed_at: Option<Instant>,
    pub displayed_at: Option<Instant>,
    pub outcome: CycleOutcome,
    /// Displayed, but later than one trigger period after the trigger
    pub deadline_miss: bool,
    /// Processing exceeded the soft deadline
    pub overrun: bool,
}

impl CycleRecord {
    pub fn new(sequence: u64, trigger_at: Instant, outcome: CycleOutcome) -> Self {
        Self {
            sequence,
            trigger_at,
            captured_at: None,
            processed_at: None,
            displayed_at: None,
            outcome,
            deadline_miss: false,
            overrun: false,
        }
    }

    /// Trigger to display, for displayed cycles
    pub fn latency(&self) -> Option<Duration> {
        self.displayed_at
            .map(|at| at.saturating_duration_since(self.trigger_at))
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MetricsSnapshot {
    /// Capture cycles started by a trigger, including those dropped for
    /// want of a buffer or a frame
    pub captured: u64,
    /// Frames read out of the camera into a pool buffer
    pub frames_read: u64,
    pub processed: u64,
    pub displayed: u64,
    pub dropped_capacity: u64,
    pub dropped_acquisition: u64,
    pub dropped_late: u64,
    pub dropped_busy: u64,
    pub deadline_misses: u64,
    pub processing_overruns: u64,
    pub trigger_timeouts: u64,
    pub abandoned: u64,
    pub last_cycle_latency_ms: f64,
}

impl MetricsSnapshot {
    pub fn dropped_total(&self) -> u64 {
        self.dropped_capacity + self.dropped_acquisition + self.dropped_late + self.dropped_busy
    }
}

#[derive(Default)]
struct Counter(CachePadded<AtomicU64>);

impl Counter {
    #[inline]
    fn bump(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    fn store(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }
}

pub struct PipelineMetrics {
    captured: Counter,
    frames_read: Counter,
    processed: Counter,
    displayed: Counter,
    dropped_capacity: Counter,
    dropped_acquisition: Counter,
    dropped_late: Counter,
    dropped_busy: Counter,
    deadline_misses: Counter,
    processing_overruns: Counter,
    trigger_timeouts: Counter,
    abandoned: Counter,
    last_cycle_latency_us: Counter,

    frozen: AtomicBool,
    history: Mutex<VecDeque<CycleRecord>>,
    history_capacity: usize,
}

impl PipelineMetrics {
    pub fn new(history_capacity: usize) -> Self {
        let history_capacity = history_capacity.max(1);
        Self {
            captured: Counter::default(),
            frames_read: Counter::default(),
            processed: Counter::default(),
            displayed: Counter::default(),
            dropped_capacity: Counter::default(),
            dropped_acquisition: Counter::default(),
            dropped_late: Counter::default(),
            dropped_busy: Counter::default(),
            deadline_misses: Counter::default(),
            processing_overruns: Counter::default(),
            trigger_timeouts: Counter::default(),
            abandoned: Counter::default(),
            last_cycle_latency_us: Counter::default(),
            frozen: AtomicBool::new(false),
            history: Mutex::new(VecDeque::with_capacity(history_capacity)),
            history_capacity,
        }
    }

    #[inline]
    fn live(&self) -> bool {
        !self.frozen.load(Ordering::Acquire)
    }

    pub fn record_capture(&self) {
        if self.live() {
            self.captured.bump();
        }
    }

    pub fn record_trigger_timeout(&self) {
        if self.live() {
            self.trigger_timeouts.bump();
        }
    }

    pub fn record_frame_read(&self) {
        if self.live() {
            self.frames_read.bump();
        }
    }

    pub fn record_processed(&self, overrun: bool) {
        if self.live() {
            self.processed.bump();
            if overrun {
                self.processing_overruns.bump();
            }
        }
    }

    /// Close a cycle: bump its outcome counter and append it to the history
    pub fn record_cycle(&self, record: CycleRecord) {
        if !self.live() {
            return;
        }

        match record.outcome {
            CycleOutcome::Displayed => {
                self.displayed.bump();
                if record.deadline_miss {
                    self.deadline_misses.bump();
                }
                if let Some(latency) = record.latency() {
                    self.last_cycle_latency_us
                        .store(latency.as_micros().min(u64::MAX as u128) as u64);
                }
            }
            CycleOutcome::DroppedCapacity => self.dropped_capacity.bump(),
            CycleOutcome::DroppedAcquisition => self.dropped_acquisition.bump(),
            CycleOutcome::DroppedLate => self.dropped_late.bump(),
            CycleOutcome::DroppedBusy => self.dropped_busy.bump(),
            CycleOutcome::Abandoned => self.abandoned.bump(),
        }

        let mut history = self.history.lock();
        if history.len() == self.history_capacity {
            history.pop_front();
        }
        history.push_back(record);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            captured: self.captured.get(),
            frames_read: self.frames_read.get(),
            processed: self.processed.get(),
            displayed: self.displayed.get(),
            dropped_capacity: self.dropped_capacity.get(),
            dropped_acquisition: self.dropped_acquisition.get(),
            dropped_late: self.dropped_late.get(),
            dropped_busy: self.dropped_busy.get(),
            deadline_misses: self.deadline_misses.get(),
            processing_overruns: self.processing_overruns.get(),
            trigger_timeouts: self.trigger_timeouts.get(),
            abandoned: self.abandoned.get(),
            last_cycle_latency_ms: self.last_cycle_latency_us.get() as f64 / 1000.0,
        }
    }

    /// Oldest first
    pub fn history(&self) -> Vec<CycleRecord> {
        self.history.lock().iter().copied().collect()
    }

    pub fn history_capacity(&self) -> usize {
        self.history_capacity
    }

    /// Stop counting; values stay at their last reading until `reset`
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        !self.live()
    }

    /// Zero every counter, clear the history and resume counting
    pub fn reset(&self) {
        for counter in [
            &self.captured,
            &self.frames_read,
            &self.processed,
            &self.displayed,
            &self.dropped_capacity,
            &self.dropped_acquisition,
            &self.dropped_late,
            &self.dropped_busy,
            &self.deadline_misses,
            &self.processing_overruns,
            &self.trigger_timeouts,
            &self.abandoned,
            &self.last_cycle_latency_us,
        ] {
            counter.store(0);
        }
        self.history.lock().clear();
        self.frozen.store(false, Ordering::Release);
    }
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_HISTORY_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn displayed(sequence: u64, latency_ms: u64, miss: bool) -> CycleRecord {
        let trigger_at = Instant::now();
        CycleRecord {
            displayed_at: Some(trigger_at + Duration::from_millis(latency_ms)),
            deadline_miss: miss,
            ..CycleRecord::new(sequence, trigger_at, CycleOutcome::Displayed)
        }
    }

    #[test]
    fn test_outcomes_counted() {
        let metrics = PipelineMetrics::new(8);
        metrics.record_cycle(displayed(0, 12, false));
        metrics.record_cycle(displayed(1, 40, true));
        metrics.record_cycle(CycleRecord::new(2, Instant::now(), CycleOutcome::DroppedLate));
        metrics.record_cycle(CycleRecord::new(3, Instant::now(), CycleOutcome::DroppedCapacity));

        let snap = metrics.snapshot();
        assert_eq!(snap.displayed, 2);
        assert_eq!(snap.deadline_misses, 1);
        assert_eq!(snap.dropped_late, 1);
        assert_eq!(snap.dropped_capacity, 1);
        assert_eq!(snap.dropped_total(), 2);
        assert!((snap.last_cycle_latency_ms - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_history_overwrites_oldest() {
        let metrics = PipelineMetrics::new(3);
        for seq in 0..5 {
            metrics.record_cycle(CycleRecord::new(seq, Instant::now(), CycleOutcome::DroppedBusy));
        }
        let sequences: Vec<_> = metrics.history().iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![2, 3, 4]);
        assert_eq!(metrics.snapshot().dropped_busy, 5);
    }

    #[test]
    fn test_freeze_and_reset() {
        let metrics = PipelineMetrics::new(4);
        metrics.record_frame_read();
        metrics.freeze();
        metrics.record_frame_read();
        metrics.record_cycle(displayed(0, 1, false));
        assert_eq!(metrics.snapshot().frames_read, 1);
        assert_eq!(metrics.snapshot().displayed, 0);
        assert!(metrics.is_frozen());

        metrics.reset();
        assert!(!metrics.is_frozen());
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
        assert!(metrics.history().is_empty());
    }

    #[test]
    fn test_concurrent_increments() {
        let metrics = Arc::new(PipelineMetrics::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        metrics.record_capture();
                        metrics.record_processed(true);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let snap = metrics.snapshot();
        assert_eq!(snap.captured, 4000);
        assert_eq!(snap.processing_overruns, 4000);
    }
}
