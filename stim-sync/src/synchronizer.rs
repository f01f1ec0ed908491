//! Trigger synchronizer
//!
//! Runs the closed loop on two threads:
//!
//! - `stim-trigger` waits for trigger edges, leases a buffer, captures into
//!   it and hands the sealed frame over a bounded channel.
//! - `stim-project` processes frames in arrival order, applies the lateness
//!   policy, displays the pattern and returns the buffer to the pool.
//!
//! The buffer pool is the only backpressure: when every buffer is in flight
//! the trigger is counted as a capacity drop instead of being queued. The
//! channel is as deep as the pool, so a captured frame is never refused.
//!
//! Device faults from either side, or a panicking processor, stop the loop
//! and freeze the metrics until an explicit `fault_reset`.

use crate::config::PipelineConfig;
use crate::error::{
    ConfigError, ControlError, DeviceFault, FaultOrigin, PipelineFault, SinkError, SourceError,
};
use crate::metrics::{CycleOutcome, CycleRecord, MetricsSnapshot, PipelineMetrics};
use crate::sink::ProjectionSink;
use crate::source::FrameSource;
use crate::state::{AtomicState, CycleEvent, PipelineState, SyncState};
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use stim_frame::{Frame, FrameBufferPool, FrameStamp, Lease, PoolStats};
use stim_process::{ProcessingStage, Processor};

/// State of both pipeline contexts at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextStates {
    pub capture: SyncState,
    pub output: SyncState,
}

struct Shared {
    pool: FrameBufferPool,
    metrics: PipelineMetrics,
    state: AtomicState<PipelineState>,
    capture_state: AtomicState<SyncState>,
    output_state: AtomicState<SyncState>,
    /// Graceful stop requested
    stopping: AtomicBool,
    /// Device fault; both loops bail out without further counting
    halted: AtomicBool,
    drain_deadline: Mutex<Option<Instant>>,
    fault: Mutex<Option<PipelineFault>>,
    next_sequence: AtomicU64,
}

impl Shared {
    fn should_exit(&self) -> bool {
        self.stopping.load(Ordering::Acquire) || self.halted.load(Ordering::Acquire)
    }

    fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// First fault wins; later ones are only logged
    fn raise_fault(&self, origin: FaultOrigin, fault: &DeviceFault, sequence: Option<u64>) {
        let record = PipelineFault {
            origin,
            message: fault.to_string(),
            sequence,
        };
        if self.halted.swap(true, Ordering::AcqRel) {
            log::error!("Further fault after pipeline halted: {}", record);
            return;
        }

        self.metrics.freeze();
        log::error!("Pipeline faulted: {}", record);
        *self.fault.lock() = Some(record);
        self.state.set(PipelineState::Faulted);
    }

    fn release<T: Into<Lease>>(&self, item: T, sequence: u64) {
        if let Err(e) = self.pool.release(item) {
            log::error!("Buffer of cycle {} was not returned cleanly: {}", sequence, e);
        }
    }
}

/// What the processing thread owns for a run
struct Output {
    stage: ProcessingStage,
    sink: Box<dyn ProjectionSink>,
}

struct Workers {
    capture: JoinHandle<Box<dyn FrameSource>>,
    output: JoinHandle<Output>,
}

/// Devices and threads; only touched under the control lock
struct Control {
    source: Option<Box<dyn FrameSource>>,
    output: Option<Output>,
    workers: Option<Workers>,
}

#[derive(Clone, Copy)]
struct CaptureSettings {
    timeout: Duration,
    core: Option<usize>,
}

#[derive(Clone, Copy)]
struct OutputSettings {
    period: Duration,
    max_lateness: Duration,
}

/// Orchestrates the acquire -> process -> project loop
pub struct TriggerSynchronizer {
    config: PipelineConfig,
    shared: Arc<Shared>,
    control: Mutex<Control>,
}

impl TriggerSynchronizer {
    /// Validate the configuration against the supplied devices and
    /// allocate the buffer pool. Devices are opened on `start`.
    pub fn new(
        config: PipelineConfig,
        source: Box<dyn FrameSource>,
        processor: Box<dyn Processor>,
        sink: Box<dyn ProjectionSink>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        if source.mode() != config.trigger.mode {
            return Err(ConfigError::TriggerModeMismatch {
                device: source.device_id().to_string(),
                expected: config.trigger.mode.as_str(),
                actual: source.mode().as_str(),
            });
        }
        check_device("camera", config.devices.camera_id.as_deref(), source.device_id())?;
        check_device("projector", config.devices.projector_id.as_deref(), sink.device_id())?;

        let stage = ProcessingStage::new(processor, config.stage_config())?;
        stage.check_format(config.pool.format)?;
        let pool = FrameBufferPool::new(config.pool)?;

        let shared = Arc::new(Shared {
            pool,
            metrics: PipelineMetrics::new(config.history_capacity),
            state: AtomicState::new(PipelineState::Idle),
            capture_state: AtomicState::new(SyncState::Idle),
            output_state: AtomicState::new(SyncState::Idle),
            stopping: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            drain_deadline: Mutex::new(None),
            fault: Mutex::new(None),
            next_sequence: AtomicU64::new(0),
        });

        Ok(Self {
            config,
            shared,
            control: Mutex::new(Control {
                source: Some(source),
                output: Some(Output { stage, sink }),
                workers: None,
            }),
        })
    }

    /// Like [`TriggerSynchronizer::new`] with the processor selected by
    /// `config.processing`
    pub fn from_config(
        config: PipelineConfig,
        source: Box<dyn FrameSource>,
        sink: Box<dyn ProjectionSink>,
    ) -> Result<Self, ConfigError> {
        let processor = config.processing.build()?;
        Self::new(config, source, processor, sink)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn state(&self) -> PipelineState {
        self.shared.state.get()
    }

    pub fn cycle_states(&self) -> ContextStates {
        ContextStates {
            capture: self.shared.capture_state.get(),
            output: self.shared.output_state.get(),
        }
    }

    /// The fault that stopped the pipeline, until `fault_reset`
    pub fn fault(&self) -> Option<PipelineFault> {
        self.shared.fault.lock().clone()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Most recent cycles, oldest first
    pub fn history(&self) -> Vec<CycleRecord> {
        self.shared.metrics.history()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.shared.pool.stats()
    }

    /// Open the devices and start both loops. Only valid from `Idle`.
    pub fn start(&self) -> Result<(), ControlError> {
        let mut control = self.control.lock();

        let state = self.shared.state.get();
        if state != PipelineState::Idle {
            return Err(ControlError::InvalidTransition { op: "start", state });
        }

        let (mut source, mut output) = match (control.source.take(), control.output.take()) {
            (Some(source), Some(output)) => (source, output),
            (source, output) => {
                control.source = source;
                control.output = output;
                return Err(ControlError::DevicesUnavailable);
            }
        };

        if let Err(fault) = source.open() {
            control.source = Some(source);
            control.output = Some(output);
            return Err(ControlError::Open {
                origin: FaultOrigin::FrameSource,
                fault,
            });
        }
        if let Err(fault) = output.sink.open() {
            source.close();
            control.source = Some(source);
            control.output = Some(output);
            return Err(ControlError::Open {
                origin: FaultOrigin::ProjectionSink,
                fault,
            });
        }

        let shared = &self.shared;
        shared.stopping.store(false, Ordering::Release);
        shared.halted.store(false, Ordering::Release);
        *shared.drain_deadline.lock() = None;
        shared.capture_state.set(SyncState::Idle);
        shared.output_state.set(SyncState::Idle);
        shared.state.set(PipelineState::Running);

        let processor = output.stage.processor_name();
        let (tx, rx) = channel::bounded::<Frame>(shared.pool.capacity());

        let output_settings = OutputSettings {
            period: self.config.trigger.period,
            max_lateness: self.config.timing.max_lateness,
        };
        let output_thread = thread::Builder::new().name("stim-project".to_string()).spawn({
            let shared = Arc::clone(shared);
            move || run_output(shared, rx, output, output_settings)
        });
        let output_thread = match output_thread {
            Ok(handle) => handle,
            Err(e) => {
                source.close();
                control.source = Some(source);
                shared.state.set(PipelineState::Idle);
                return Err(ControlError::Spawn(e));
            }
        };

        let capture_settings = CaptureSettings {
            timeout: self.config.trigger.timeout,
            core: self.config.trigger_core,
        };
        let capture_thread = thread::Builder::new().name("stim-trigger".to_string()).spawn({
            let shared = Arc::clone(shared);
            move || run_capture(shared, source, tx, capture_settings)
        });
        let capture_thread = match capture_thread {
            Ok(handle) => handle,
            Err(e) => {
                // The sender died with the closure, so the output loop ends
                if let Ok(mut output) = output_thread.join() {
                    output.sink.close();
                    control.output = Some(output);
                }
                shared.state.set(PipelineState::Idle);
                return Err(ControlError::Spawn(e));
            }
        };

        control.workers = Some(Workers {
            capture: capture_thread,
            output: output_thread,
        });

        log::info!(
            "Pipeline started: {} trigger every {:?}, {} buffers, processor {}",
            self.config.trigger.mode,
            self.config.trigger.period,
            shared.pool.capacity(),
            processor
        );
        Ok(())
    }

    /// Graceful stop: finish queued cycles within the drain grace period,
    /// abandon the rest, close the devices and return to `Idle`.
    ///
    /// A no-op when already idle.
    pub fn stop(&self) -> Result<(), ControlError> {
        let mut control = self.control.lock();

        match self
            .shared
            .state
            .transition(PipelineState::Running, PipelineState::Draining)
        {
            Ok(()) => {}
            Err(PipelineState::Idle) => return Ok(()),
            Err(state) => return Err(ControlError::InvalidTransition { op: "stop", state }),
        }

        let grace = self.config.timing.drain_grace;
        *self.shared.drain_deadline.lock() = Some(Instant::now() + grace);
        self.shared.stopping.store(true, Ordering::Release);
        log::info!("Draining pipeline (grace {:?})", grace);

        self.join_workers(&mut control);

        match self
            .shared
            .state
            .transition(PipelineState::Draining, PipelineState::Idle)
        {
            Ok(()) => {
                let m = self.metrics();
                log::info!(
                    "Pipeline stopped: {} captured, {} displayed, {} dropped, {} abandoned",
                    m.captured,
                    m.displayed,
                    m.dropped_total(),
                    m.abandoned
                );
                Ok(())
            }
            Err(state) => match self.fault() {
                Some(fault) => Err(ControlError::Faulted(fault)),
                None => Err(ControlError::InvalidTransition { op: "stop", state }),
            },
        }
    }

    /// Leave `Faulted`: wait for both loops, close the devices, clear the
    /// fault and metrics. A new `start` is required to run again.
    pub fn fault_reset(&self) -> Result<(), ControlError> {
        let mut control = self.control.lock();

        let state = self.shared.state.get();
        if state != PipelineState::Faulted {
            return Err(ControlError::InvalidTransition {
                op: "fault-reset",
                state,
            });
        }

        self.shared.stopping.store(true, Ordering::Release);
        self.join_workers(&mut control);

        let shared = &self.shared;
        shared.metrics.reset();
        *shared.fault.lock() = None;
        *shared.drain_deadline.lock() = None;
        shared.halted.store(false, Ordering::Release);
        shared.stopping.store(false, Ordering::Release);
        shared.capture_state.set(SyncState::Idle);
        shared.output_state.set(SyncState::Idle);
        shared.state.set(PipelineState::Idle);

        log::info!("Fault cleared, pipeline idle");
        Ok(())
    }

    /// Join both loops and take the devices back, closed
    fn join_workers(&self, control: &mut Control) {
        let Some(workers) = control.workers.take() else {
            return;
        };

        match workers.capture.join() {
            Ok(mut source) => {
                source.close();
                control.source = Some(source);
            }
            Err(_) => log::error!("Trigger thread panicked; camera handle lost"),
        }
        match workers.output.join() {
            Ok(mut output) => {
                output.sink.close();
                control.output = Some(output);
            }
            Err(_) => log::error!("Projection thread panicked; projector handle lost"),
        }
    }
}

impl Drop for TriggerSynchronizer {
    fn drop(&mut self) {
        if self.shared.state.get() == PipelineState::Running {
            if let Err(e) = self.stop() {
                log::warn!("Stop on drop failed: {}", e);
            }
        } else {
            self.shared.stopping.store(true, Ordering::Release);
            let mut control = self.control.lock();
            self.join_workers(&mut control);
        }
    }
}

fn check_device(role: &'static str, expected: Option<&str>, actual: &str) -> Result<(), ConfigError> {
    match expected {
        Some(expected) if expected != actual => Err(ConfigError::DeviceMismatch {
            role,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }),
        _ => Ok(()),
    }
}

fn pin_to_core(core: usize) {
    let pinned = core_affinity::get_core_ids()
        .and_then(|ids| ids.into_iter().find(|id| id.id == core))
        .map(core_affinity::set_for_current)
        .unwrap_or(false);
    if pinned {
        log::debug!("Trigger thread pinned to core {}", core);
    } else {
        log::warn!("Could not pin trigger thread to core {}", core);
    }
}

/// Trigger/capture loop. Blocks only in the source's wait and capture calls.
fn run_capture(
    shared: Arc<Shared>,
    mut source: Box<dyn FrameSource>,
    tx: Sender<Frame>,
    settings: CaptureSettings,
) -> Box<dyn FrameSource> {
    if let Some(core) = settings.core {
        pin_to_core(core);
    }

    let cell = &shared.capture_state;
    let metrics = &shared.metrics;
    cell.advance(CycleEvent::Armed);

    while !shared.should_exit() {
        let trigger = match source.wait_for_trigger(settings.timeout) {
            Ok(trigger) => trigger,
            Err(SourceError::Device(fault)) => {
                cell.advance(CycleEvent::DeviceFault);
                shared.raise_fault(FaultOrigin::FrameSource, &fault, None);
                break;
            }
            Err(e) => {
                log::trace!("No trigger: {}", e);
                metrics.record_trigger_timeout();
                cell.advance(CycleEvent::TriggerTimeout);
                continue;
            }
        };
        if shared.should_exit() {
            break;
        }

        let sequence = shared.next_sequence.fetch_add(1, Ordering::Relaxed);
        metrics.record_capture();

        let mut buffer = match shared.pool.acquire() {
            Ok(buffer) => buffer,
            Err(e) => {
                log::debug!("Cycle {} dropped: {}", sequence, e);
                metrics.record_cycle(CycleRecord::new(
                    sequence,
                    trigger.at,
                    CycleOutcome::DroppedCapacity,
                ));
                cell.advance(CycleEvent::PoolExhausted);
                continue;
            }
        };
        cell.advance(CycleEvent::Triggered);

        let captured_at = match source.capture(&mut buffer) {
            Ok(at) => at,
            Err(SourceError::Device(fault)) => {
                shared.release(buffer, sequence);
                cell.advance(CycleEvent::DeviceFault);
                shared.raise_fault(FaultOrigin::FrameSource, &fault, Some(sequence));
                break;
            }
            Err(e) => {
                log::debug!("Cycle {} dropped: {}", sequence, e);
                shared.release(buffer, sequence);
                metrics.record_cycle(CycleRecord::new(
                    sequence,
                    trigger.at,
                    CycleOutcome::DroppedAcquisition,
                ));
                let event = match e {
                    SourceError::TriggerTimeout(_) => CycleEvent::TriggerTimeout,
                    _ => CycleEvent::Underrun,
                };
                cell.advance(event);
                continue;
            }
        };

        let frame = buffer.seal(FrameStamp {
            sequence,
            trigger_at: trigger.at,
            captured_at,
        });
        metrics.record_frame_read();
        cell.advance(CycleEvent::Captured);

        match tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                // Cannot happen while the channel is as deep as the pool
                log::error!("Frame queue full; dropping cycle {}", sequence);
                shared.release(frame, sequence);
                metrics.record_cycle(CycleRecord::new(
                    sequence,
                    trigger.at,
                    CycleOutcome::DroppedCapacity,
                ));
            }
            Err(TrySendError::Disconnected(frame)) => {
                shared.release(frame, sequence);
                if !shared.should_exit() {
                    let fault = DeviceFault::new("projection thread exited while running");
                    shared.raise_fault(FaultOrigin::ProcessingStage, &fault, Some(sequence));
                }
                break;
            }
        }

        // The cycle now belongs to the output context
        cell.set(SyncState::Idle);
        cell.advance(CycleEvent::Armed);
    }

    if shared.is_halted() {
        cell.set(SyncState::Faulted);
    } else {
        cell.advance(CycleEvent::Drain);
        cell.advance(CycleEvent::Drained);
    }
    log::debug!("Trigger thread exiting");
    source
}

/// Processing/projection loop. Handles cycles strictly in capture order.
fn run_output(
    shared: Arc<Shared>,
    rx: Receiver<Frame>,
    mut output: Output,
    settings: OutputSettings,
) -> Output {
    let cell = &shared.output_state;

    while let Ok(frame) = rx.recv() {
        let sequence = frame.sequence();

        if shared.is_halted() {
            // Metrics are frozen; just give the buffer back
            shared.release(frame, sequence);
            continue;
        }

        if shared.stopping.load(Ordering::Acquire) && cell.get() != SyncState::Draining {
            cell.advance(CycleEvent::Drain);
        }
        let past_grace = shared
            .drain_deadline
            .lock()
            .is_some_and(|deadline| Instant::now() >= deadline);
        if past_grace {
            log::debug!("Cycle {} abandoned during drain", sequence);
            let record = CycleRecord {
                captured_at: Some(frame.captured_at()),
                ..CycleRecord::new(sequence, frame.trigger_at(), CycleOutcome::Abandoned)
            };
            shared.release(frame, sequence);
            shared.metrics.record_cycle(record);
            continue;
        }

        if let Err((origin, fault)) = run_cycle(&shared, &mut output, frame, settings) {
            shared.raise_fault(origin, &fault, Some(sequence));
            break;
        }
    }

    if shared.is_halted() {
        cell.set(SyncState::Faulted);
    } else if cell.get() == SyncState::Draining {
        cell.advance(CycleEvent::Drained);
    }
    log::debug!("Projection thread exiting");
    output
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Process, apply the lateness policy and display one cycle.
/// Only a processor panic or a projector device fault is returned.
fn run_cycle(
    shared: &Shared,
    output: &mut Output,
    frame: Frame,
    settings: OutputSettings,
) -> Result<(), (FaultOrigin, DeviceFault)> {
    let cell = &shared.output_state;
    let metrics = &shared.metrics;
    // Cycle transitions are not tracked while draining
    let track = |event: CycleEvent| {
        if cell.get() != SyncState::Draining {
            cell.advance(event);
        }
    };
    if cell.get() != SyncState::Draining {
        cell.set(SyncState::Processing);
    }

    let sequence = frame.sequence();
    let trigger_at = frame.trigger_at();
    let captured_at = frame.captured_at();

    // The frame's lease goes back to the pool while unwinding
    let stage = &mut output.stage;
    let result = panic::catch_unwind(AssertUnwindSafe(|| stage.process(frame))).map_err(
        |payload| {
            let message = format!("processor panicked: {}", panic_message(&*payload));
            (FaultOrigin::ProcessingStage, DeviceFault::new(message))
        },
    )?;
    let dispatch_at = Instant::now();
    metrics.record_processed(result.overrun.is_some());

    let mut record = CycleRecord {
        captured_at: Some(captured_at),
        processed_at: Some(dispatch_at),
        overrun: result.overrun.is_some(),
        ..CycleRecord::new(sequence, trigger_at, CycleOutcome::Displayed)
    };

    let lateness = result.pattern.lateness_at(dispatch_at);
    if lateness > settings.max_lateness {
        log::debug!(
            "Cycle {} dropped: {:?} past its display target",
            sequence,
            lateness
        );
        shared.release(result.source, sequence);
        record.outcome = CycleOutcome::DroppedLate;
        metrics.record_cycle(record);
        track(CycleEvent::DroppedLate);
        return Ok(());
    }

    track(CycleEvent::Processed);
    let shown = output.sink.display(&result.pattern);
    track(CycleEvent::Dispatched);
    let (source, _pattern) = result.into_parts();
    shared.release(source, sequence);

    match shown {
        Ok(shown_at) => {
            record.displayed_at = Some(shown_at);
            record.deadline_miss = shown_at.saturating_duration_since(trigger_at) > settings.period;
            metrics.record_cycle(record);
            Ok(())
        }
        Err(SinkError::DeviceBusy) => {
            log::debug!("Cycle {} dropped: projector busy", sequence);
            record.outcome = CycleOutcome::DroppedBusy;
            metrics.record_cycle(record);
            Ok(())
        }
        Err(SinkError::Device(fault)) => Err((FaultOrigin::ProjectionSink, fault)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TriggerMode;
    use crate::sim::{SimCamera, SimProjector, SimTrigger};
    use crate::sink::ProjectorSink;
    use crate::source::{HardwareTriggeredSource, SoftwareTimedSource};
    use stim_frame::{PixelFormat, PoolConfig};
    use stim_process::{threshold_mask, Pattern, PatternPayload, Processed};

    const SIDE: u32 = 64;

    /// Threshold processor that takes a fixed amount of time
    struct FixedDelay(Duration);

    impl Processor for FixedDelay {
        fn name(&self) -> &'static str {
            "fixed-delay"
        }

        fn process(&mut self, frame: &Frame) -> Processed {
            thread::sleep(self.0);
            Processed::pattern_only(PatternPayload::Mask(threshold_mask(frame, 200 << 8)))
        }
    }

    /// Panics on one cycle, blanks every other
    struct PanicsOn(u64);

    impl Processor for PanicsOn {
        fn name(&self) -> &'static str {
            "panics-on"
        }

        fn process(&mut self, frame: &Frame) -> Processed {
            if frame.sequence() == self.0 {
                panic!("bad frame {}", frame.sequence());
            }
            Processed::pattern_only(PatternPayload::Blank)
        }
    }

    /// Sink whose display call unwinds the projection thread
    struct PanickingSink;

    impl ProjectionSink for PanickingSink {
        fn device_id(&self) -> &str {
            "dmd0"
        }

        fn open(&mut self) -> Result<(), DeviceFault> {
            Ok(())
        }

        fn display(&mut self, pattern: &Pattern) -> Result<Instant, SinkError> {
            panic!("sink lost pattern {}", pattern.sequence);
        }

        fn close(&mut self) {}
    }

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    fn config(period_ms: u64) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.trigger.period = ms(period_ms);
        config.trigger.timeout = ms(50);
        config.timing.soft_deadline = ms(period_ms - 5);
        config.timing.drain_grace = ms(500);
        config.pool = PoolConfig::new(SIDE, SIDE, PixelFormat::Mono8);
        config.compute_threads = 2;
        config
    }

    fn pipeline(
        config: PipelineConfig,
        trigger: SimTrigger,
        camera: SimCamera,
        projector: SimProjector,
        processing: Duration,
    ) -> TriggerSynchronizer {
        TriggerSynchronizer::new(
            config,
            Box::new(HardwareTriggeredSource::new(trigger, camera)),
            Box::new(FixedDelay(processing)),
            Box::new(ProjectorSink::new(projector)),
        )
        .unwrap()
    }

    fn camera() -> SimCamera {
        SimCamera::new("cam0", SIDE, SIDE)
    }

    fn projector() -> SimProjector {
        SimProjector::new("dmd0", SIDE, SIDE)
    }

    fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(ms(5));
        }
        done()
    }

    #[test]
    fn test_steady_state() {
        let sync = pipeline(
            config(33),
            SimTrigger::new(ms(33)).with_edge_limit(100),
            camera(),
            projector(),
            ms(10),
        );
        sync.start().unwrap();
        assert_eq!(sync.state(), PipelineState::Running);

        assert!(wait_until(Duration::from_secs(15), || {
            let m = sync.metrics();
            m.captured == 100 && m.processed == 100 && m.displayed == 100
        }));
        sync.stop().unwrap();

        let m = sync.metrics();
        assert_eq!(m.frames_read, 100);
        assert_eq!(m.processed, 100);
        assert_eq!(m.dropped_capacity, 0);
        assert_eq!(m.deadline_misses, 0);
        assert_eq!(m.dropped_total(), 0);
        assert!(m.last_cycle_latency_ms > 0.0 && m.last_cycle_latency_ms < 33.0);

        assert_eq!(sync.state(), PipelineState::Idle);
        assert_eq!(sync.pool_stats().in_use, 0);
        assert_eq!(
            sync.cycle_states(),
            ContextStates {
                capture: SyncState::Idle,
                output: SyncState::Idle
            }
        );
    }

    #[test]
    fn test_overload_drops_for_capacity() {
        let sync = pipeline(
            config(33),
            SimTrigger::new(ms(33)).with_edge_limit(30),
            camera(),
            projector(),
            ms(40),
        );
        let started = Instant::now();
        sync.start().unwrap();

        // Capture cycles keep pace with the trigger while the pool is dry
        let mut last_captured = 0;
        let mut saw_drops_while_capturing = false;
        assert!(wait_until(Duration::from_secs(10), || {
            let m = sync.metrics();
            assert!(m.captured >= last_captured);
            let expected = (started.elapsed().as_millis() / 33) as u64;
            assert!(m.captured <= expected + 1);
            if m.dropped_capacity > 0 && m.captured > last_captured {
                saw_drops_while_capturing = true;
            }
            last_captured = m.captured;
            m.captured == 30
        }));
        let reached = started.elapsed();
        assert!(reached < ms(33 * 30 + 300), "30 captures took {:?}", reached);
        assert!(saw_drops_while_capturing);

        assert!(wait_until(Duration::from_secs(5), || {
            let m = sync.metrics();
            m.processed == m.frames_read
        }));
        sync.stop().unwrap();

        let m = sync.metrics();
        assert_eq!(m.captured, 30);
        assert!(m.dropped_capacity > 0);
        assert!(m.frames_read < m.captured);
        assert_eq!(m.captured, m.frames_read + m.dropped_capacity + m.dropped_acquisition);
        // Every cycle blows the soft deadline, every displayed one the period
        assert_eq!(m.processing_overruns, m.processed);
        assert_eq!(m.deadline_misses, m.displayed);
        assert_eq!(m.processed, m.displayed + m.dropped_late + m.dropped_busy);
        assert_eq!(sync.pool_stats().in_use, 0);
    }

    #[test]
    fn test_lateness_drops_counted_once() {
        // 30 ms of processing against a 20 ms period: results arrive more
        // than the allowed 2 ms past their target
        let mut cfg = config(20);
        cfg.timing.max_lateness = ms(2);
        let sync = pipeline(
            cfg,
            SimTrigger::new(ms(20)).with_edge_limit(10),
            camera(),
            projector(),
            ms(30),
        );
        sync.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || {
            let m = sync.metrics();
            m.captured == 10 && m.processed == m.frames_read
        }));
        sync.stop().unwrap();

        let m = sync.metrics();
        assert_eq!(m.displayed, 0);
        assert_eq!(m.dropped_late, m.processed);
        let late: Vec<_> = sync
            .history()
            .into_iter()
            .filter(|r| r.outcome == CycleOutcome::DroppedLate)
            .collect();
        assert_eq!(late.len() as u64, m.dropped_late);
        assert!(late.iter().all(|r| r.overrun && r.displayed_at.is_none()));
    }

    #[test]
    fn test_camera_fault_freezes_pipeline() {
        let camera = camera().with_fail_after(10);
        let attempts = camera.attempts();
        let sync = pipeline(config(20), SimTrigger::new(ms(20)), camera, projector(), ms(2));
        sync.start().unwrap();

        assert!(wait_until(Duration::from_secs(5), || sync.state() == PipelineState::Faulted));
        let frozen = sync.metrics();
        assert_eq!(frozen.frames_read, 10);

        let fault = sync.fault().unwrap();
        assert_eq!(fault.origin, FaultOrigin::FrameSource);
        assert_eq!(fault.sequence, Some(10));

        thread::sleep(ms(150));
        assert_eq!(attempts.load(Ordering::Acquire), 11);
        assert_eq!(sync.metrics(), frozen);

        assert!(matches!(
            sync.start(),
            Err(ControlError::InvalidTransition {
                state: PipelineState::Faulted,
                ..
            })
        ));
        assert!(sync.stop().is_err());

        sync.fault_reset().unwrap();
        assert_eq!(sync.state(), PipelineState::Idle);
        assert!(sync.fault().is_none());
        assert_eq!(sync.metrics(), MetricsSnapshot::default());
        assert_eq!(sync.pool_stats().in_use, 0);
        assert!(matches!(
            sync.fault_reset(),
            Err(ControlError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_projector_fault() {
        let sync = pipeline(
            config(20),
            SimTrigger::new(ms(20)),
            camera(),
            projector().with_fail_after(5),
            ms(2),
        );
        sync.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || sync.state() == PipelineState::Faulted));

        let fault = sync.fault().unwrap();
        assert_eq!(fault.origin, FaultOrigin::ProjectionSink);
        assert_eq!(sync.metrics().displayed, 5);

        sync.fault_reset().unwrap();
        assert_eq!(sync.pool_stats().in_use, 0);
    }

    #[test]
    fn test_processor_panic_faults_pipeline() {
        let projector = projector();
        let planes = projector.planes();
        let sync = TriggerSynchronizer::new(
            config(20),
            Box::new(HardwareTriggeredSource::new(SimTrigger::new(ms(20)), camera())),
            Box::new(PanicsOn(3)),
            Box::new(ProjectorSink::new(projector)),
        )
        .unwrap();
        sync.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || sync.state() == PipelineState::Faulted));

        let fault = sync.fault().unwrap();
        assert_eq!(fault.origin, FaultOrigin::ProcessingStage);
        assert_eq!(fault.sequence, Some(3));
        assert!(fault.message.contains("bad frame 3"), "{}", fault.message);
        assert_eq!(sync.metrics().displayed, 3);
        let shown: Vec<u64> = planes.lock().iter().map(|(seq, _)| *seq).collect();
        assert_eq!(shown, vec![0, 1, 2]);
        assert!(wait_until(Duration::from_secs(1), || {
            sync.cycle_states()
                == ContextStates {
                    capture: SyncState::Faulted,
                    output: SyncState::Faulted,
                }
        }));

        // Both device handles survive, so the pipeline can run again
        sync.fault_reset().unwrap();
        assert_eq!(sync.pool_stats().in_use, 0);
        sync.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || sync.metrics().displayed >= 3));
        sync.stop().unwrap();
        assert_eq!(sync.state(), PipelineState::Idle);
        assert_eq!(sync.pool_stats().in_use, 0);
    }

    #[test]
    fn test_lost_projection_thread_faults_pipeline() {
        let sync = TriggerSynchronizer::new(
            config(20),
            Box::new(HardwareTriggeredSource::new(SimTrigger::new(ms(20)), camera())),
            Box::new(FixedDelay(ms(1))),
            Box::new(PanickingSink),
        )
        .unwrap();
        sync.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || sync.state() == PipelineState::Faulted));

        let fault = sync.fault().unwrap();
        assert_eq!(fault.origin, FaultOrigin::ProcessingStage);
        assert!(fault.sequence.is_some_and(|seq| seq >= 1));

        // The sink went down with its thread
        sync.fault_reset().unwrap();
        assert_eq!(sync.pool_stats().in_use, 0);
        assert!(matches!(sync.start(), Err(ControlError::DevicesUnavailable)));
    }

    #[test]
    fn test_processing_overrun_still_displayed() {
        // Past the 5 ms soft deadline but well inside the display target
        let mut cfg = config(40);
        cfg.timing.soft_deadline = ms(5);
        let sync = pipeline(
            cfg,
            SimTrigger::new(ms(40)).with_edge_limit(5),
            camera(),
            projector(),
            ms(10),
        );
        sync.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || {
            let m = sync.metrics();
            m.captured == 5 && m.processed == 5 && m.displayed == 5
        }));
        sync.stop().unwrap();

        let m = sync.metrics();
        assert_eq!(m.processing_overruns, 5);
        assert_eq!(m.processing_overruns, m.displayed);
        assert_eq!(m.dropped_late, 0);
        assert_eq!(m.deadline_misses, 0);
        assert!(sync
            .history()
            .iter()
            .all(|r| r.overrun && r.outcome == CycleOutcome::Displayed));
    }

    #[test]
    fn test_stop_during_processing_releases_buffers() {
        let mut cfg = config(20);
        cfg.timing.drain_grace = ms(30);
        let sync = pipeline(cfg, SimTrigger::new(ms(20)), camera(), projector(), ms(80));
        sync.start().unwrap();

        assert!(wait_until(Duration::from_secs(5), || sync.metrics().processed >= 1));
        thread::sleep(ms(10));
        sync.stop().unwrap();

        let m = sync.metrics();
        assert_eq!(sync.state(), PipelineState::Idle);
        assert_eq!(sync.pool_stats().in_use, 0);
        // Every frame read was either completed or abandoned
        assert_eq!(m.frames_read, m.processed + m.abandoned);
    }

    #[test]
    fn test_display_order_strictly_increasing() {
        let projector = projector();
        let planes = projector.planes();
        let sync = pipeline(
            config(10),
            SimTrigger::new(ms(10)).with_edge_limit(40),
            camera().with_underruns([3, 7]),
            projector,
            ms(3),
        );
        sync.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || {
            let m = sync.metrics();
            m.captured == 40 && m.processed == m.frames_read
        }));
        sync.stop().unwrap();

        let m = sync.metrics();
        assert_eq!(m.dropped_acquisition, 2);
        let sequences: Vec<u64> = planes.lock().iter().map(|(seq, _)| *seq).collect();
        assert_eq!(sequences.len() as u64, m.displayed);
        assert!(sequences.windows(2).all(|w| w[0] < w[1]));

        let history = sync.history();
        assert!(history.windows(2).all(|w| w[0].sequence < w[1].sequence));
    }

    #[test]
    fn test_trigger_timeouts_are_recoverable() {
        let trigger = SimTrigger::new(ms(10));
        let pause = trigger.pause_handle();
        pause.store(true, Ordering::Release);

        let mut cfg = config(10);
        cfg.trigger.timeout = ms(20);
        let sync = pipeline(cfg, trigger, camera(), projector(), ms(1));
        sync.start().unwrap();

        assert!(wait_until(Duration::from_secs(2), || sync.metrics().trigger_timeouts >= 3));
        assert_eq!(sync.metrics().captured, 0);
        assert_eq!(sync.state(), PipelineState::Running);

        pause.store(false, Ordering::Release);
        assert!(wait_until(Duration::from_secs(2), || sync.metrics().displayed >= 3));
        sync.stop().unwrap();
    }

    #[test]
    fn test_busy_projector_drops_pattern() {
        let sync = pipeline(
            config(10),
            SimTrigger::new(ms(10)).with_edge_limit(30),
            camera(),
            projector().with_latch_time(ms(45)),
            ms(1),
        );
        sync.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || {
            let m = sync.metrics();
            m.captured == 30 && m.processed == m.frames_read
        }));
        sync.stop().unwrap();

        let m = sync.metrics();
        assert!(m.displayed > 0);
        assert!(m.dropped_busy > 0);
        assert_eq!(m.processed, m.displayed + m.dropped_busy + m.dropped_late);
    }

    #[test]
    fn test_restart_continues_sequence() {
        let projector = projector();
        let planes = projector.planes();
        let sync = pipeline(config(10), SimTrigger::new(ms(10)), camera(), projector, ms(1));

        sync.start().unwrap();
        assert!(matches!(
            sync.start(),
            Err(ControlError::InvalidTransition {
                state: PipelineState::Running,
                ..
            })
        ));
        assert!(wait_until(Duration::from_secs(2), || sync.metrics().displayed >= 3));
        sync.stop().unwrap();
        let first_run = planes.lock().len();

        sync.start().unwrap();
        assert!(wait_until(Duration::from_secs(2), || planes.lock().len() >= first_run + 3));
        sync.stop().unwrap();
        sync.stop().unwrap();

        let sequences: Vec<u64> = planes.lock().iter().map(|(seq, _)| *seq).collect();
        assert!(sequences.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_software_timed_pipeline() {
        let mut cfg = config(10);
        cfg.trigger.mode = TriggerMode::SoftwareTimed;
        cfg.processing = stim_process::ProcessorKind::Regions {
            level: 200 << 8,
            min_area: 1,
            max_regions: 4,
        };
        let sync = TriggerSynchronizer::from_config(
            cfg,
            Box::new(SoftwareTimedSource::new(camera(), ms(10))),
            Box::new(ProjectorSink::new(projector())),
        )
        .unwrap();

        sync.start().unwrap();
        assert!(wait_until(Duration::from_secs(2), || sync.metrics().displayed >= 10));
        sync.stop().unwrap();
        assert_eq!(sync.metrics().dropped_acquisition, 0);
    }

    #[test]
    fn test_configuration_checked_against_devices() {
        let mut cfg = config(10);
        cfg.trigger.mode = TriggerMode::SoftwareTimed;
        let result = TriggerSynchronizer::from_config(
            cfg,
            Box::new(HardwareTriggeredSource::new(SimTrigger::new(ms(10)), camera())),
            Box::new(ProjectorSink::new(projector())),
        );
        assert!(matches!(result, Err(ConfigError::TriggerModeMismatch { .. })));

        let mut cfg = config(10);
        cfg.devices.projector_id = Some("dmd7".into());
        let result = TriggerSynchronizer::from_config(
            cfg,
            Box::new(HardwareTriggeredSource::new(SimTrigger::new(ms(10)), camera())),
            Box::new(ProjectorSink::new(projector())),
        );
        assert!(matches!(
            result,
            Err(ConfigError::DeviceMismatch {
                role: "projector",
                ..
            })
        ));
    }
}
