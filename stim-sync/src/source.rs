//! Camera side of the loop
//!
//! [`FrameSource`] is what the synchronizer drives. The vendor boundary is
//! split into a [`TriggerLine`] (digital edge input) and a [`CameraDevice`]
//! (readout bus); the two concrete sources combine them for hardware and
//! software-timed triggering.

use crate::config::TriggerMode;
use crate::error::{DeviceFault, SourceError};
use std::thread;
use std::time::{Duration, Instant};
use stim_frame::FrameBuffer;

/// Longest a triggered exposure may take to read out before it counts as an
/// underrun
pub const DEFAULT_READOUT_TIMEOUT: Duration = Duration::from_millis(20);

/// One observed trigger edge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerEvent {
    pub at: Instant,
    /// Running edge index as counted by the trigger hardware
    pub edge_count: u64,
}

/// Camera frames synchronized to a trigger
pub trait FrameSource: Send {
    fn device_id(&self) -> &str;

    fn mode(&self) -> TriggerMode;

    /// Acquire device handles for a run
    fn open(&mut self) -> Result<(), DeviceFault>;

    /// Block until the next trigger or `timeout`
    fn wait_for_trigger(&mut self, timeout: Duration) -> Result<TriggerEvent, SourceError>;

    /// Read the exposure started by the last trigger into `into`.
    /// Returns the capture timestamp.
    fn capture(&mut self, into: &mut FrameBuffer) -> Result<Instant, SourceError>;

    /// Release device handles at the end of a run
    fn close(&mut self);
}

/// Digital trigger input
pub trait TriggerLine: Send {
    /// Wait for the next rising edge; `Ok(None)` on timeout
    fn wait_edge(&mut self, timeout: Duration) -> Result<Option<TriggerEvent>, DeviceFault>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Frame copied; exposure timestamp
    Ready(Instant),
    NotReady,
}

/// Vendor camera readout
pub trait CameraDevice: Send {
    fn id(&self) -> &str;

    /// Prepare for triggered acquisition
    fn arm(&mut self, mode: TriggerMode) -> Result<(), DeviceFault>;

    fn disarm(&mut self);

    /// Start one exposure (software-timed mode)
    fn software_trigger(&mut self) -> Result<(), DeviceFault>;

    fn read_frame(&mut self, into: &mut [u8], timeout: Duration)
        -> Result<ReadOutcome, DeviceFault>;
}

fn read_into<C: CameraDevice>(
    camera: &mut C,
    into: &mut FrameBuffer,
    timeout: Duration,
) -> Result<Instant, SourceError> {
    match camera.read_frame(into.pixels_mut(), timeout)? {
        ReadOutcome::Ready(at) => Ok(at),
        ReadOutcome::NotReady => Err(SourceError::Underrun),
    }
}

/// Exposures started by an external waveform generator
pub struct HardwareTriggeredSource<L, C> {
    line: L,
    camera: C,
    readout_timeout: Duration,
    open: bool,
}

impl<L: TriggerLine, C: CameraDevice> HardwareTriggeredSource<L, C> {
    pub fn new(line: L, camera: C) -> Self {
        Self {
            line,
            camera,
            readout_timeout: DEFAULT_READOUT_TIMEOUT,
            open: false,
        }
    }

    pub fn with_readout_timeout(mut self, timeout: Duration) -> Self {
        self.readout_timeout = timeout;
        self
    }

    pub fn camera(&self) -> &C {
        &self.camera
    }
}

impl<L: TriggerLine, C: CameraDevice> FrameSource for HardwareTriggeredSource<L, C> {
    fn device_id(&self) -> &str {
        self.camera.id()
    }

    fn mode(&self) -> TriggerMode {
        TriggerMode::Hardware
    }

    fn open(&mut self) -> Result<(), DeviceFault> {
        if !self.open {
            self.camera.arm(TriggerMode::Hardware)?;
            self.open = true;
            log::debug!("Camera {} armed for hardware trigger", self.camera.id());
        }
        Ok(())
    }

    fn wait_for_trigger(&mut self, timeout: Duration) -> Result<TriggerEvent, SourceError> {
        self.line
            .wait_edge(timeout)?
            .ok_or(SourceError::TriggerTimeout(timeout))
    }

    fn capture(&mut self, into: &mut FrameBuffer) -> Result<Instant, SourceError> {
        read_into(&mut self.camera, into, self.readout_timeout)
    }

    fn close(&mut self) {
        if self.open {
            self.camera.disarm();
            self.open = false;
            log::debug!("Camera {} disarmed", self.camera.id());
        }
    }
}

/// Exposures paced by the host on a monotonic schedule.
///
/// Ticks that were missed (the caller came back late) are skipped rather
/// than fired back to back.
pub struct SoftwareTimedSource<C> {
    camera: C,
    period: Duration,
    readout_timeout: Duration,
    next_tick: Option<Instant>,
    ticks: u64,
    skipped: u64,
    open: bool,
}

impl<C: CameraDevice> SoftwareTimedSource<C> {
    pub fn new(camera: C, period: Duration) -> Self {
        Self {
            camera,
            period,
            readout_timeout: DEFAULT_READOUT_TIMEOUT,
            next_tick: None,
            ticks: 0,
            skipped: 0,
            open: false,
        }
    }

    pub fn with_readout_timeout(mut self, timeout: Duration) -> Self {
        self.readout_timeout = timeout;
        self
    }

    /// Ticks skipped because the caller fell behind
    pub fn skipped_ticks(&self) -> u64 {
        self.skipped
    }

    pub fn camera(&self) -> &C {
        &self.camera
    }
}

impl<C: CameraDevice> FrameSource for SoftwareTimedSource<C> {
    fn device_id(&self) -> &str {
        self.camera.id()
    }

    fn mode(&self) -> TriggerMode {
        TriggerMode::SoftwareTimed
    }

    fn open(&mut self) -> Result<(), DeviceFault> {
        if !self.open {
            if self.period.is_zero() {
                return Err(DeviceFault::new("software trigger period is zero"));
            }
            self.camera.arm(TriggerMode::SoftwareTimed)?;
            self.next_tick = None;
            self.open = true;
            log::debug!(
                "Camera {} armed for software trigger every {:?}",
                self.camera.id(),
                self.period
            );
        }
        Ok(())
    }

    fn wait_for_trigger(&mut self, timeout: Duration) -> Result<TriggerEvent, SourceError> {
        let now = Instant::now();
        let mut tick = *self.next_tick.get_or_insert(now);

        if tick < now {
            let behind = now.duration_since(tick).as_nanos() / self.period.as_nanos();
            if behind > 0 {
                self.skipped += behind as u64;
                tick += Duration::from_nanos((self.period.as_nanos() * behind) as u64);
                log::trace!("Software trigger skipped {} missed ticks", behind);
            }
        }

        if tick > now + timeout {
            thread::sleep(timeout);
            self.next_tick = Some(tick);
            return Err(SourceError::TriggerTimeout(timeout));
        }

        let wait = tick.saturating_duration_since(Instant::now());
        if !wait.is_zero() {
            thread::sleep(wait);
        }

        self.camera.software_trigger()?;
        let event = TriggerEvent {
            at: Instant::now(),
            edge_count: self.ticks,
        };
        self.ticks += 1;
        self.next_tick = Some(tick + self.period);
        Ok(event)
    }

    fn capture(&mut self, into: &mut FrameBuffer) -> Result<Instant, SourceError> {
        read_into(&mut self.camera, into, self.readout_timeout)
    }

    fn close(&mut self) {
        if self.open {
            self.camera.disarm();
            self.open = false;
        }
    }
}
