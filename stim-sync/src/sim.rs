//! Simulated trigger, camera and projector
//!
//! Stand-ins for the vendor devices so the full loop can run, and be timed,
//! without hardware.

use crate::config::TriggerMode;
use crate::error::DeviceFault;
use crate::sink::{BitPlane, ProjectorDevice};
use crate::source::{CameraDevice, ReadOutcome, TriggerEvent, TriggerLine};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn sleep_until(at: Instant) {
    let wait = at.saturating_duration_since(Instant::now());
    if !wait.is_zero() {
        thread::sleep(wait);
    }
}

/// Periodic trigger waveform.
///
/// Edge `k` fires at `origin + k * period`, where the origin is the first
/// wait. A caller that falls behind gets the latest edge that has already
/// passed; the ones in between are lost, as on a real trigger line.
pub struct SimTrigger {
    period: Duration,
    edge_limit: Option<u64>,
    paused: Arc<AtomicBool>,
    origin: Option<Instant>,
    next_edge: u64,
}

impl SimTrigger {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            edge_limit: None,
            paused: Arc::new(AtomicBool::new(false)),
            origin: None,
            next_edge: 0,
        }
    }

    /// Stop the waveform after `limit` edges
    pub fn with_edge_limit(mut self, limit: u64) -> Self {
        self.edge_limit = Some(limit);
        self
    }

    /// Flag that suspends the waveform while set
    pub fn pause_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.paused)
    }

    fn edge_time(&self, origin: Instant, index: u64) -> Instant {
        origin + Duration::from_nanos((self.period.as_nanos() as u64).saturating_mul(index))
    }
}

impl TriggerLine for SimTrigger {
    fn wait_edge(&mut self, timeout: Duration) -> Result<Option<TriggerEvent>, DeviceFault> {
        let now = Instant::now();
        let deadline = now + timeout;
        let origin = *self.origin.get_or_insert(now);

        let passed = (now.duration_since(origin).as_nanos() / self.period.as_nanos().max(1)) as u64;
        let index = self.next_edge.max(passed);
        let exhausted = self.edge_limit.is_some_and(|limit| index >= limit);
        let at = self.edge_time(origin, index);

        if exhausted || self.paused.load(Ordering::Acquire) || at > deadline {
            sleep_until(deadline);
            return Ok(None);
        }

        sleep_until(at);
        self.next_edge = index + 1;
        Ok(Some(TriggerEvent {
            at,
            edge_count: index,
        }))
    }
}

/// Camera producing synthetic 8-bit fluorescence frames: seeded noise with a
/// few bright spots.
pub struct SimCamera {
    id: String,
    width: u32,
    height: u32,
    rng: StdRng,
    spots: Vec<(u32, u32)>,
    readout_time: Duration,
    underruns: HashSet<u64>,
    fail_after: Option<u64>,
    attempts: Arc<AtomicU64>,
    armed: Option<TriggerMode>,
    software_triggers: u64,
}

impl SimCamera {
    pub fn new(id: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            id: id.into(),
            width,
            height,
            rng: StdRng::seed_from_u64(0x5EED),
            spots: vec![(width / 4, height / 4), (width * 2 / 3, height / 2)],
            readout_time: Duration::from_micros(500),
            underruns: HashSet::new(),
            fail_after: None,
            attempts: Arc::new(AtomicU64::new(0)),
            armed: None,
            software_triggers: 0,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn with_spots(mut self, spots: Vec<(u32, u32)>) -> Self {
        self.spots = spots;
        self
    }

    pub fn with_readout_time(mut self, readout_time: Duration) -> Self {
        self.readout_time = readout_time;
        self
    }

    /// Report "not ready" on these readout attempts (0-based)
    pub fn with_underruns(mut self, attempts: impl IntoIterator<Item = u64>) -> Self {
        self.underruns = attempts.into_iter().collect();
        self
    }

    /// Fail with a device error once `reads` readouts have been attempted
    pub fn with_fail_after(mut self, reads: u64) -> Self {
        self.fail_after = Some(reads);
        self
    }

    /// Shared count of readout attempts
    pub fn attempts(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.attempts)
    }

    pub fn software_triggers(&self) -> u64 {
        self.software_triggers
    }

    fn render(&mut self, into: &mut [u8]) {
        for px in into.iter_mut() {
            *px = self.rng.gen_range(10..40);
        }
        let width = self.width as usize;
        for &(sx, sy) in &self.spots {
            for y in sy.saturating_sub(1)..=(sy + 1).min(self.height.saturating_sub(1)) {
                for x in sx.saturating_sub(1)..=(sx + 1).min(self.width.saturating_sub(1)) {
                    if let Some(px) = into.get_mut(y as usize * width + x as usize) {
                        *px = 250;
                    }
                }
            }
        }
    }
}

impl CameraDevice for SimCamera {
    fn id(&self) -> &str {
        &self.id
    }

    fn arm(&mut self, mode: TriggerMode) -> Result<(), DeviceFault> {
        self.armed = Some(mode);
        Ok(())
    }

    fn disarm(&mut self) {
        self.armed = None;
    }

    fn software_trigger(&mut self) -> Result<(), DeviceFault> {
        match self.armed {
            Some(TriggerMode::SoftwareTimed) => {
                self.software_triggers += 1;
                Ok(())
            }
            _ => Err(DeviceFault::new("software trigger while not armed for it")),
        }
    }

    fn read_frame(
        &mut self,
        into: &mut [u8],
        timeout: Duration,
    ) -> Result<ReadOutcome, DeviceFault> {
        if self.armed.is_none() {
            return Err(DeviceFault::new(format!("camera {} is not armed", self.id)));
        }

        let attempt = self.attempts.fetch_add(1, Ordering::AcqRel);
        if self.fail_after.is_some_and(|limit| attempt >= limit) {
            return Err(DeviceFault::new(format!(
                "camera {} disconnected during readout",
                self.id
            )));
        }
        if self.underruns.contains(&attempt) || self.readout_time > timeout {
            return Ok(ReadOutcome::NotReady);
        }

        thread::sleep(self.readout_time);
        self.render(into);
        Ok(ReadOutcome::Ready(Instant::now()))
    }
}

/// Recorded `(sequence, packed plane)` pairs, in submission order
pub type PlaneLog = Arc<Mutex<Vec<(u64, Vec<u8>)>>>;

/// Projector that records every submitted plane
pub struct SimProjector {
    id: String,
    width: u32,
    height: u32,
    latch_time: Duration,
    latched_until: Option<Instant>,
    fail_after: Option<u64>,
    submits: u64,
    planes: PlaneLog,
    connected: bool,
}

impl SimProjector {
    pub fn new(id: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            id: id.into(),
            width,
            height,
            latch_time: Duration::ZERO,
            latched_until: None,
            fail_after: None,
            submits: 0,
            planes: Arc::new(Mutex::new(Vec::new())),
            connected: false,
        }
    }

    /// Keep each plane latched (refusing new ones) for this long
    pub fn with_latch_time(mut self, latch_time: Duration) -> Self {
        self.latch_time = latch_time;
        self
    }

    /// Fail with a device error after `submits` successful submissions
    pub fn with_fail_after(mut self, submits: u64) -> Self {
        self.fail_after = Some(submits);
        self
    }

    pub fn planes(&self) -> PlaneLog {
        Arc::clone(&self.planes)
    }
}

impl ProjectorDevice for SimProjector {
    fn id(&self) -> &str {
        &self.id
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn connect(&mut self) -> Result<(), DeviceFault> {
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.connected = false;
        self.latched_until = None;
    }

    fn is_latched(&self) -> Result<bool, DeviceFault> {
        Ok(self
            .latched_until
            .is_some_and(|until| Instant::now() < until))
    }

    fn submit(&mut self, plane: &BitPlane<'_>) -> Result<Instant, DeviceFault> {
        if !self.connected {
            return Err(DeviceFault::new(format!("projector {} is not connected", self.id)));
        }
        if self.fail_after.is_some_and(|limit| self.submits >= limit) {
            return Err(DeviceFault::new(format!("projector {} stopped responding", self.id)));
        }

        let now = Instant::now();
        self.submits += 1;
        self.latched_until = Some(now + self.latch_time);
        self.planes.lock().push((plane.sequence, plane.bits.to_vec()));
        Ok(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_skips_to_latest_passed_edge() {
        let mut trigger = SimTrigger::new(Duration::from_millis(5));
        let first = trigger.wait_edge(Duration::from_millis(50)).unwrap().unwrap();
        assert_eq!(first.edge_count, 0);

        thread::sleep(Duration::from_millis(17));
        let late = trigger.wait_edge(Duration::from_millis(50)).unwrap().unwrap();
        assert!(late.edge_count >= 3);
        assert_eq!(late.at, first.at + Duration::from_millis(5 * late.edge_count));
    }

    #[test]
    fn test_trigger_pause() {
        let mut trigger = SimTrigger::new(Duration::from_millis(2));
        let pause = trigger.pause_handle();
        pause.store(true, Ordering::Release);
        assert_eq!(trigger.wait_edge(Duration::from_millis(10)).unwrap(), None);
        pause.store(false, Ordering::Release);
        assert!(trigger.wait_edge(Duration::from_millis(10)).unwrap().is_some());
    }

    #[test]
    fn test_camera_is_deterministic_per_seed() {
        let mut a = SimCamera::new("a", 8, 8).with_seed(7);
        let mut b = SimCamera::new("b", 8, 8).with_seed(7);
        a.arm(TriggerMode::Hardware).unwrap();
        b.arm(TriggerMode::Hardware).unwrap();

        let (mut fa, mut fb) = (vec![0u8; 64], vec![0u8; 64]);
        a.read_frame(&mut fa, Duration::from_millis(5)).unwrap();
        b.read_frame(&mut fb, Duration::from_millis(5)).unwrap();
        assert_eq!(fa, fb);
        assert_eq!(fa[2 * 8 + 2], 250);
    }

    #[test]
    fn test_camera_failure_injection() {
        let mut camera = SimCamera::new("c", 4, 4).with_fail_after(1);
        let attempts = camera.attempts();
        let mut frame = vec![0u8; 16];
        assert!(camera.read_frame(&mut frame, Duration::from_millis(5)).is_err());

        camera.arm(TriggerMode::Hardware).unwrap();
        assert!(camera.read_frame(&mut frame, Duration::from_millis(5)).is_ok());
        assert!(camera.read_frame(&mut frame, Duration::from_millis(5)).is_err());
        assert_eq!(attempts.load(Ordering::Acquire), 2);
        assert!(camera.software_trigger().is_err());
    }
}
