//! Projector side of the loop

use crate::error::{DeviceFault, SinkError};
use std::time::{Duration, Instant};
use stim_process::{BitMask, Pattern, PatternPayload};

/// Submissions slower than this are logged
pub const DEFAULT_SUBMIT_BUDGET: Duration = Duration::from_millis(2);

/// Displays patterns within a bounded submission time
pub trait ProjectionSink: Send {
    fn device_id(&self) -> &str;

    fn open(&mut self) -> Result<(), DeviceFault>;

    /// Submit `pattern`; returns when the projector starts showing it
    fn display(&mut self, pattern: &Pattern) -> Result<Instant, SinkError>;

    fn close(&mut self);
}

/// One packed 1-bit frame for the micromirror array
#[derive(Debug, Clone, Copy)]
pub struct BitPlane<'a> {
    /// Cycle the plane belongs to
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    /// Rows of `ceil(width / 8)` bytes, MSB = leftmost mirror
    pub bits: &'a [u8],
}

/// Vendor projector command channel
pub trait ProjectorDevice: Send {
    fn id(&self) -> &str;

    /// Mirror array size in pixels
    fn resolution(&self) -> (u32, u32);

    fn connect(&mut self) -> Result<(), DeviceFault>;

    fn disconnect(&mut self);

    /// Whether the previous plane is still latched
    fn is_latched(&self) -> Result<bool, DeviceFault>;

    /// Queue a plane for display; returns its display start time
    fn submit(&mut self, plane: &BitPlane<'_>) -> Result<Instant, DeviceFault>;
}

/// [`ProjectionSink`] over a bit-plane projector
pub struct ProjectorSink<D> {
    device: D,
    canvas: BitMask,
    plane: Vec<u8>,
    submit_budget: Duration,
    open: bool,
}

impl<D: ProjectorDevice> ProjectorSink<D> {
    pub fn new(device: D) -> Self {
        let (width, height) = device.resolution();
        Self {
            device,
            canvas: BitMask::new(width, height),
            plane: Vec::with_capacity((width as usize).div_ceil(8) * height as usize),
            submit_budget: DEFAULT_SUBMIT_BUDGET,
            open: false,
        }
    }

    pub fn with_submit_budget(mut self, budget: Duration) -> Self {
        self.submit_budget = budget;
        self
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Draw `pattern` onto the device-sized canvas and pack it
    fn rasterize(&mut self, pattern: &Pattern) {
        let canvas = &mut self.canvas;
        match &pattern.payload {
            PatternPayload::Mask(mask)
                if mask.width() == canvas.width() && mask.height() == canvas.height() =>
            {
                mask.pack_msb_first(&mut self.plane);
                return;
            }
            PatternPayload::Mask(mask) => {
                // Canvas size differs from the device: clip
                canvas.clear();
                let width = mask.width().min(canvas.width());
                let height = mask.height().min(canvas.height());
                for y in 0..height {
                    let row = mask.row(y);
                    for x in 0..width {
                        if BitMask::row_bit(row, x) {
                            canvas.set(x, y, true);
                        }
                    }
                }
            }
            PatternPayload::Regions(regions) => {
                canvas.clear();
                for roi in regions {
                    canvas.fill_rect(roi);
                }
            }
            PatternPayload::Blank => canvas.clear(),
        }
        canvas.pack_msb_first(&mut self.plane);
    }
}

impl<D: ProjectorDevice> ProjectionSink for ProjectorSink<D> {
    fn device_id(&self) -> &str {
        self.device.id()
    }

    fn open(&mut self) -> Result<(), DeviceFault> {
        if !self.open {
            self.device.connect()?;
            self.open = true;
            let (width, height) = self.device.resolution();
            log::debug!("Projector {} connected ({}x{})", self.device.id(), width, height);
        }
        Ok(())
    }

    fn display(&mut self, pattern: &Pattern) -> Result<Instant, SinkError> {
        if self.device.is_latched()? {
            return Err(SinkError::DeviceBusy);
        }

        self.rasterize(pattern);

        let started = Instant::now();
        let plane = BitPlane {
            sequence: pattern.sequence,
            width: self.canvas.width(),
            height: self.canvas.height(),
            bits: &self.plane,
        };
        let shown_at = self.device.submit(&plane)?;

        let elapsed = started.elapsed();
        if elapsed > self.submit_budget {
            log::warn!(
                "Projector {} took {:?} to accept pattern {} (budget {:?})",
                self.device.id(),
                elapsed,
                pattern.sequence,
                self.submit_budget
            );
        }
        Ok(shown_at)
    }

    fn close(&mut self) {
        if self.open {
            self.device.disconnect();
            self.open = false;
        }
    }
}
