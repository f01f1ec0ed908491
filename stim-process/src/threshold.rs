//! Intensity thresholding

use crate::processor::Processor;
use crate::types::{BitMask, PatternPayload, Processed};
use stim_frame::Frame;

/// Mask of every pixel whose 16-bit intensity is at least `level`
pub fn threshold_mask(frame: &Frame, level: u16) -> BitMask {
    let width = frame.width();
    let mut mask = BitMask::new(width, frame.height());
    mask.fill_rows(|y, row| {
        for x in 0..width {
            if frame.intensity(x, y) >= level {
                BitMask::set_row_bit(row, x);
            }
        }
    });
    mask
}

pub struct ThresholdProcessor {
    level: u16,
}

impl ThresholdProcessor {
    pub fn new(level: u16) -> Self {
        Self { level }
    }

    pub fn level(&self) -> u16 {
        self.level
    }
}

impl Processor for ThresholdProcessor {
    fn name(&self) -> &'static str {
        "threshold"
    }

    fn process(&mut self, frame: &Frame) -> Processed {
        Processed::pattern_only(PatternPayload::Mask(threshold_mask(frame, self.level)))
    }
}
