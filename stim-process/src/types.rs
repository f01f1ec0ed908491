//! Processing output types: projector patterns and processed results

use rayon::prelude::*;
use std::fmt;
use std::time::{Duration, Instant};
use stim_frame::Frame;

/// Row-major 1-bit image, each row padded to whole 64-bit words
#[derive(Clone, PartialEq, Eq)]
pub struct BitMask {
    width: u32,
    height: u32,
    words_per_row: usize,
    words: Vec<u64>,
}

impl BitMask {
    pub fn new(width: u32, height: u32) -> Self {
        let words_per_row = (width as usize).div_ceil(64);
        Self {
            width,
            height,
            words_per_row,
            words: vec![0; words_per_row * height as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn words_per_row(&self) -> usize {
        self.words_per_row
    }

    pub fn row(&self, y: u32) -> &[u64] {
        let start = y as usize * self.words_per_row;
        &self.words[start..start + self.words_per_row]
    }

    pub fn get(&self, x: u32, y: u32) -> bool {
        if x >= self.width || y >= self.height {
            return false;
        }
        Self::row_bit(self.row(y), x)
    }

    pub fn set(&mut self, x: u32, y: u32, on: bool) {
        if x >= self.width || y >= self.height {
            return;
        }
        let index = y as usize * self.words_per_row + (x / 64) as usize;
        let bit = 1u64 << (x % 64);
        if on {
            self.words[index] |= bit;
        } else {
            self.words[index] &= !bit;
        }
    }

    /// Read bit `x` of a single row slice
    #[inline]
    pub fn row_bit(row: &[u64], x: u32) -> bool {
        row[(x / 64) as usize] & (1u64 << (x % 64)) != 0
    }

    /// Set bit `x` of a single row slice
    #[inline]
    pub fn set_row_bit(row: &mut [u64], x: u32) {
        row[(x / 64) as usize] |= 1u64 << (x % 64);
    }

    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    pub fn clear(&mut self) {
        self.words.fill(0);
    }

    /// Light every pixel inside `roi`, clipped to the mask
    pub fn fill_rect(&mut self, roi: &Roi) {
        let x_end = roi.x.saturating_add(roi.width).min(self.width);
        let y_end = roi.y.saturating_add(roi.height).min(self.height);
        for y in roi.y..y_end {
            let start = y as usize * self.words_per_row;
            let row = &mut self.words[start..start + self.words_per_row];
            for x in roi.x..x_end {
                Self::set_row_bit(row, x);
            }
        }
    }

    /// Fill rows in parallel. `f` receives the row index and its zeroed words.
    pub fn fill_rows<F>(&mut self, f: F)
    where
        F: Fn(u32, &mut [u64]) + Sync + Send,
    {
        if self.words_per_row == 0 {
            return;
        }
        self.words
            .par_chunks_mut(self.words_per_row)
            .enumerate()
            .for_each(|(y, row)| {
                row.fill(0);
                f(y as u32, row);
            });
    }

    /// Pack into a byte plane, MSB = leftmost pixel, rows padded to bytes.
    ///
    /// `out` is cleared and reused so callers can keep one plane per device.
    pub fn pack_msb_first(&self, out: &mut Vec<u8>) {
        let row_bytes = (self.width as usize).div_ceil(8);
        out.clear();
        out.reserve(row_bytes * self.height as usize);
        for y in 0..self.height {
            let row = self.row(y);
            for b in 0..row_bytes {
                let byte = (row[b / 8] >> ((b % 8) * 8)) as u8;
                out.push(byte.reverse_bits());
            }
        }
    }
}

impl fmt::Debug for BitMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitMask")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("lit", &self.count_ones())
            .finish()
    }
}

/// Rectangular region of interest in pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    /// Number of member pixels (not the bounding box area)
    pub area: u32,
    /// Brightest member intensity, 16-bit scale
    pub peak: u16,
}

impl Roi {
    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x
            && y >= self.y
            && x < self.x.saturating_add(self.width)
            && y < self.y.saturating_add(self.height)
    }
}

/// Device-addressable projector command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternPayload {
    /// Nothing illuminated
    Blank,
    /// Per-pixel illumination
    Mask(BitMask),
    /// Illuminate the listed rectangles
    Regions(Vec<Roi>),
}

impl PatternPayload {
    pub fn is_blank(&self) -> bool {
        match self {
            PatternPayload::Blank => true,
            PatternPayload::Mask(mask) => mask.is_empty(),
            PatternPayload::Regions(regions) => regions.is_empty(),
        }
    }
}

/// Pattern to display for one cycle
#[derive(Debug, Clone)]
pub struct Pattern {
    pub sequence: u64,
    /// When the pattern should be on the projector
    pub target_display: Instant,
    /// Canvas size in projector pixels
    pub width: u32,
    pub height: u32,
    pub payload: PatternPayload,
}

impl Pattern {
    /// How far past its target `now` is, zero when early or on time
    pub fn lateness_at(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.target_display)
    }
}

/// Replacement pixel data produced by a processor (8-bit grayscale)
#[derive(Clone, PartialEq, Eq)]
pub struct ProcessedImage {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl fmt::Debug for ProcessedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessedImage")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

/// Raw output of a processor before the stage attaches timing
#[derive(Debug, Clone)]
pub struct Processed {
    pub payload: PatternPayload,
    pub image: Option<ProcessedImage>,
}

impl Processed {
    pub fn pattern_only(payload: PatternPayload) -> Self {
        Self {
            payload,
            image: None,
        }
    }
}

/// Processing took longer than the soft deadline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessingOverrun {
    pub elapsed: Duration,
    pub deadline: Duration,
}

impl ProcessingOverrun {
    pub fn excess(&self) -> Duration {
        self.elapsed.saturating_sub(self.deadline)
    }
}

/// Result of processing one frame.
///
/// Keeps the source frame so the orchestrator can hand its buffer back to
/// the pool once the pattern has been dispatched.
#[derive(Debug)]
pub struct ProcessedResult {
    pub source: Frame,
    pub image: Option<ProcessedImage>,
    pub pattern: Pattern,
    pub processing_time: Duration,
    pub overrun: Option<ProcessingOverrun>,
}

impl ProcessedResult {
    pub fn sequence(&self) -> u64 {
        self.pattern.sequence
    }

    /// Processed pixels: the replacement image if any, else the source frame
    pub fn pixels(&self) -> &[u8] {
        match &self.image {
            Some(image) => &image.data,
            None => self.source.pixels(),
        }
    }

    pub fn into_parts(self) -> (Frame, Pattern) {
        (self.source, self.pattern)
    }
}
