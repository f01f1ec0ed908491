//! Frame data types and pixel formats

use std::time::Instant;

/// Pixel formats delivered by the camera readout
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Mono8 = 1,  // 8-bit grayscale
    Mono12 = 2, // 12-bit grayscale, stored little-endian in 16 bits
    Mono16 = 3, // 16-bit grayscale, little-endian
    Bgra8 = 4,  // Packed BGR with alpha
}

impl PixelFormat {
    /// Map a raw format code (as used across the C boundary) to a format
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(PixelFormat::Mono8),
            2 => Some(PixelFormat::Mono12),
            3 => Some(PixelFormat::Mono16),
            4 => Some(PixelFormat::Bgra8),
            _ => None,
        }
    }

    /// Returns bytes per pixel
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Mono8 => 1,
            PixelFormat::Mono12 | PixelFormat::Mono16 => 2,
            PixelFormat::Bgra8 => 4,
        }
    }

    /// Number of meaningful bits per sample
    pub fn significant_bits(self) -> u32 {
        match self {
            PixelFormat::Mono8 | PixelFormat::Bgra8 => 8,
            PixelFormat::Mono12 => 12,
            PixelFormat::Mono16 => 16,
        }
    }

    /// Calculate frame size in bytes
    pub fn calculate_size(self, width: u32, height: u32) -> usize {
        width as usize * height as usize * self.bytes_per_pixel()
    }

    /// Intensity of the pixel at `index`, scaled to the full 16-bit range.
    ///
    /// `bytes` must hold at least `index + 1` pixels of this format.
    #[inline]
    pub fn intensity(self, bytes: &[u8], index: usize) -> u16 {
        match self {
            PixelFormat::Mono8 => (bytes[index] as u16) << 8,
            PixelFormat::Mono12 => {
                let raw = u16::from_le_bytes([bytes[index * 2], bytes[index * 2 + 1]]);
                raw.min(0x0FFF) << 4
            }
            PixelFormat::Mono16 => u16::from_le_bytes([bytes[index * 2], bytes[index * 2 + 1]]),
            PixelFormat::Bgra8 => {
                let px = &bytes[index * 4..index * 4 + 3];
                // BT.601 luma weights in 8.8 fixed point
                let luma = (px[2] as u32 * 77 + px[1] as u32 * 150 + px[0] as u32 * 29) >> 8;
                (luma as u16) << 8
            }
        }
    }
}

/// Dimensions and layout of the frames held by a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
    pub stride: u32, // Bytes per row
    pub format: PixelFormat,
}

impl FrameGeometry {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            stride: width * format.bytes_per_pixel() as u32,
            format,
        }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Bytes covered by the pixel rows (excludes any pool padding)
    pub fn image_size(&self) -> usize {
        self.stride as usize * self.height as usize
    }
}

/// Per-cycle identity stamped onto a frame once the capture completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStamp {
    /// Cycle sequence number, counted from the first trigger of a run
    pub sequence: u64,
    /// Instant the trigger edge was observed
    pub trigger_at: Instant,
    /// Instant the readout finished
    pub captured_at: Instant,
}
