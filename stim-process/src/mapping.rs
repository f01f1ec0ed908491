//! Camera to projector mapping
//!
//! Patterns are computed in camera pixels but the micromirror device is
//! addressed in its own pixels. A calibrated 3x3 homography (camera ->
//! projector) maps between the two; masks are warped by inverse lookup so
//! every projector pixel is decided exactly once.

use crate::error::ProcessError;
use crate::types::{BitMask, PatternPayload, Roi};
use glam::{Mat3, Vec2, Vec3};

const DEGENERATE_EPSILON: f32 = 1e-9;

/// Translation, scale and rotation read off a homography
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decomposition {
    pub translation: Vec2,
    pub scale: Vec2,
    pub rotation_degrees: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProjectorMapping {
    homography: Mat3,
    inverse: Mat3,
    width: u32,
    height: u32,
}

impl ProjectorMapping {
    /// `homography` maps camera pixels to projector pixels of a
    /// `width` x `height` device
    pub fn new(homography: Mat3, width: u32, height: u32) -> Result<Self, ProcessError> {
        let det = homography.determinant();
        if !det.is_finite() || det.abs() < DEGENERATE_EPSILON {
            return Err(ProcessError::DegenerateMapping(det));
        }
        if width == 0 || height == 0 {
            return Err(ProcessError::InvalidParameter(format!(
                "projector resolution {}x{} must be non-zero",
                width, height
            )));
        }
        Ok(Self {
            homography,
            inverse: homography.inverse(),
            width,
            height,
        })
    }

    /// Build from a row-major matrix, the layout calibration tools emit
    pub fn from_row_major(m: [f32; 9], width: u32, height: u32) -> Result<Self, ProcessError> {
        Self::new(Mat3::from_cols_array(&m).transpose(), width, height)
    }

    pub fn identity(width: u32, height: u32) -> Self {
        Self {
            homography: Mat3::IDENTITY,
            inverse: Mat3::IDENTITY,
            width,
            height,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn homography(&self) -> Mat3 {
        self.homography
    }

    fn project(m: &Mat3, p: Vec2) -> Option<Vec2> {
        let v = *m * Vec3::new(p.x, p.y, 1.0);
        if v.z.abs() < DEGENERATE_EPSILON {
            return None;
        }
        Some(Vec2::new(v.x / v.z, v.y / v.z))
    }

    /// Camera point -> projector point
    pub fn map_point(&self, camera: Vec2) -> Option<Vec2> {
        Self::project(&self.homography, camera)
    }

    /// Projector point -> camera point
    pub fn unmap_point(&self, projector: Vec2) -> Option<Vec2> {
        Self::project(&self.inverse, projector)
    }

    /// Warp a camera-space mask into projector space (nearest neighbour)
    pub fn warp_mask(&self, mask: &BitMask) -> BitMask {
        let inverse = self.inverse;
        let width = self.width;
        let (src_w, src_h) = (mask.width() as f32, mask.height() as f32);

        let mut out = BitMask::new(self.width, self.height);
        out.fill_rows(|y, row| {
            for x in 0..width {
                let centre = Vec2::new(x as f32 + 0.5, y as f32 + 0.5);
                if let Some(src) = Self::project(&inverse, centre) {
                    if src.x >= 0.0 && src.y >= 0.0 && src.x < src_w && src.y < src_h {
                        if mask.get(src.x as u32, src.y as u32) {
                            BitMask::set_row_bit(row, x);
                        }
                    }
                }
            }
        });
        out
    }

    /// Map a camera-space rectangle to its projector-space bounding box.
    ///
    /// Returns `None` when the box falls entirely outside the device.
    pub fn map_roi(&self, roi: &Roi) -> Option<Roi> {
        let x0 = roi.x as f32;
        let y0 = roi.y as f32;
        let x1 = (roi.x + roi.width) as f32;
        let y1 = (roi.y + roi.height) as f32;
        let corners = [
            Vec2::new(x0, y0),
            Vec2::new(x1, y0),
            Vec2::new(x0, y1),
            Vec2::new(x1, y1),
        ];

        let mut min = Vec2::splat(f32::MAX);
        let mut max = Vec2::splat(f32::MIN);
        for corner in corners {
            let p = self.map_point(corner)?;
            min = min.min(p);
            max = max.max(p);
        }

        let min = min.max(Vec2::ZERO);
        let max = max.min(Vec2::new(self.width as f32, self.height as f32));
        if max.x <= min.x || max.y <= min.y {
            return None;
        }

        let left = min.x.floor() as u32;
        let top = min.y.floor() as u32;
        Some(Roi {
            x: left,
            y: top,
            width: (max.x.ceil() as u32).saturating_sub(left).max(1),
            height: (max.y.ceil() as u32).saturating_sub(top).max(1),
            area: roi.area,
            peak: roi.peak,
        })
    }

    /// Move a payload from camera space into projector space
    pub fn apply(&self, payload: PatternPayload) -> PatternPayload {
        match payload {
            PatternPayload::Blank => PatternPayload::Blank,
            PatternPayload::Mask(mask) => PatternPayload::Mask(self.warp_mask(&mask)),
            PatternPayload::Regions(regions) => {
                let mapped: Vec<Roi> = regions.iter().filter_map(|r| self.map_roi(r)).collect();
                if mapped.is_empty() {
                    PatternPayload::Blank
                } else {
                    PatternPayload::Regions(mapped)
                }
            }
        }
    }

    /// Break the homography into translation, per-axis scale and rotation
    pub fn decompose(&self) -> Decomposition {
        let h = self.homography * (1.0 / self.homography.z_axis.z);
        // glam is column-major: element (row r, col c) is col(c)[r]
        let at = |r: usize, c: usize| h.col(c)[r];

        let r1 = Vec2::new(at(0, 0), at(0, 1));
        let r2 = Vec2::new(at(1, 0), at(1, 1));
        let scale = Vec2::new(r1.length(), r2.length());
        let r2n = r2 / scale.y;

        Decomposition {
            translation: Vec2::new(at(0, 2), at(1, 2)),
            scale,
            rotation_degrees: r2n.x.atan2(r2n.y).to_degrees(),
        }
    }
}
