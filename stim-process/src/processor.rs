//! Pluggable frame processors
//!
//! A processor turns a captured frame into a projector pattern and,
//! optionally, a replacement image. Implementations must be deterministic
//! given their input; scratch buffers may be reused between calls but must
//! not carry state from one frame to the next.

use crate::activity::ActivityProcessor;
use crate::error::ProcessError;
use crate::regions::RegionProcessor;
use crate::threshold::ThresholdProcessor;
use crate::types::Processed;
use stim_frame::{Frame, PixelFormat};

pub trait Processor: Send {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    fn supports(&self, _format: PixelFormat) -> bool {
        true
    }

    fn process(&mut self, frame: &Frame) -> Processed;
}

/// Algorithm selection, resolved once at configuration time
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProcessorKind {
    /// Light every pixel at or above `level` (16-bit scale)
    Threshold { level: u16 },
    /// Light the bounding boxes of the largest bright connected regions
    Regions {
        level: u16,
        min_area: u32,
        max_regions: usize,
    },
    /// Light pixels that stand out from their local tile
    Activity { tile: u32, z_threshold: f32 },
}

impl Default for ProcessorKind {
    fn default() -> Self {
        ProcessorKind::Threshold { level: 0x8000 }
    }
}

impl ProcessorKind {
    pub fn validate(&self) -> Result<(), ProcessError> {
        match *self {
            ProcessorKind::Threshold { .. } => Ok(()),
            ProcessorKind::Regions { max_regions, .. } if max_regions == 0 => Err(
                ProcessError::InvalidParameter("max_regions must be at least 1".into()),
            ),
            ProcessorKind::Regions { .. } => Ok(()),
            ProcessorKind::Activity { tile, .. } if tile < 2 => Err(
                ProcessError::InvalidParameter(format!("activity tile {} is below 2 px", tile)),
            ),
            ProcessorKind::Activity { z_threshold, .. }
                if !z_threshold.is_finite() || z_threshold <= 0.0 =>
            {
                Err(ProcessError::InvalidParameter(format!(
                    "activity z_threshold {} must be positive",
                    z_threshold
                )))
            }
            ProcessorKind::Activity { .. } => Ok(()),
        }
    }

    /// Instantiate the selected algorithm
    pub fn build(&self) -> Result<Box<dyn Processor>, ProcessError> {
        self.validate()?;
        Ok(match *self {
            ProcessorKind::Threshold { level } => Box::new(ThresholdProcessor::new(level)),
            ProcessorKind::Regions {
                level,
                min_area,
                max_regions,
            } => Box::new(RegionProcessor::new(level, min_area, max_regions)),
            ProcessorKind::Activity { tile, z_threshold } => {
                Box::new(ActivityProcessor::new(tile, z_threshold))
            }
        })
    }
}
