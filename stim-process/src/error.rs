//! Processing errors

use stim_frame::PixelFormat;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("processor `{processor}` does not support {format:?} frames")]
    UnsupportedFormat {
        processor: &'static str,
        format: PixelFormat,
    },

    #[error("invalid processing parameter: {0}")]
    InvalidParameter(String),

    /// The homography cannot be inverted
    #[error("projector mapping is degenerate (determinant {0})")]
    DegenerateMapping(f32),

    #[error("failed to build compute thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
