//! Stimulation pipeline processing stage
//!
//! Turns captured frames into projector patterns on a dedicated compute pool.
//!
//! Key features:
//! - Pluggable, deterministic processors selected at configuration time
//! - Row-parallel kernels with rayon
//! - Camera to projector homography via glam
//! - Soft-deadline accounting with best-effort results on overrun

pub mod activity;
pub mod error;
pub mod mapping;
pub mod processor;
pub mod regions;
pub mod stage;
pub mod threshold;
pub mod types;

pub use activity::*;
pub use error::*;
pub use mapping::*;
pub use processor::*;
pub use regions::*;
pub use stage::*;
pub use threshold::*;
pub use types::*;
