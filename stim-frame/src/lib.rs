//! Stimulation pipeline frame layer
//!
//! Frame data model and the fixed-size buffer pool shared by the capture and
//! processing contexts.
//!
//! Key properties:
//! - All buffers allocated once at startup, never grown
//! - Lock-free acquire/release through a bounded free list
//! - Typed lifecycle: writable `FrameBuffer` -> sealed, immutable `Frame`

pub mod error;
pub mod frame_pool;
pub mod types;

pub use error::*;
pub use frame_pool::*;
pub use types::*;
