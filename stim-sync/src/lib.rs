//! Stimulation pipeline orchestration
//!
//! Phase-locks camera capture, frame processing and projector output to a
//! trigger waveform and keeps the loop inside its per-cycle budget.
//!
//! Key features:
//! - Trigger/capture and processing/projection on separate threads
//! - Fixed buffer pool as backpressure: slow cycles are dropped, never queued
//! - Strictly increasing display order
//! - Lock-free metrics with a bounded cycle history
//! - Hardware-free simulated devices for timing tests

pub mod config;
pub mod error;
pub mod metrics;
pub mod sim;
pub mod sink;
pub mod source;
pub mod state;
pub mod synchronizer;

pub use config::*;
pub use error::*;
pub use metrics::*;
pub use sink::*;
pub use source::*;
pub use state::*;
pub use synchronizer::*;
