//! Frame pool errors

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// Every buffer is currently leased; the cycle must be dropped
    #[error("pool exhausted: all {capacity} buffers are in use")]
    Exhausted { capacity: usize },

    /// A buffer was handed back to a pool that does not own it, or its slot
    /// was not marked in use
    #[error("invalid release: {0}")]
    InvalidRelease(&'static str),

    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),
}
