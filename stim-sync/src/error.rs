//! Pipeline errors
//!
//! Per-cycle failures (`SourceError`, `SinkError`) are counted and skipped
//! except for their `Device` variants, which fault the pipeline. Control
//! operations report through `ControlError`.

use crate::state::PipelineState;
use std::fmt;
use std::time::Duration;
use stim_frame::PoolError;
use stim_process::ProcessError;
use thiserror::Error;

/// Unrecoverable device failure reported by a vendor adapter
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct DeviceFault(pub String);

impl DeviceFault {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    /// No trigger edge within the wait; the waveform may be paused
    #[error("no trigger within {0:?}")]
    TriggerTimeout(Duration),

    /// Frame not ready after the trigger
    #[error("frame not ready (underrun)")]
    Underrun,

    #[error("camera device error: {0}")]
    Device(#[from] DeviceFault),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    /// Previous pattern still latched
    #[error("projector busy")]
    DeviceBusy,

    #[error("projector device error: {0}")]
    Device(#[from] DeviceFault),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("trigger period must be non-zero")]
    PeriodZero,

    #[error("trigger timeout must be non-zero")]
    TimeoutZero,

    #[error("soft deadline {deadline:?} must be positive and below the period {period:?}")]
    DeadlineNotBelowPeriod { deadline: Duration, period: Duration },

    #[error("history capacity must be at least 1")]
    HistoryCapacityZero,

    #[error("{device} is configured for {expected} mode but runs {actual}")]
    TriggerModeMismatch {
        device: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("configured {role} `{expected}` but got device `{actual}`")]
    DeviceMismatch {
        role: &'static str,
        expected: String,
        actual: String,
    },

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// Which collaborator raised a fatal fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOrigin {
    FrameSource,
    /// The processor panicked or the processing context went away
    ProcessingStage,
    ProjectionSink,
}

impl fmt::Display for FaultOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultOrigin::FrameSource => f.write_str("frame source"),
            FaultOrigin::ProcessingStage => f.write_str("processing stage"),
            FaultOrigin::ProjectionSink => f.write_str("projection sink"),
        }
    }
}

/// Record of the fault that put the pipeline into `Faulted`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineFault {
    pub origin: FaultOrigin,
    pub message: String,
    /// Cycle being handled when the fault happened, if any
    pub sequence: Option<u64>,
}

impl fmt::Display for PipelineFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sequence {
            Some(seq) => write!(f, "{} fault at cycle {}: {}", self.origin, seq, self.message),
            None => write!(f, "{} fault: {}", self.origin, self.message),
        }
    }
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("cannot {op} while {state:?}")]
    InvalidTransition {
        op: &'static str,
        state: PipelineState,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to open {origin}: {fault}")]
    Open { origin: FaultOrigin, fault: DeviceFault },

    #[error("pipeline faulted: {0}")]
    Faulted(PipelineFault),

    /// A previous run panicked and took the devices with it
    #[error("devices are no longer available")]
    DevicesUnavailable,

    #[error("failed to spawn pipeline thread: {0}")]
    Spawn(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_display() {
        let fault = PipelineFault {
            origin: FaultOrigin::FrameSource,
            message: "cable unplugged".into(),
            sequence: Some(42),
        };
        assert_eq!(fault.to_string(), "frame source fault at cycle 42: cable unplugged");
    }

    #[test]
    fn test_device_fault_converts() {
        let err: SourceError = DeviceFault::new("readout failed").into();
        assert!(matches!(err, SourceError::Device(_)));
        let err: SinkError = DeviceFault::new("usb reset").into();
        assert_eq!(err.to_string(), "projector device error: usb reset");
    }
}
