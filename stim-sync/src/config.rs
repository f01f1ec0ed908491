//! Pipeline configuration
//!
//! Consumed once at construction and immutable for the run.

use crate::error::ConfigError;
use std::fmt;
use std::time::Duration;
use stim_frame::PoolConfig;
use stim_process::{ProcessorKind, ProjectorMapping, StageConfig};

pub const DEFAULT_FPS: f64 = 30.0;
/// Capture, dispatch and bookkeeping time reserved out of every period
pub const FIXED_OVERHEAD: Duration = Duration::from_millis(5);
pub const DEFAULT_MAX_LATENESS: Duration = Duration::from_millis(8);
pub const DEFAULT_TRIGGER_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_millis(200);
pub const DEFAULT_HISTORY_CAPACITY: usize = 256;

fn default_period() -> Duration {
    Duration::from_secs_f64(1.0 / DEFAULT_FPS)
}

/// `None` when the frame rate has no representable, non-zero period
fn period_for(fps: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(1.0 / fps)
        .ok()
        .filter(|period| !period.is_zero())
}

/// How exposures are initiated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriggerMode {
    /// External waveform generator drives the camera trigger line
    #[default]
    Hardware,
    /// The host paces exposures from a monotonic clock
    SoftwareTimed,
}

impl TriggerMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerMode::Hardware => "hardware",
            TriggerMode::SoftwareTimed => "software-timed",
        }
    }
}

impl fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct TriggerConfig {
    pub mode: TriggerMode,
    pub period: Duration,
    /// Longest single wait for a trigger edge before counting a timeout
    pub timeout: Duration,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            mode: TriggerMode::Hardware,
            period: default_period(),
            timeout: DEFAULT_TRIGGER_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// Processing budget; overruns are flagged past this
    pub soft_deadline: Duration,
    /// Largest tolerated dispatch delay past a pattern's target time
    pub max_lateness: Duration,
    /// How long a stop keeps completing queued cycles
    pub drain_grace: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            soft_deadline: default_period().saturating_sub(FIXED_OVERHEAD),
            max_lateness: DEFAULT_MAX_LATENESS,
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }
}

/// Identifiers the supplied devices must report
#[derive(Debug, Clone, Default)]
pub struct DeviceConfig {
    /// `None` accepts any camera
    pub camera_id: Option<String>,
    /// `None` accepts any projector
    pub projector_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub trigger: TriggerConfig,
    pub pool: PoolConfig,
    pub timing: TimingConfig,
    pub devices: DeviceConfig,
    pub processing: ProcessorKind,
    /// Compute threads for processing (0 = one per core)
    pub compute_threads: usize,
    pub mapping: Option<ProjectorMapping>,
    /// Cycle records kept for inspection
    pub history_capacity: usize,
    /// Pin the trigger thread to this core
    pub trigger_core: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            trigger: TriggerConfig::default(),
            pool: PoolConfig::default(),
            timing: TimingConfig::default(),
            devices: DeviceConfig::default(),
            processing: ProcessorKind::default(),
            compute_threads: 0,
            mapping: None,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            trigger_core: None,
        }
    }
}

impl PipelineConfig {
    /// Derive the period and default soft deadline from a frame rate
    pub fn with_fps(mut self, fps: f64) -> Self {
        match period_for(fps) {
            Some(period) => {
                self.trigger.period = period;
                self.timing.soft_deadline = period.saturating_sub(FIXED_OVERHEAD);
            }
            // Leaves a configuration that validate() rejects
            None => self.trigger.period = Duration::ZERO,
        }
        self
    }

    pub fn period(&self) -> Duration {
        self.trigger.period
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.trigger.period.is_zero() {
            return Err(ConfigError::PeriodZero);
        }
        if self.trigger.timeout.is_zero() {
            return Err(ConfigError::TimeoutZero);
        }
        let deadline = self.timing.soft_deadline;
        if deadline.is_zero() || deadline >= self.trigger.period {
            return Err(ConfigError::DeadlineNotBelowPeriod {
                deadline,
                period: self.trigger.period,
            });
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::HistoryCapacityZero);
        }
        self.pool.validate()?;
        self.processing.validate()?;
        Ok(())
    }

    /// Settings handed to the processing stage
    pub fn stage_config(&self) -> StageConfig {
        StageConfig {
            period: self.trigger.period,
            soft_deadline: self.timing.soft_deadline,
            threads: self.compute_threads,
            mapping: self.mapping,
        }
    }
}
