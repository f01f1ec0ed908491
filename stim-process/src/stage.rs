//! Processing stage
//!
//! Owns the selected processor and a dedicated rayon pool so row-parallel
//! kernels never compete with the global pool or the capture thread.

use crate::error::ProcessError;
use crate::mapping::ProjectorMapping;
use crate::processor::{Processor, ProcessorKind};
use crate::types::{Pattern, Processed, ProcessedResult, ProcessingOverrun};
use std::time::{Duration, Instant};
use stim_frame::{Frame, PixelFormat};

#[derive(Debug, Clone)]
pub struct StageConfig {
    /// Trigger period; a pattern targets `trigger_at + period`
    pub period: Duration,
    /// Processing budget, strictly below `period`
    pub soft_deadline: Duration,
    /// Compute threads (0 = let rayon decide)
    pub threads: usize,
    /// Camera -> projector mapping; `None` projects in camera pixels
    pub mapping: Option<ProjectorMapping>,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_micros(33_333),
            soft_deadline: Duration::from_micros(28_333),
            threads: 0,
            mapping: None,
        }
    }
}

impl StageConfig {
    pub fn validate(&self) -> Result<(), ProcessError> {
        if self.period.is_zero() {
            return Err(ProcessError::InvalidParameter("period must be non-zero".into()));
        }
        if self.soft_deadline.is_zero() || self.soft_deadline >= self.period {
            return Err(ProcessError::InvalidParameter(format!(
                "soft deadline {:?} must be positive and below the period {:?}",
                self.soft_deadline, self.period
            )));
        }
        Ok(())
    }
}

pub struct ProcessingStage {
    processor: Box<dyn Processor>,
    pool: rayon::ThreadPool,
    config: StageConfig,
}

impl ProcessingStage {
    pub fn new(processor: Box<dyn Processor>, config: StageConfig) -> Result<Self, ProcessError> {
        config.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.threads)
            .thread_name(|i| format!("stim-process-{}", i))
            .build()?;

        log::info!(
            "Processing stage: {} on {} threads, soft deadline {:?}",
            processor.name(),
            pool.current_num_threads(),
            config.soft_deadline
        );

        Ok(Self {
            processor,
            pool,
            config,
        })
    }

    /// Build the processor named by `kind` and wrap it in a stage
    pub fn from_kind(kind: ProcessorKind, config: StageConfig) -> Result<Self, ProcessError> {
        Self::new(kind.build()?, config)
    }

    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    pub fn processor_name(&self) -> &'static str {
        self.processor.name()
    }

    /// Fail early for camera formats the processor cannot read
    pub fn check_format(&self, format: PixelFormat) -> Result<(), ProcessError> {
        if self.processor.supports(format) {
            Ok(())
        } else {
            Err(ProcessError::UnsupportedFormat {
                processor: self.processor.name(),
                format,
            })
        }
    }

    /// Run the processor on `frame`.
    ///
    /// Always returns a result; exceeding the soft deadline is reported in
    /// `overrun` rather than discarding the work.
    pub fn process(&mut self, frame: Frame) -> ProcessedResult {
        let started = Instant::now();

        let processor = &mut self.processor;
        let mapping = self.config.mapping;
        let (processed, width, height) = self.pool.install(|| {
            let processed = processor.process(&frame);
            match mapping {
                Some(m) => {
                    let processed = Processed {
                        payload: m.apply(processed.payload),
                        image: processed.image,
                    };
                    (processed, m.width(), m.height())
                }
                None => (processed, frame.width(), frame.height()),
            }
        });

        let processing_time = started.elapsed();
        let overrun = (processing_time > self.config.soft_deadline).then(|| ProcessingOverrun {
            elapsed: processing_time,
            deadline: self.config.soft_deadline,
        });
        if let Some(o) = &overrun {
            log::debug!(
                "Frame {} overran its processing budget by {:?}",
                frame.sequence(),
                o.excess()
            );
        }

        let pattern = Pattern {
            sequence: frame.sequence(),
            target_display: frame.trigger_at() + self.config.period,
            width,
            height,
            payload: processed.payload,
        };

        ProcessedResult {
            source: frame,
            image: processed.image,
            pattern,
            processing_time,
            overrun,
        }
    }
}
