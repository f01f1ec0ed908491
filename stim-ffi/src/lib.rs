//! Stimulation pipeline FFI - C Foreign Function Interface
//!
//! Control surface for the application driving the microscope (GUI/CLI).
//! Devices are supplied as C function tables; see [`device_ffi`].

use libc::{c_char, c_int};
use std::ptr;
use std::time::Duration;

use stim_frame::{PixelFormat, PoolConfig};
use stim_process::{ProcessorKind, ProjectorMapping};
use stim_sync::{
    ControlError, FaultOrigin, FrameSource, HardwareTriggeredSource, PipelineConfig,
    PipelineState, ProjectorSink, SoftwareTimedSource, TriggerMode, TriggerSynchronizer,
};

pub mod device_ffi;
pub use device_ffi::*;

/// Opaque handle to a TriggerSynchronizer (C-compatible)
pub struct StimPipeline {
    _private: [u8; 0],
}

// ============================================================================
// STATUS CODES
// ============================================================================

pub const STIM_OK: c_int = 0;
pub const STIM_ERR_NULL: c_int = -1;
/// Operation not valid in the current pipeline state
pub const STIM_ERR_STATE: c_int = -2;
/// A device could not be opened
pub const STIM_ERR_DEVICE: c_int = -3;
/// The pipeline faulted; see `stim_pipeline_last_fault`
pub const STIM_ERR_FAULTED: c_int = -4;
pub const STIM_ERR_SPAWN: c_int = -5;
pub const STIM_ERR_CONFIG: c_int = -6;

pub const STIM_STATE_IDLE: u32 = PipelineState::Idle as u32;
pub const STIM_STATE_RUNNING: u32 = PipelineState::Running as u32;
pub const STIM_STATE_DRAINING: u32 = PipelineState::Draining as u32;
pub const STIM_STATE_FAULTED: u32 = PipelineState::Faulted as u32;

pub const STIM_PROCESSOR_THRESHOLD: u32 = 0;
pub const STIM_PROCESSOR_REGIONS: u32 = 1;
pub const STIM_PROCESSOR_ACTIVITY: u32 = 2;

pub const STIM_FAULT_FRAME_SOURCE: u32 = 0;
pub const STIM_FAULT_PROJECTION_SINK: u32 = 1;
pub const STIM_FAULT_PROCESSING_STAGE: u32 = 2;

const FAULT_MESSAGE_LEN: usize = 256;

/// C-compatible pipeline configuration. Times are in microseconds.
#[repr(C)]
pub struct CPipelineConfig {
    /// `STIM_TRIGGER_*`
    pub trigger_mode: u32,
    pub period_us: u64,
    pub trigger_timeout_us: u64,
    pub soft_deadline_us: u64,
    pub max_lateness_us: u64,
    pub drain_grace_us: u64,
    pub buffer_count: u32,
    pub width: u32,
    pub height: u32,
    /// Pixel format code (1 = Mono8, 2 = Mono12, 3 = Mono16, 4 = BGRA8)
    pub pixel_format: u32,
    /// `STIM_PROCESSOR_*`
    pub processor: u32,
    /// Intensity level on a 16-bit scale (threshold, regions)
    pub level: u16,
    pub min_area: u32,
    pub max_regions: u32,
    pub tile: u32,
    pub z_threshold: f32,
    /// 0 = one per core
    pub compute_threads: u32,
    pub history_capacity: u32,
    /// Core to pin the trigger thread to, or -1
    pub trigger_core: i32,
    /// Apply `homography` to map camera pixels onto the projector
    pub has_mapping: bool,
    /// Camera to projector homography, row-major
    pub homography: [f32; 9],
}

/// C-compatible metrics snapshot
#[repr(C)]
#[derive(Debug, Default)]
pub struct CMetricsSnapshot {
    pub captured: u64,
    pub frames_read: u64,
    pub processed: u64,
    pub displayed: u64,
    pub dropped_capacity: u64,
    pub dropped_acquisition: u64,
    pub dropped_late: u64,
    pub dropped_busy: u64,
    pub deadline_misses: u64,
    pub processing_overruns: u64,
    pub trigger_timeouts: u64,
    pub abandoned: u64,
    pub last_cycle_latency_ms: f64,
    pub buffers_in_use: u32,
}

/// C-compatible fault record
#[repr(C)]
pub struct CFault {
    /// `STIM_FAULT_*`
    pub origin: u32,
    pub has_sequence: bool,
    pub sequence: u64,
    /// NUL-terminated, truncated to fit
    pub message: [c_char; FAULT_MESSAGE_LEN],
}

fn us(value: u64) -> Duration {
    Duration::from_micros(value)
}

fn micros(duration: Duration) -> u64 {
    duration.as_micros().min(u64::MAX as u128) as u64
}

fn processor_from_c(config: &CPipelineConfig) -> Result<ProcessorKind, String> {
    match config.processor {
        STIM_PROCESSOR_THRESHOLD => Ok(ProcessorKind::Threshold {
            level: config.level,
        }),
        STIM_PROCESSOR_REGIONS => Ok(ProcessorKind::Regions {
            level: config.level,
            min_area: config.min_area,
            max_regions: config.max_regions as usize,
        }),
        STIM_PROCESSOR_ACTIVITY => Ok(ProcessorKind::Activity {
            tile: config.tile,
            z_threshold: config.z_threshold,
        }),
        other => Err(format!("unknown processor {}", other)),
    }
}

/// Translate the C configuration. The mapping targets the projector's
/// mirror array.
fn config_from_c(config: &CPipelineConfig, projector: (u32, u32)) -> Result<PipelineConfig, String> {
    let mode = match config.trigger_mode {
        STIM_TRIGGER_HARDWARE => TriggerMode::Hardware,
        STIM_TRIGGER_SOFTWARE => TriggerMode::SoftwareTimed,
        other => return Err(format!("unknown trigger mode {}", other)),
    };
    let format = PixelFormat::from_raw(config.pixel_format)
        .ok_or_else(|| format!("unknown pixel format {}", config.pixel_format))?;
    let mapping = if config.has_mapping {
        let (width, height) = projector;
        Some(
            ProjectorMapping::from_row_major(config.homography, width, height)
                .map_err(|e| e.to_string())?,
        )
    } else {
        None
    };

    let mut out = PipelineConfig::default();
    out.trigger.mode = mode;
    out.trigger.period = us(config.period_us);
    out.trigger.timeout = us(config.trigger_timeout_us);
    out.timing.soft_deadline = us(config.soft_deadline_us);
    out.timing.max_lateness = us(config.max_lateness_us);
    out.timing.drain_grace = us(config.drain_grace_us);
    out.pool = PoolConfig::new(config.width, config.height, format)
        .with_buffer_count(config.buffer_count as usize);
    out.processing = processor_from_c(config)?;
    out.compute_threads = config.compute_threads as usize;
    out.mapping = mapping;
    out.history_capacity = config.history_capacity as usize;
    out.trigger_core = usize::try_from(config.trigger_core).ok();
    Ok(out)
}

fn control_status(op: &str, result: Result<(), ControlError>) -> c_int {
    match result {
        Ok(()) => STIM_OK,
        Err(e) => {
            log::error!("stim_pipeline_{} failed: {}", op, e);
            match e {
                ControlError::InvalidTransition { .. } => STIM_ERR_STATE,
                ControlError::Open { .. } | ControlError::DevicesUnavailable => STIM_ERR_DEVICE,
                ControlError::Faulted(_) => STIM_ERR_FAULTED,
                ControlError::Spawn(_) => STIM_ERR_SPAWN,
                ControlError::Config(_) => STIM_ERR_CONFIG,
            }
        }
    }
}

// ============================================================================
// CONFIGURATION API
// ============================================================================

/// Fill `out` with the default configuration (hardware trigger, 30 fps,
/// 1280x1024 Mono8, threshold processor)
///
/// # Safety
/// Caller must ensure out is a valid pointer.
#[no_mangle]
pub unsafe extern "C" fn stim_config_default(out: *mut CPipelineConfig) -> c_int {
    if out.is_null() {
        return STIM_ERR_NULL;
    }

    let config = PipelineConfig::default();
    let (level, min_area, max_regions, tile, z_threshold) = (0x8000, 4, 8, 16, 3.0);
    out.write(CPipelineConfig {
        trigger_mode: STIM_TRIGGER_HARDWARE,
        period_us: micros(config.trigger.period),
        trigger_timeout_us: micros(config.trigger.timeout),
        soft_deadline_us: micros(config.timing.soft_deadline),
        max_lateness_us: micros(config.timing.max_lateness),
        drain_grace_us: micros(config.timing.drain_grace),
        buffer_count: config.pool.buffer_count as u32,
        width: config.pool.width,
        height: config.pool.height,
        pixel_format: config.pool.format as u32,
        processor: STIM_PROCESSOR_THRESHOLD,
        level,
        min_area,
        max_regions,
        tile,
        z_threshold,
        compute_threads: 0,
        history_capacity: config.history_capacity as u32,
        trigger_core: -1,
        has_mapping: false,
        homography: [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
    });
    STIM_OK
}

// ============================================================================
// PIPELINE API
// ============================================================================

/// Create a pipeline. Returns null on invalid configuration or a missing
/// required callback.
///
/// Once the callback tables are accepted the pipeline owns their user data
/// and calls each `destroy` exactly once, also when creation fails after
/// that point.
///
/// # Safety
/// Caller must ensure all pointers are valid and that the callbacks may be
/// called from pipeline threads until `destroy`.
#[no_mangle]
pub unsafe extern "C" fn stim_pipeline_create(
    config: *const CPipelineConfig,
    camera: *const CCameraVTable,
    projector: *const CProjectorVTable,
) -> *mut StimPipeline {
    if config.is_null() || camera.is_null() || projector.is_null() {
        return ptr::null_mut();
    }
    let (config, camera, projector) = (&*config, &*camera, &*projector);

    let hardware = config.trigger_mode == STIM_TRIGGER_HARDWARE;
    if hardware && camera.wait_edge.is_none() {
        log::error!("stim_pipeline_create: hardware trigger needs a wait_edge callback");
        return ptr::null_mut();
    }
    if !hardware && camera.software_trigger.is_none() {
        log::error!("stim_pipeline_create: software trigger needs a software_trigger callback");
        return ptr::null_mut();
    }

    let pipeline_config = match config_from_c(config, (projector.width, projector.height)) {
        Ok(c) => c,
        Err(e) => {
            log::error!("stim_pipeline_create: {}", e);
            return ptr::null_mut();
        }
    };

    let (Some(ffi_camera), Some(ffi_projector)) =
        (FfiCamera::from_vtable(camera), FfiProjector::from_vtable(projector))
    else {
        log::error!("stim_pipeline_create: incomplete device callback table");
        return ptr::null_mut();
    };

    let source: Box<dyn FrameSource> = if hardware {
        let Some(line) = FfiTriggerLine::from_vtable(camera) else {
            return ptr::null_mut();
        };
        Box::new(HardwareTriggeredSource::new(line, ffi_camera))
    } else {
        Box::new(SoftwareTimedSource::new(ffi_camera, pipeline_config.trigger.period))
    };
    let sink = Box::new(ProjectorSink::new(ffi_projector));

    match TriggerSynchronizer::from_config(pipeline_config, source, sink) {
        Ok(pipeline) => Box::into_raw(Box::new(pipeline)) as *mut StimPipeline,
        Err(e) => {
            log::error!("stim_pipeline_create: {}", e);
            ptr::null_mut()
        }
    }
}

/// Destroy a pipeline, stopping it first if it is running
///
/// # Safety
/// Caller must ensure ptr is valid and not already freed.
#[no_mangle]
pub unsafe extern "C" fn stim_pipeline_destroy(ptr: *mut StimPipeline) {
    if !ptr.is_null() {
        let _ = Box::from_raw(ptr as *mut TriggerSynchronizer);
    }
}

/// Open the devices and start acquisition
///
/// # Safety
/// Caller must ensure ptr is valid.
#[no_mangle]
pub unsafe extern "C" fn stim_pipeline_start(ptr: *const StimPipeline) -> c_int {
    if ptr.is_null() {
        return STIM_ERR_NULL;
    }

    let pipeline = &*(ptr as *const TriggerSynchronizer);
    control_status("start", pipeline.start())
}

/// Drain and stop; blocks until both pipeline threads have exited
///
/// # Safety
/// Caller must ensure ptr is valid.
#[no_mangle]
pub unsafe extern "C" fn stim_pipeline_stop(ptr: *const StimPipeline) -> c_int {
    if ptr.is_null() {
        return STIM_ERR_NULL;
    }

    let pipeline = &*(ptr as *const TriggerSynchronizer);
    control_status("stop", pipeline.stop())
}

/// Clear a fault and return to idle
///
/// # Safety
/// Caller must ensure ptr is valid.
#[no_mangle]
pub unsafe extern "C" fn stim_pipeline_fault_reset(ptr: *const StimPipeline) -> c_int {
    if ptr.is_null() {
        return STIM_ERR_NULL;
    }

    let pipeline = &*(ptr as *const TriggerSynchronizer);
    control_status("fault_reset", pipeline.fault_reset())
}

/// Get the pipeline state (`STIM_STATE_*`)
///
/// # Safety
/// Caller must ensure ptr is valid.
#[no_mangle]
pub unsafe extern "C" fn stim_pipeline_state(ptr: *const StimPipeline) -> u32 {
    if ptr.is_null() {
        return STIM_STATE_IDLE;
    }

    let pipeline = &*(ptr as *const TriggerSynchronizer);
    pipeline.state() as u32
}

/// Copy the current metrics into `out`
///
/// # Safety
/// Caller must ensure ptr and out are valid.
#[no_mangle]
pub unsafe extern "C" fn stim_pipeline_snapshot(
    ptr: *const StimPipeline,
    out: *mut CMetricsSnapshot,
) -> c_int {
    if ptr.is_null() || out.is_null() {
        return STIM_ERR_NULL;
    }

    let pipeline = &*(ptr as *const TriggerSynchronizer);
    let m = pipeline.metrics();
    out.write(CMetricsSnapshot {
        captured: m.captured,
        frames_read: m.frames_read,
        processed: m.processed,
        displayed: m.displayed,
        dropped_capacity: m.dropped_capacity,
        dropped_acquisition: m.dropped_acquisition,
        dropped_late: m.dropped_late,
        dropped_busy: m.dropped_busy,
        deadline_misses: m.deadline_misses,
        processing_overruns: m.processing_overruns,
        trigger_timeouts: m.trigger_timeouts,
        abandoned: m.abandoned,
        last_cycle_latency_ms: m.last_cycle_latency_ms,
        buffers_in_use: pipeline.pool_stats().in_use as u32,
    });
    STIM_OK
}

/// Copy the fault that stopped the pipeline into `out`.
/// Returns 1 if there is one, 0 if not.
///
/// # Safety
/// Caller must ensure ptr and out are valid.
#[no_mangle]
pub unsafe extern "C" fn stim_pipeline_last_fault(
    ptr: *const StimPipeline,
    out: *mut CFault,
) -> c_int {
    if ptr.is_null() || out.is_null() {
        return STIM_ERR_NULL;
    }

    let pipeline = &*(ptr as *const TriggerSynchronizer);
    let Some(fault) = pipeline.fault() else {
        return 0;
    };

    let mut message = [0 as c_char; FAULT_MESSAGE_LEN];
    let bytes = fault.message.as_bytes();
    let len = bytes.len().min(FAULT_MESSAGE_LEN - 1);
    for (dst, &src) in message.iter_mut().zip(&bytes[..len]) {
        *dst = src as c_char;
    }

    out.write(CFault {
        origin: match fault.origin {
            FaultOrigin::FrameSource => STIM_FAULT_FRAME_SOURCE,
            FaultOrigin::ProjectionSink => STIM_FAULT_PROJECTION_SINK,
            FaultOrigin::ProcessingStage => STIM_FAULT_PROCESSING_STAGE,
        },
        has_sequence: fault.sequence.is_some(),
        sequence: fault.sequence.unwrap_or(0),
        message,
    });
    1
}

// ============================================================================
// UTILITY FUNCTIONS
// ============================================================================

/// Get library version string
///
/// # Safety
/// Returns a static string, safe to call.
#[no_mangle]
pub extern "C" fn stim_version() -> *const c_char {
    "0.1.0\0".as_ptr() as *const c_char
}
