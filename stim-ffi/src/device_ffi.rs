//! Host-supplied device callbacks
//!
//! The controlling application drives the vendor SDKs and hands the pipeline
//! C function tables. These are wrapped into the camera, trigger line and
//! projector traits the synchronizer works with.
//!
//! Return code convention for the callbacks: negative values are device
//! faults, the meaning of `0` and `1` is given per callback.

use libc::{c_char, c_int, c_void};
use std::ffi::CStr;
use std::time::{Duration, Instant};
use stim_sync::{
    BitPlane, CameraDevice, DeviceFault, ProjectorDevice, ReadOutcome, TriggerEvent, TriggerLine,
    TriggerMode,
};

/// Trigger mode code for hardware triggering
pub const STIM_TRIGGER_HARDWARE: u32 = 0;
/// Trigger mode code for host-timed triggering
pub const STIM_TRIGGER_SOFTWARE: u32 = 1;

/// C camera function table
#[repr(C)]
pub struct CCameraVTable {
    pub user_data: *mut c_void,
    /// NUL-terminated identifier, copied at pipeline creation
    pub id: *const c_char,
    /// Arm for `mode` (`STIM_TRIGGER_*`); 0 on success
    pub arm: Option<unsafe extern "C" fn(*mut c_void, u32) -> c_int>,
    pub disarm: Option<unsafe extern "C" fn(*mut c_void)>,
    /// Start one exposure; 0 on success. Only needed in software mode.
    pub software_trigger: Option<unsafe extern "C" fn(*mut c_void) -> c_int>,
    /// Wait up to `timeout_us` for a trigger edge: 1 = edge (count written
    /// to the out pointer), 0 = timeout. Only needed in hardware mode.
    pub wait_edge: Option<unsafe extern "C" fn(*mut c_void, u64, *mut u64) -> c_int>,
    /// Copy the exposure into `buf`: 1 = ready, 0 = not ready in time
    pub read_frame: Option<unsafe extern "C" fn(*mut c_void, *mut u8, usize, u64) -> c_int>,
    /// Called once when the pipeline no longer needs `user_data`
    pub destroy: Option<unsafe extern "C" fn(*mut c_void)>,
}

/// C projector function table
#[repr(C)]
pub struct CProjectorVTable {
    pub user_data: *mut c_void,
    /// NUL-terminated identifier, copied at pipeline creation
    pub id: *const c_char,
    pub width: u32,
    pub height: u32,
    /// 0 on success
    pub connect: Option<unsafe extern "C" fn(*mut c_void) -> c_int>,
    pub disconnect: Option<unsafe extern "C" fn(*mut c_void)>,
    /// 1 = previous plane still latched, 0 = ready
    pub is_latched: Option<unsafe extern "C" fn(*mut c_void) -> c_int>,
    /// Submit a packed plane `(sequence, bits, len, width, height)`; 0 on success
    pub submit: Option<unsafe extern "C" fn(*mut c_void, u64, *const u8, usize, u32, u32) -> c_int>,
    pub destroy: Option<unsafe extern "C" fn(*mut c_void)>,
}

type ArmFn = unsafe extern "C" fn(*mut c_void, u32) -> c_int;
type WaitEdgeFn = unsafe extern "C" fn(*mut c_void, u64, *mut u64) -> c_int;
type ReadFrameFn = unsafe extern "C" fn(*mut c_void, *mut u8, usize, u64) -> c_int;
type ConnectFn = unsafe extern "C" fn(*mut c_void) -> c_int;
type IsLatchedFn = unsafe extern "C" fn(*mut c_void) -> c_int;
type SubmitFn = unsafe extern "C" fn(*mut c_void, u64, *const u8, usize, u32, u32) -> c_int;

fn micros(duration: Duration) -> u64 {
    duration.as_micros().min(u64::MAX as u128) as u64
}

unsafe fn copy_id(id: *const c_char, fallback: &str) -> String {
    if id.is_null() {
        fallback.to_string()
    } else {
        CStr::from_ptr(id).to_string_lossy().into_owned()
    }
}

/// Camera backed by a [`CCameraVTable`]
pub struct FfiCamera {
    user_data: *mut c_void,
    id: String,
    arm: ArmFn,
    disarm: Option<unsafe extern "C" fn(*mut c_void)>,
    software_trigger: Option<unsafe extern "C" fn(*mut c_void) -> c_int>,
    read_frame: ReadFrameFn,
    destroy: Option<unsafe extern "C" fn(*mut c_void)>,
}

// The host guarantees its callbacks may be called from the pipeline's
// trigger thread; each adapter is used by one thread at a time.
unsafe impl Send for FfiCamera {}

impl FfiCamera {
    /// Returns `None` when a required callback is missing
    ///
    /// # Safety
    /// `vtable.id` must be null or a valid C string; the callbacks must
    /// accept `vtable.user_data` until `destroy` is called.
    pub unsafe fn from_vtable(vtable: &CCameraVTable) -> Option<Self> {
        Some(Self {
            user_data: vtable.user_data,
            id: copy_id(vtable.id, "camera"),
            arm: vtable.arm?,
            disarm: vtable.disarm,
            software_trigger: vtable.software_trigger,
            read_frame: vtable.read_frame?,
            destroy: vtable.destroy,
        })
    }

    fn fault(&self, call: &str, code: c_int) -> DeviceFault {
        DeviceFault::new(format!("camera {}: {} returned {}", self.id, call, code))
    }
}

impl CameraDevice for FfiCamera {
    fn id(&self) -> &str {
        &self.id
    }

    fn arm(&mut self, mode: TriggerMode) -> Result<(), DeviceFault> {
        let code = match mode {
            TriggerMode::Hardware => STIM_TRIGGER_HARDWARE,
            TriggerMode::SoftwareTimed => STIM_TRIGGER_SOFTWARE,
        };
        match unsafe { (self.arm)(self.user_data, code) } {
            0 => Ok(()),
            rc => Err(self.fault("arm", rc)),
        }
    }

    fn disarm(&mut self) {
        if let Some(disarm) = self.disarm {
            unsafe { disarm(self.user_data) }
        }
    }

    fn software_trigger(&mut self) -> Result<(), DeviceFault> {
        let Some(trigger) = self.software_trigger else {
            return Err(DeviceFault::new(format!(
                "camera {} has no software trigger callback",
                self.id
            )));
        };
        match unsafe { trigger(self.user_data) } {
            0 => Ok(()),
            rc => Err(self.fault("software_trigger", rc)),
        }
    }

    fn read_frame(
        &mut self,
        into: &mut [u8],
        timeout: Duration,
    ) -> Result<ReadOutcome, DeviceFault> {
        let rc = unsafe {
            (self.read_frame)(self.user_data, into.as_mut_ptr(), into.len(), micros(timeout))
        };
        match rc {
            1 => Ok(ReadOutcome::Ready(Instant::now())),
            0 => Ok(ReadOutcome::NotReady),
            rc => Err(self.fault("read_frame", rc)),
        }
    }
}

impl Drop for FfiCamera {
    fn drop(&mut self) {
        if let Some(destroy) = self.destroy {
            unsafe { destroy(self.user_data) }
        }
    }
}

/// Trigger input served by the camera table's `wait_edge` callback.
/// Does not own the user data; the paired [`FfiCamera`] does.
pub struct FfiTriggerLine {
    user_data: *mut c_void,
    id: String,
    wait_edge: WaitEdgeFn,
}

unsafe impl Send for FfiTriggerLine {}

impl FfiTriggerLine {
    /// # Safety
    /// Same contract as [`FfiCamera::from_vtable`]
    pub unsafe fn from_vtable(vtable: &CCameraVTable) -> Option<Self> {
        Some(Self {
            user_data: vtable.user_data,
            id: copy_id(vtable.id, "camera"),
            wait_edge: vtable.wait_edge?,
        })
    }
}

impl TriggerLine for FfiTriggerLine {
    fn wait_edge(&mut self, timeout: Duration) -> Result<Option<TriggerEvent>, DeviceFault> {
        let mut edge_count = 0u64;
        let rc = unsafe { (self.wait_edge)(self.user_data, micros(timeout), &mut edge_count) };
        match rc {
            1 => Ok(Some(TriggerEvent {
                at: Instant::now(),
                edge_count,
            })),
            0 => Ok(None),
            rc => Err(DeviceFault::new(format!(
                "trigger line of {}: wait_edge returned {}",
                self.id, rc
            ))),
        }
    }
}

/// Projector backed by a [`CProjectorVTable`]
pub struct FfiProjector {
    user_data: *mut c_void,
    id: String,
    resolution: (u32, u32),
    connect: ConnectFn,
    disconnect: Option<unsafe extern "C" fn(*mut c_void)>,
    is_latched: IsLatchedFn,
    submit: SubmitFn,
    destroy: Option<unsafe extern "C" fn(*mut c_void)>,
}

unsafe impl Send for FfiProjector {}

impl FfiProjector {
    /// Returns `None` when a required callback is missing or the mirror
    /// array has no pixels
    ///
    /// # Safety
    /// Same contract as [`FfiCamera::from_vtable`]
    pub unsafe fn from_vtable(vtable: &CProjectorVTable) -> Option<Self> {
        if vtable.width == 0 || vtable.height == 0 {
            return None;
        }
        Some(Self {
            user_data: vtable.user_data,
            id: copy_id(vtable.id, "projector"),
            resolution: (vtable.width, vtable.height),
            connect: vtable.connect?,
            disconnect: vtable.disconnect,
            is_latched: vtable.is_latched?,
            submit: vtable.submit?,
            destroy: vtable.destroy,
        })
    }

    fn fault(&self, call: &str, code: c_int) -> DeviceFault {
        DeviceFault::new(format!("projector {}: {} returned {}", self.id, call, code))
    }
}

impl ProjectorDevice for FfiProjector {
    fn id(&self) -> &str {
        &self.id
    }

    fn resolution(&self) -> (u32, u32) {
        self.resolution
    }

    fn connect(&mut self) -> Result<(), DeviceFault> {
        match unsafe { (self.connect)(self.user_data) } {
            0 => Ok(()),
            rc => Err(self.fault("connect", rc)),
        }
    }

    fn disconnect(&mut self) {
        if let Some(disconnect) = self.disconnect {
            unsafe { disconnect(self.user_data) }
        }
    }

    fn is_latched(&self) -> Result<bool, DeviceFault> {
        match unsafe { (self.is_latched)(self.user_data) } {
            0 => Ok(false),
            1 => Ok(true),
            rc => Err(self.fault("is_latched", rc)),
        }
    }

    fn submit(&mut self, plane: &BitPlane<'_>) -> Result<Instant, DeviceFault> {
        let rc = unsafe {
            (self.submit)(
                self.user_data,
                plane.sequence,
                plane.bits.as_ptr(),
                plane.bits.len(),
                plane.width,
                plane.height,
            )
        };
        match rc {
            0 => Ok(Instant::now()),
            rc => Err(self.fault("submit", rc)),
        }
    }
}

impl Drop for FfiProjector {
    fn drop(&mut self) {
        if let Some(destroy) = self.destroy {
            unsafe { destroy(self.user_data) }
        }
    }
}
