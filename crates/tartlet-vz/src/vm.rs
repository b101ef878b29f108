//! The running virtual machine.

use std::path::Path;
use std::time::Duration;

use objc2::runtime::AnyObject;
use tokio::sync::oneshot;

use crate::error::{VzError, VzResult};
use crate::ffi::{DispatchQueue, ErrorCompletion, nsurl_file_path, release, require_class};
use crate::{msg_send, msg_send_bool, msg_send_i64};

/// Execution state of a virtual machine (`VZVirtualMachineState`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum MachineState {
    /// Not started or already exited.
    Stopped = 0,
    /// Executing.
    Running = 1,
    /// Paused.
    Paused = 2,
    /// Irrecoverable error.
    Error = 3,
    /// Start in progress.
    Starting = 4,
    /// Pause in progress.
    Pausing = 5,
    /// Resume in progress.
    Resuming = 6,
    /// Stop in progress.
    Stopping = 7,
    /// Machine state save in progress.
    Saving = 8,
    /// Machine state restore in progress.
    Restoring = 9,
}

impl From<i64> for MachineState {
    fn from(value: i64) -> Self {
        match value {
            0 => Self::Stopped,
            1 => Self::Running,
            2 => Self::Paused,
            4 => Self::Starting,
            5 => Self::Pausing,
            6 => Self::Resuming,
            7 => Self::Stopping,
            8 => Self::Saving,
            9 => Self::Restoring,
            _ => Self::Error,
        }
    }
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Error => "error",
            Self::Starting => "starting",
            Self::Pausing => "pausing",
            Self::Resuming => "resuming",
            Self::Stopping => "stopping",
            Self::Saving => "saving",
            Self::Restoring => "restoring",
        };
        write!(f, "{name}")
    }
}

/// Options for [`VirtualMachine::start`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StartOptions {
    /// Boot a macOS guest into recovery.
    pub recovery: bool,
}

/// A virtual machine created from a
/// [`VmConfiguration`](crate::config::VmConfiguration).
///
/// All operations run on the VM's serial dispatch queue; the async methods
/// resolve when the framework reports completion.
pub struct VirtualMachine {
    inner: *mut AnyObject,
    queue: DispatchQueue,
}

// The VZ handle is only touched through its serial dispatch queue.
unsafe impl Send for VirtualMachine {}
unsafe impl Sync for VirtualMachine {}

impl VirtualMachine {
    pub(crate) fn from_raw(inner: *mut AnyObject, queue: DispatchQueue) -> Self {
        Self { inner, queue }
    }

    /// The current machine state.
    pub fn state(&self) -> MachineState {
        let inner = self.inner;
        let state = self
            .queue
            .sync(|| unsafe { msg_send_i64!(inner, state) });
        MachineState::from(state)
    }

    /// Whether the framework would accept a `pause` right now.
    pub fn can_pause(&self) -> bool {
        let inner = self.inner;
        self.queue
            .sync(|| unsafe { msg_send_bool!(inner, canPause).as_bool() })
    }

    /// Whether a guest stop request can be delivered.
    pub fn can_request_stop(&self) -> bool {
        let inner = self.inner;
        self.queue
            .sync(|| unsafe { msg_send_bool!(inner, canRequestStop).as_bool() })
    }

    /// Starts the VM.
    pub async fn start(&self, options: StartOptions) -> VzResult<()> {
        let (completion, rx) = ErrorCompletion::new();
        let inner = self.inner;
        let block = completion.as_block_ptr();

        if options.recovery {
            let start_cls = require_class("VZMacOSVirtualMachineStartOptions")?;
            self.queue.sync(|| unsafe {
                let opts = msg_send!(start_cls, new);
                crate::msg_send_void_bool!(opts, setStartUpFromMacOSRecovery: true);
                let sel = objc2::sel!(startWithOptions:completionHandler:);
                let func: unsafe extern "C" fn(
                    *const AnyObject,
                    objc2::runtime::Sel,
                    *mut AnyObject,
                    *const std::ffi::c_void,
                ) = std::mem::transmute(crate::ffi::objc_msgSend as *const std::ffi::c_void);
                func(inner as *const AnyObject, sel, opts, block);
            });
        } else {
            self.queue.sync(|| unsafe {
                let sel = objc2::sel!(startWithCompletionHandler:);
                let func: unsafe extern "C" fn(
                    *const AnyObject,
                    objc2::runtime::Sel,
                    *const std::ffi::c_void,
                ) = std::mem::transmute(crate::ffi::objc_msgSend as *const std::ffi::c_void);
                func(inner as *const AnyObject, sel, block);
            });
        }

        wait(rx, "start").await
    }

    /// Force-stops the VM. The guest gets no chance to shut down cleanly;
    /// use [`request_stop`](Self::request_stop) for a graceful stop.
    pub async fn stop(&self) -> VzResult<()> {
        let (completion, rx) = ErrorCompletion::new();
        let inner = self.inner;
        let block = completion.as_block_ptr();
        self.queue.sync(|| unsafe {
            let sel = objc2::sel!(stopWithCompletionHandler:);
            let func: unsafe extern "C" fn(
                *const AnyObject,
                objc2::runtime::Sel,
                *const std::ffi::c_void,
            ) = std::mem::transmute(crate::ffi::objc_msgSend as *const std::ffi::c_void);
            func(inner as *const AnyObject, sel, block);
        });
        wait(rx, "stop").await
    }

    /// Asks the guest OS to shut down. The guest may ignore the request;
    /// the VM transitions to `Stopped` only when it complies.
    pub fn request_stop(&self) -> VzResult<()> {
        let inner = self.inner;
        self.queue.sync(|| unsafe {
            let mut error: *mut AnyObject = std::ptr::null_mut();
            let ok = msg_send_bool!(inner, requestStopWithError: &mut error);
            if ok.as_bool() {
                Ok(())
            } else {
                Err(crate::ffi::extract_nserror(error))
            }
        })
    }

    /// Pauses the VM.
    pub async fn pause(&self) -> VzResult<()> {
        let (completion, rx) = ErrorCompletion::new();
        let inner = self.inner;
        let block = completion.as_block_ptr();
        self.queue.sync(|| unsafe {
            let sel = objc2::sel!(pauseWithCompletionHandler:);
            let func: unsafe extern "C" fn(
                *const AnyObject,
                objc2::runtime::Sel,
                *const std::ffi::c_void,
            ) = std::mem::transmute(crate::ffi::objc_msgSend as *const std::ffi::c_void);
            func(inner as *const AnyObject, sel, block);
        });
        wait(rx, "pause").await
    }

    /// Resumes a paused (or freshly restored) VM.
    pub async fn resume(&self) -> VzResult<()> {
        let (completion, rx) = ErrorCompletion::new();
        let inner = self.inner;
        let block = completion.as_block_ptr();
        self.queue.sync(|| unsafe {
            let sel = objc2::sel!(resumeWithCompletionHandler:);
            let func: unsafe extern "C" fn(
                *const AnyObject,
                objc2::runtime::Sel,
                *const std::ffi::c_void,
            ) = std::mem::transmute(crate::ffi::objc_msgSend as *const std::ffi::c_void);
            func(inner as *const AnyObject, sel, block);
        });
        wait(rx, "resume").await
    }

    /// Serializes the paused VM's live state into `path`.
    pub async fn save_machine_state(&self, path: &Path) -> VzResult<()> {
        let (completion, rx) = ErrorCompletion::new();
        let inner = self.inner;
        let block = completion.as_block_ptr();
        let url = nsurl_file_path(&path.to_string_lossy());
        self.queue.sync(|| unsafe {
            let sel = objc2::sel!(saveMachineStateToURL:completionHandler:);
            let func: unsafe extern "C" fn(
                *const AnyObject,
                objc2::runtime::Sel,
                *mut AnyObject,
                *const std::ffi::c_void,
            ) = std::mem::transmute(crate::ffi::objc_msgSend as *const std::ffi::c_void);
            func(inner as *const AnyObject, sel, url, block);
        });
        let result = wait(rx, "save machine state").await;
        release(url);
        result
    }

    /// Loads previously saved machine state from `path`. The VM must not
    /// have been started; it ends up `Paused` and is then resumed.
    pub async fn restore_machine_state(&self, path: &Path) -> VzResult<()> {
        let (completion, rx) = ErrorCompletion::new();
        let inner = self.inner;
        let block = completion.as_block_ptr();
        let url = nsurl_file_path(&path.to_string_lossy());
        self.queue.sync(|| unsafe {
            let sel = objc2::sel!(restoreMachineStateFromURL:completionHandler:);
            let func: unsafe extern "C" fn(
                *const AnyObject,
                objc2::runtime::Sel,
                *mut AnyObject,
                *const std::ffi::c_void,
            ) = std::mem::transmute(crate::ffi::objc_msgSend as *const std::ffi::c_void);
            func(inner as *const AnyObject, sel, url, block);
        });
        let result = wait(rx, "restore machine state").await;
        release(url);
        result
    }

    /// Resolves when the VM reaches `Stopped` or `Error`.
    ///
    /// The framework has no exit future; callers observe the serial state
    /// property, which the framework updates from its own queue.
    pub async fn wait_until_stopped(&self) -> VzResult<()> {
        loop {
            match self.state() {
                MachineState::Stopped => return Ok(()),
                MachineState::Error => {
                    return Err(VzError::Internal("VM entered error state".into()));
                }
                _ => tokio::time::sleep(Duration::from_millis(100)).await,
            }
        }
    }
}

impl Drop for VirtualMachine {
    fn drop(&mut self) {
        release(self.inner);
    }
}

async fn wait(rx: oneshot::Receiver<Option<VzError>>, op: &str) -> VzResult<()> {
    match rx.await {
        Ok(None) => Ok(()),
        Ok(Some(err)) => Err(err),
        Err(_) => Err(VzError::Internal(format!("{op} completion dropped"))),
    }
}
