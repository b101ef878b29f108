//! Safe facade over Apple's Virtualization.framework.
//!
//! The engine drives exactly one VM per process, so this crate exposes the
//! narrow surface that takes: a configuration builder, device attachment
//! constructors, and a [`VirtualMachine`] with the asynchronous lifecycle
//! operations (start with options, stop, request-stop, pause, resume, save
//! and restore machine state).
//!
//! All Objective-C objects are owned pointers released on drop; device
//! configurations hand their pointer over to the VM configuration with
//! `into_ptr`. Every VM operation runs on the VM's serial dispatch queue as
//! the framework requires.
//!
//! The crate compiles to nothing outside macOS; callers gate their use of
//! it on `target_os = "macos"`.

#![cfg(target_os = "macos")]
// FFI code casts pointers liberally; these lints fight the grain.
#![allow(clippy::ptr_as_ptr)]
#![allow(clippy::ptr_cast_constness)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod device;
pub mod error;
pub mod ffi;
pub mod vm;

pub use config::{
    BootLoader, EfiBootLoader, GenericPlatform, MacOsBootLoader, MacPlatform, Platform,
    VmConfiguration,
};
pub use device::{
    AudioDeviceConfiguration, BridgedInterface, ClipboardDeviceConfiguration,
    DirectoryShareDevice, DiskCaching, DiskSync, EntropyDeviceConfiguration,
    GraphicsDeviceConfiguration, KeyboardConfiguration, NetworkAttachment,
    NetworkDeviceConfiguration, PointingDeviceConfiguration, SerialPortConfiguration,
    SharedDirectory, StorageAttachment, StorageDeviceConfiguration,
    bridged_interface_names, rosetta_share_available,
};
pub use error::{VzError, VzResult};
pub use vm::{MachineState, StartOptions, VirtualMachine};

/// Whether the framework is present and the hardware can virtualize.
#[must_use]
pub fn is_supported() -> bool {
    ffi::is_supported()
}

/// Whether this host can run nested virtual machines.
#[must_use]
pub fn nested_supported() -> bool {
    ffi::nested_supported()
}
