//! Boot loaders, platform configurations and the VM configuration builder.

use std::path::Path;

use objc2::runtime::AnyObject;

use crate::error::{VzError, VzResult};
use crate::ffi::{
    DispatchQueue, nsarray, nsdata, nsurl_file_path, release, require_class,
};
use crate::vm::VirtualMachine;
use crate::{msg_send, msg_send_bool, msg_send_void, msg_send_void_bool, msg_send_void_u64};

// ============================================================================
// Boot loaders
// ============================================================================

/// Trait for boot loader configurations.
pub trait BootLoader {
    /// The underlying Objective-C object pointer.
    fn as_ptr(&self) -> *mut AnyObject;
}

/// Boot loader for macOS guests.
pub struct MacOsBootLoader {
    inner: *mut AnyObject,
}

unsafe impl Send for MacOsBootLoader {}

impl MacOsBootLoader {
    /// Creates a macOS boot loader.
    pub fn new() -> VzResult<Self> {
        unsafe {
            let cls = require_class("VZMacOSBootLoader")?;
            let obj = msg_send!(cls, new);
            if obj.is_null() {
                return Err(VzError::Internal("failed to create macOS boot loader".into()));
            }
            Ok(Self { inner: obj })
        }
    }
}

impl BootLoader for MacOsBootLoader {
    fn as_ptr(&self) -> *mut AnyObject {
        self.inner
    }
}

impl Drop for MacOsBootLoader {
    fn drop(&mut self) {
        release(self.inner);
    }
}

/// EFI boot loader for Linux guests; boots straight from the root disk.
pub struct EfiBootLoader {
    inner: *mut AnyObject,
}

unsafe impl Send for EfiBootLoader {}

impl EfiBootLoader {
    /// Creates an EFI boot loader backed by the variable store at `nvram`.
    ///
    /// The store must already exist; it is created together with the VM by
    /// the image subsystem.
    pub fn new(nvram: impl AsRef<Path>) -> VzResult<Self> {
        let nvram = nvram.as_ref();
        if !nvram.exists() {
            return Err(VzError::NotFound(nvram.display().to_string()));
        }
        unsafe {
            let store_cls = require_class("VZEFIVariableStore")?;
            let url = nsurl_file_path(&nvram.to_string_lossy());
            let alloc = msg_send!(store_cls, alloc);
            let store = msg_send!(alloc, initWithURL: url);
            if store.is_null() {
                return Err(VzError::InvalidConfiguration(format!(
                    "failed to open EFI variable store {}",
                    nvram.display()
                )));
            }

            let cls = require_class("VZEFIBootLoader")?;
            let obj = msg_send!(cls, new);
            if obj.is_null() {
                return Err(VzError::Internal("failed to create EFI boot loader".into()));
            }
            msg_send_void!(obj, setVariableStore: store);
            Ok(Self { inner: obj })
        }
    }
}

impl BootLoader for EfiBootLoader {
    fn as_ptr(&self) -> *mut AnyObject {
        self.inner
    }
}

impl Drop for EfiBootLoader {
    fn drop(&mut self) {
        release(self.inner);
    }
}

// ============================================================================
// Platforms
// ============================================================================

/// Trait for platform configurations.
pub trait Platform {
    /// The underlying Objective-C object pointer.
    fn as_ptr(&self) -> *mut AnyObject;
}

/// Platform configuration for macOS guests.
///
/// Carries the hardware model and machine identifier the guest was
/// installed with, plus the auxiliary (NVRAM) storage.
pub struct MacPlatform {
    inner: *mut AnyObject,
}

unsafe impl Send for MacPlatform {}

impl MacPlatform {
    /// Creates a macOS platform from the persisted identity blobs.
    pub fn new(hardware_model: &[u8], machine_id: &[u8], nvram: &Path) -> VzResult<Self> {
        unsafe {
            let cls = require_class("VZMacPlatformConfiguration")?;
            let obj = msg_send!(cls, new);
            if obj.is_null() {
                return Err(VzError::Internal("failed to create macOS platform".into()));
            }

            let model_cls = require_class("VZMacHardwareModel")?;
            let model_alloc = msg_send!(model_cls, alloc);
            let model = msg_send!(model_alloc, initWithDataRepresentation: nsdata(hardware_model));
            if model.is_null() {
                release(obj);
                return Err(VzError::InvalidConfiguration(
                    "hardware model blob is not valid".into(),
                ));
            }
            if !msg_send_bool!(model, isSupported).as_bool() {
                release(obj);
                return Err(VzError::InvalidConfiguration(
                    "hardware model is not supported on this host".into(),
                ));
            }
            msg_send_void!(obj, setHardwareModel: model);

            let id_cls = require_class("VZMacMachineIdentifier")?;
            let id_alloc = msg_send!(id_cls, alloc);
            let id = msg_send!(id_alloc, initWithDataRepresentation: nsdata(machine_id));
            if id.is_null() {
                release(obj);
                return Err(VzError::InvalidConfiguration(
                    "machine identifier blob is not valid".into(),
                ));
            }
            msg_send_void!(obj, setMachineIdentifier: id);

            if !nvram.exists() {
                release(obj);
                return Err(VzError::NotFound(nvram.display().to_string()));
            }
            let aux_cls = require_class("VZMacAuxiliaryStorage")?;
            let aux_alloc = msg_send!(aux_cls, alloc);
            let url = nsurl_file_path(&nvram.to_string_lossy());
            let aux = msg_send!(aux_alloc, initWithContentsOfURL: url);
            if aux.is_null() {
                release(obj);
                return Err(VzError::InvalidConfiguration(format!(
                    "failed to open auxiliary storage {}",
                    nvram.display()
                )));
            }
            msg_send_void!(obj, setAuxiliaryStorage: aux);

            Ok(Self { inner: obj })
        }
    }
}

impl Platform for MacPlatform {
    fn as_ptr(&self) -> *mut AnyObject {
        self.inner
    }
}

impl Drop for MacPlatform {
    fn drop(&mut self) {
        release(self.inner);
    }
}

/// Generic platform configuration for Linux guests.
pub struct GenericPlatform {
    inner: *mut AnyObject,
}

unsafe impl Send for GenericPlatform {}

impl GenericPlatform {
    /// Creates a generic platform.
    pub fn new() -> VzResult<Self> {
        unsafe {
            let cls = require_class("VZGenericPlatformConfiguration")?;
            let obj = msg_send!(cls, new);
            if obj.is_null() {
                return Err(VzError::Internal("failed to create generic platform".into()));
            }
            let _: *mut AnyObject = msg_send!(obj, retain);
            Ok(Self { inner: obj })
        }
    }

    /// Enables nested virtualization. The caller checks host support first.
    pub fn set_nested(&mut self, nested: bool) -> &mut Self {
        unsafe {
            msg_send_void_bool!(self.inner, setNestedVirtualizationEnabled: nested);
        }
        self
    }
}

impl Platform for GenericPlatform {
    fn as_ptr(&self) -> *mut AnyObject {
        self.inner
    }
}

impl Drop for GenericPlatform {
    fn drop(&mut self) {
        release(self.inner);
    }
}

// ============================================================================
// VM configuration builder
// ============================================================================

/// Builder for a complete hardware configuration.
///
/// Configure CPU, memory, boot loader, platform and devices, then
/// [`build`](Self::build) the [`VirtualMachine`].
pub struct VmConfiguration {
    inner: *mut AnyObject,
    storage_devices: Vec<*mut AnyObject>,
    network_devices: Vec<*mut AnyObject>,
    serial_ports: Vec<*mut AnyObject>,
    directory_shares: Vec<*mut AnyObject>,
    graphics_devices: Vec<*mut AnyObject>,
    pointing_devices: Vec<*mut AnyObject>,
    keyboards: Vec<*mut AnyObject>,
    audio_devices: Vec<*mut AnyObject>,
    console_devices: Vec<*mut AnyObject>,
    entropy_devices: Vec<*mut AnyObject>,
}

unsafe impl Send for VmConfiguration {}

impl VmConfiguration {
    /// Creates an empty configuration.
    pub fn new() -> VzResult<Self> {
        unsafe {
            let cls = require_class("VZVirtualMachineConfiguration")?;
            let alloc = msg_send!(cls, alloc);
            let obj = msg_send!(alloc, init);
            if obj.is_null() {
                return Err(VzError::Internal(
                    "failed to create VZVirtualMachineConfiguration".into(),
                ));
            }
            Ok(Self {
                inner: obj,
                storage_devices: Vec::new(),
                network_devices: Vec::new(),
                serial_ports: Vec::new(),
                directory_shares: Vec::new(),
                graphics_devices: Vec::new(),
                pointing_devices: Vec::new(),
                keyboards: Vec::new(),
                audio_devices: Vec::new(),
                console_devices: Vec::new(),
                entropy_devices: Vec::new(),
            })
        }
    }

    /// Sets the virtual CPU count.
    pub fn set_cpu_count(&mut self, count: u32) -> &mut Self {
        unsafe {
            msg_send_void_u64!(self.inner, setCPUCount: u64::from(count));
        }
        self
    }

    /// Sets the memory size in bytes.
    pub fn set_memory_size(&mut self, bytes: u64) -> &mut Self {
        unsafe {
            msg_send_void_u64!(self.inner, setMemorySize: bytes);
        }
        self
    }

    /// Sets the boot loader.
    pub fn set_boot_loader(&mut self, boot_loader: impl BootLoader) -> &mut Self {
        unsafe {
            msg_send_void!(self.inner, setBootLoader: boot_loader.as_ptr());
        }
        self
    }

    /// Sets the platform configuration.
    pub fn set_platform(&mut self, platform: impl Platform) -> &mut Self {
        unsafe {
            msg_send_void!(self.inner, setPlatform: platform.as_ptr());
        }
        self
    }

    /// Adds a storage device.
    pub fn add_storage_device(
        &mut self,
        device: crate::device::StorageDeviceConfiguration,
    ) -> &mut Self {
        self.storage_devices.push(device.into_ptr());
        self
    }

    /// Adds a network device.
    pub fn add_network_device(
        &mut self,
        device: crate::device::NetworkDeviceConfiguration,
    ) -> &mut Self {
        self.network_devices.push(device.into_ptr());
        self
    }

    /// Adds a serial port.
    pub fn add_serial_port(&mut self, port: crate::device::SerialPortConfiguration) -> &mut Self {
        self.serial_ports.push(port.into_ptr());
        self
    }

    /// Adds a directory sharing device.
    pub fn add_directory_share(
        &mut self,
        device: crate::device::DirectoryShareDevice,
    ) -> &mut Self {
        self.directory_shares.push(device.into_ptr());
        self
    }

    /// Adds a graphics device.
    pub fn add_graphics_device(
        &mut self,
        device: crate::device::GraphicsDeviceConfiguration,
    ) -> &mut Self {
        self.graphics_devices.push(device.into_ptr());
        self
    }

    /// Adds a pointing device.
    pub fn add_pointing_device(
        &mut self,
        device: crate::device::PointingDeviceConfiguration,
    ) -> &mut Self {
        self.pointing_devices.push(device.into_ptr());
        self
    }

    /// Adds a keyboard.
    pub fn add_keyboard(&mut self, keyboard: crate::device::KeyboardConfiguration) -> &mut Self {
        self.keyboards.push(keyboard.into_ptr());
        self
    }

    /// Adds an audio device.
    pub fn add_audio_device(
        &mut self,
        device: crate::device::AudioDeviceConfiguration,
    ) -> &mut Self {
        self.audio_devices.push(device.into_ptr());
        self
    }

    /// Adds a console device (clipboard agent).
    pub fn add_console_device(
        &mut self,
        device: crate::device::ClipboardDeviceConfiguration,
    ) -> &mut Self {
        self.console_devices.push(device.into_ptr());
        self
    }

    /// Adds an entropy device.
    pub fn add_entropy_device(
        &mut self,
        device: crate::device::EntropyDeviceConfiguration,
    ) -> &mut Self {
        self.entropy_devices.push(device.into_ptr());
        self
    }

    /// Validates the assembled configuration against the framework.
    pub fn validate(&self) -> VzResult<()> {
        unsafe {
            let mut error: *mut AnyObject = std::ptr::null_mut();
            let ok = msg_send_bool!(self.inner, validateWithError: &mut error);
            if ok.as_bool() {
                Ok(())
            } else {
                Err(crate::ffi::extract_nserror(error))
            }
        }
    }

    /// Finalizes the device arrays, validates, and creates the VM bound to
    /// a fresh serial dispatch queue.
    pub fn build(mut self) -> VzResult<VirtualMachine> {
        self.apply_devices();
        self.validate()?;

        let queue = DispatchQueue::new("com.tartlet.vm");
        let vm_ptr = unsafe {
            let cls = require_class("VZVirtualMachine")?;
            let alloc = msg_send!(cls, alloc);
            let obj = msg_send!(alloc, initWithConfiguration: self.inner, queue: queue.as_ptr());
            if obj.is_null() {
                return Err(VzError::Internal("failed to create VZVirtualMachine".into()));
            }
            obj
        };
        Ok(VirtualMachine::from_raw(vm_ptr, queue))
    }

    fn apply_devices(&mut self) {
        unsafe {
            if !self.storage_devices.is_empty() {
                msg_send_void!(self.inner, setStorageDevices: nsarray(&self.storage_devices));
            }
            if !self.network_devices.is_empty() {
                msg_send_void!(self.inner, setNetworkDevices: nsarray(&self.network_devices));
            }
            if !self.serial_ports.is_empty() {
                msg_send_void!(self.inner, setSerialPorts: nsarray(&self.serial_ports));
            }
            if !self.directory_shares.is_empty() {
                msg_send_void!(
                    self.inner,
                    setDirectorySharingDevices: nsarray(&self.directory_shares)
                );
            }
            if !self.graphics_devices.is_empty() {
                msg_send_void!(self.inner, setGraphicsDevices: nsarray(&self.graphics_devices));
            }
            if !self.pointing_devices.is_empty() {
                msg_send_void!(self.inner, setPointingDevices: nsarray(&self.pointing_devices));
            }
            if !self.keyboards.is_empty() {
                msg_send_void!(self.inner, setKeyboards: nsarray(&self.keyboards));
            }
            if !self.audio_devices.is_empty() {
                msg_send_void!(self.inner, setAudioDevices: nsarray(&self.audio_devices));
            }
            if !self.console_devices.is_empty() {
                msg_send_void!(self.inner, setConsoleDevices: nsarray(&self.console_devices));
            }
            if !self.entropy_devices.is_empty() {
                msg_send_void!(self.inner, setEntropyDevices: nsarray(&self.entropy_devices));
            }
        }
    }
}

impl Drop for VmConfiguration {
    fn drop(&mut self) {
        release(self.inner);
    }
}
