//! Device configurations: storage, network, serial, directory sharing,
//! graphics, input, audio, clipboard and entropy.
//!
//! Each configuration owns its Objective-C object and hands the pointer to
//! [`crate::config::VmConfiguration`] via `into_ptr`.

use std::ffi::c_void;
use std::os::unix::io::RawFd;
use std::path::Path;

use objc2::runtime::{AnyObject, Bool, Sel};

use crate::error::{VzError, VzResult};
use crate::ffi::{
    self, file_handle_for_fd, nsarray, nsdictionary, nsstring, nsstring_to_string,
    nsurl_file_path, nsurl_from_string, release, require_class,
};
use crate::{msg_send, msg_send_bool, msg_send_i64, msg_send_void, msg_send_void_bool};

// ============================================================================
// Storage
// ============================================================================

/// Host caching mode of a disk-image attachment
/// (`VZDiskImageCachingMode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum DiskCaching {
    /// Framework decides.
    Automatic = 0,
    /// Host page cache enabled.
    Cached = 1,
    /// Host page cache bypassed.
    Uncached = 2,
}

/// Write synchronization mode of a disk attachment
/// (`VZDiskImageSynchronizationMode` / `VZDiskSynchronizationMode`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum DiskSync {
    /// Full barrier semantics.
    Full = 0,
    /// `fsync` on flush.
    Fsync = 1,
    /// No synchronization.
    None = 2,
}

/// An owned storage attachment pointer.
pub struct StorageAttachment {
    inner: *mut AnyObject,
}

unsafe impl Send for StorageAttachment {}

impl StorageAttachment {
    /// Attachment backed by a local disk image file.
    pub fn disk_image(
        path: impl AsRef<Path>,
        read_only: bool,
        caching: DiskCaching,
        sync: DiskSync,
    ) -> VzResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(VzError::NotFound(path.display().to_string()));
        }
        unsafe {
            let cls = require_class("VZDiskImageStorageDeviceAttachment")?;
            let url = nsurl_file_path(&path.to_string_lossy());
            let mut error: *mut AnyObject = std::ptr::null_mut();

            let sel = objc2::sel!(initWithURL:readOnly:cachingMode:synchronizationMode:error:);
            let func: unsafe extern "C" fn(
                *mut AnyObject,
                Sel,
                *mut AnyObject,
                Bool,
                i64,
                i64,
                *mut *mut AnyObject,
            ) -> *mut AnyObject = std::mem::transmute(ffi::objc_msgSend as *const c_void);
            let alloc = msg_send!(cls, alloc);
            let obj = func(
                alloc,
                sel,
                url,
                Bool::new(read_only),
                caching as i64,
                sync as i64,
                &mut error,
            );
            if obj.is_null() {
                return Err(ffi::extract_nserror(error));
            }
            Ok(Self { inner: obj })
        }
    }

    /// Attachment backed by an already-open block or character device.
    ///
    /// The caller keeps the descriptor open for the VM's lifetime; the
    /// file handle does not close it.
    pub fn block_device(fd: RawFd, read_only: bool, sync: DiskSync) -> VzResult<Self> {
        unsafe {
            let cls = require_class("VZDiskBlockDeviceStorageDeviceAttachment")?;
            let handle = file_handle_for_fd(fd);
            let mut error: *mut AnyObject = std::ptr::null_mut();

            let sel = objc2::sel!(initWithFileHandle:readOnly:synchronizationMode:error:);
            let func: unsafe extern "C" fn(
                *mut AnyObject,
                Sel,
                *mut AnyObject,
                Bool,
                i64,
                *mut *mut AnyObject,
            ) -> *mut AnyObject = std::mem::transmute(ffi::objc_msgSend as *const c_void);
            let alloc = msg_send!(cls, alloc);
            let obj = func(alloc, sel, handle, Bool::new(read_only), sync as i64, &mut error);
            if obj.is_null() {
                return Err(ffi::extract_nserror(error));
            }
            Ok(Self { inner: obj })
        }
    }

    /// Attachment backed by a network block device export.
    pub fn network_block_device(
        url: &str,
        read_only: bool,
        sync: DiskSync,
        timeout_seconds: f64,
    ) -> VzResult<Self> {
        unsafe {
            let cls = require_class("VZNetworkBlockDeviceStorageDeviceAttachment")?;
            let ns_url = nsurl_from_string(url);
            if ns_url.is_null() {
                return Err(VzError::InvalidConfiguration(format!(
                    "\"{url}\" is not a valid NBD URL"
                )));
            }
            let mut error: *mut AnyObject = std::ptr::null_mut();

            let sel = objc2::sel!(initWithURL:timeout:forcedReadOnly:synchronizationMode:error:);
            let func: unsafe extern "C" fn(
                *mut AnyObject,
                Sel,
                *mut AnyObject,
                f64,
                Bool,
                i64,
                *mut *mut AnyObject,
            ) -> *mut AnyObject = std::mem::transmute(ffi::objc_msgSend as *const c_void);
            let alloc = msg_send!(cls, alloc);
            let obj = func(
                alloc,
                sel,
                ns_url,
                timeout_seconds,
                Bool::new(read_only),
                sync as i64,
                &mut error,
            );
            if obj.is_null() {
                return Err(ffi::extract_nserror(error));
            }
            Ok(Self { inner: obj })
        }
    }

    fn into_ptr(self) -> *mut AnyObject {
        let ptr = self.inner;
        std::mem::forget(self);
        ptr
    }
}

impl Drop for StorageAttachment {
    fn drop(&mut self) {
        release(self.inner);
    }
}

/// A VirtIO block storage device.
pub struct StorageDeviceConfiguration {
    inner: *mut AnyObject,
}

unsafe impl Send for StorageDeviceConfiguration {}

impl StorageDeviceConfiguration {
    /// Creates a VirtIO block device over `attachment`.
    pub fn virtio(attachment: StorageAttachment) -> VzResult<Self> {
        unsafe {
            let cls = require_class("VZVirtioBlockDeviceConfiguration")?;
            let alloc = msg_send!(cls, alloc);
            let obj = msg_send!(alloc, initWithAttachment: attachment.into_ptr());
            if obj.is_null() {
                return Err(VzError::Internal("failed to create block device".into()));
            }
            Ok(Self { inner: obj })
        }
    }

    /// Consumes the configuration and returns the raw pointer.
    pub fn into_ptr(self) -> *mut AnyObject {
        let ptr = self.inner;
        std::mem::forget(self);
        ptr
    }
}

impl Drop for StorageDeviceConfiguration {
    fn drop(&mut self) {
        release(self.inner);
    }
}

// ============================================================================
// Network
// ============================================================================

/// A bridgeable host interface.
#[derive(Debug, Clone)]
pub struct BridgedInterface {
    /// Interface identifier (`en0`).
    pub identifier: String,
    /// Human-readable name.
    pub display_name: String,
}

/// Enumerates the host interfaces available for bridging.
#[must_use]
pub fn bridged_interface_names() -> Vec<BridgedInterface> {
    let Some(cls) = ffi::get_class("VZBridgedNetworkInterface") else {
        return Vec::new();
    };
    unsafe {
        let array: *mut AnyObject = msg_send!(cls, networkInterfaces);
        let count = ffi::nsarray_count(array);
        let mut interfaces = Vec::with_capacity(count);
        for i in 0..count {
            let iface = ffi::nsarray_object_at_index(array, i);
            if iface.is_null() {
                continue;
            }
            let identifier = nsstring_to_string(msg_send!(iface, identifier));
            let display_name = nsstring_to_string(msg_send!(iface, localizedDisplayName));
            interfaces.push(BridgedInterface {
                identifier,
                display_name,
            });
        }
        interfaces
    }
}

/// An owned network attachment pointer.
pub struct NetworkAttachment {
    inner: *mut AnyObject,
}

unsafe impl Send for NetworkAttachment {}

impl NetworkAttachment {
    /// Framework NAT attachment.
    pub fn nat() -> VzResult<Self> {
        unsafe {
            let cls = require_class("VZNATNetworkDeviceAttachment")?;
            let obj = msg_send!(cls, new);
            if obj.is_null() {
                return Err(VzError::Internal("failed to create NAT attachment".into()));
            }
            Ok(Self { inner: obj })
        }
    }

    /// Bridge onto the host interface named `identifier`.
    pub fn bridged(identifier: &str) -> VzResult<Self> {
        let cls = require_class("VZBridgedNetworkInterface")?;
        unsafe {
            let array: *mut AnyObject = msg_send!(cls, networkInterfaces);
            let count = ffi::nsarray_count(array);
            for i in 0..count {
                let iface = ffi::nsarray_object_at_index(array, i);
                if iface.is_null() {
                    continue;
                }
                if nsstring_to_string(msg_send!(iface, identifier)) == identifier {
                    let att_cls = require_class("VZBridgedNetworkDeviceAttachment")?;
                    let alloc = msg_send!(att_cls, alloc);
                    let obj = msg_send!(alloc, initWithInterface: iface);
                    if obj.is_null() {
                        return Err(VzError::Internal(
                            "failed to create bridged attachment".into(),
                        ));
                    }
                    return Ok(Self { inner: obj });
                }
            }
        }
        Err(VzError::InvalidConfiguration(format!(
            "no bridgeable host interface named \"{identifier}\""
        )))
    }

    /// Attachment over a connected datagram socket (the filter helper's
    /// data plane). The descriptor stays owned by the caller.
    pub fn file_handle(fd: RawFd) -> VzResult<Self> {
        unsafe {
            let cls = require_class("VZFileHandleNetworkDeviceAttachment")?;
            let handle = file_handle_for_fd(fd);
            let alloc = msg_send!(cls, alloc);
            let obj = msg_send!(alloc, initWithFileHandle: handle);
            if obj.is_null() {
                return Err(VzError::Internal(
                    "failed to create file handle attachment".into(),
                ));
            }
            Ok(Self { inner: obj })
        }
    }

    fn into_ptr(self) -> *mut AnyObject {
        let ptr = self.inner;
        std::mem::forget(self);
        ptr
    }
}

impl Drop for NetworkAttachment {
    fn drop(&mut self) {
        release(self.inner);
    }
}

/// A VirtIO network device.
pub struct NetworkDeviceConfiguration {
    inner: *mut AnyObject,
}

unsafe impl Send for NetworkDeviceConfiguration {}

impl NetworkDeviceConfiguration {
    /// Creates a VirtIO NIC with `mac` over `attachment`.
    pub fn virtio(attachment: NetworkAttachment, mac: &str) -> VzResult<Self> {
        unsafe {
            let cls = require_class("VZVirtioNetworkDeviceConfiguration")?;
            let obj = msg_send!(cls, new);
            if obj.is_null() {
                return Err(VzError::Internal("failed to create network device".into()));
            }
            msg_send_void!(obj, setAttachment: attachment.into_ptr());

            let mac_cls = require_class("VZMACAddress")?;
            let mac_alloc = msg_send!(mac_cls, alloc);
            let mac_obj = msg_send!(mac_alloc, initWithString: nsstring(mac));
            if mac_obj.is_null() {
                release(obj);
                return Err(VzError::InvalidConfiguration(format!(
                    "\"{mac}\" is not a valid MAC address"
                )));
            }
            msg_send_void!(obj, setMACAddress: mac_obj);
            Ok(Self { inner: obj })
        }
    }

    /// Consumes the configuration and returns the raw pointer.
    pub fn into_ptr(self) -> *mut AnyObject {
        let ptr = self.inner;
        std::mem::forget(self);
        ptr
    }
}

impl Drop for NetworkDeviceConfiguration {
    fn drop(&mut self) {
        release(self.inner);
    }
}

// ============================================================================
// Serial
// ============================================================================

/// A VirtIO console serial port over a pair of file descriptors.
pub struct SerialPortConfiguration {
    inner: *mut AnyObject,
}

unsafe impl Send for SerialPortConfiguration {}

impl SerialPortConfiguration {
    /// Creates a serial port reading from `read_fd` and writing to
    /// `write_fd` (typically both ends of a PTY). The descriptors stay
    /// owned by the caller.
    pub fn with_fds(read_fd: RawFd, write_fd: RawFd) -> VzResult<Self> {
        unsafe {
            let att_cls = require_class("VZFileHandleSerialPortAttachment")?;
            let read_handle = file_handle_for_fd(read_fd);
            let write_handle = file_handle_for_fd(write_fd);
            let alloc = msg_send!(att_cls, alloc);
            let attachment = msg_send!(
                alloc,
                initWithFileHandleForReading: read_handle,
                fileHandleForWriting: write_handle
            );
            if attachment.is_null() {
                return Err(VzError::Internal(
                    "failed to create serial port attachment".into(),
                ));
            }

            let cls = require_class("VZVirtioConsoleDeviceSerialPortConfiguration")?;
            let port = msg_send!(cls, new);
            if port.is_null() {
                return Err(VzError::Internal("failed to create serial port".into()));
            }
            msg_send_void!(port, setAttachment: attachment);
            Ok(Self { inner: port })
        }
    }

    /// Consumes the configuration and returns the raw pointer.
    pub fn into_ptr(self) -> *mut AnyObject {
        let ptr = self.inner;
        std::mem::forget(self);
        ptr
    }
}

impl Drop for SerialPortConfiguration {
    fn drop(&mut self) {
        release(self.inner);
    }
}

// ============================================================================
// Directory sharing
// ============================================================================

/// A host directory exposed to the guest.
pub struct SharedDirectory {
    inner: *mut AnyObject,
}

unsafe impl Send for SharedDirectory {}

impl SharedDirectory {
    /// Wraps a host directory.
    pub fn new(path: impl AsRef<Path>, read_only: bool) -> VzResult<Self> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Err(VzError::NotFound(path.display().to_string()));
        }
        unsafe {
            let cls = require_class("VZSharedDirectory")?;
            let url = nsurl_file_path(&path.to_string_lossy());
            let alloc = msg_send!(cls, alloc);

            let sel = objc2::sel!(initWithURL:readOnly:);
            let func: unsafe extern "C" fn(
                *mut AnyObject,
                Sel,
                *mut AnyObject,
                Bool,
            ) -> *mut AnyObject = std::mem::transmute(ffi::objc_msgSend as *const c_void);
            let obj = func(alloc, sel, url, Bool::new(read_only));
            if obj.is_null() {
                return Err(VzError::Internal("failed to create shared directory".into()));
            }
            Ok(Self { inner: obj })
        }
    }

    fn into_ptr(self) -> *mut AnyObject {
        let ptr = self.inner;
        std::mem::forget(self);
        ptr
    }
}

impl Drop for SharedDirectory {
    fn drop(&mut self) {
        release(self.inner);
    }
}

/// A VirtioFS directory sharing device under one mount tag.
pub struct DirectoryShareDevice {
    inner: *mut AnyObject,
}

unsafe impl Send for DirectoryShareDevice {}

impl DirectoryShareDevice {
    /// One unnamed directory under `tag`.
    pub fn single(tag: &str, directory: SharedDirectory) -> VzResult<Self> {
        unsafe {
            let share_cls = require_class("VZSingleDirectoryShare")?;
            let alloc = msg_send!(share_cls, alloc);
            let share = msg_send!(alloc, initWithDirectory: directory.into_ptr());
            if share.is_null() {
                return Err(VzError::Internal("failed to create directory share".into()));
            }
            Self::with_share(tag, share)
        }
    }

    /// Multiple named directories under `tag`; the guest sees one
    /// subdirectory per name.
    pub fn multiple(tag: &str, entries: Vec<(String, SharedDirectory)>) -> VzResult<Self> {
        unsafe {
            let mut keys = Vec::with_capacity(entries.len());
            let mut values = Vec::with_capacity(entries.len());
            for (name, directory) in entries {
                keys.push(nsstring(&name));
                values.push(directory.into_ptr());
            }
            let dict = nsdictionary(&keys, &values);

            let share_cls = require_class("VZMultipleDirectoryShare")?;
            let alloc = msg_send!(share_cls, alloc);
            let share = msg_send!(alloc, initWithDirectories: dict);
            if share.is_null() {
                return Err(VzError::Internal(
                    "failed to create multi-directory share".into(),
                ));
            }
            Self::with_share(tag, share)
        }
    }

    /// The Rosetta translation share for Linux guests.
    pub fn rosetta(tag: &str) -> VzResult<Self> {
        if !rosetta_share_available() {
            return Err(VzError::InvalidConfiguration(
                "Rosetta is not installed on this host".into(),
            ));
        }
        unsafe {
            let cls = require_class("VZLinuxRosettaDirectoryShare")?;
            let mut error: *mut AnyObject = std::ptr::null_mut();
            let alloc = msg_send!(cls, alloc);
            let sel = objc2::sel!(initWithError:);
            let func: unsafe extern "C" fn(
                *mut AnyObject,
                Sel,
                *mut *mut AnyObject,
            ) -> *mut AnyObject = std::mem::transmute(ffi::objc_msgSend as *const c_void);
            let share = func(alloc, sel, &mut error);
            if share.is_null() {
                return Err(ffi::extract_nserror(error));
            }
            Self::with_share(tag, share)
        }
    }

    unsafe fn with_share(tag: &str, share: *mut AnyObject) -> VzResult<Self> {
        unsafe {
            let cls = require_class("VZVirtioFileSystemDeviceConfiguration")?;
            let mut error: *mut AnyObject = std::ptr::null_mut();
            let valid = msg_send_bool!(cls, validateTag: nsstring(tag), error: &mut error);
            if !valid.as_bool() {
                return Err(VzError::InvalidConfiguration(format!(
                    "\"{tag}\" is not a valid mount tag"
                )));
            }

            let alloc = msg_send!(cls, alloc);
            let obj = msg_send!(alloc, initWithTag: nsstring(tag));
            if obj.is_null() {
                return Err(VzError::Internal(
                    "failed to create file system device".into(),
                ));
            }
            msg_send_void!(obj, setShare: share);
            Ok(Self { inner: obj })
        }
    }

    /// Consumes the configuration and returns the raw pointer.
    pub fn into_ptr(self) -> *mut AnyObject {
        let ptr = self.inner;
        std::mem::forget(self);
        ptr
    }
}

impl Drop for DirectoryShareDevice {
    fn drop(&mut self) {
        release(self.inner);
    }
}

/// Whether Rosetta translation is installed and usable.
#[must_use]
pub fn rosetta_share_available() -> bool {
    const ROSETTA_INSTALLED: i64 = 2;
    let Some(cls) = ffi::get_class("VZLinuxRosettaDirectoryShare") else {
        return false;
    };
    unsafe { msg_send_i64!(cls, availability) == ROSETTA_INSTALLED }
}

// ============================================================================
// Graphics and input
// ============================================================================

/// A graphics device.
pub struct GraphicsDeviceConfiguration {
    inner: *mut AnyObject,
}

unsafe impl Send for GraphicsDeviceConfiguration {}

impl GraphicsDeviceConfiguration {
    /// macOS guest graphics with one display.
    pub fn mac(width: u32, height: u32, pixels_per_inch: u32) -> VzResult<Self> {
        unsafe {
            let display_cls = require_class("VZMacGraphicsDisplayConfiguration")?;
            let alloc = msg_send!(display_cls, alloc);
            let sel = objc2::sel!(initWithWidthInPixels:heightInPixels:pixelsPerInch:);
            let func: unsafe extern "C" fn(*mut AnyObject, Sel, i64, i64, i64) -> *mut AnyObject =
                std::mem::transmute(ffi::objc_msgSend as *const c_void);
            let display = func(
                alloc,
                sel,
                i64::from(width),
                i64::from(height),
                i64::from(pixels_per_inch),
            );
            if display.is_null() {
                return Err(VzError::Internal("failed to create display".into()));
            }

            let cls = require_class("VZMacGraphicsDeviceConfiguration")?;
            let obj = msg_send!(cls, new);
            if obj.is_null() {
                return Err(VzError::Internal("failed to create graphics device".into()));
            }
            msg_send_void!(obj, setDisplays: nsarray(&[display]));
            Ok(Self { inner: obj })
        }
    }

    /// Linux guest graphics with one scanout.
    pub fn virtio(width: u32, height: u32) -> VzResult<Self> {
        unsafe {
            let scanout_cls = require_class("VZVirtioGraphicsScanoutConfiguration")?;
            let alloc = msg_send!(scanout_cls, alloc);
            let sel = objc2::sel!(initWithWidthInPixels:heightInPixels:);
            let func: unsafe extern "C" fn(*mut AnyObject, Sel, i64, i64) -> *mut AnyObject =
                std::mem::transmute(ffi::objc_msgSend as *const c_void);
            let scanout = func(alloc, sel, i64::from(width), i64::from(height));
            if scanout.is_null() {
                return Err(VzError::Internal("failed to create scanout".into()));
            }

            let cls = require_class("VZVirtioGraphicsDeviceConfiguration")?;
            let obj = msg_send!(cls, new);
            if obj.is_null() {
                return Err(VzError::Internal("failed to create graphics device".into()));
            }
            msg_send_void!(obj, setScanouts: nsarray(&[scanout]));
            Ok(Self { inner: obj })
        }
    }

    /// Consumes the configuration and returns the raw pointer.
    pub fn into_ptr(self) -> *mut AnyObject {
        let ptr = self.inner;
        std::mem::forget(self);
        ptr
    }
}

impl Drop for GraphicsDeviceConfiguration {
    fn drop(&mut self) {
        release(self.inner);
    }
}

/// A pointing device.
pub struct PointingDeviceConfiguration {
    inner: *mut AnyObject,
}

unsafe impl Send for PointingDeviceConfiguration {}

impl PointingDeviceConfiguration {
    /// USB screen-coordinate pointer; works for every guest class.
    pub fn usb_screen_coordinate() -> VzResult<Self> {
        Self::of_class("VZUSBScreenCoordinatePointingDeviceConfiguration")
    }

    /// Mac trackpad; macOS guests only.
    pub fn mac_trackpad() -> VzResult<Self> {
        Self::of_class("VZMacTrackpadConfiguration")
    }

    fn of_class(name: &str) -> VzResult<Self> {
        unsafe {
            let cls = require_class(name)?;
            let obj = msg_send!(cls, new);
            if obj.is_null() {
                return Err(VzError::Internal(format!("failed to create {name}")));
            }
            Ok(Self { inner: obj })
        }
    }

    /// Consumes the configuration and returns the raw pointer.
    pub fn into_ptr(self) -> *mut AnyObject {
        let ptr = self.inner;
        std::mem::forget(self);
        ptr
    }
}

impl Drop for PointingDeviceConfiguration {
    fn drop(&mut self) {
        release(self.inner);
    }
}

/// A keyboard.
pub struct KeyboardConfiguration {
    inner: *mut AnyObject,
}

unsafe impl Send for KeyboardConfiguration {}

impl KeyboardConfiguration {
    /// USB keyboard.
    pub fn usb() -> VzResult<Self> {
        unsafe {
            let cls = require_class("VZUSBKeyboardConfiguration")?;
            let obj = msg_send!(cls, new);
            if obj.is_null() {
                return Err(VzError::Internal("failed to create keyboard".into()));
            }
            Ok(Self { inner: obj })
        }
    }

    /// Consumes the configuration and returns the raw pointer.
    pub fn into_ptr(self) -> *mut AnyObject {
        let ptr = self.inner;
        std::mem::forget(self);
        ptr
    }
}

impl Drop for KeyboardConfiguration {
    fn drop(&mut self) {
        release(self.inner);
    }
}

// ============================================================================
// Audio, clipboard, entropy
// ============================================================================

/// A VirtIO sound device wired to the host's default input and output.
pub struct AudioDeviceConfiguration {
    inner: *mut AnyObject,
}

unsafe impl Send for AudioDeviceConfiguration {}

impl AudioDeviceConfiguration {
    /// Creates a sound device with one host-backed input and output stream.
    pub fn host_input_output() -> VzResult<Self> {
        unsafe {
            let input_cls = require_class("VZVirtioSoundDeviceInputStreamConfiguration")?;
            let input = msg_send!(input_cls, new);
            let source_cls = require_class("VZHostAudioInputStreamSource")?;
            msg_send_void!(input, setSource: msg_send!(source_cls, new));

            let output_cls = require_class("VZVirtioSoundDeviceOutputStreamConfiguration")?;
            let output = msg_send!(output_cls, new);
            let sink_cls = require_class("VZHostAudioOutputStreamSink")?;
            msg_send_void!(output, setSink: msg_send!(sink_cls, new));

            let cls = require_class("VZVirtioSoundDeviceConfiguration")?;
            let obj = msg_send!(cls, new);
            if obj.is_null() {
                return Err(VzError::Internal("failed to create sound device".into()));
            }
            msg_send_void!(obj, setStreams: nsarray(&[input, output]));
            Ok(Self { inner: obj })
        }
    }

    /// Consumes the configuration and returns the raw pointer.
    pub fn into_ptr(self) -> *mut AnyObject {
        let ptr = self.inner;
        std::mem::forget(self);
        ptr
    }
}

impl Drop for AudioDeviceConfiguration {
    fn drop(&mut self) {
        release(self.inner);
    }
}

/// The clipboard agent: a VirtIO console device carrying a Spice agent port.
pub struct ClipboardDeviceConfiguration {
    inner: *mut AnyObject,
}

unsafe impl Send for ClipboardDeviceConfiguration {}

impl ClipboardDeviceConfiguration {
    /// Creates the Spice-agent console device with clipboard sharing on.
    pub fn spice_agent() -> VzResult<Self> {
        unsafe {
            let att_cls = require_class("VZSpiceAgentPortAttachment")?;
            let attachment = msg_send!(att_cls, new);
            if attachment.is_null() {
                return Err(VzError::Internal("failed to create spice agent".into()));
            }
            msg_send_void_bool!(attachment, setSharesClipboard: true);

            let port_cls = require_class("VZVirtioConsolePortConfiguration")?;
            let port = msg_send!(port_cls, new);
            let name: *mut AnyObject = msg_send!(att_cls, spiceAgentPortName);
            msg_send_void!(port, setName: name);
            msg_send_void!(port, setAttachment: attachment);

            let cls = require_class("VZVirtioConsoleDeviceConfiguration")?;
            let obj = msg_send!(cls, new);
            if obj.is_null() {
                return Err(VzError::Internal("failed to create console device".into()));
            }
            let ports: *mut AnyObject = msg_send!(obj, ports);
            let sel = objc2::sel!(setObject:atIndexedSubscript:);
            let func: unsafe extern "C" fn(*mut AnyObject, Sel, *mut AnyObject, usize) =
                std::mem::transmute(ffi::objc_msgSend as *const c_void);
            func(ports, sel, port, 0);
            Ok(Self { inner: obj })
        }
    }

    /// Consumes the configuration and returns the raw pointer.
    pub fn into_ptr(self) -> *mut AnyObject {
        let ptr = self.inner;
        std::mem::forget(self);
        ptr
    }
}

impl Drop for ClipboardDeviceConfiguration {
    fn drop(&mut self) {
        release(self.inner);
    }
}

/// A VirtIO entropy device.
pub struct EntropyDeviceConfiguration {
    inner: *mut AnyObject,
}

unsafe impl Send for EntropyDeviceConfiguration {}

impl EntropyDeviceConfiguration {
    /// Creates a VirtIO entropy device.
    pub fn virtio() -> VzResult<Self> {
        unsafe {
            let cls = require_class("VZVirtioEntropyDeviceConfiguration")?;
            let obj = msg_send!(cls, new);
            if obj.is_null() {
                return Err(VzError::Internal("failed to create entropy device".into()));
            }
            Ok(Self { inner: obj })
        }
    }

    /// Consumes the configuration and returns the raw pointer.
    pub fn into_ptr(self) -> *mut AnyObject {
        let ptr = self.inner;
        std::mem::forget(self);
        ptr
    }
}

impl Drop for EntropyDeviceConfiguration {
    fn drop(&mut self) {
        release(self.inner);
    }
}
