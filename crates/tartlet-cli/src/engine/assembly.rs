//! Device assembly: from the configuration document plus the parsed plans
//! to a complete hardware configuration.
//!
//! Assembly also owns every OS resource the devices borrow: PTY
//! descriptors, block device descriptors, cloned disk directories, fetched
//! archives and the filter helper subprocess all live in the
//! [`ResourceBag`], released on every exit path — by `assemble` itself when
//! assembly fails partway, by the run command once the machine exits.

use std::collections::HashMap;
use std::fs::File;
use std::io::IsTerminal;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::{debug, info};

use tartlet_core::archive::FetchedArchive;
use tartlet_core::config::GuestOs;
use tartlet_core::disk::{CachingMode, DiskSource, DiskSpec, SyncMode};
use tartlet_core::error::{BlockDeviceCause, EngineError, Result};
use tartlet_core::lock::{self, FileLock};
use tartlet_core::net::NetworkPlan;
use tartlet_core::share::{DirShareSpec, ShareSource};
use tartlet_core::softnet::{self, FilterHelper};
use tartlet_core::{ImageRef, StorageIndex};
use tartlet_vz as vz;

use super::chrome::DisplayMode;
use super::lifecycle::MachineHandle;
use crate::commands::run::{RunContext, SerialPlan};

/// Pixel density reported for macOS guest displays.
const MAC_DISPLAY_PPI: u32 = 80;

/// Dial timeout for network block device exports, in seconds.
const NBD_TIMEOUT_SECS: f64 = 10.0;

/// A remote image cloned into an engine-owned directory.
///
/// The clone is the attachment target; dropping it unlinks the directory,
/// so garbage collection happens on every exit path.
struct ClonedDisk {
    path: PathBuf,
    _lock: FileLock,
    _dir: tempfile::TempDir,
}

/// OS resources borrowed by the assembled devices.
///
/// Descriptors handed to device attachments (PTY ends, block devices, the
/// filter data plane) are only *borrowed* by the framework, so they live
/// here for the machine's lifetime.
#[derive(Default)]
pub struct ResourceBag {
    fds: Vec<OwnedFd>,
    block_device_files: Vec<File>,
    cloned_disks: Vec<ClonedDisk>,
    archives: Vec<FetchedArchive>,
    filter_helper: Option<FilterHelper>,
}

impl ResourceBag {
    /// Releases everything with an ordered teardown: the helper gets its
    /// termination signal first, file descriptors and temp directories go
    /// with the drop.
    pub async fn release(mut self) {
        if let Some(helper) = self.filter_helper.take() {
            helper.terminate().await;
        }
    }
}

/// The built machine plus everything it borrows.
pub struct AssembledVm {
    /// The configured, not yet started machine.
    pub machine: vz::VirtualMachine,
    /// Resources to release after the machine exits.
    pub resources: ResourceBag,
    /// Path of the allocated serial PTY, when `--serial` asked for one.
    pub serial_pty: Option<PathBuf>,
}

/// Builds the complete hardware configuration for `ctx`.
///
/// On failure everything acquired so far is released before the error
/// propagates, so a fetch or device error after the filter helper spawned
/// still terminates the helper gracefully.
pub async fn assemble(ctx: &RunContext, index: &StorageIndex) -> Result<AssembledVm> {
    let mut resources = ResourceBag::default();
    match build_machine(ctx, index, &mut resources).await {
        Ok((machine, serial_pty)) => Ok(AssembledVm {
            machine,
            resources,
            serial_pty,
        }),
        Err(err) => {
            resources.release().await;
            Err(err)
        }
    }
}

async fn build_machine(
    ctx: &RunContext,
    index: &StorageIndex,
    resources: &mut ResourceBag,
) -> Result<(vz::VirtualMachine, Option<PathBuf>)> {
    let config = &ctx.config;
    let mut vzc = vz::VmConfiguration::new().map_err(map_vz)?;

    vzc.set_cpu_count(config.cpu_count);
    vzc.set_memory_size(config.memory_size);

    match config.os {
        GuestOs::Darwin => {
            let hardware_model = decode_identity_blob(config.hardware_model.as_deref(), "hardwareModel")?;
            let ecid = decode_identity_blob(config.ecid.as_deref(), "ecid")?;
            let platform =
                vz::MacPlatform::new(&hardware_model, &ecid, &ctx.vm_dir.nvram_path())
                    .map_err(map_vz)?;
            vzc.set_platform(platform);
            vzc.set_boot_loader(vz::MacOsBootLoader::new().map_err(map_vz)?);
        }
        GuestOs::Linux => {
            let mut platform = vz::GenericPlatform::new().map_err(map_vz)?;
            platform.set_nested(ctx.nested);
            vzc.set_platform(platform);
            vzc.set_boot_loader(vz::EfiBootLoader::new(ctx.vm_dir.nvram_path()).map_err(map_vz)?);
        }
    }

    // Root disk first, then the additional disks in argument order.
    let root = DiskSpec {
        source: DiskSource::Image(ctx.vm_dir.disk_path()),
        read_only: ctx.root_disk.read_only,
        sync: ctx.root_disk.sync,
        caching: ctx.root_disk.caching,
    };
    for spec in std::iter::once(&root).chain(ctx.disks.iter()) {
        let attachment = attach_disk(spec, index, resources).await?;
        vzc.add_storage_device(
            vz::StorageDeviceConfiguration::virtio(attachment).map_err(map_vz)?,
        );
    }

    attach_network(&mut vzc, ctx, resources)?;

    let serial_pty = attach_serial(&mut vzc, &ctx.serial, resources)?;

    attach_directory_shares(&mut vzc, &ctx.shares, resources).await?;
    if let Some(tag) = &ctx.rosetta_tag {
        if !vz::rosetta_share_available() {
            return Err(EngineError::unsupported(
                "Rosetta translation is not installed on this host",
            ));
        }
        vzc.add_directory_share(vz::DirectoryShareDevice::rosetta(tag).map_err(map_vz)?);
    }

    if ctx.display != DisplayMode::Headless {
        let graphics = match config.os {
            GuestOs::Darwin => vz::GraphicsDeviceConfiguration::mac(
                config.display.width,
                config.display.height,
                MAC_DISPLAY_PPI,
            ),
            GuestOs::Linux => {
                vz::GraphicsDeviceConfiguration::virtio(config.display.width, config.display.height)
            }
        };
        vzc.add_graphics_device(graphics.map_err(map_vz)?);
    }

    vzc.add_keyboard(vz::KeyboardConfiguration::usb().map_err(map_vz)?);
    let pointing = match (config.os, ctx.trackpad) {
        (GuestOs::Darwin, true) => vz::PointingDeviceConfiguration::mac_trackpad(),
        _ => vz::PointingDeviceConfiguration::usb_screen_coordinate(),
    };
    vzc.add_pointing_device(pointing.map_err(map_vz)?);

    if ctx.audio {
        vzc.add_audio_device(vz::AudioDeviceConfiguration::host_input_output().map_err(map_vz)?);
    }
    if ctx.clipboard {
        vzc.add_console_device(
            vz::ClipboardDeviceConfiguration::spice_agent().map_err(map_vz)?,
        );
    }
    vzc.add_entropy_device(vz::EntropyDeviceConfiguration::virtio().map_err(map_vz)?);

    let machine = vzc.build().map_err(map_vz)?;
    Ok((machine, serial_pty))
}

fn decode_identity_blob(blob: Option<&str>, field: &str) -> Result<Vec<u8>> {
    let blob = blob.ok_or_else(|| {
        EngineError::VmConfiguration(format!("macOS guest config is missing \"{field}\""))
    })?;
    BASE64.decode(blob).map_err(|err| {
        EngineError::VmConfiguration(format!("\"{field}\" is not valid base64: {err}"))
    })
}

async fn attach_disk(
    spec: &DiskSpec,
    index: &StorageIndex,
    resources: &mut ResourceBag,
) -> Result<vz::StorageAttachment> {
    let caching = map_caching(spec.caching);
    let sync = map_sync(spec.sync);
    match &spec.source {
        DiskSource::Image(path) => {
            if !spec.read_only && lock::is_locked_elsewhere(path) {
                return Err(EngineError::DiskAlreadyInUse(path.clone()));
            }
            vz::StorageAttachment::disk_image(path, spec.read_only, caching, sync).map_err(map_vz)
        }
        DiskSource::BlockDevice(path) => {
            let file = File::options()
                .read(true)
                .write(!spec.read_only)
                .open(path)
                .map_err(|err| {
                    let cause = match err.raw_os_error().map(nix::errno::Errno::from_raw) {
                        Some(nix::errno::Errno::EBUSY) => BlockDeviceCause::Busy,
                        Some(nix::errno::Errno::EACCES) => BlockDeviceCause::AccessDenied,
                        _ => BlockDeviceCause::Other,
                    };
                    EngineError::FailedToOpenBlockDevice {
                        path: path.clone(),
                        cause,
                    }
                })?;
            let attachment =
                vz::StorageAttachment::block_device(file.as_raw_fd(), spec.read_only, sync)
                    .map_err(map_vz)?;
            resources.block_device_files.push(file);
            Ok(attachment)
        }
        DiskSource::Nbd(url) => {
            vz::StorageAttachment::network_block_device(url, spec.read_only, sync, NBD_TIMEOUT_SECS)
                .map_err(map_vz)
        }
        DiskSource::Remote(image) => {
            let clone = clone_remote_disk(index, image)?;
            let attachment =
                vz::StorageAttachment::disk_image(&clone.path, spec.read_only, caching, sync)
                    .map_err(map_vz)?;
            resources.cloned_disks.push(clone);
            Ok(attachment)
        }
    }
}

/// Clones a pulled image's disk into an engine-owned temporary directory.
///
/// The clone, not the cache copy, is attached; it is locked for the run
/// and unlinked when the bag drops.
fn clone_remote_disk(index: &StorageIndex, image: &ImageRef) -> Result<ClonedDisk> {
    let source = index.cached_image_dir(image).join(tartlet_constants::layout::DISK_FILE);
    if !source.is_file() {
        return Err(EngineError::Common(tartlet_error::CommonError::not_found(
            format!("image {image} (pull it first)"),
        )));
    }

    let dir = tempfile::Builder::new().prefix("tartlet-clone-").tempdir()?;
    let path = dir.path().join(tartlet_constants::layout::DISK_FILE);
    // copyfile clones on APFS, so this is cheap for same-volume caches.
    std::fs::copy(&source, &path)?;
    info!(image = %image, clone = %path.display(), "cloned remote image disk");

    let lock = FileLock::try_exclusive(File::open(&path)?)?
        .ok_or_else(|| EngineError::DiskAlreadyInUse(path.clone()))?;
    Ok(ClonedDisk {
        path,
        _lock: lock,
        _dir: dir,
    })
}

fn attach_network(
    vzc: &mut vz::VmConfiguration,
    ctx: &RunContext,
    resources: &mut ResourceBag,
) -> Result<()> {
    let mac = ctx.config.normalized_mac();
    match &ctx.network {
        NetworkPlan::Shared => {
            let attachment = vz::NetworkAttachment::nat().map_err(map_vz)?;
            vzc.add_network_device(
                vz::NetworkDeviceConfiguration::virtio(attachment, &mac).map_err(map_vz)?,
            );
        }
        NetworkPlan::Bridged(interfaces) => {
            for (i, interface) in interfaces.iter().enumerate() {
                let attachment = vz::NetworkAttachment::bridged(interface)
                    .map_err(|err| EngineError::Bridge(err.to_string()))?;
                // Only the first device can carry the configured MAC.
                let device_mac = if i == 0 {
                    mac.clone()
                } else {
                    tartlet_core::config::generate_mac_address()
                };
                vzc.add_network_device(
                    vz::NetworkDeviceConfiguration::virtio(attachment, &device_mac)
                        .map_err(map_vz)?,
                );
            }
        }
        NetworkPlan::Softnet(args) | NetworkPlan::Host(args) => {
            let binary = softnet::resolve_binary()?;
            softnet::ensure_setuid(&binary, std::io::stdin().is_terminal());
            let mut helper = FilterHelper::spawn(&binary, &mac, args)?;
            let fd = helper
                .take_data_fd()
                .ok_or_else(|| EngineError::internal("filter helper data plane missing"))?;
            let attachment =
                vz::NetworkAttachment::file_handle(fd.as_raw_fd()).map_err(map_vz)?;
            vzc.add_network_device(
                vz::NetworkDeviceConfiguration::virtio(attachment, &mac).map_err(map_vz)?,
            );
            resources.fds.push(fd);
            resources.filter_helper = Some(helper);
        }
    }
    Ok(())
}

fn attach_serial(
    vzc: &mut vz::VmConfiguration,
    plan: &SerialPlan,
    resources: &mut ResourceBag,
) -> Result<Option<PathBuf>> {
    match plan {
        SerialPlan::None => Ok(None),
        SerialPlan::Pty => {
            let pty = nix::pty::openpty(None, None)
                .map_err(|errno| EngineError::internal(format!("openpty failed: {errno}")))?;
            let path = nix::unistd::ttyname(&pty.slave)
                .map_err(|errno| EngineError::internal(format!("ttyname failed: {errno}")))?;
            let port = vz::SerialPortConfiguration::with_fds(
                pty.master.as_raw_fd(),
                pty.master.as_raw_fd(),
            )
            .map_err(map_vz)?;
            vzc.add_serial_port(port);
            debug!(path = %path.display(), "serial PTY allocated");
            // Both ends stay open for the VM's lifetime; the user attaches
            // to the slave path.
            resources.fds.push(pty.master);
            resources.fds.push(pty.slave);
            Ok(Some(path))
        }
        SerialPlan::Path(path) => {
            let file = File::options()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)?;
            let port =
                vz::SerialPortConfiguration::with_fds(file.as_raw_fd(), file.as_raw_fd())
                    .map_err(map_vz)?;
            vzc.add_serial_port(port);
            resources.fds.push(file.into());
            Ok(None)
        }
    }
}

async fn attach_directory_shares(
    vzc: &mut vz::VmConfiguration,
    shares: &[DirShareSpec],
    resources: &mut ResourceBag,
) -> Result<()> {
    // Group by mount tag, preserving the order tags first appear in.
    let mut order: Vec<&str> = Vec::new();
    let mut by_tag: HashMap<&str, Vec<&DirShareSpec>> = HashMap::new();
    for share in shares {
        if !by_tag.contains_key(share.mount_tag.as_str()) {
            order.push(&share.mount_tag);
        }
        by_tag.entry(&share.mount_tag).or_default().push(share);
    }

    for tag in order {
        let group = &by_tag[tag];
        if let [single] = group.as_slice() {
            if single.name.is_none() {
                let dir = materialize(single, resources).await?;
                vzc.add_directory_share(
                    vz::DirectoryShareDevice::single(tag, dir).map_err(map_vz)?,
                );
                continue;
            }
        }
        let mut entries = Vec::with_capacity(group.len());
        for share in group {
            let name = share
                .name
                .clone()
                .expect("validated: grouped shares are named");
            entries.push((name, materialize(share, resources).await?));
        }
        vzc.add_directory_share(
            vz::DirectoryShareDevice::multiple(tag, entries).map_err(map_vz)?,
        );
    }
    Ok(())
}

/// Resolves a share source to a host directory, fetching archives.
async fn materialize(
    share: &DirShareSpec,
    resources: &mut ResourceBag,
) -> Result<vz::SharedDirectory> {
    match &share.source {
        ShareSource::Path(path) => {
            vz::SharedDirectory::new(path, share.read_only).map_err(map_vz)
        }
        ShareSource::Url(url) => {
            let archive = tartlet_core::archive::fetch(url).await?;
            let dir = vz::SharedDirectory::new(archive.path(), share.read_only).map_err(map_vz)?;
            resources.archives.push(archive);
            Ok(dir)
        }
    }
}

const fn map_caching(mode: CachingMode) -> vz::DiskCaching {
    match mode {
        CachingMode::Automatic => vz::DiskCaching::Automatic,
        CachingMode::Cached => vz::DiskCaching::Cached,
        CachingMode::Uncached => vz::DiskCaching::Uncached,
    }
}

const fn map_sync(mode: SyncMode) -> vz::DiskSync {
    match mode {
        SyncMode::Full => vz::DiskSync::Full,
        SyncMode::Fsync => vz::DiskSync::Fsync,
        SyncMode::None => vz::DiskSync::None,
    }
}

/// Maps facade errors onto the engine taxonomy.
pub fn map_vz(err: vz::VzError) -> EngineError {
    if err.is_vm_limit_exceeded() {
        return EngineError::VirtualMachineLimitExceeded { peers: vec![] };
    }
    match err {
        vz::VzError::NotFound(what) => {
            EngineError::Common(tartlet_error::CommonError::not_found(what))
        }
        other => EngineError::VmConfiguration(other.to_string()),
    }
}

// ============================================================================
// MachineHandle adapter
// ============================================================================

/// [`MachineHandle`] over the framework VM.
pub struct VzMachine {
    inner: vz::VirtualMachine,
}

impl VzMachine {
    /// Wraps a built machine.
    #[must_use]
    pub fn new(inner: vz::VirtualMachine) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl MachineHandle for VzMachine {
    async fn start(&self, recovery: bool) -> Result<()> {
        self.inner
            .start(vz::StartOptions { recovery })
            .await
            .map_err(map_vz)
    }

    async fn resume(&self) -> Result<()> {
        self.inner.resume().await.map_err(map_vz)
    }

    async fn restore_state(&self, path: &std::path::Path) -> Result<()> {
        self.inner.restore_machine_state(path).await.map_err(map_vz)
    }

    async fn stop(&self) -> Result<()> {
        self.inner.stop().await.map_err(map_vz)
    }

    fn request_stop(&self) -> Result<()> {
        self.inner.request_stop().map_err(map_vz)
    }

    async fn pause(&self) -> Result<()> {
        self.inner.pause().await.map_err(map_vz)
    }

    async fn save_state(&self, path: &std::path::Path) -> Result<()> {
        self.inner.save_machine_state(path).await.map_err(map_vz)
    }

    async fn wait_until_stopped(&self) -> Result<()> {
        self.inner.wait_until_stopped().await.map_err(map_vz)
    }
}
