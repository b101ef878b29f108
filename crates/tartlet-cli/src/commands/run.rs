//! The run command: one process, one VM, from directory lock to exit.
//!
//! Ordering is load-bearing here:
//!
//! 1. every option is parsed and validated before any resource exists;
//! 2. the configuration document is read into memory;
//! 3. the home lock covers the MAC collision check (and repair);
//! 4. the VM lock is taken on a fresh descriptor, *then* the home lock is
//!    released;
//! 5. devices are assembled, event sources installed, and only then does
//!    the VM start.

use std::fs::File;
use std::path::PathBuf;

use tracing::warn;

use tartlet_core::config::{GuestOs, VmConfig};
use tartlet_core::disk::{DiskOptions, DiskSpec};
use tartlet_core::error::{EngineError, Result};
use tartlet_core::lock::FileLock;
use tartlet_core::net::{self, NetworkOptions, NetworkPlan, NetworkSelection};
use tartlet_core::share::{self, DirShareSpec};
use tartlet_core::{StorageIndex, VmDirectory};

use crate::engine::chrome::{self, DisplayMode};

use super::RunArgs;

/// Serial console plan.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
pub enum SerialPlan {
    /// No serial console.
    None,
    /// Allocate a fresh PTY and report its path.
    Pty,
    /// Attach to an externally provided path.
    Path(PathBuf),
}

/// Everything the device assembly and the lifecycle controller need,
/// assembled once and then immutable.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
pub struct RunContext {
    pub vm_dir: VmDirectory,
    pub config: VmConfig,
    pub network: NetworkPlan,
    pub disks: Vec<DiskSpec>,
    pub shares: Vec<DirShareSpec>,
    pub serial: SerialPlan,
    pub root_disk: DiskOptions,
    pub display: DisplayMode,
    pub rosetta_tag: Option<String>,
    pub suspendable: bool,
    pub nested: bool,
    pub recovery: bool,
    pub audio: bool,
    pub clipboard: bool,
    pub trackpad: bool,
}

/// Executes the run command.
pub async fn execute(args: RunArgs) -> anyhow::Result<()> {
    // Phase 1: validation, before any resource acquisition.
    let display = chrome::select_display_mode(
        args.graphics,
        args.no_graphics,
        args.vnc,
        args.vnc_experimental,
        args.captures_system_keys,
    )?;
    let disks = args
        .disks
        .iter()
        .map(|spec| DiskSpec::parse(spec))
        .collect::<Result<Vec<_>>>()?;
    let shares = args
        .dirs
        .iter()
        .map(|spec| DirShareSpec::parse(spec))
        .collect::<Result<Vec<_>>>()?;
    share::validate_mount_tags(&shares)?;
    let root_disk = DiskOptions::parse(args.root_disk_opts.as_deref().unwrap_or(""))?;

    let network = match net::select(&NetworkOptions {
        bridged: args.net_bridged.clone(),
        softnet: args.net_softnet,
        softnet_allow: args.net_softnet_allow.clone(),
        softnet_expose: args.net_softnet_expose.clone(),
        host: args.net_host,
    })? {
        NetworkSelection::ListBridgedInterfaces => return list_bridged_interfaces(),
        NetworkSelection::Plan(plan) => plan,
    };

    let serial = if args.serial {
        SerialPlan::Pty
    } else if let Some(path) = &args.serial_path {
        SerialPlan::Path(path.clone())
    } else {
        SerialPlan::None
    };

    // Phase 2: read the configuration document. This happens before the
    // VM lock on purpose; see tartlet_core::lock.
    let index = StorageIndex::open_default()?;
    let vm_dir = index.vm(&args.name);
    vm_dir.validate()?;
    let mut config = vm_dir.config()?;
    config.validate_for_host()?;
    validate_guest_options(&config, &args)?;

    // Phase 3: under the home lock, repair MAC collisions with running
    // peers. The repaired config must be on disk before peers can read it.
    let home_lock = FileLock::exclusive(File::open(index.root())?)?;
    if let Some(peer) = index.running_peer_with_mac(&config.mac_address, vm_dir.name())? {
        println!(
            "MAC address {} is already in use by running VM \"{peer}\", resetting it",
            config.mac_address
        );
        config.regenerate_mac_address();
        vm_dir.save_config(&config)?;
    }

    // Phase 4: the VM lock, on a descriptor that stays open for the whole
    // run. Only then does the home lock go away.
    let _vm_lock = FileLock::try_exclusive(vm_dir.open_config_for_lock()?)?
        .ok_or_else(|| EngineError::VmAlreadyRunning(args.name.clone()))?;
    drop(home_lock);

    let resume = if vm_dir.suspended() {
        if config.os == GuestOs::Darwin {
            true
        } else {
            warn!("ignoring saved state: save/restore requires a macOS guest");
            false
        }
    } else {
        false
    };

    let ctx = RunContext {
        vm_dir,
        config,
        network,
        disks,
        shares,
        serial,
        root_disk,
        display,
        rosetta_tag: args.rosetta.clone(),
        suspendable: args.suspendable,
        nested: args.nested,
        recovery: args.recovery,
        audio: !args.no_audio,
        clipboard: !args.no_clipboard,
        trackpad: !args.no_trackpad,
    };

    run_vm(ctx, index, resume).await
}

/// Guest-class constraints that need the configuration document.
fn validate_guest_options(config: &VmConfig, args: &RunArgs) -> Result<()> {
    if args.suspendable && config.os != GuestOs::Darwin {
        return Err(EngineError::unsupported(
            "suspend-to-disk requires a macOS guest",
        ));
    }
    if args.no_trackpad && config.os != GuestOs::Darwin {
        return Err(EngineError::InvalidOptions(
            "--no-trackpad only applies to macOS guests".into(),
        ));
    }
    if args.recovery && config.os != GuestOs::Darwin {
        return Err(EngineError::InvalidOptions(
            "--recovery only applies to macOS guests".into(),
        ));
    }
    if args.rosetta.is_some() && config.os != GuestOs::Linux {
        return Err(EngineError::InvalidOptions(
            "--rosetta requires a Linux guest".into(),
        ));
    }
    if args.nested {
        if config.os != GuestOs::Linux {
            return Err(EngineError::unsupported(
                "nested virtualization requires a Linux guest",
            ));
        }
        #[cfg(target_os = "macos")]
        if !tartlet_vz::nested_supported() {
            return Err(EngineError::unsupported(
                "nested virtualization is not available on this host",
            ));
        }
    }
    Ok(())
}

#[cfg(target_os = "macos")]
fn list_bridged_interfaces() -> anyhow::Result<()> {
    let interfaces = tartlet_vz::bridged_interface_names();
    if interfaces.is_empty() {
        println!("no bridgeable host interfaces");
    }
    for interface in interfaces {
        println!("{} ({})", interface.identifier, interface.display_name);
    }
    Ok(())
}

#[cfg(not(target_os = "macos"))]
fn list_bridged_interfaces() -> anyhow::Result<()> {
    Err(EngineError::unsupported("enumerating bridgeable interfaces requires a macOS host").into())
}

#[cfg(target_os = "macos")]
async fn run_vm(ctx: RunContext, index: StorageIndex, resume: bool) -> anyhow::Result<()> {
    use crate::engine::telemetry::Telemetry;

    if !tartlet_vz::is_supported() {
        return Err(EngineError::unsupported("virtualization is not available on this host").into());
    }

    match run_locked(&ctx, &index, resume).await {
        Ok(_outcome) => Ok(()),
        Err(err) => {
            // Best-effort: the report must never change the exit path.
            let telemetry = Telemetry::new();
            telemetry.capture_error(&err);
            telemetry.flush().await;
            Err(err.into())
        }
    }
}

/// The post-lock phase: assemble, install event sources, run to exit,
/// release everything.
///
/// The resource bag outlives every fallible step in here, so the filter
/// helper gets its graceful termination no matter where the run fails.
#[cfg(target_os = "macos")]
async fn run_locked(
    ctx: &RunContext,
    index: &StorageIndex,
    resume: bool,
) -> Result<crate::engine::lifecycle::RunOutcome> {
    use tokio_util::sync::CancellationToken;

    use crate::engine::assembly::{self, AssembledVm};

    let AssembledVm {
        machine,
        resources,
        serial_pty,
    } = assembly::assemble(ctx, index).await?;

    let shutdown = CancellationToken::new();
    let result = drive_machine(ctx, index, resume, machine, serial_pty, &shutdown).await;

    shutdown.cancel();
    resources.release().await;
    result
}

/// Installs the event sources and runs the machine to its exit.
#[cfg(target_os = "macos")]
async fn drive_machine(
    ctx: &RunContext,
    index: &StorageIndex,
    resume: bool,
    machine: tartlet_vz::VirtualMachine,
    serial_pty: Option<PathBuf>,
    shutdown: &tokio_util::sync::CancellationToken,
) -> Result<crate::engine::lifecycle::RunOutcome> {
    use std::sync::Arc;

    use crate::engine::assembly::VzMachine;
    use crate::engine::lifecycle::{self, LifecycleController};
    use crate::engine::{control, signals};

    if let Some(path) = &serial_pty {
        println!("Serial console on {}", path.display());
    }

    let (events, rx) = lifecycle::event_channel();

    // The control socket is best-effort: a bind failure is logged and the
    // run proceeds without out-of-band commands.
    let _control = control::ControlSocket::bind(
        &ctx.vm_dir.control_socket_path(),
        events.clone(),
        shutdown.clone(),
    )
    .map_err(|err| warn!(error = %err, "control socket unavailable"))
    .ok();

    // Installed after the devices are fully configured and before start:
    // from here on SIGUSR1/SIGUSR2 are lifecycle events, not terminations.
    signals::spawn(events.clone(), shutdown.clone())?;

    let peers = {
        let index = index.clone();
        let name = ctx.vm_dir.name().to_string();
        Box::new(move || index.running_peer_names(&name))
    };
    let mut controller = LifecycleController::new(
        Arc::new(VzMachine::new(machine)),
        ctx.vm_dir.state_path(),
        ctx.suspendable,
        ctx.recovery,
        peers,
    );
    if let DisplayMode::Vnc { .. } = ctx.display {
        let bridged = matches!(ctx.network, NetworkPlan::Bridged(_));
        controller = controller.on_started(move || {
            let host = chrome::reachable_host(bridged);
            chrome::publish_vnc_url(&chrome::vnc_url(&host, 5900, None));
        });
    }

    controller.run(resume, rx).await
}

#[cfg(not(target_os = "macos"))]
async fn run_vm(_ctx: RunContext, _index: StorageIndex, _resume: bool) -> anyhow::Result<()> {
    Err(EngineError::unsupported("running VMs requires a macOS host").into())
}
