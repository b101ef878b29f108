//! Command-line surface.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

pub mod run;

/// Top-level CLI.
#[derive(Parser)]
#[command(name = "tartlet")]
#[command(author, version, about = "Run engine for macOS and Linux VMs on Apple Silicon")]
pub struct Cli {
    /// Enable debug logging.
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Run a VM until it exits.
    Run(RunArgs),
}

/// Arguments of the run command.
///
/// This is the validated option record the engine consumes; clap reports
/// usage errors itself (exit code 2).
#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// VM name.
    pub name: String,

    /// Open a UI window (the default on interactive sessions).
    #[arg(long)]
    pub graphics: bool,

    /// Run headless, without any UI.
    #[arg(long)]
    pub no_graphics: bool,

    /// Attach a serial console on a freshly allocated PTY.
    #[arg(long)]
    pub serial: bool,

    /// Attach a serial console to the given path instead.
    #[arg(long, value_name = "PATH", conflicts_with = "serial")]
    pub serial_path: Option<PathBuf>,

    /// Disable the audio device.
    #[arg(long)]
    pub no_audio: bool,

    /// Disable clipboard sharing.
    #[arg(long)]
    pub no_clipboard: bool,

    /// Boot a macOS guest into recovery.
    #[arg(long)]
    pub recovery: bool,

    /// Publish the screen over the integrated remote display server.
    #[arg(long)]
    pub vnc: bool,

    /// Publish the screen over the experimental remote display server.
    #[arg(long)]
    pub vnc_experimental: bool,

    /// Attach an additional disk (`<location>[:ro][,sync=…][,caching=…]`);
    /// repeatable.
    #[arg(long = "disk", value_name = "SPEC")]
    pub disks: Vec<String>,

    /// Attach a Rosetta translation share under the given mount tag
    /// (Linux guests only).
    #[arg(long, value_name = "TAG")]
    pub rosetta: Option<String>,

    /// Share a directory (`[name:]<path|URL>[:ro][,tag=…]`); repeatable.
    #[arg(long = "dir", value_name = "SPEC")]
    pub dirs: Vec<String>,

    /// Enable nested virtualization (requires host support).
    #[arg(long)]
    pub nested: bool,

    /// Bridge onto a host interface, or "list" to enumerate them;
    /// repeatable.
    #[arg(long = "net-bridged", value_name = "IFACE")]
    pub net_bridged: Vec<String>,

    /// Route traffic through the isolating packet-filter helper.
    #[arg(long = "net-softnet")]
    pub net_softnet: bool,

    /// CIDRs the filter helper allows (implies --net-softnet).
    #[arg(long = "net-softnet-allow", value_name = "CIDRS")]
    pub net_softnet_allow: Option<String>,

    /// Ports the filter helper exposes (implies --net-softnet).
    #[arg(long = "net-softnet-expose", value_name = "PORTS")]
    pub net_softnet_expose: Option<String>,

    /// Host-only networking through the filter helper.
    #[arg(long = "net-host")]
    pub net_host: bool,

    /// Options for the root disk (`ro[,sync=…][,caching=…]`).
    #[arg(long = "root-disk-opts", value_name = "OPTS")]
    pub root_disk_opts: Option<String>,

    /// Allow suspend-to-disk via SIGUSR1 (macOS guests only).
    #[arg(long)]
    pub suspendable: bool,

    /// Forward system shortcuts to the guest (native UI only).
    #[arg(long = "captures-system-keys")]
    pub captures_system_keys: bool,

    /// Do not attach a trackpad (macOS guests only).
    #[arg(long)]
    pub no_trackpad: bool,
}
