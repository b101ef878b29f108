//! Per-VM directory layout. These names are contractual: other tools in the
//! fleet read and write the same files.

/// VM configuration document; also the target of the per-VM advisory lock.
pub const CONFIG_FILE: &str = "config.json";

/// Root disk image.
pub const DISK_FILE: &str = "disk.img";

/// Non-volatile RAM blob (macOS auxiliary storage / EFI variable store).
pub const NVRAM_FILE: &str = "nvram.bin";

/// Saved machine state; present iff the VM is suspended.
pub const STATE_FILE: &str = "state.bin";

/// Control socket accepting out-of-band lifecycle commands.
pub const CONTROL_SOCKET: &str = "sock";

/// Default VM home directory under `$HOME` when the environment does not
/// override it.
pub const DEFAULT_HOME_DIR: &str = ".tartlet";
