/// Environment variable overriding the VM home directory.
///
/// Kept under the historical name for on-disk compatibility with the
/// existing fleet.
pub const VM_HOME: &str = "TART_HOME";

/// Environment variable overriding the packet-filter helper binary path.
pub const SOFTNET_BINARY: &str = "TARTLET_SOFTNET_BINARY";
