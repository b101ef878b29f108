/// File descriptor number on which the packet-filter helper receives its end
/// of the data-plane socketpair.
pub const DATA_PLANE_FD: i32 = 3;

/// Default packet-filter helper binary name, resolved on `PATH`.
pub const SOFTNET_BINARY_NAME: &str = "softnet";
