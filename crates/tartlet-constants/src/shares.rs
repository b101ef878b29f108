/// Mount tag used for directory shares when the spec does not name one.
///
/// Guests running a stock configuration auto-mount this tag, so it has to
/// match what the guest agents expect.
pub const DEFAULT_MOUNT_TAG: &str = "com.apple.virtio-fs.automount";

/// Mount tag of the Rosetta translation share (Linux guests).
pub const ROSETTA_DEFAULT_TAG: &str = "rosetta";
