//! Engine error taxonomy.

use std::path::PathBuf;

use tartlet_error::CommonError;
use thiserror::Error;

/// Result type alias using [`EngineError`].
pub type Result<T> = std::result::Result<T, EngineError>;

/// Why opening a block device failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDeviceCause {
    /// The device is exclusively opened by another process.
    Busy,
    /// The engine lacks permission to open the device node.
    AccessDenied,
    /// Any other reason; see the wrapped message.
    Other,
}

impl std::fmt::Display for BlockDeviceCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Busy => write!(f, "device is busy"),
            Self::AccessDenied => write!(f, "access denied"),
            Self::Other => write!(f, "open failed"),
        }
    }
}

/// Errors raised by the run engine.
///
/// Validation errors (`InvalidOptions`, `InvalidSpec`, `ArchMismatch`,
/// configuration problems) are raised before any resource acquisition.
/// Everything after lock acquisition is reported on stderr and exits the
/// process with code 1.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Shared error vocabulary (I/O, unsupported capability, timeouts, …).
    #[error(transparent)]
    Common(#[from] CommonError),

    /// Mutually exclusive flags or unknown option tokens.
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// Malformed disk or directory-share specification.
    #[error("invalid specification: {0}")]
    InvalidSpec(String),

    /// Obviously wrong-architecture media.
    #[error("wrong architecture: {0}")]
    ArchMismatch(String),

    /// The named VM directory does not exist.
    #[error("VM \"{0}\" not found")]
    VmNotFound(String),

    /// The per-VM lock is held by another process.
    #[error("VM \"{0}\" is already running")]
    VmAlreadyRunning(String),

    /// Inconsistent configuration values.
    #[error("VM configuration error: {0}")]
    VmConfiguration(String),

    /// A block device could not be opened.
    #[error("failed to open block device {}: {cause}", .path.display())]
    FailedToOpenBlockDevice {
        /// Device node path.
        path: PathBuf,
        /// Classified cause.
        cause: BlockDeviceCause,
    },

    /// A writable attach was attempted on a locked local image.
    #[error(
        "disk {} is already in use, pass it as read-only or stop the VM using it",
        .0.display()
    )]
    DiskAlreadyInUse(PathBuf),

    /// The platform's running-VM cap was reached.
    #[error("virtual machine limit exceeded{}", fmt_peers(.peers))]
    VirtualMachineLimitExceeded {
        /// Names of other running VMs, best-effort.
        peers: Vec<String>,
    },

    /// Any failure during the pause/save suspend sequence.
    #[error("failed to suspend VM: {0}")]
    SuspendFailed(String),

    /// No matching bridged host interface.
    #[error("bridged network error: {0}")]
    Bridge(String),
}

impl EngineError {
    /// Shorthand for an unsupported-capability error.
    #[must_use]
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Common(CommonError::unsupported(msg))
    }

    /// Shorthand for an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Common(CommonError::internal(msg))
    }

    /// Returns true if this error names a capability the host lacks.
    #[must_use]
    pub const fn is_unsupported(&self) -> bool {
        matches!(self, Self::Common(CommonError::Unsupported(_)))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        Self::Common(CommonError::Io(err))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::VmConfiguration(err.to_string())
    }
}

fn fmt_peers(peers: &[String]) -> String {
    if peers.is_empty() {
        String::new()
    } else {
        format!(", run \"tartlet stop\" on one of: {}", peers.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_exceeded_lists_peers() {
        let err = EngineError::VirtualMachineLimitExceeded {
            peers: vec!["sonoma".into(), "jammy".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("virtual machine limit exceeded"));
        assert!(msg.contains("sonoma, jammy"));
    }

    #[test]
    fn test_limit_exceeded_without_peers() {
        let err = EngineError::VirtualMachineLimitExceeded { peers: vec![] };
        assert_eq!(err.to_string(), "virtual machine limit exceeded");
    }

    #[test]
    fn test_block_device_cause_display() {
        let err = EngineError::FailedToOpenBlockDevice {
            path: PathBuf::from("/dev/disk4"),
            cause: BlockDeviceCause::Busy,
        };
        assert_eq!(
            err.to_string(),
            "failed to open block device /dev/disk4: device is busy"
        );
    }

    #[test]
    fn test_unsupported_shorthand() {
        let err = EngineError::unsupported("nested virtualization");
        assert!(err.is_unsupported());
    }
}
