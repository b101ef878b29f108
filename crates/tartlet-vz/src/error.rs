//! Errors surfaced by the Virtualization.framework facade.

use thiserror::Error;

/// Result type alias using [`VzError`].
pub type VzResult<T> = std::result::Result<T, VzError>;

/// `VZErrorVirtualMachineLimitExceeded` in the framework's error domain.
pub const CODE_VM_LIMIT_EXCEEDED: i64 = 4;

/// Errors from the framework or from this facade.
#[derive(Debug, Error)]
pub enum VzError {
    /// A path handed to an attachment does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The configuration is rejected before reaching the framework.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// An operation was attempted in the wrong machine state.
    #[error("invalid machine state: expected {expected}, VM is {actual}")]
    InvalidState {
        /// Required precondition.
        expected: String,
        /// Observed state.
        actual: String,
    },

    /// An asynchronous operation exceeded its bound.
    #[error("timeout: {0}")]
    Timeout(String),

    /// An `NSError` from the framework.
    #[error("{message} (VZError {code})")]
    Framework {
        /// `NSError` code in the framework's domain.
        code: i64,
        /// Localized description.
        message: String,
    },

    /// A required framework class is missing or an allocation failed.
    #[error("framework error: {0}")]
    Internal(String),
}

impl VzError {
    /// Whether the platform's cap of concurrently running VMs was hit.
    #[must_use]
    pub const fn is_vm_limit_exceeded(&self) -> bool {
        matches!(
            self,
            Self::Framework {
                code: CODE_VM_LIMIT_EXCEEDED,
                ..
            }
        )
    }
}
