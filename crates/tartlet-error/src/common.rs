//! Common error variants shared across the tartlet crates.

use thiserror::Error;

/// Errors that occur across multiple tartlet crates.
///
/// Crate-specific errors should wrap this type using the `#[from]`
/// attribute rather than redefining these variants.
#[derive(Debug, Error)]
pub enum CommonError {
    /// I/O error from the standard library.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or inconsistent configuration values.
    #[error("configuration error: {0}")]
    Config(String),

    /// A requested resource (VM directory, disk image, helper binary, …)
    /// does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An operation was attempted on a resource that is not in a valid
    /// state for it.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The host platform lacks a required capability.
    #[error("unsupported on this host: {0}")]
    Unsupported(String),

    /// Operation exceeded its allowed time limit.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Unexpected internal error; the message carries debugging context.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CommonError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Creates a new not found error.
    #[must_use]
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound(resource.into())
    }

    /// Creates a new invalid state error.
    #[must_use]
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Creates a new unsupported-capability error.
    #[must_use]
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    /// Creates a new timeout error.
    #[must_use]
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    /// Creates a new internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns true if this is a not found error.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns true if this is an unsupported-capability error.
    #[must_use]
    pub const fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err: CommonError = io_err.into();
        assert!(err.to_string().contains("I/O error"));
    }

    #[test]
    fn test_not_found() {
        let err = CommonError::not_found("VM \"ventura\"");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "not found: VM \"ventura\"");
    }

    #[test]
    fn test_unsupported() {
        let err = CommonError::unsupported("nested virtualization");
        assert!(err.is_unsupported());
        assert_eq!(
            err.to_string(),
            "unsupported on this host: nested virtualization"
        );
    }

    #[test]
    fn test_config() {
        let err = CommonError::config("memory size below platform minimum");
        assert_eq!(
            err.to_string(),
            "configuration error: memory size below platform minimum"
        );
    }
}
