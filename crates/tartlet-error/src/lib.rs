//! Common error types for tartlet.
//!
//! Crate-specific error enums wrap [`CommonError`] with `#[from]` so that
//! I/O and other cross-cutting failures keep one display form everywhere:
//!
//! ```rust,ignore
//! use tartlet_error::CommonError;
//! use thiserror::Error;
//!
//! #[derive(Debug, Error)]
//! pub enum MyError {
//!     #[error(transparent)]
//!     Common(#[from] CommonError),
//!
//!     #[error("my specific error: {0}")]
//!     Specific(String),
//! }
//! ```

mod common;

pub use common::CommonError;

/// Result type alias using `CommonError`.
pub type Result<T> = std::result::Result<T, CommonError>;
