//! The run engine: lifecycle controller, signal pump, control socket,
//! chrome bridge and telemetry.

// Off macOS the run command stops at validation, so the controller and its
// event sources are exercised by tests only.
#[cfg(target_os = "macos")]
pub mod assembly;
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
pub mod chrome;
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
pub mod control;
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
pub mod lifecycle;
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
pub mod signals;
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
pub mod telemetry;
