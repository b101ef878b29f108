//! Process exit codes of the run engine.

/// Normal VM exit.
pub const EXIT_OK: i32 = 0;

/// Engine error; the message is written to standard error.
pub const EXIT_FAILURE: i32 = 1;

/// Invalid command-line usage (reported by the argument parser).
pub const EXIT_USAGE: i32 = 2;
