//! Stable exit codes for `aste` commands.

/// Task finished without errors (failed tests alone do not change this).
pub const OK: i32 = 0;
/// Bad invocation: unreadable or invalid config, unknown task.
pub const INVALID: i32 = 10;
/// The run stopped on an infrastructure or unexpected error.
pub const ERROR: i32 = 100;
/// The run stopped on a build error.
pub const BUILD_ERROR: i32 = 200;
