//! Stable exit codes for devflow CLI commands.

/// Command succeeded.
pub const OK: i32 = 0;
/// Command failed; the fault category is printed on stderr.
pub const FAULT: i32 = 1;
