//! Stable exit codes for compat-runner CLI commands.

/// Every leaf landed where the expectations put it (merged PASS or XFAIL).
pub const OK: i32 = 0;
/// Unexpected failures or stale expectations (merged FAIL or UPASS), or the
/// run aborted on a configuration error.
pub const FAILED: i32 = 1;
