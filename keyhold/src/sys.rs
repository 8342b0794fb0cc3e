//! Small process-level helpers: wall clock reads and memory locking.

use crate::error::{CResult, Error};

/// Seconds since the Unix epoch.
pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Locks all current and future pages of the process into RAM so raw key
/// material cannot be written to swap. Must be called before any key
/// material enters the process; callers exit with code 111 on failure.
pub fn lock_memory() -> CResult<()> {
    use nix::sys::mman::{mlockall, MlockAllFlags};
    mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE)
        .map_err(|err| Error::Internal(format!("mlockall: {}", err)))
}
