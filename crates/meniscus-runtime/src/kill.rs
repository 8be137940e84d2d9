//! Cooperative kill switch.
//!
//! An operator stops a run by dropping a zero-byte file named `kill`
//! into the run's *base* directory (not the numbered run directory).
//! Once per step every rank tests for the sentinel and the observation
//! count is sum-reduced: the group stops iff at least one rank saw the
//! file. The decision comes from the reduction, never from per-rank
//! filesystem polling; cross-rank filesystem visibility is not trusted
//! for control flow. The root clears the sentinel exactly once.

use std::path::Path;

use tracing::info;

use crate::comm::{Communicator, ReduceOp};
use crate::error::Result;

/// Sentinel file name an operator creates to request shutdown.
pub const KILL_FILE: &str = "kill";

/// Collectively decide whether the operator requested a stop.
///
/// Returns the same value on every rank. When it returns `true` the
/// caller is expected to write one final checkpoint before leaving the
/// time loop.
pub fn check_kill(comm: &dyn Communicator, run_base: &Path) -> Result<bool> {
    let sentinel = run_base.join(KILL_FILE);
    let seen = u64::from(sentinel.exists());
    let seen_anywhere = comm.all_reduce_u64(seen, ReduceOp::Sum);
    if seen_anywhere == 0 {
        return Ok(false);
    }
    if comm.is_root() {
        if sentinel.exists() {
            std::fs::remove_file(&sentinel)?;
        }
        info!(path = %sentinel.display(), "kill sentinel found, stopping simulation");
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{GroupComm, SoloComm};
    use tempfile::tempdir;

    #[test]
    fn test_no_sentinel_no_stop() {
        let dir = tempdir().unwrap();
        assert!(!check_kill(&SoloComm, dir.path()).unwrap());
    }

    #[test]
    fn test_sentinel_is_consumed_exactly_once() {
        let dir = tempdir().unwrap();
        let sentinel = dir.path().join(KILL_FILE);
        std::fs::write(&sentinel, b"").unwrap();

        assert!(check_kill(&SoloComm, dir.path()).unwrap());
        assert!(!sentinel.exists(), "root must clear the sentinel");
        assert!(!check_kill(&SoloComm, dir.path()).unwrap());
    }

    #[test]
    fn test_whole_group_stops_together() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(KILL_FILE), b"").unwrap();

        let comms = GroupComm::group(4);
        let base = dir.path();
        std::thread::scope(|scope| {
            for comm in &comms {
                scope.spawn(move || {
                    assert!(check_kill(comm, base).unwrap());
                });
            }
        });
        assert!(!base.join(KILL_FILE).exists());
    }
}
