//! Versioned run-directory allocation.
//!
//! Each simulation attempt gets its own numbered directory under the
//! base output path, with four fixed children:
//!
//! ```text
//! <base>/<version>/
//!     Timeseries/   per-field snapshot series + index documents
//!     Statistics/   reduced scalar output
//!     Settings/     parameter dumps, tagged by starting step
//!     Checkpoint/   the rotating parameters/fields pair
//! ```
//!
//! The version number is `max(numeric children) + 1`, computed once by
//! the root rank and broadcast to the group; no other rank looks at
//! the directory listing, so the protocol carries no assumption about
//! how quickly one rank's directory creation becomes visible to
//! another. Non-numeric children (editor droppings, operator notes) are
//! ignored. Restarts do not allocate: the run directory is derived from
//! the restart path by stripping its trailing `Checkpoint` segment.

use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::info;

use crate::comm::Communicator;
use crate::error::Result;
use crate::mesh::Mesh;
use crate::params::{dump_parameters, RunParameters};
use crate::timeseries::SnapshotSeries;

/// Snapshot series and index documents.
pub const TIMESERIES_DIR: &str = "Timeseries";

/// Reduced scalar output.
pub const STATISTICS_DIR: &str = "Statistics";

/// Parameter dumps.
pub const SETTINGS_DIR: &str = "Settings";

/// The rotating checkpoint pair.
pub const CHECKPOINT_DIR: &str = "Checkpoint";

/// Next free version number under `base`: one past the largest
/// purely-numeric child name, starting at 1.
///
/// Root-only helper; the result is broadcast by
/// [`create_run_directory`].
pub fn next_version(base: &Path) -> Result<u64> {
    let mut newest = 0u64;
    for entry in fs::read_dir(base)? {
        let entry = entry?;
        if let Some(version) = entry.file_name().to_str().and_then(|name| name.parse().ok()) {
            newest = newest.max(version);
        }
    }
    Ok(newest + 1)
}

/// Run directory a restart path points into.
///
/// Restart paths conventionally name the `Checkpoint` child; the run
/// directory is its parent. A path that already names the run
/// directory passes through unchanged.
pub fn resolve_restart_run_dir(restart: &Path) -> PathBuf {
    if restart.file_name() == Some(OsStr::new(CHECKPOINT_DIR)) {
        restart.parent().unwrap_or(restart).to_path_buf()
    } else {
        restart.to_path_buf()
    }
}

/// Allocate (or resume) the run directory and open the snapshot series.
///
/// Fresh runs: the root computes the next version, broadcasts it, and
/// creates the tree; barriers fence the creation so no rank proceeds
/// into a tree that does not exist yet. Restarts resume into the same
/// numbered directory (no new version) but still open *fresh* series
/// files tagged with the current step count.
///
/// Directory creation is idempotent (`create_dir_all`); a root-side
/// failure (permissions, disk full) propagates immediately; there is
/// no partial-tree recovery.
pub fn create_run_directory(
    comm: &Arc<dyn Communicator>,
    base: &Path,
    restart: Option<&Path>,
    fields: &[String],
    tstep: u64,
    mesh: &Mesh,
    params: &RunParameters,
) -> Result<(PathBuf, IndexMap<String, SnapshotSeries>)> {
    if comm.is_root() {
        info!(base = %base.display(), "creating run folders");
        fs::create_dir_all(base)?;
    }
    comm.barrier();

    let run_path = match restart {
        Some(restart) => resolve_restart_run_dir(restart),
        None => {
            let proposed = if comm.is_root() { next_version(base)? } else { 0 };
            let version = comm.broadcast_u64(proposed);
            base.join(version.to_string())
        }
    };

    comm.barrier();
    if comm.is_root() {
        for child in [TIMESERIES_DIR, STATISTICS_DIR, SETTINGS_DIR, CHECKPOINT_DIR] {
            fs::create_dir_all(run_path.join(child))?;
        }
    }
    comm.barrier();

    let series_dir = run_path.join(TIMESERIES_DIR);
    let mut series = IndexMap::new();
    for field in fields {
        let handle = SnapshotSeries::open(Arc::clone(comm), &series_dir, field, tstep, mesh)?;
        series.insert(field.clone(), handle);
    }

    if comm.is_root() {
        let settings_path = run_path
            .join(SETTINGS_DIR)
            .join(format!("parameters_from_tstep_{tstep}.dat"));
        dump_parameters(params, &settings_path)?;
    }

    Ok((run_path, series))
}
