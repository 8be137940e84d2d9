//! Crash-safe checkpoint persistence.
//!
//! A checkpoint is the durable pair `(parameters.dat, fields.bin)`
//! inside the run's `Checkpoint/` directory. It is *replaced* on every
//! checkpoint interval, never appended, under a two-slot rotation
//! protocol:
//!
//! 1. rename the existing file to its `.old` sibling,
//! 2. write the new file,
//! 3. delete the `.old` sibling only after the new file is fully
//!    committed.
//!
//! The rename, not a copy, is what makes the rotation atomic from
//! the filesystem's point of view: at every instant at least one
//! loadable pair exists. A process killed mid-write leaves the `.old`
//! files as the last known-good state; the next successful checkpoint
//! cleans them up, and if the run never checkpoints again, renaming
//! them back is the operator's call. The field-container deletion is
//! fenced from the parameters deletion by a barrier, so a crash between
//! the two leaves at most one stale `.old` parameters file: harmless
//! debris that is never auto-cleaned.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::comm::Communicator;
use crate::container::{ContainerReader, ContainerWriter};
use crate::error::{Error, Result};
use crate::mesh::Mesh;
use crate::params::{dump_parameters, RunParameters};
use crate::rundir::CHECKPOINT_DIR;
use crate::storage::SolutionStorage;

/// Checkpointed parameters file name.
pub const PARAMETERS_FILE: &str = "parameters.dat";

/// Checkpointed field container name.
pub const FIELDS_FILE: &str = "fields.bin";

/// Suffix of the rotated last-known-good sibling.
pub const OLD_SUFFIX: &str = "old";

/// `path` with the rotation suffix appended (`fields.bin` →
/// `fields.bin.old`).
pub fn old_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(OLD_SUFFIX);
    PathBuf::from(name)
}

/// Rename `path` to its `.old` sibling if it exists.
fn rotate_to_old(path: &Path) -> Result<()> {
    if path.exists() {
        fs::rename(path, old_path(path))?;
    }
    Ok(())
}

/// Delete `path` if it exists.
fn remove_if_present(path: &Path) -> Result<()> {
    if path.exists() {
        fs::remove_file(path)?;
    }
    Ok(())
}

/// Collectively write one checkpoint of the full simulation state.
///
/// Injects `num_processes`, `t_0` and `tstep` into the parameters
/// (overwriting any prior values), rotates and rewrites the parameters
/// file, rotates and rewrites the field container (mesh once, then
/// both generations of every subproblem, each subproblem's write fenced
/// by barriers so the whole group commits a field before any rank moves
/// to the next) and finally drops the `.old` siblings.
pub fn save_checkpoint(
    comm: &dyn Communicator,
    tstep: u64,
    t: f64,
    mesh: &Mesh,
    state: &SolutionStorage,
    run_path: &Path,
    params: &mut RunParameters,
) -> Result<()> {
    let checkpoint_dir = run_path.join(CHECKPOINT_DIR);
    let parameters_path = checkpoint_dir.join(PARAMETERS_FILE);
    let fields_path = checkpoint_dir.join(FIELDS_FILE);

    // Every rank injects so the in-memory mapping stays consistent
    // group-wide; only the root writes the file.
    params.inject_restart_state(comm.size(), t, tstep);
    if comm.is_root() {
        rotate_to_old(&parameters_path)?;
        dump_parameters(params, &parameters_path)?;
    }
    comm.barrier();

    if comm.is_root() {
        rotate_to_old(&fields_path)?;
    }
    comm.barrier();

    let mut container = ContainerWriter::create(comm, &fields_path);
    if comm.is_root() {
        info!(tstep, t, "storing checkpoint mesh");
    }
    container.write_mesh(mesh);
    for name in state.subproblem_names() {
        comm.barrier();
        if comm.is_root() {
            info!(subproblem = %name, "storing subproblem");
        }
        if let Some(current) = state.current(&name) {
            container.write_f64(format!("{name}/current"), current);
        }
        if let Some(previous) = state.previous(&name) {
            container.write_f64(format!("{name}/previous"), previous);
        }
        comm.barrier();
    }
    container.close()?;

    // The new pair is committed; the rotated files may go. The barrier
    // keeps the two deletions ordered so a crash in between leaves at
    // most a stale parameters sibling, never a missing valid file.
    if comm.is_root() {
        remove_if_present(&old_path(&fields_path))?;
    }
    comm.barrier();
    if comm.is_root() {
        remove_if_present(&old_path(&parameters_path))?;
    }
    Ok(())
}

/// Restore both generations of every registered subproblem from a
/// checkpoint directory.
///
/// Every rank opens the committed container read-only and slices out
/// its own shard. A subproblem absent from the container is left
/// untouched; its problem-supplied initial values stand. Shards must
/// have been written by a group of the same size.
pub fn load_checkpoint(
    comm: &dyn Communicator,
    checkpoint_dir: &Path,
    state: &mut SolutionStorage,
) -> Result<()> {
    let fields_path = checkpoint_dir.join(FIELDS_FILE);
    let reader = ContainerReader::open(&fields_path)?;

    for name in state.subproblem_names() {
        if comm.is_root() {
            info!(subproblem = %name, "loading subproblem");
        }
        restore_generation(&reader, comm, &name, "current", state.current_mut(&name))?;
        restore_generation(&reader, comm, &name, "previous", state.previous_mut(&name))?;
    }
    Ok(())
}

fn restore_generation(
    reader: &ContainerReader,
    comm: &dyn Communicator,
    subproblem: &str,
    generation: &str,
    buffer: Option<&mut [f64]>,
) -> Result<()> {
    let Some(buffer) = buffer else {
        return Ok(());
    };
    let key = format!("{subproblem}/{generation}");
    let Some(shard) = reader.read_f64_shard(&key, comm.rank(), comm.size())? else {
        debug!(key = %key, "dataset absent from checkpoint, keeping initial values");
        return Ok(());
    };
    if shard.len() != buffer.len() {
        return Err(Error::Shape(format!(
            "checkpoint shard for {key} holds {} values, local buffer holds {}",
            shard.len(),
            buffer.len()
        )));
    }
    buffer.copy_from_slice(&shard);
    Ok(())
}
