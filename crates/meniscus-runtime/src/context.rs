//! The explicit run context.
//!
//! Everything a running simulation threads through its components
//! (communicator, parameters, mesh, solution buffers, paths, open
//! series) lives in one [`RunContext`] value passed by reference.
//! Components take exactly the fields they read or write; nothing is
//! ambient.

use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::checkpoint::{load_checkpoint, PARAMETERS_FILE};
use crate::comm::Communicator;
use crate::error::{Error, Result};
use crate::mesh::Mesh;
use crate::params::{load_parameters, RunParameters};
use crate::rundir::create_run_directory;
use crate::storage::{SolutionStorage, SubproblemLayout};
use crate::timeseries::SnapshotSeries;

/// State of one rank's participation in a run.
pub struct RunContext {
    /// The rank group.
    pub comm: Arc<dyn Communicator>,
    /// Run configuration; rewritten into every checkpoint.
    pub params: RunParameters,
    /// This rank's mesh shard.
    pub mesh: Mesh,
    /// Field composition of each subproblem.
    pub layout: SubproblemLayout,
    /// Both generations of every subproblem's local shard.
    pub state: SolutionStorage,
    /// Base output directory (where the kill sentinel appears).
    pub base_path: PathBuf,
    /// This attempt's numbered run directory.
    pub run_path: PathBuf,
    /// Open snapshot series, keyed by field name.
    pub series: IndexMap<String, SnapshotSeries>,
    /// Simulation time.
    pub t: f64,
    /// Completed step count.
    pub tstep: u64,
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("params", &self.params)
            .field("mesh", &self.mesh)
            .field("layout", &self.layout)
            .field("state", &self.state)
            .field("base_path", &self.base_path)
            .field("run_path", &self.run_path)
            .field("series", &self.series.keys().collect::<Vec<_>>())
            .field("t", &self.t)
            .field("tstep", &self.tstep)
            .finish()
    }
}

impl RunContext {
    /// Set up a run: load checkpointed parameters when restarting,
    /// allocate (or resume) the run directory, open the series, and
    /// restore checkpointed state.
    ///
    /// `restart` names the prior run's `Checkpoint` directory. When it
    /// is given, the settings file inside it must exist
    /// ([`Error::MissingConfiguration`] otherwise) and its values win
    /// over the in-memory defaults; `t` and `tstep` resume from the
    /// injected `t_0` / `tstep` keys.
    pub fn initialize(
        comm: Arc<dyn Communicator>,
        mut params: RunParameters,
        mesh: Mesh,
        layout: SubproblemLayout,
        mut state: SolutionStorage,
        base_path: PathBuf,
        restart: Option<PathBuf>,
    ) -> Result<Self> {
        if let Some(restart) = &restart {
            load_parameters(&mut params, &restart.join(PARAMETERS_FILE))?;
        }
        let t = params.get_f64("t_0").unwrap_or(0.0);
        let tstep = params.get_u64("tstep").unwrap_or(0);

        let fields = layout.field_names();
        let (run_path, series) = create_run_directory(
            &comm,
            &base_path,
            restart.as_deref(),
            &fields,
            tstep,
            &mesh,
            &params,
        )?;

        if let Some(restart) = &restart {
            load_checkpoint(&*comm, restart, &mut state)?;
        }

        Ok(Self {
            comm,
            params,
            mesh,
            layout,
            state,
            base_path,
            run_path,
            series,
            t,
            tstep,
        })
    }

    /// Time step size; required.
    pub fn dt(&self) -> Result<f64> {
        self.params.get_f64("dt").ok_or(Error::MissingParameter("dt"))
    }

    /// Simulation end time; required.
    pub fn end_time(&self) -> Result<f64> {
        self.params.get_f64("T").ok_or(Error::MissingParameter("T"))
    }

    /// Steps between snapshot appends.
    pub fn save_interval(&self) -> u64 {
        self.params.get_u64("save_intv").unwrap_or(1).max(1)
    }

    /// Steps between checkpoints.
    pub fn checkpoint_interval(&self) -> u64 {
        self.params.get_u64("checkpoint_intv").unwrap_or(50).max(1)
    }

    /// Steps between progress log lines.
    pub fn info_interval(&self) -> u64 {
        self.params.get_u64("info_intv").unwrap_or(10).max(1)
    }
}
