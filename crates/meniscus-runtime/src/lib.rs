//! Meniscus runtime.
//!
//! Persistence and coordination for parallel, time-stepping
//! simulations: a run's state must survive crashes and restarts
//! correctly while a fixed group of cooperating ranks shares one
//! filesystem. The numerical method itself (discretization, assembly,
//! solves) is an external collaborator consumed through named field
//! buffers and a mesh handle.
//!
//! # Architecture
//!
//! - [`comm`] - barrier/reduction/broadcast/gather over the rank group
//! - [`rundir`] - versioned run-directory allocation
//! - [`checkpoint`] - crash-safe checkpoint rotation and restore
//! - [`timeseries`] - append-only per-field snapshot series
//! - [`index`] - series index documents and their parser
//! - [`kill`] - the cooperative kill-switch protocol
//! - [`mesh`] - mesh shards and global coordinate extents
//! - [`params`] - run configuration and its on-disk round trips
//! - [`storage`] - double-buffered per-subproblem solution shards
//! - [`container`] - the binary dataset container codec
//! - [`context`] - the explicit per-run context value
//! - [`driver`] - the time loop and its persistence decision
//! - [`error`] - error types for persistence failures
//!
//! # Run Directory Layout
//!
//! ```text
//! <base>/
//!     kill                      operator-created stop sentinel
//!     <version>/                one numbered directory per attempt
//!         Timeseries/           <field>_from_tstep_<N>.{bin,json}
//!         Statistics/
//!         Settings/             parameters_from_tstep_<N>.dat
//!         Checkpoint/           parameters.dat, fields.bin (+ .old
//!                               siblings while a rotation is in flight)
//! ```
//!
//! # Example
//!
//! ```ignore
//! let comm: Arc<dyn Communicator> = Arc::new(SoloComm);
//! let mut ctx = RunContext::initialize(
//!     comm, params, mesh, layout, state, base_path, restart,
//! )?;
//! run_time_loop(&mut ctx, &mut integrator)?;
//! ```

pub mod checkpoint;
pub mod comm;
pub mod container;
pub mod context;
pub mod driver;
pub mod error;
pub mod index;
pub mod kill;
pub mod mesh;
pub mod params;
pub mod rundir;
pub mod storage;
pub mod timeseries;

pub use checkpoint::{load_checkpoint, save_checkpoint, FIELDS_FILE, PARAMETERS_FILE};
pub use comm::{Communicator, GroupComm, ReduceOp, SoloComm};
pub use container::{ContainerReader, ContainerWriter, Dataset, FrameReader};
pub use context::RunContext;
pub use driver::{run_time_loop, save_solution, Integrator};
pub use error::{Error, Result};
pub use index::{parse_series_index, IndexDocument, IndexEntry, ParsedIndex};
pub use kill::{check_kill, KILL_FILE};
pub use mesh::{extent_max, extent_min, Mesh};
pub use params::{
    dump_parameters, dump_parameters_as, load_parameters, ParamValue, RunParameters,
    SettingsFormat,
};
pub use rundir::{
    create_run_directory, next_version, CHECKPOINT_DIR, SETTINGS_DIR, STATISTICS_DIR,
    TIMESERIES_DIR,
};
pub use storage::{FieldDecl, SolutionStorage, SubproblemLayout};
pub use timeseries::{save_snapshot, SnapshotSeries};
