//! The main time loop.
//!
//! Advances simulation time, hands each step to the problem-supplied
//! [`Integrator`], and makes the once-per-step persistence decision:
//! snapshot on the save interval, checkpoint on the checkpoint
//! interval, and always one final checkpoint when the run ends,
//! whether by reaching the end time or by the operator's kill sentinel.

use std::time::Instant;

use tracing::info;

use crate::checkpoint::save_checkpoint;
use crate::context::RunContext;
use crate::error::Result;
use crate::kill::check_kill;
use crate::timeseries::save_snapshot;

/// Problem-specific numerics plugged into the loop.
///
/// The loop owns time and persistence; the integrator owns physics. It
/// reads `previous`, writes `current` through the context's solution
/// storage, and may touch any other context field it declares a need
/// for.
pub trait Integrator {
    /// Called once before the first step.
    fn initialize(&mut self, _ctx: &mut RunContext) -> Result<()> {
        Ok(())
    }

    /// Advance the solution by one step.
    fn step(&mut self, ctx: &mut RunContext) -> Result<()>;

    /// Called once after the loop ends.
    fn finish(&mut self, _ctx: &mut RunContext) -> Result<()> {
        Ok(())
    }
}

/// The once-per-step persistence decision.
///
/// Returns whether the run should stop after this step. Collective:
/// every rank reaches this in lockstep, and the stop decision comes out
/// identical group-wide because it is built from the kill reduction and
/// from values every rank computed identically.
pub fn save_solution(ctx: &mut RunContext) -> Result<bool> {
    if ctx.tstep % ctx.save_interval() == 0 {
        save_snapshot(ctx.t, &ctx.state, &ctx.layout, &mut ctx.series)?;
    }

    let stop = check_kill(&*ctx.comm, &ctx.base_path)? || ctx.t >= ctx.end_time()?;

    if ctx.tstep % ctx.checkpoint_interval() == 0 || stop {
        save_checkpoint(
            &*ctx.comm,
            ctx.tstep,
            ctx.t,
            &ctx.mesh,
            &ctx.state,
            &ctx.run_path,
            &mut ctx.params,
        )?;
    }
    Ok(stop)
}

/// Run the time loop to completion.
pub fn run_time_loop(ctx: &mut RunContext, integrator: &mut dyn Integrator) -> Result<()> {
    integrator.initialize(ctx)?;

    let dt = ctx.dt()?;
    let end_time = ctx.end_time()?;
    let info_interval = ctx.info_interval();
    let mut stop = false;
    let mut clock = Instant::now();

    while ctx.t < end_time && !stop {
        ctx.t += dt;
        ctx.tstep += 1;

        integrator.step(ctx)?;
        stop = save_solution(ctx)?;
        ctx.state.advance_step();

        if ctx.tstep % info_interval == 0 {
            if ctx.comm.is_root() {
                info!(
                    t = ctx.t,
                    tstep = ctx.tstep,
                    elapsed_s = clock.elapsed().as_secs_f64(),
                    "time loop progress"
                );
            }
            clock = Instant::now();
        }
    }

    integrator.finish(ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::PARAMETERS_FILE;
    use crate::comm::{Communicator, SoloComm};
    use crate::index::parse_series_index;
    use crate::kill::KILL_FILE;
    use crate::mesh::Mesh;
    use crate::params::{load_parameters, RunParameters};
    use crate::rundir::CHECKPOINT_DIR;
    use crate::storage::{FieldDecl, SolutionStorage, SubproblemLayout};
    use std::path::PathBuf;
    use std::sync::Arc;
    use tempfile::tempdir;

    /// Pointwise exponential decay: u ← u_prev * (1 - k dt).
    struct Decay {
        rate: f64,
    }

    impl Integrator for Decay {
        fn step(&mut self, ctx: &mut RunContext) -> Result<()> {
            let dt = ctx.dt()?;
            let factor = 1.0 - self.rate * dt;
            for name in ctx.state.subproblem_names() {
                let previous = ctx.state.previous(&name).map(<[f64]>::to_vec);
                if let (Some(previous), Some(current)) = (previous, ctx.state.current_mut(&name)) {
                    for (c, p) in current.iter_mut().zip(previous.iter()) {
                        *c = p * factor;
                    }
                }
            }
            Ok(())
        }
    }

    fn build_context(base: PathBuf, extra: impl FnOnce(&mut RunParameters)) -> RunContext {
        let comm: Arc<dyn Communicator> = Arc::new(SoloComm);
        let mesh = Mesh::interval(&*comm, 4, 0.0, 1.0).unwrap();
        let mut layout = SubproblemLayout::new();
        layout.declare("heat", vec![FieldDecl::scalar("temperature")]);
        let mut state = SolutionStorage::new();
        state.init("heat", vec![1.0; 5]);
        let mut params = RunParameters::new();
        params.set("dt", 0.1);
        params.set("T", 0.5);
        params.set("save_intv", 1u64);
        params.set("checkpoint_intv", 100u64);
        extra(&mut params);
        RunContext::initialize(comm, params, mesh, layout, state, base, None).unwrap()
    }

    #[test]
    fn test_loop_reaches_end_time_and_writes_final_checkpoint() {
        let dir = tempdir().unwrap();
        let mut ctx = build_context(dir.path().to_path_buf(), |_| {});
        run_time_loop(&mut ctx, &mut Decay { rate: 1.0 }).unwrap();

        assert_eq!(ctx.tstep, 5);
        assert!((ctx.t - 0.5).abs() < 1e-12);

        // Five snapshots, one per step.
        let parsed =
            parse_series_index(ctx.series["temperature"].index_path(), false).unwrap();
        assert_eq!(parsed.entries.len(), 5);

        // The end-of-run checkpoint carries the final step.
        let mut on_disk = RunParameters::new();
        load_parameters(
            &mut on_disk,
            &ctx.run_path.join(CHECKPOINT_DIR).join(PARAMETERS_FILE),
        )
        .unwrap();
        assert_eq!(on_disk.get_u64("tstep"), Some(5));
        assert_eq!(on_disk.get_f64("t_0"), Some(ctx.t));
    }

    #[test]
    fn test_kill_sentinel_stops_early_with_final_checkpoint() {
        let dir = tempdir().unwrap();
        let mut ctx = build_context(dir.path().to_path_buf(), |p| p.set("T", 100.0));

        // Drop the sentinel before the run; the first step's check
        // consumes it.
        std::fs::write(dir.path().join(KILL_FILE), b"").unwrap();
        run_time_loop(&mut ctx, &mut Decay { rate: 1.0 }).unwrap();

        assert_eq!(ctx.tstep, 1, "sentinel must stop the loop on the first check");
        assert!(!dir.path().join(KILL_FILE).exists());
        assert!(ctx
            .run_path
            .join(CHECKPOINT_DIR)
            .join(PARAMETERS_FILE)
            .is_file());
    }

    #[test]
    fn test_decay_solution_advances() {
        let dir = tempdir().unwrap();
        let mut ctx = build_context(dir.path().to_path_buf(), |_| {});
        run_time_loop(&mut ctx, &mut Decay { rate: 1.0 }).unwrap();

        // After 5 steps of u *= 0.9: 0.9^5.
        let expected = 0.9f64.powi(5);
        for value in ctx.state.current("heat").unwrap() {
            assert!((value - expected).abs() < 1e-12);
        }
    }
}
