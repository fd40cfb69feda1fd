//! Drivers run the model; recorders observe each run.

use crate::solvers::{LinearSolver, NonlinearSolver, SolverStats};
use crate::system::Model;
use crate::vector::VecView;
use crate::Result;

/// Receives the model's global vectors after every run.
///
/// Parameters are keyed by absolute pathname; unknowns and residuals by
/// absolute or promoted name.
pub trait Recorder {
    /// Called once when the problem is set up.
    fn startup(&mut self, _model: &Model) -> Result<()> {
        Ok(())
    }

    fn record(&mut self, params: &VecView, unknowns: &VecView, resids: &VecView) -> Result<()>;
}

/// Runs the nonlinear solver once per [`run`](Driver::run) and notifies
/// its recorders.
#[derive(Default)]
pub struct Driver {
    recorders: Vec<Box<dyn Recorder>>,
}

impl Driver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_recorder(&mut self, recorder: impl Recorder + 'static) -> &mut Self {
        self.recorders.push(Box::new(recorder));
        self
    }

    pub fn recorder_count(&self) -> usize {
        self.recorders.len()
    }

    pub fn setup(&mut self, model: &Model) -> Result<()> {
        for recorder in &mut self.recorders {
            recorder.startup(model)?;
        }
        Ok(())
    }

    pub fn run(
        &mut self,
        model: &mut Model,
        nonlinear: &mut dyn NonlinearSolver,
        linear: &mut dyn LinearSolver,
    ) -> Result<SolverStats> {
        let stats = nonlinear.solve(model, linear)?;
        log::debug!(
            "run finished after {} iterations, |R| = {:e}",
            stats.iterations,
            stats.final_residual
        );

        let vectors = model.vectors();
        let params = VecView::new("", &vectors.p_layout, &vectors.params);
        let unknowns = VecView::new("", &vectors.u_layout, &vectors.unknowns);
        let resids = VecView::new("", &vectors.u_layout, &vectors.resids);
        for recorder in &mut self.recorders {
            recorder.record(&params, &unknowns, &resids)?;
        }
        Ok(stats)
    }
}
