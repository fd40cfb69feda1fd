//! Nonlinear solvers.

use super::{LinearSolver, NonlinearSolver, SolverStats};
use crate::component::LinearMode;
use crate::system::Model;
use crate::{Error, Result};

/// Runs every component once, in order.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOnce;

impl NonlinearSolver for RunOnce {
    fn solve(&mut self, model: &mut Model, _linear: &mut dyn LinearSolver) -> Result<SolverStats> {
        model.run_once()?;
        let final_residual = model.apply_nonlinear()?;
        Ok(SolverStats { iterations: 1, function_evals: 2, jacobian_evals: 0, final_residual })
    }
}

/// Newton-Raphson on the full residual vector.
///
/// Solves `A delta = R` with `A = -dR/du` and updates
/// `u += relaxation * delta`.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Newton {
    /// Convergence tolerance on the residual norm
    pub tolerance: f64,
    /// Maximum number of iterations
    pub max_iterations: usize,
    /// Relaxation factor (1.0 = full Newton step)
    pub relaxation: f64,
}

impl Default for Newton {
    fn default() -> Self {
        Newton { tolerance: 1e-10, max_iterations: 20, relaxation: 1.0 }
    }
}

impl Newton {
    pub fn new(tolerance: f64, max_iterations: usize) -> Self {
        Newton { tolerance, max_iterations, relaxation: 1.0 }
    }

    /// Creates a damped Newton solver.
    pub fn with_relaxation(tolerance: f64, max_iterations: usize, relaxation: f64) -> Self {
        Newton { tolerance, max_iterations, relaxation }
    }
}

impl NonlinearSolver for Newton {
    fn solve(&mut self, model: &mut Model, linear: &mut dyn LinearSolver) -> Result<SolverStats> {
        let mut stats = SolverStats::new();
        let mut norm = model.apply_nonlinear()?;
        stats.function_evals += 1;

        for iteration in 0..self.max_iterations {
            stats.iterations = iteration;
            stats.final_residual = norm;
            log::debug!("newton iteration {iteration}: |R| = {norm:e}");
            if norm < self.tolerance {
                return Ok(stats);
            }

            model.linearize()?;
            stats.jacobian_evals += 1;
            let rhs = model.vectors.resids.clone();
            let delta = linear.solve(&rhs, model, LinearMode::Forward)?;
            for (u, d) in model.vectors.unknowns.iter_mut().zip(&delta) {
                *u += self.relaxation * d;
            }

            norm = model.apply_nonlinear()?;
            stats.function_evals += 1;

            if !norm.is_finite() || (iteration > 10 && norm > 1e10) {
                return Err(Error::NonlinearSolveFailed { iterations: iteration + 1, residual: norm, reason: "diverged" });
            }
        }

        stats.iterations = self.max_iterations;
        stats.final_residual = norm;
        if norm < self.tolerance {
            return Ok(stats);
        }
        Err(Error::NonlinearSolveFailed {
            iterations: self.max_iterations,
            residual: norm,
            reason: "maximum iterations exceeded",
        })
    }
}
