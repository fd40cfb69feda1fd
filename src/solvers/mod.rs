//! Nonlinear and linear solvers that act on a set-up [`Model`].
//!
//! # Nonlinear
//!
//! - [`RunOnce`]: executes every component once in order. Enough for
//!   feed-forward models whose implicit components converge locally.
//! - [`Newton`]: global Newton on the residual vector. Each iteration
//!   linearizes the model and solves `A delta = R` with the configured linear
//!   solver, where `A = -dR/du`.
//!
//! # Linear
//!
//! - [`DirectSolver`]: assembles `A` column by column through
//!   [`Model::apply_linear`] and factors it with LU. The factorization is
//!   reused until the model is linearized again.
//! - [`Richardson`]: matrix-free fixed-point iteration `x += b - A x`.
//!
//! Linear solvers also carry the direction preference that `auto` gradients
//! resolve to.

pub mod linear;
pub mod nonlinear;

use std::fmt;
use std::str::FromStr;

use crate::component::LinearMode;
use crate::system::Model;
use crate::{Error, Result};

pub use linear::{DirectSolver, Richardson};
pub use nonlinear::{Newton, RunOnce};

/// Direction a linear solver prefers for total derivatives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ModePreference {
    Forward,
    Reverse,
    /// No preference
    #[default]
    Auto,
}

impl ModePreference {
    /// The concrete direction, if there is one.
    pub fn resolve(self) -> Option<LinearMode> {
        match self {
            ModePreference::Forward => Some(LinearMode::Forward),
            ModePreference::Reverse => Some(LinearMode::Reverse),
            ModePreference::Auto => None,
        }
    }
}

impl fmt::Display for ModePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModePreference::Forward => write!(f, "fwd"),
            ModePreference::Reverse => write!(f, "rev"),
            ModePreference::Auto => write!(f, "auto"),
        }
    }
}

impl FromStr for ModePreference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fwd" => Ok(ModePreference::Forward),
            "rev" => Ok(ModePreference::Reverse),
            "auto" => Ok(ModePreference::Auto),
            _ => Err(Error::InvalidOption { option: "mode", allowed: "['fwd', 'rev', 'auto']", value: s.to_string() }),
        }
    }
}

/// Solves `A x = rhs` (forward) or `A^T x = rhs` (reverse) for the model's
/// current linearization.
pub trait LinearSolver {
    fn preference(&self) -> ModePreference;

    fn solve(&mut self, rhs: &[f64], model: &mut Model, mode: LinearMode) -> Result<Vec<f64>>;
}

/// Drives the model's unknowns to a converged state.
pub trait NonlinearSolver {
    fn solve(&mut self, model: &mut Model, linear: &mut dyn LinearSolver) -> Result<SolverStats>;
}

/// Statistics from a solver run.
#[derive(Debug, Clone, PartialEq)]
pub struct SolverStats {
    /// Number of iterations performed
    pub iterations: usize,
    /// Number of residual evaluations
    pub function_evals: usize,
    /// Number of linearizations
    pub jacobian_evals: usize,
    /// Final residual norm
    pub final_residual: f64,
}

impl SolverStats {
    /// Creates new solver statistics.
    pub fn new() -> Self {
        SolverStats { iterations: 0, function_evals: 0, jacobian_evals: 0, final_residual: 0.0 }
    }
}

impl Default for SolverStats {
    fn default() -> Self {
        Self::new()
    }
}
