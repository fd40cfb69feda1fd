//! Linear solvers for the model operator.

use nalgebra::{DMatrix, DVector, Dyn, LU};

use super::{LinearSolver, ModePreference};
use crate::component::LinearMode;
use crate::system::Model;
use crate::{Error, Result};

/// Dense LU solver.
///
/// The operator is assembled with one [`Model::apply_linear`] call per
/// column, so it suits small and medium models.
#[derive(Debug, Default)]
pub struct DirectSolver {
    pub mode: ModePreference,
    cache: Option<(u64, LinearMode, LU<f64, Dyn, Dyn>)>,
}

impl DirectSolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mode(mut self, mode: ModePreference) -> Self {
        self.mode = mode;
        self
    }

    /// Dense `A` (forward) or `A^T` (reverse).
    pub fn assemble(model: &mut Model, mode: LinearMode) -> Result<DMatrix<f64>> {
        let n = model.size();
        let mut matrix = DMatrix::zeros(n, n);
        let mut e = vec![0.0; n];
        for j in 0..n {
            e[j] = 1.0;
            let column = model.apply_linear(mode, &e)?;
            e[j] = 0.0;
            matrix.set_column(j, &DVector::from_vec(column));
        }
        Ok(matrix)
    }

    fn factor(&mut self, model: &mut Model, mode: LinearMode) -> Result<&LU<f64, Dyn, Dyn>> {
        let generation = model.jacobian_generation();
        let stale = !matches!(&self.cache, Some((g, m, _)) if *g == generation && *m == mode);
        if stale {
            log::trace!("factoring {} operator of size {}", mode, model.size());
            let lu = Self::assemble(model, mode)?.lu();
            self.cache = Some((generation, mode, lu));
        }
        match &self.cache {
            Some((_, _, lu)) => Ok(lu),
            None => Err(Error::SingularMatrix(model.size())),
        }
    }
}

impl LinearSolver for DirectSolver {
    fn preference(&self) -> ModePreference {
        self.mode
    }

    fn solve(&mut self, rhs: &[f64], model: &mut Model, mode: LinearMode) -> Result<Vec<f64>> {
        let n = model.size();
        if rhs.len() != n {
            return Err(Error::SizeMismatch { name: "right-hand side".to_string(), expected: n, actual: rhs.len() });
        }
        let lu = self.factor(model, mode)?;
        let x = lu.solve(&DVector::from_column_slice(rhs)).ok_or(Error::SingularMatrix(n))?;
        Ok(x.as_slice().to_vec())
    }
}

/// Richardson iteration `x += b - A x`.
///
/// Converges when the spectral radius of `I - A` is below one, which holds
/// for any feed-forward chain of explicit components.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Richardson {
    pub max_iterations: usize,
    /// Absolute tolerance on the residual norm
    pub atol: f64,
    pub mode: ModePreference,
}

impl Default for Richardson {
    fn default() -> Self {
        Richardson { max_iterations: 100, atol: 1e-12, mode: ModePreference::Auto }
    }
}

impl Richardson {
    pub fn new(max_iterations: usize, atol: f64) -> Self {
        Richardson { max_iterations, atol, ..Self::default() }
    }

    pub fn with_mode(mut self, mode: ModePreference) -> Self {
        self.mode = mode;
        self
    }
}

impl LinearSolver for Richardson {
    fn preference(&self) -> ModePreference {
        self.mode
    }

    fn solve(&mut self, rhs: &[f64], model: &mut Model, mode: LinearMode) -> Result<Vec<f64>> {
        let mut x = rhs.to_vec();
        let mut norm = f64::INFINITY;

        for iteration in 0..self.max_iterations {
            let ax = model.apply_linear(mode, &x)?;
            let residual: Vec<f64> = rhs.iter().zip(&ax).map(|(b, a)| b - a).collect();
            norm = residual.iter().map(|r| r * r).sum::<f64>().sqrt();
            log::trace!("richardson iteration {iteration}: |r| = {norm:e}");
            if norm <= self.atol {
                return Ok(x);
            }
            for (xi, ri) in x.iter_mut().zip(&residual) {
                *xi += ri;
            }
        }

        Err(Error::LinearSolveFailed { iterations: self.max_iterations, residual: norm })
    }
}
