//! Automatic differentiation support using `num-dual`.
//!
//! Forward-mode dual numbers give exact Jacobian blocks for components whose
//! equations can be written generically over [`Dual64`].
//!
//! # Example
//!
//! ```
//! use num_dual::Dual64;
//! use plexus::autodiff::jacobian;
//!
//! // f(x, y) = [x^2, xy]
//! let f = |v: &[Dual64]| vec![v[0] * v[0], v[0] * v[1]];
//! let jac = jacobian(f, &[2.0, 3.0]);
//! assert_eq!(jac[(1, 0)], 3.0);
//! ```

use nalgebra::DMatrix;
use num_dual::{Dual64, DualNum};

/// Jacobian of `f` at `x`, one dual sweep per column.
pub fn jacobian<F>(f: F, x: &[f64]) -> DMatrix<f64>
where
    F: Fn(&[Dual64]) -> Vec<Dual64>,
{
    let mut columns: Vec<Vec<f64>> = Vec::with_capacity(x.len());
    for j in 0..x.len() {
        let mut seeded: Vec<Dual64> = x.iter().map(|&v| Dual64::from(v)).collect();
        seeded[j] = Dual64::from(x[j]).derivative();
        columns.push(f(&seeded).iter().map(|r| r.eps).collect());
    }

    let n_eqs = columns.first().map_or(0, Vec::len);
    DMatrix::from_fn(n_eqs, x.len(), |i, j| columns[j][i])
}

/// Value and gradient of a scalar function.
pub fn gradient<F>(f: F, x: &[f64]) -> (f64, Vec<f64>)
where
    F: Fn(&[Dual64]) -> Dual64,
{
    let plain: Vec<Dual64> = x.iter().map(|&v| Dual64::from(v)).collect();
    let value = f(&plain).re();
    let jac = jacobian(|v| vec![f(v)], x);
    (value, jac.row(0).iter().copied().collect())
}
