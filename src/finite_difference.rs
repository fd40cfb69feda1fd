//! Finite difference approximations of Jacobians.
//!
//! Used when a component provides no analytic partials, when a component
//! or the whole model forces it, and as the reference in derivative checks.

use std::fmt;
use std::str::FromStr;

use nalgebra::DMatrix;

use crate::component::{Component, Jacobian};
use crate::vector::{Layout, ObjectStore, VecView, VecViewMut};
use crate::{Error, Result};

/// Difference formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FdForm {
    /// `(f(x + h) - f(x)) / h`
    #[default]
    Forward,
    /// `(f(x) - f(x - h)) / h`
    Backward,
    /// `(f(x + h) - f(x - h)) / 2h`
    Central,
}

impl fmt::Display for FdForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FdForm::Forward => write!(f, "forward"),
            FdForm::Backward => write!(f, "backward"),
            FdForm::Central => write!(f, "central"),
        }
    }
}

impl FromStr for FdForm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "forward" => Ok(FdForm::Forward),
            "backward" => Ok(FdForm::Backward),
            "central" => Ok(FdForm::Central),
            _ => Err(Error::InvalidOption {
                option: "form",
                allowed: "['forward', 'backward', 'central']",
                value: s.to_string(),
            }),
        }
    }
}

/// Finite difference settings for a component or for the whole model.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FdOptions {
    /// Use finite differences even when analytic derivatives exist
    pub force_fd: bool,
    /// Absolute perturbation
    pub step_size: f64,
    pub form: FdForm,
}

impl Default for FdOptions {
    fn default() -> Self {
        FdOptions { force_fd: false, step_size: 1e-6, form: FdForm::Forward }
    }
}

impl FdOptions {
    /// Default settings with `force_fd` on.
    pub fn forced() -> Self {
        FdOptions { force_fd: true, ..Self::default() }
    }

    pub fn with_step(mut self, step_size: f64) -> Self {
        self.step_size = step_size;
        self
    }

    pub fn with_form(mut self, form: FdForm) -> Self {
        self.form = form;
        self
    }
}

/// Approximates the Jacobian of `f` at `x0` one column at a time.
///
/// `f` must return `n_out` values. It always sees a full copy of `x0` with a
/// single entry perturbed, so repeated calls are reproducible.
pub fn fd_jacobian<F>(x0: &[f64], n_out: usize, options: &FdOptions, mut f: F) -> Result<DMatrix<f64>>
where
    F: FnMut(&[f64]) -> Result<Vec<f64>>,
{
    let h = options.step_size;
    let base = match options.form {
        FdForm::Central => None,
        _ => Some(f(x0)?),
    };

    let mut x = x0.to_vec();
    let mut jac = DMatrix::zeros(n_out, x0.len());

    for j in 0..x0.len() {
        let column: Vec<f64> = match (options.form, &base) {
            (FdForm::Forward, Some(f0)) => {
                x[j] = x0[j] + h;
                let fp = f(&x)?;
                fp.iter().zip(f0).map(|(a, b)| (a - b) / h).collect()
            }
            (FdForm::Backward, Some(f0)) => {
                x[j] = x0[j] - h;
                let fm = f(&x)?;
                f0.iter().zip(&fm).map(|(a, b)| (a - b) / h).collect()
            }
            _ => {
                x[j] = x0[j] + h;
                let fp = f(&x)?;
                x[j] = x0[j] - h;
                let fm = f(&x)?;
                fp.iter().zip(&fm).map(|(a, b)| (a - b) / (2.0 * h)).collect()
            }
        };
        x[j] = x0[j];

        for (i, v) in column.into_iter().take(n_out).enumerate() {
            jac[(i, j)] = v;
        }
    }
    Ok(jac)
}

/// A component's variables at one operating point.
pub struct UnitPoint<'a> {
    pub pathname: &'a str,
    pub u_layout: &'a Layout,
    pub p_layout: &'a Layout,
    pub unknowns: &'a [f64],
    pub params: &'a [f64],
    pub u_objects: &'a ObjectStore,
    pub p_objects: &'a ObjectStore,
}

impl UnitPoint<'_> {
    /// Residuals at the given parameter and unknown values, computed on copies.
    pub fn residual(&self, component: &mut dyn Component, params: &[f64], unknowns: &[f64]) -> Result<Vec<f64>> {
        let mut u = unknowns.to_vec();
        let mut r = vec![0.0; u.len()];
        let mut u_objects = self.u_objects.clone();

        let p_view = VecView::new(self.pathname, self.p_layout, params).with_objects(self.p_objects);
        let mut u_view = VecViewMut::new(self.pathname, self.u_layout, &mut u).with_objects(&mut u_objects);
        let mut r_view = VecViewMut::new(self.pathname, self.u_layout, &mut r);
        component.evaluate_residual(&p_view, &mut u_view, &mut r_view)?;
        Ok(r)
    }

    /// Numeric parameter and state names, in the order they are perturbed.
    pub fn fd_inputs(&self) -> Vec<(&str, bool)> {
        let params = self.p_layout.iter().filter(|(_, s)| !s.by_obj).map(|(n, _)| (n, false));
        let states = self.u_layout.iter().filter(|(_, s)| s.state && !s.by_obj).map(|(n, _)| (n, true));
        params.chain(states).collect()
    }

    /// Numeric outputs and states.
    pub fn fd_outputs(&self) -> Vec<&str> {
        self.u_layout.iter().filter(|(_, s)| !s.by_obj).map(|(n, _)| n).collect()
    }
}

/// Finite difference Jacobian of a component's residuals with respect to its
/// parameters and states, keyed like analytic blocks.
pub fn unit_fd_jacobian(component: &mut dyn Component, point: &UnitPoint, options: &FdOptions) -> Result<Jacobian> {
    let inputs = point.fd_inputs();

    let mut x0: Vec<f64> = Vec::new();
    let mut columns = Vec::new();
    for &(name, state) in &inputs {
        let (layout, data) = if state { (point.u_layout, point.unknowns) } else { (point.p_layout, point.params) };
        let range = layout.slot(name).map(|s| s.range()).unwrap_or_default();
        columns.push(x0.len()..x0.len() + range.len());
        x0.extend_from_slice(&data[range]);
    }

    let full = fd_jacobian(&x0, point.unknowns.len(), options, |x| {
        let mut p = point.params.to_vec();
        let mut u = point.unknowns.to_vec();
        for (&(name, state), cols) in inputs.iter().zip(&columns) {
            let (layout, data) = if state { (point.u_layout, &mut u) } else { (point.p_layout, &mut p) };
            if let Some(slot) = layout.slot(name) {
                data[slot.range()].copy_from_slice(&x[cols.clone()]);
            }
        }
        point.residual(&mut *component, &p, &u)
    })?;

    let mut jac = Jacobian::new();
    for of in point.fd_outputs() {
        let Some(rows) = point.u_layout.slot(of).map(|s| s.range()) else { continue };
        for (&(wrt, _), cols) in inputs.iter().zip(&columns) {
            let block = full.view((rows.start, cols.start), (rows.len(), cols.len())).into_owned();
            jac.insert(of, wrt, block);
        }
    }
    Ok(jac)
}
