//! A component with an implicit state.

use crate::component::{Component, Jacobian};
use crate::vector::{VecView, VecViewMut};
use crate::{Error, Result, VarSpec, VariableRegistry};

/// Root of `a x^2 + b x + c = 0`, held as the state `x`.
///
/// `compute_outputs` converges the state locally with Newton iterations
/// starting from its current value, so the component also works under a
/// sequential solver. The residual and its partials are exposed for global
/// Newton solves.
#[derive(Debug, Clone)]
pub struct QuadraticState {
    initial: f64,
    /// Local convergence tolerance on `|R|`
    pub tolerance: f64,
    pub max_iterations: usize,
}

impl QuadraticState {
    /// Creates the component with an initial guess for `x`.
    pub fn new(initial: f64) -> Self {
        QuadraticState { initial, tolerance: 1e-12, max_iterations: 50 }
    }

    fn coefficients(params: &VecView) -> Result<(f64, f64, f64)> {
        Ok((params.scalar("a")?, params.scalar("b")?, params.scalar("c")?))
    }
}

impl Component for QuadraticState {
    fn setup(&mut self, vars: &mut VariableRegistry) -> Result<()> {
        vars.add_param("a", VarSpec::value(1.0))?;
        vars.add_param("b", VarSpec::value(1.0))?;
        vars.add_param("c", VarSpec::value(0.0))?;
        vars.add_state("x", VarSpec::value(self.initial))
    }

    fn compute_outputs(&mut self, params: &VecView, unknowns: &mut VecViewMut) -> Result<()> {
        let (a, b, c) = Self::coefficients(params)?;
        let mut x = unknowns.scalar("x")?;

        for _ in 0..self.max_iterations {
            let r = a * x * x + b * x + c;
            if r.abs() < self.tolerance {
                return unknowns.set_scalar("x", x);
            }
            let slope = 2.0 * a * x + b;
            if slope == 0.0 {
                return Err(Error::Component {
                    component: params.owner().to_string(),
                    message: format!("zero slope at x = {x}"),
                });
            }
            x -= r / slope;
        }

        Err(Error::Component {
            component: params.owner().to_string(),
            message: format!("no root found after {} iterations", self.max_iterations),
        })
    }

    fn evaluate_residual(&mut self, params: &VecView, unknowns: &mut VecViewMut, resids: &mut VecViewMut) -> Result<()> {
        let (a, b, c) = Self::coefficients(params)?;
        let x = unknowns.scalar("x")?;
        resids.set_scalar("x", a * x * x + b * x + c)
    }

    fn linearize(&mut self, params: &VecView, unknowns: &VecView, _resids: &VecView) -> Result<Option<Jacobian>> {
        let (a, b, _) = Self::coefficients(params)?;
        let x = unknowns.scalar("x")?;
        let mut jac = Jacobian::new();
        jac.insert_scalar("x", "a", x * x);
        jac.insert_scalar("x", "b", x);
        jac.insert_scalar("x", "c", 1.0);
        jac.insert_scalar("x", "x", 2.0 * a * x + b);
        Ok(Some(jac))
    }
}
