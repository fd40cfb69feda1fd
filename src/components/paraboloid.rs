//! The paraboloid test function.

use crate::component::{Component, Jacobian};
use crate::vector::{VecView, VecViewMut};
use crate::{Result, VarSpec, VariableRegistry};

/// `f_xy = (x - 3)^2 + x y + (y + 4)^2 - 3`
#[derive(Debug, Clone, Copy, Default)]
pub struct Paraboloid;

impl Paraboloid {
    pub fn new() -> Self {
        Paraboloid
    }
}

impl Component for Paraboloid {
    fn setup(&mut self, vars: &mut VariableRegistry) -> Result<()> {
        vars.add_param("x", VarSpec::value(0.0))?;
        vars.add_param("y", VarSpec::value(0.0))?;
        vars.add_output("f_xy", VarSpec::value(0.0))
    }

    fn compute_outputs(&mut self, params: &VecView, unknowns: &mut VecViewMut) -> Result<()> {
        let x = params.scalar("x")?;
        let y = params.scalar("y")?;
        unknowns.set_scalar("f_xy", (x - 3.0).powi(2) + x * y + (y + 4.0).powi(2) - 3.0)
    }

    fn linearize(&mut self, params: &VecView, _unknowns: &VecView, _resids: &VecView) -> Result<Option<Jacobian>> {
        let x = params.scalar("x")?;
        let y = params.scalar("y")?;
        let mut jac = Jacobian::new();
        jac.insert_scalar("f_xy", "x", 2.0 * x - 6.0 + y);
        jac.insert_scalar("f_xy", "y", 2.0 * y + 8.0 + x);
        Ok(Some(jac))
    }
}
