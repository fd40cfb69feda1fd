//! Scalar components differentiated with dual numbers.

use num_dual::{Dual64, DualNum};

use crate::autodiff;
use crate::component::{Component, Jacobian};
use crate::vector::{VecView, VecViewMut};
use crate::{Result, VarSpec, VariableRegistry};

type DualFn = Box<dyn Fn(&[Dual64]) -> Dual64>;

/// One scalar output computed from scalar parameters by a closure over
/// [`Dual64`]. The partials are exact.
///
/// ```
/// use num_dual::{Dual64, DualNum};
/// use plexus::components::DualComp;
///
/// let comp = DualComp::new(&["x", "y"], "z", |v: &[Dual64]| v[0] * v[1].exp());
/// assert_eq!(comp.inputs(), ["x", "y"]);
/// ```
pub struct DualComp {
    inputs: Vec<String>,
    output: String,
    f: DualFn,
}

impl DualComp {
    pub fn new<F>(inputs: &[&str], output: &str, f: F) -> Self
    where
        F: Fn(&[Dual64]) -> Dual64 + 'static,
    {
        DualComp {
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            output: output.to_string(),
            f: Box::new(f),
        }
    }

    pub fn inputs(&self) -> &[String] {
        &self.inputs
    }

    fn point(&self, params: &VecView) -> Result<Vec<f64>> {
        self.inputs.iter().map(|name| params.scalar(name)).collect()
    }
}

impl Component for DualComp {
    fn setup(&mut self, vars: &mut VariableRegistry) -> Result<()> {
        for name in &self.inputs {
            vars.add_param(name, VarSpec::value(0.0))?;
        }
        vars.add_output(&self.output, VarSpec::value(0.0))
    }

    fn compute_outputs(&mut self, params: &VecView, unknowns: &mut VecViewMut) -> Result<()> {
        let x: Vec<Dual64> = self.point(params)?.into_iter().map(Dual64::from).collect();
        unknowns.set_scalar(&self.output, (self.f)(&x).re())
    }

    fn linearize(&mut self, params: &VecView, _unknowns: &VecView, _resids: &VecView) -> Result<Option<Jacobian>> {
        let (_, grad) = autodiff::gradient(|v| (self.f)(v), &self.point(params)?);
        let mut jac = Jacobian::new();
        for (name, d) in self.inputs.iter().zip(grad) {
            jac.insert_scalar(&self.output, name, d);
        }
        Ok(Some(jac))
    }
}
