//! Affine map component.

use nalgebra::{DMatrix, DVector};

use crate::component::{Component, Jacobian};
use crate::vector::{VecView, VecViewMut};
use crate::{Result, VarSpec, VariableRegistry};

/// `y = A x + b`, with parameter `x` and output `y`.
///
/// ```
/// use nalgebra::DMatrix;
/// use plexus::components::LinearMap;
///
/// let map = LinearMap::new(DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 3.0, 4.0]), vec![0.0, 1.0]);
/// assert_eq!(map.evaluate(&[1.0, 1.0]), vec![3.0, 8.0]);
/// ```
#[derive(Debug, Clone)]
pub struct LinearMap {
    a: DMatrix<f64>,
    b: DVector<f64>,
}

impl LinearMap {
    /// `b` must have one entry per row of `a`.
    pub fn new(a: DMatrix<f64>, b: Vec<f64>) -> Self {
        LinearMap { a, b: DVector::from_vec(b) }
    }

    pub fn evaluate(&self, x: &[f64]) -> Vec<f64> {
        (&self.a * DVector::from_column_slice(x) + &self.b).as_slice().to_vec()
    }
}

impl Component for LinearMap {
    fn setup(&mut self, vars: &mut VariableRegistry) -> Result<()> {
        vars.add_param("x", VarSpec::shape(&[self.a.ncols()]))?;
        vars.add_output("y", VarSpec::shape(&[self.a.nrows()]))
    }

    fn compute_outputs(&mut self, params: &VecView, unknowns: &mut VecViewMut) -> Result<()> {
        let y = self.evaluate(params.get("x")?);
        unknowns.set("y", &y)
    }

    fn linearize(&mut self, _params: &VecView, _unknowns: &VecView, _resids: &VecView) -> Result<Option<Jacobian>> {
        let mut jac = Jacobian::new();
        jac.insert("y", "x", self.a.clone());
        Ok(Some(jac))
    }
}
