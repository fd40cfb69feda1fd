//! The contract every leaf component satisfies.
//!
//! A component declares its variables in [`Component::setup`] and then only
//! has to implement the methods it wants to specialize:
//!
//! - explicit components implement [`compute_outputs`](Component::compute_outputs)
//!   and inherit a residual that measures how far the stored outputs are from
//!   freshly computed ones;
//! - implicit components override [`evaluate_residual`](Component::evaluate_residual);
//! - [`linearize`](Component::linearize) returns analytic Jacobian blocks,
//!   which the default [`apply_linear`](Component::apply_linear) multiplies
//!   through. Without blocks the model falls back to finite differences.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use nalgebra::{DMatrix, DVector};

use crate::finite_difference::FdOptions;
use crate::vector::{Layout, VecView, VecViewMut};
use crate::{Error, Result, VariableRegistry};

/// Direction of a Jacobian product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum LinearMode {
    /// `d_resids += J d_inputs`
    Forward,
    /// `d_inputs += J^T d_resids`
    Reverse,
}

impl fmt::Display for LinearMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinearMode::Forward => write!(f, "fwd"),
            LinearMode::Reverse => write!(f, "rev"),
        }
    }
}

impl FromStr for LinearMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fwd" => Ok(LinearMode::Forward),
            "rev" => Ok(LinearMode::Reverse),
            _ => Err(Error::InvalidOption { option: "mode", allowed: "['fwd', 'rev']", value: s.to_string() }),
        }
    }
}

/// Partial derivative blocks keyed by `(output, input)` local names.
///
/// Each block is `output_size x input_size`; an input is either a parameter
/// or a state of the same component. Missing pairs are structurally zero.
///
/// ```
/// use nalgebra::DMatrix;
/// use plexus::Jacobian;
///
/// let mut jac = Jacobian::new();
/// jac.insert_scalar("f", "x", 2.0);
/// jac.insert("y", "x", DMatrix::from_row_slice(2, 1, &[1.0, 3.0]));
/// assert_eq!(jac.get("y", "x").unwrap()[(1, 0)], 3.0);
/// assert!(jac.get("f", "y").is_none());
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Jacobian {
    blocks: BTreeMap<(String, String), DMatrix<f64>>,
}

impl Jacobian {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the block for `d of / d wrt`, replacing any previous one.
    pub fn insert(&mut self, of: &str, wrt: &str, block: DMatrix<f64>) {
        self.blocks.insert((of.to_string(), wrt.to_string()), block);
    }

    /// Stores a 1x1 block.
    pub fn insert_scalar(&mut self, of: &str, wrt: &str, value: f64) {
        self.insert(of, wrt, DMatrix::from_element(1, 1, value));
    }

    pub fn get(&self, of: &str, wrt: &str) -> Option<&DMatrix<f64>> {
        self.blocks.get(&(of.to_string(), wrt.to_string()))
    }

    pub fn contains(&self, of: &str, wrt: &str) -> bool {
        self.get(of, wrt).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, &DMatrix<f64>)> {
        self.blocks.iter().map(|((of, wrt), block)| (of.as_str(), wrt.as_str(), block))
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Checks every key and block shape against the component's layouts.
    pub fn validate(&self, component: &str, unknowns: &Layout, params: &Layout) -> Result<()> {
        for (of, wrt, block) in self.iter() {
            let key_error = |reason: &str| Error::InvalidJacobianKey {
                component: component.to_string(),
                output: of.to_string(),
                input: wrt.to_string(),
                reason: reason.to_string(),
            };

            let out = unknowns.slot(of).ok_or_else(|| key_error("unknown output"))?;
            let inp = match (params.slot(wrt), unknowns.slot(wrt)) {
                (Some(slot), _) => slot,
                (None, Some(slot)) if slot.state => slot,
                (None, Some(_)) => return Err(key_error("input is an explicit output")),
                (None, None) => return Err(key_error("unknown input")),
            };
            if out.by_obj || inp.by_obj {
                return Err(key_error("variable is passed by object"));
            }

            if block.nrows() != out.size || block.ncols() != inp.size {
                return Err(Error::JacobianShape {
                    component: component.to_string(),
                    output: of.to_string(),
                    input: wrt.to_string(),
                    expected_rows: out.size,
                    expected_cols: inp.size,
                    rows: block.nrows(),
                    cols: block.ncols(),
                });
            }
        }
        Ok(())
    }
}

/// Vectors handed to [`Component::apply_linear`].
///
/// In forward mode `d_params` and the state entries of `d_unknowns` are
/// inputs and `d_resids` accumulates the result. In reverse mode `d_resids`
/// is the input and the product accumulates into `d_params` and the state
/// entries of `d_unknowns`.
pub struct LinearContext<'a> {
    pub params: VecView<'a>,
    pub unknowns: VecView<'a>,
    pub d_params: VecViewMut<'a>,
    pub d_unknowns: VecViewMut<'a>,
    pub d_resids: VecViewMut<'a>,
    /// Blocks cached by the last linearization
    pub jacobian: Option<&'a Jacobian>,
}

impl LinearContext<'_> {
    fn is_state(&self, name: &str) -> bool {
        self.unknowns.layout().slot(name).is_some_and(|s| s.state)
    }

    /// Multiplies by the cached blocks, or does nothing without any.
    pub fn apply_jacobian(&mut self, mode: LinearMode) -> Result<()> {
        let Some(jacobian) = self.jacobian else { return Ok(()) };

        for (of, wrt, block) in jacobian.iter() {
            let state = self.is_state(wrt);
            match mode {
                LinearMode::Forward => {
                    let x = if state { self.d_unknowns.get(wrt)? } else { self.d_params.get(wrt)? };
                    let product = block * DVector::from_column_slice(x);
                    for (r, v) in self.d_resids.get_mut(of)?.iter_mut().zip(product.iter()) {
                        *r += v;
                    }
                }
                LinearMode::Reverse => {
                    let y = DVector::from_column_slice(self.d_resids.get(of)?);
                    let product = block.tr_mul(&y);
                    let target = if state { &mut self.d_unknowns } else { &mut self.d_params };
                    for (d, v) in target.get_mut(wrt)?.iter_mut().zip(product.iter()) {
                        *d += v;
                    }
                }
            }
        }
        Ok(())
    }
}

/// A leaf of the model tree.
pub trait Component {
    /// Declares parameters, outputs and states.
    fn setup(&mut self, vars: &mut VariableRegistry) -> Result<()>;

    /// Computes outputs from parameters. Implicit components may use this to
    /// converge their states locally.
    fn compute_outputs(&mut self, _params: &VecView, _unknowns: &mut VecViewMut) -> Result<()> {
        Ok(())
    }

    /// Evaluates residuals without changing the unknowns.
    ///
    /// The default is [`explicit_residual`].
    fn evaluate_residual(
        &mut self,
        params: &VecView,
        unknowns: &mut VecViewMut,
        resids: &mut VecViewMut,
    ) -> Result<()> {
        explicit_residual(self, params, unknowns, resids)
    }

    /// Returns analytic partials of the residuals, or `None` if there are none.
    fn linearize(&mut self, _params: &VecView, _unknowns: &VecView, _resids: &VecView) -> Result<Option<Jacobian>> {
        Ok(None)
    }

    /// Applies the Jacobian (forward) or its transpose (reverse).
    fn apply_linear(&self, ctx: &mut LinearContext, mode: LinearMode) -> Result<()> {
        ctx.apply_jacobian(mode)
    }

    /// Whether [`apply_linear`](Component::apply_linear) is overridden with a
    /// product that needs no cached blocks.
    fn provides_jacobian_product(&self) -> bool {
        false
    }

    /// Finite difference settings for this component.
    fn fd_options(&self) -> FdOptions {
        FdOptions::default()
    }
}

/// Residual of an explicit component: the change `compute_outputs` would make.
///
/// The residual storage is used to remember the old outputs, so on return the
/// unknowns hold their previous values and the residuals hold
/// `new_outputs - old_outputs`. Object outputs are put back as well; they
/// have no residual.
pub fn explicit_residual<C: Component + ?Sized>(
    component: &mut C,
    params: &VecView,
    unknowns: &mut VecViewMut,
    resids: &mut VecViewMut,
) -> Result<()> {
    for (r, u) in resids.as_mut_slice().iter_mut().zip(unknowns.as_slice()) {
        *r = -u;
    }

    let objects = unknowns.objects_snapshot();
    component.compute_outputs(params, unknowns)?;
    if let Some(objects) = objects {
        unknowns.restore_objects(objects);
    }

    for (r, u) in resids.as_mut_slice().iter_mut().zip(unknowns.as_mut_slice().iter_mut()) {
        *r += *u;
        *u -= *r;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::ObjectStore;
    use crate::VarSpec;
    use std::any::Any;
    use std::rc::Rc;

    struct SetFive;

    impl Component for SetFive {
        fn setup(&mut self, vars: &mut VariableRegistry) -> Result<()> {
            vars.add_param("x", VarSpec::value(0.0))?;
            vars.add_output("y", VarSpec::value(2.0))
        }

        fn compute_outputs(&mut self, _params: &VecView, unknowns: &mut VecViewMut) -> Result<()> {
            unknowns.set_scalar("y", 5.0)
        }
    }

    fn layouts(comp: &mut dyn Component) -> (Layout, Layout) {
        let mut vars = VariableRegistry::new("c");
        comp.setup(&mut vars).unwrap();
        vars.finalize("c", true);
        (
            Layout::from_metas(vars.unknowns(), |m| m.relative_name.as_str()),
            Layout::from_metas(vars.params(), |m| m.relative_name.as_str()),
        )
    }

    #[test]
    fn test_explicit_residual_leaves_outputs() {
        let mut comp = SetFive;
        let (ul, pl) = layouts(&mut comp);
        let p = vec![0.0];
        let mut u = vec![2.0];
        let mut r = vec![0.0];

        comp.evaluate_residual(
            &VecView::new("c", &pl, &p),
            &mut VecViewMut::new("c", &ul, &mut u),
            &mut VecViewMut::new("c", &ul, &mut r),
        )
        .unwrap();

        assert_eq!(r, vec![3.0]);
        assert_eq!(u, vec![2.0]);
    }

    /// Replaces its object output with a label of the input.
    struct Labeller;

    impl Component for Labeller {
        fn setup(&mut self, vars: &mut VariableRegistry) -> Result<()> {
            vars.add_param("x", VarSpec::value(0.0))?;
            vars.add_output("y", VarSpec::value(1.0))?;
            vars.add_output("label", VarSpec::object(Rc::new(String::from("old"))))
        }

        fn compute_outputs(&mut self, params: &VecView, unknowns: &mut VecViewMut) -> Result<()> {
            unknowns.set_scalar("y", params.scalar("x")?)?;
            unknowns.set_object("label", Rc::new(format!("x = {}", params.scalar("x")?)))
        }
    }

    #[test]
    fn test_explicit_residual_leaves_object_outputs() {
        let mut comp = Labeller;
        let (ul, pl) = layouts(&mut comp);
        let p = vec![4.0];
        let mut u = vec![1.0];
        let mut r = vec![0.0];
        let mut objects = ObjectStore::new();
        objects.insert("label".to_string(), Rc::new(String::from("old")) as Rc<dyn Any>);

        comp.evaluate_residual(
            &VecView::new("c", &pl, &p),
            &mut VecViewMut::new("c", &ul, &mut u).with_objects(&mut objects),
            &mut VecViewMut::new("c", &ul, &mut r),
        )
        .unwrap();

        assert_eq!(r, vec![3.0]);
        assert_eq!(u, vec![1.0]);
        let label = objects["label"].downcast_ref::<String>().unwrap();
        assert_eq!(label, "old");
    }

    #[test]
    fn test_linear_mode_parse() {
        assert_eq!("fwd".parse::<LinearMode>().unwrap(), LinearMode::Forward);
        assert_eq!("rev".parse::<LinearMode>().unwrap(), LinearMode::Reverse);
        assert!(matches!("auto".parse::<LinearMode>(), Err(Error::InvalidOption { .. })));
    }

    struct Implicit;

    impl Component for Implicit {
        fn setup(&mut self, vars: &mut VariableRegistry) -> Result<()> {
            vars.add_param("x", VarSpec::value([1.0, 2.0]))?;
            vars.add_output("y", VarSpec::value(0.0))?;
            vars.add_state("s", VarSpec::value(0.0))
        }
    }

    fn jacobian() -> Jacobian {
        let mut jac = Jacobian::new();
        jac.insert("y", "x", DMatrix::from_row_slice(1, 2, &[2.0, 3.0]));
        jac.insert_scalar("s", "s", 4.0);
        jac.insert_scalar("s", "y", 1.0);
        jac
    }

    #[test]
    fn test_validate_keys_and_shapes() {
        let (ul, pl) = layouts(&mut Implicit);
        let err = jacobian().validate("c", &ul, &pl).unwrap_err();
        assert!(matches!(err, Error::InvalidJacobianKey { ref input, .. } if input == "y"));

        let mut jac = Jacobian::new();
        jac.insert("y", "x", DMatrix::zeros(2, 1));
        let err = jac.validate("c", &ul, &pl).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Jacobian in component 'c' between the variables 'y' and 'x' is the wrong size. It should be 1 by 2 but is 2 by 1"
        );

        let mut jac = Jacobian::new();
        jac.insert_scalar("z", "x", 1.0);
        assert!(matches!(jac.validate("c", &ul, &pl), Err(Error::InvalidJacobianKey { .. })));
    }

    #[test]
    fn test_apply_jacobian_both_modes() {
        let (ul, pl) = layouts(&mut Implicit);
        let mut jac = jacobian();
        jac.blocks.remove(&("s".to_string(), "y".to_string()));
        jac.validate("c", &ul, &pl).unwrap();

        let (p, u) = (vec![1.0, 2.0], vec![0.0, 0.0]);
        let mut dp = vec![1.0, 10.0];
        let mut du = vec![0.0, 0.5];
        let mut dr = vec![0.0, 0.0];
        {
            let mut ctx = LinearContext {
                params: VecView::new("c", &pl, &p),
                unknowns: VecView::new("c", &ul, &u),
                d_params: VecViewMut::new("c", &pl, &mut dp),
                d_unknowns: VecViewMut::new("c", &ul, &mut du),
                d_resids: VecViewMut::new("c", &ul, &mut dr),
                jacobian: Some(&jac),
            };
            ctx.apply_jacobian(LinearMode::Forward).unwrap();
        }
        assert_eq!(dr, vec![32.0, 2.0]);

        let mut dp = vec![0.0, 0.0];
        let mut du = vec![0.0, 0.0];
        let mut dr = vec![1.0, 2.0];
        {
            let mut ctx = LinearContext {
                params: VecView::new("c", &pl, &p),
                unknowns: VecView::new("c", &ul, &u),
                d_params: VecViewMut::new("c", &pl, &mut dp),
                d_unknowns: VecViewMut::new("c", &ul, &mut du),
                d_resids: VecViewMut::new("c", &ul, &mut dr),
                jacobian: Some(&jac),
            };
            ctx.apply_jacobian(LinearMode::Reverse).unwrap();
        }
        assert_eq!(dp, vec![2.0, 3.0]);
        assert_eq!(du, vec![0.0, 8.0]);
    }
}
