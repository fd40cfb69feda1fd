use std::cell::Cell;
use std::io::Write;
use std::rc::Rc;

use assert_approx_eq::assert_approx_eq;
use nalgebra::DMatrix;
use rstest::rstest;

use plexus::components::{IndepVarComp, LinearMap, Paraboloid};
use plexus::solvers::{DirectSolver, LinearSolver, ModePreference};
use plexus::{
    Component, Error, FdOptions, Group, Jacobian, LinearContext, LinearMode, Model, Problem, Result, VarSpec,
    VariableRegistry, VecView, VecViewMut,
};

fn paraboloid() -> Problem {
    let mut root = Group::new();
    root.add("px", IndepVarComp::new("x", 3.0), &["x"]);
    root.add("py", IndepVarComp::new("y", -4.0), &["y"]);
    root.add("parab", Paraboloid::new(), &["*"]);
    let mut problem = Problem::new(root);
    problem.setup().unwrap();
    problem.run().unwrap();
    problem
}

/// px:x -> c1 (y = 2x + 1) -> c2 (y = [3; -1] y1)
fn chain() -> Problem {
    let mut root = Group::new();
    root.add("px", IndepVarComp::new("x", 2.0), &["x"]);
    root.add("c1", LinearMap::new(DMatrix::from_element(1, 1, 2.0), vec![1.0]), &["x"]);
    root.add("c2", LinearMap::new(DMatrix::from_row_slice(2, 1, &[3.0, -1.0]), vec![0.0, 0.0]), &[]);
    root.connect("c1:y", "c2:x");
    let mut problem = Problem::new(root);
    problem.setup().unwrap();
    problem.run().unwrap();
    problem
}

#[rstest]
#[case("fwd", 1e-12)]
#[case("rev", 1e-12)]
#[case("fd", 1e-5)]
fn test_paraboloid_totals(#[case] mode: &str, #[case] tol: f64) {
    let mut problem = paraboloid();
    let jac = problem.calc_gradient(&["x", "y"], &["f_xy"], mode, "array").unwrap();
    let jac = jac.as_dense().unwrap();
    assert_eq!(jac.shape(), (1, 2));
    assert_approx_eq!(jac[(0, 0)], -4.0, tol);
    assert_approx_eq!(jac[(0, 1)], 3.0, tol);
}

#[test_log::test]
fn test_chain_modes_agree() {
    let mut problem = chain();
    let fwd = problem.calc_gradient(&["x"], &["c2:y"], "fwd", "dense").unwrap();
    let rev = problem.calc_gradient(&["x"], &["c2:y"], "rev", "dense").unwrap();
    let fd = problem.calc_gradient(&["x"], &["c2:y"], "fd", "dense").unwrap();

    let fwd = fwd.as_dense().unwrap();
    assert_approx_eq!(fwd[(0, 0)], 6.0);
    assert_approx_eq!(fwd[(1, 0)], -2.0);
    assert!((fwd - rev.as_dense().unwrap()).norm() < 1e-12);
    assert!((fwd - fd.as_dense().unwrap()).norm() < 1e-5);

    // Values are untouched by the finite difference sweep.
    assert_eq!(problem.get("c2:y").unwrap().flat(), vec![15.0, -5.0]);
}

#[test_log::test]
fn test_keyed_format() {
    let mut problem = paraboloid();
    let jac = problem.calc_gradient(&["x", "y"], &["f_xy"], "rev", "dict").unwrap();
    assert!(jac.as_dense().is_none());
    assert_approx_eq!(jac.get("f_xy", "y").unwrap()[(0, 0)], 3.0);
    assert_eq!(jac.as_keyed().unwrap().len(), 2);
}

#[test_log::test]
fn test_keyed_blocks_match_dense() {
    let mut problem = chain();
    let names = (["x", "c1:y"], ["c1:y", "c2:y"]);
    let dense = problem.calc_gradient(&names.0, &names.1, "fwd", "dense").unwrap();
    let keyed = problem.calc_gradient(&names.0, &names.1, "fwd", "keyed").unwrap();
    let dense = dense.as_dense().unwrap();
    assert_eq!(dense.shape(), (3, 2));
    assert_eq!(keyed.as_keyed().unwrap().len(), 4);

    let block = keyed.get("c2:y", "x").unwrap();
    assert_eq!(block.shape(), (2, 1));
    assert_approx_eq!(block[(0, 0)], dense[(1, 0)]);
    assert_approx_eq!(block[(1, 0)], -2.0);
    assert_approx_eq!(keyed.get("c1:y", "c1:y").unwrap()[(0, 0)], 1.0);
    assert_approx_eq!(keyed.get("c2:y", "c1:y").unwrap()[(0, 0)], 3.0);
}

#[test_log::test]
fn test_auto_mode() {
    let mut problem = paraboloid();
    let err = problem.calc_gradient(&["x"], &["f_xy"], "auto", "dense").unwrap_err();
    assert!(matches!(err, Error::AutoModeUnsupported));

    let mut root = Group::new();
    root.add("px", IndepVarComp::new("x", 3.0), &["x"]);
    root.add("py", IndepVarComp::new("y", -4.0), &["y"]);
    root.add("parab", Paraboloid::new(), &["*"]);
    let mut problem = Problem::new(root).with_linear_solver(DirectSolver::new().with_mode(ModePreference::Forward));
    problem.setup().unwrap();
    problem.run().unwrap();
    let jac = problem.calc_gradient(&["x"], &["f_xy"], "auto", "dense").unwrap();
    assert_approx_eq!(jac.as_dense().unwrap()[(0, 0)], -4.0);
}

#[test_log::test]
fn test_root_force_fd() {
    let mut root = Group::new();
    root.add("px", IndepVarComp::new("x", 3.0), &["x"]);
    root.add("py", IndepVarComp::new("y", -4.0), &["y"]);
    root.add("parab", Paraboloid::new(), &["*"]);
    let mut problem = Problem::new(root).with_fd_options(FdOptions::forced().with_step(1e-7));
    problem.setup().unwrap();
    problem.run().unwrap();

    let jac = problem.calc_gradient(&["x", "y"], &["f_xy"], "rev", "dense").unwrap();
    let jac = jac.as_dense().unwrap();
    assert_approx_eq!(jac[(0, 0)], -4.0, 1e-5);
    assert_approx_eq!(jac[(0, 1)], 3.0, 1e-5);
}

#[test_log::test]
fn test_unresolved_name() {
    let mut problem = paraboloid();
    let err = problem.calc_gradient(&["x"], &["g_xy"], "fwd", "dense").unwrap_err();
    assert_eq!(err.to_string(), "'g_xy' cannot be resolved to any known output");
}

/// Returns a 2x2 block for a scalar pair.
struct BadShape;

impl Component for BadShape {
    fn setup(&mut self, vars: &mut VariableRegistry) -> Result<()> {
        vars.add_param("x", VarSpec::value(0.0))?;
        vars.add_output("y", VarSpec::value(0.0))
    }

    fn compute_outputs(&mut self, params: &VecView, unknowns: &mut VecViewMut) -> Result<()> {
        unknowns.set_scalar("y", params.scalar("x")?)
    }

    fn linearize(&mut self, _p: &VecView, _u: &VecView, _r: &VecView) -> Result<Option<Jacobian>> {
        let mut jac = Jacobian::new();
        jac.insert("y", "x", DMatrix::identity(2, 2));
        Ok(Some(jac))
    }
}

struct CountingSolver {
    solves: Rc<Cell<usize>>,
    inner: DirectSolver,
}

impl LinearSolver for CountingSolver {
    fn preference(&self) -> ModePreference {
        self.inner.preference()
    }

    fn solve(&mut self, rhs: &[f64], model: &mut Model, mode: LinearMode) -> Result<Vec<f64>> {
        self.solves.set(self.solves.get() + 1);
        self.inner.solve(rhs, model, mode)
    }
}

#[test_log::test]
fn test_shape_checked_before_solve() {
    let solves = Rc::new(Cell::new(0));
    let mut root = Group::new();
    root.add("px", IndepVarComp::new("x", 1.0), &["x"]);
    root.add("bad", BadShape, &["x"]);
    let mut problem = Problem::new(root)
        .with_linear_solver(CountingSolver { solves: Rc::clone(&solves), inner: DirectSolver::new() });
    problem.setup().unwrap();
    problem.run().unwrap();

    let err = problem.calc_gradient(&["x"], &["bad:y"], "fwd", "dense").unwrap_err();
    assert_eq!(
        err.to_string(),
        "Jacobian in component 'bad' between the variables 'y' and 'x' is the wrong size. It should be 1 by 1 but is 2 by 2"
    );
    assert_eq!(solves.get(), 0);
}

/// y = 3x through a hand-written product and no cached blocks.
struct Tripler;

impl Component for Tripler {
    fn setup(&mut self, vars: &mut VariableRegistry) -> Result<()> {
        vars.add_param("x", VarSpec::value(0.0))?;
        vars.add_output("y", VarSpec::value(0.0))
    }

    fn compute_outputs(&mut self, params: &VecView, unknowns: &mut VecViewMut) -> Result<()> {
        unknowns.set_scalar("y", 3.0 * params.scalar("x")?)
    }

    fn apply_linear(&self, ctx: &mut LinearContext, mode: LinearMode) -> Result<()> {
        match mode {
            LinearMode::Forward => {
                let dx = ctx.d_params.scalar("x")?;
                ctx.d_resids.get_mut("y")?[0] += 3.0 * dx;
            }
            LinearMode::Reverse => {
                let dy = ctx.d_resids.scalar("y")?;
                ctx.d_params.get_mut("x")?[0] += 3.0 * dy;
            }
        }
        Ok(())
    }

    fn provides_jacobian_product(&self) -> bool {
        true
    }
}

#[test_log::test]
fn test_custom_product() {
    let mut root = Group::new();
    root.add("px", IndepVarComp::new("x", 1.0), &["x"]);
    root.add("t", Tripler, &["x"]);
    root.add("parab", Paraboloid::new(), &[]);
    root.connect("t:y", "parab:x");
    let mut problem = Problem::new(root);
    problem.setup().unwrap();
    problem.run().unwrap();

    // f = (3x - 3)^2 + 16 - 3 with the hanging y at zero, so df/dx = 6 (3x - 3)
    problem.set("x", &[2.0]).unwrap();
    problem.run().unwrap();
    for mode in ["fwd", "rev"] {
        let jac = problem.calc_gradient(&["x"], &["parab:f_xy"], mode, "dense").unwrap();
        assert_approx_eq!(jac.as_dense().unwrap()[(0, 0)], 18.0);
    }

    let report = problem.check_partial_derivatives(None).unwrap();
    let check = &report["t"][&("y".to_string(), "x".to_string())];
    assert!(!check.skipped);
    assert_approx_eq!(check.j_fwd[(0, 0)], 3.0);
    assert_approx_eq!(check.j_rev[(0, 0)], 3.0);
    assert!(check.max_rel_error() < 1e-5);
}

/// Computes y = 3x but multiplies by 5 in its product. Blocks come from
/// finite differences since it neither linearizes nor claims the product.
struct Misquoted;

impl Component for Misquoted {
    fn setup(&mut self, vars: &mut VariableRegistry) -> Result<()> {
        vars.add_param("x", VarSpec::value(0.0))?;
        vars.add_output("y", VarSpec::value(0.0))
    }

    fn compute_outputs(&mut self, params: &VecView, unknowns: &mut VecViewMut) -> Result<()> {
        unknowns.set_scalar("y", 3.0 * params.scalar("x")?)
    }

    fn apply_linear(&self, ctx: &mut LinearContext, mode: LinearMode) -> Result<()> {
        match mode {
            LinearMode::Forward => {
                let dx = ctx.d_params.scalar("x")?;
                ctx.d_resids.get_mut("y")?[0] += 5.0 * dx;
            }
            LinearMode::Reverse => {
                let dy = ctx.d_resids.scalar("y")?;
                ctx.d_params.get_mut("x")?[0] += 5.0 * dy;
            }
        }
        Ok(())
    }
}

#[test_log::test]
fn test_check_partials_covers_wrong_product() {
    let mut root = Group::new();
    root.add("px", IndepVarComp::new("x", 1.0), &["x"]);
    root.add("m", Misquoted, &["x"]);
    let mut problem = Problem::new(root);
    problem.setup().unwrap();
    problem.run().unwrap();

    let jac = problem.calc_gradient(&["x"], &["m:y"], "fwd", "dense").unwrap();
    assert_approx_eq!(jac.as_dense().unwrap()[(0, 0)], 5.0);

    let report = problem.check_partial_derivatives(None).unwrap();
    let check = &report["m"][&("y".to_string(), "x".to_string())];
    assert!(!check.skipped);
    assert_approx_eq!(check.j_fwd[(0, 0)], 5.0);
    assert_approx_eq!(check.j_rev[(0, 0)], 5.0);
    assert_approx_eq!(check.j_fd[(0, 0)], 3.0, 1e-5);
    assert_approx_eq!(check.rel_error.0, 2.0 / 3.0, 1e-5);
}

#[test_log::test]
fn test_check_partials_report() {
    let mut problem = paraboloid();
    let mut text: Vec<u8> = Vec::new();
    let report = problem.check_partial_derivatives(Some(&mut text as &mut dyn Write)).unwrap();

    for check in report["parab"].values() {
        assert!(check.abs_error.2 < 1e-12);
        assert!(check.rel_error.0 < 1e-5);
        assert!(check.rel_error.1 < 1e-5);
    }
    let text = String::from_utf8(text).unwrap();
    let rule = "-".repeat(20);
    assert!(text.contains(&format!("{rule}\nComponent: 'parab'\n{rule}")));
    assert!(text.contains("    Forward Magnitude : 4.000000e+00"));
}

#[test_log::test]
fn test_check_totals() {
    let mut problem = chain();
    let report = problem.check_total_derivatives(None).unwrap();
    let check = &report[&("c2:y".to_string(), "x".to_string())];
    assert_eq!(check.j_fwd.shape(), (2, 1));
    assert!(check.abs_error.2 < 1e-12);
    assert!(check.max_rel_error() < 1e-5);
    assert!(report.contains_key(&("c1:y".to_string(), "x".to_string())));
}

#[test_log::test]
fn test_unit_scaled_derivatives() {
    struct Doubler;
    impl Component for Doubler {
        fn setup(&mut self, vars: &mut VariableRegistry) -> Result<()> {
            vars.add_param("len", VarSpec::value(0.0).units("cm"))?;
            vars.add_output("twice", VarSpec::value(0.0).units("cm"))
        }

        fn compute_outputs(&mut self, params: &VecView, unknowns: &mut VecViewMut) -> Result<()> {
            unknowns.set_scalar("twice", 2.0 * params.scalar("len")?)
        }

        fn linearize(&mut self, _p: &VecView, _u: &VecView, _r: &VecView) -> Result<Option<Jacobian>> {
            let mut jac = Jacobian::new();
            jac.insert_scalar("twice", "len", 2.0);
            Ok(Some(jac))
        }
    }

    let mut root = Group::new();
    root.add("src", IndepVarComp::new("x", 1.5).units("x", "m"), &["x"]);
    root.add("d", Doubler, &[]);
    root.connect("x", "d:len");
    let mut problem = Problem::new(root);
    problem.setup().unwrap();
    problem.run().unwrap();
    assert_approx_eq!(problem.get_scalar("d:twice").unwrap(), 300.0);

    for mode in ["fwd", "rev", "fd"] {
        let jac = problem.calc_gradient(&["x"], &["d:twice"], mode, "dense").unwrap();
        assert_approx_eq!(jac.as_dense().unwrap()[(0, 0)], 200.0, 1e-4);
    }
}

#[cfg(feature = "autodiff")]
#[test_log::test]
fn test_dual_component() {
    use num_dual::{Dual64, DualNum};
    use plexus::components::DualComp;

    let mut root = Group::new();
    root.add("px", IndepVarComp::new("x", 0.5), &["x"]);
    root.add("py", IndepVarComp::new("y", 2.0), &["y"]);
    root.add("g", DualComp::new(&["x", "y"], "g", |v: &[Dual64]| v[0].sin() * v[1] * v[1]), &["*"]);
    let mut problem = Problem::new(root);
    problem.setup().unwrap();
    problem.run().unwrap();
    assert_approx_eq!(problem.get_scalar("g").unwrap(), 0.5_f64.sin() * 4.0);

    let jac = problem.calc_gradient(&["x", "y"], &["g"], "rev", "dense").unwrap();
    let jac = jac.as_dense().unwrap();
    assert_approx_eq!(jac[(0, 0)], 0.5_f64.cos() * 4.0);
    assert_approx_eq!(jac[(0, 1)], 0.5_f64.sin() * 4.0);

    let report = problem.check_partial_derivatives(None).unwrap();
    assert!(report["g"].values().all(|c| c.max_rel_error() < 1e-5));
}
