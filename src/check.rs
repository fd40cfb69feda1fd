//! Cross-checks of analytic derivatives against finite differences.
//!
//! Every compared pair gets three magnitudes (forward, reverse, fd), three
//! absolute errors (fwd - fd, rev - fd, fwd - rev) and the same errors
//! relative to the fd magnitude. When the fd magnitude is zero the relative
//! errors equal the absolute ones.

use std::collections::BTreeMap;
use std::io::Write;

use nalgebra::DMatrix;

use crate::component::LinearMode;
use crate::finite_difference::FdOptions;
use crate::gradient::{calc_gradient, GradientContext, GradientMode, ReturnFormat};
use crate::system::Model;
use crate::{Result, VarKind};

/// Comparison of one derivative block.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivativeCheck {
    pub j_fwd: DMatrix<f64>,
    pub j_rev: DMatrix<f64>,
    pub j_fd: DMatrix<f64>,
    /// `(|J_fwd|, |J_rev|, |J_fd|)`
    pub magnitude: (f64, f64, f64),
    /// `(|J_fwd - J_fd|, |J_rev - J_fd|, |J_fwd - J_rev|)`
    pub abs_error: (f64, f64, f64),
    pub rel_error: (f64, f64, f64),
    /// No analytic block was provided for this pair
    pub skipped: bool,
}

impl DerivativeCheck {
    pub fn new(j_fwd: DMatrix<f64>, j_rev: DMatrix<f64>, j_fd: DMatrix<f64>, skipped: bool) -> Self {
        let magnitude = (j_fwd.norm(), j_rev.norm(), j_fd.norm());
        let abs_error = ((&j_fwd - &j_fd).norm(), (&j_rev - &j_fd).norm(), (&j_fwd - &j_rev).norm());
        let scale = if magnitude.2 == 0.0 { 1.0 } else { magnitude.2 };
        let rel_error = (abs_error.0 / scale, abs_error.1 / scale, abs_error.2 / scale);
        DerivativeCheck { j_fwd, j_rev, j_fd, magnitude, abs_error, rel_error, skipped }
    }

    /// Largest of the three relative errors.
    pub fn max_rel_error(&self) -> f64 {
        self.rel_error.0.max(self.rel_error.1).max(self.rel_error.2)
    }
}

/// Partial checks, keyed by component pathname and then `(output, input)`.
pub type PartialReport = BTreeMap<String, BTreeMap<(String, String), DerivativeCheck>>;

/// Total checks keyed by `(output, input)`.
pub type TotalReport = BTreeMap<(String, String), DerivativeCheck>;

/// Formats like C's `%.6e`.
fn sci(v: f64) -> String {
    let s = format!("{v:.6e}");
    match s.split_once('e') {
        Some((mantissa, exp)) => match exp.parse::<i32>() {
            Ok(e) => format!("{mantissa}e{}{:02}", if e < 0 { '-' } else { '+' }, e.abs()),
            Err(_) => s,
        },
        None => s,
    }
}

fn write_pair(out: &mut dyn Write, of: &str, wrt: &str, check: &DerivativeCheck, started: &mut bool) -> Result<()> {
    if *started {
        writeln!(out, "{}", " -".repeat(30))?;
    }
    *started = true;

    writeln!(out, "  Variable '{of}' wrt '{wrt}'\n")?;
    writeln!(out, "    Forward Magnitude : {}", sci(check.magnitude.0))?;
    writeln!(out, "    Reverse Magnitude : {}", sci(check.magnitude.1))?;
    writeln!(out, "         Fd Magnitude : {}\n", sci(check.magnitude.2))?;
    writeln!(out, "    Absolute Error (Jfor - Jfd) : {}", sci(check.abs_error.0))?;
    writeln!(out, "    Absolute Error (Jrev - Jfd) : {}", sci(check.abs_error.1))?;
    writeln!(out, "    Absolute Error (Jfor - Jrev): {}\n", sci(check.abs_error.2))?;
    writeln!(out, "    Relative Error (Jfor - Jfd) : {}", sci(check.rel_error.0))?;
    writeln!(out, "    Relative Error (Jrev - Jfd) : {}", sci(check.rel_error.1))?;
    writeln!(out, "    Relative Error (Jfor - Jrev): {}\n", sci(check.rel_error.2))?;
    writeln!(out, "    Raw Forward Derivative (Jfor)\n{}", check.j_fwd)?;
    writeln!(out, "    Raw Reverse Derivative (Jrev)\n{}", check.j_rev)?;
    writeln!(out, "    Raw FD Derivative (Jfd)\n{}", check.j_fd)?;
    Ok(())
}

/// Checks every active component's partials.
///
/// Components that force finite differences are not checked. Every other
/// component goes through its own `apply_linear`, so a hand-written product
/// is compared even when its cached blocks came from finite differences.
/// Pairs without an analytic block are compared as zero and flagged `skipped`.
pub fn check_partials(model: &mut Model, fd_options: &FdOptions, mut out: Option<&mut dyn Write>) -> Result<PartialReport> {
    model.linearize()?;
    if let Some(w) = out.as_deref_mut() {
        writeln!(w, "Partial Derivatives Check\n")?;
    }

    let mut report = PartialReport::new();
    for idx in model.active_units() {
        let node = &model.nodes()[idx];
        let Some(unit) = node.unit() else { continue };
        if unit.fd_options().force_fd {
            continue;
        }

        let cname = node.pathname.clone();
        let u_layout = unit.u_layout().clone();
        let p_layout = unit.p_layout().clone();
        let cached = unit.jacobian().cloned();

        let inputs: Vec<(String, bool)> = p_layout
            .iter()
            .filter(|(_, s)| !s.by_obj)
            .map(|(n, _)| (n.to_string(), false))
            .chain(u_layout.iter().filter(|(_, s)| s.state && !s.by_obj).map(|(n, _)| (n.to_string(), true)))
            .collect();
        let outputs: Vec<String> = u_layout.iter().filter(|(_, s)| !s.by_obj).map(|(n, _)| n.to_string()).collect();
        let skipped = |of: &str, wrt: &str| cached.as_ref().is_some_and(|jac| !jac.contains(of, wrt));
        let input_range = |wrt: &str, state: bool| {
            let layout = if state { &u_layout } else { &p_layout };
            layout.slot(wrt).map(|s| s.range()).unwrap_or_default()
        };
        let output_range = |of: &str| u_layout.slot(of).map(|s| s.range()).unwrap_or_default();

        let mut j_fwd = BTreeMap::new();
        let mut j_rev = BTreeMap::new();
        for of in &outputs {
            for (wrt, state) in &inputs {
                let shape = (output_range(of).len(), input_range(wrt, *state).len());
                j_fwd.insert((of.clone(), wrt.clone()), DMatrix::zeros(shape.0, shape.1));
                j_rev.insert((of.clone(), wrt.clone()), DMatrix::zeros(shape.0, shape.1));
            }
        }

        let (np, nu) = (p_layout.len(), u_layout.len());

        for of in &outputs {
            for (row, i) in output_range(of).enumerate() {
                let (mut dp, mut du, mut dr) = (vec![0.0; np], vec![0.0; nu], vec![0.0; nu]);
                dr[i] = 1.0;
                model.unit_apply_linear(idx, LinearMode::Reverse, &mut dp, &mut du, &mut dr)?;
                for (wrt, state) in &inputs {
                    if skipped(of, wrt) {
                        continue;
                    }
                    let source = if *state { &du } else { &dp };
                    if let Some(block) = j_rev.get_mut(&(of.clone(), wrt.clone())) {
                        for (col, k) in input_range(wrt, *state).enumerate() {
                            block[(row, col)] = source[k];
                        }
                    }
                }
            }
        }

        for (wrt, state) in &inputs {
            for (col, k) in input_range(wrt, *state).enumerate() {
                let (mut dp, mut du, mut dr) = (vec![0.0; np], vec![0.0; nu], vec![0.0; nu]);
                if *state {
                    du[k] = 1.0;
                } else {
                    dp[k] = 1.0;
                }
                model.unit_apply_linear(idx, LinearMode::Forward, &mut dp, &mut du, &mut dr)?;
                for of in &outputs {
                    if skipped(of, wrt) {
                        continue;
                    }
                    if let Some(block) = j_fwd.get_mut(&(of.clone(), wrt.clone())) {
                        for (row, i) in output_range(of).enumerate() {
                            block[(row, col)] = dr[i];
                        }
                    }
                }
            }
        }

        let j_fd = model.unit_fd(idx, fd_options)?;

        if let Some(w) = out.as_deref_mut() {
            let rule = "-".repeat(cname.len() + 15);
            writeln!(w, "{rule}\nComponent: '{cname}'\n{rule}")?;
        }

        let mut started = false;
        let mut data = BTreeMap::new();
        for (wrt, state) in &inputs {
            for of in &outputs {
                let key = (of.clone(), wrt.clone());
                let shape = (output_range(of).len(), input_range(wrt, *state).len());
                let fd = j_fd.get(of, wrt).cloned().unwrap_or_else(|| DMatrix::zeros(shape.0, shape.1));
                let fwd = j_fwd.remove(&key).unwrap_or_else(|| DMatrix::zeros(shape.0, shape.1));
                let rev = j_rev.remove(&key).unwrap_or_else(|| DMatrix::zeros(shape.0, shape.1));
                let check = DerivativeCheck::new(fwd, rev, fd, skipped(of, wrt));
                if let Some(w) = out.as_deref_mut() {
                    write_pair(w, of, wrt, &check, &mut started)?;
                }
                data.insert(key, check);
            }
        }
        log::debug!("checked {} partial blocks of '{cname}'", data.len());
        report.insert(cname, data);
    }
    Ok(report)
}

/// Independent outputs (of components with no parameters and no states)
/// and every other differentiable output, by promoted name.
pub fn total_check_names(model: &Model) -> (Vec<String>, Vec<String>) {
    let mut inputs = Vec::new();
    let mut outputs = Vec::new();
    for idx in model.active_units() {
        let Some(unit) = model.nodes()[idx].unit() else { continue };
        let registry = unit.registry();
        let independent = registry.params().is_empty() && registry.states().next().is_none();
        for meta in registry.unknowns().iter().filter(|m| m.is_differentiable()) {
            let name = model
                .unknowns()
                .iter()
                .find(|m| m.pathname == meta.pathname)
                .map_or_else(|| meta.pathname.clone(), |m| m.promoted_name.clone());
            if independent && meta.kind == VarKind::Output {
                inputs.push(name);
            } else {
                outputs.push(name);
            }
        }
    }
    (inputs, outputs)
}

/// Compares forward, reverse and finite difference total derivatives.
pub fn check_totals(model: &mut Model, ctx: &mut GradientContext, mut out: Option<&mut dyn Write>) -> Result<TotalReport> {
    if let Some(w) = out.as_deref_mut() {
        writeln!(w, "Total Derivatives Check\n")?;
    }

    let (inputs, outputs) = total_check_names(model);
    let ins: Vec<&str> = inputs.iter().map(String::as_str).collect();
    let outs: Vec<&str> = outputs.iter().map(String::as_str).collect();

    let force_fd = ctx.fd_options.force_fd;
    ctx.fd_options.force_fd = false;
    let fwd = calc_gradient(model, ctx, &ins, &outs, GradientMode::Forward, ReturnFormat::Keyed);
    let rev = calc_gradient(model, ctx, &ins, &outs, GradientMode::Reverse, ReturnFormat::Keyed);
    let fd = calc_gradient(model, ctx, &ins, &outs, GradientMode::FiniteDifference, ReturnFormat::Keyed);
    ctx.fd_options.force_fd = force_fd;
    let (fwd, rev, fd) = (fwd?, rev?, fd?);

    let mut report = TotalReport::new();
    let mut started = false;
    for wrt in &ins {
        for of in &outs {
            let (Some(f), Some(r), Some(d)) = (fwd.get(of, wrt), rev.get(of, wrt), fd.get(of, wrt)) else {
                continue;
            };
            let check = DerivativeCheck::new(f.clone(), r.clone(), d.clone(), false);
            if let Some(w) = out.as_deref_mut() {
                write_pair(w, of, wrt, &check, &mut started)?;
            }
            report.insert((of.to_string(), wrt.to_string()), check);
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{Component, Jacobian};
    use crate::components::{IndepVarComp, Paraboloid};
    use crate::partition::Serial;
    use crate::solvers::{DirectSolver, RunOnce};
    use crate::units::UnitRegistry;
    use crate::vector::{VecView, VecViewMut};
    use crate::{Group, VarSpec, VariableRegistry};
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_sci_format() {
        assert_eq!(sci(1.0), "1.000000e+00");
        assert_eq!(sci(0.00012345), "1.234500e-04");
        assert_eq!(sci(0.0), "0.000000e+00");
    }

    #[test]
    fn test_zero_fd_magnitude() {
        let check = DerivativeCheck::new(
            DMatrix::from_element(1, 1, 0.5),
            DMatrix::from_element(1, 1, 0.5),
            DMatrix::zeros(1, 1),
            false,
        );
        assert_eq!(check.rel_error.0, check.abs_error.0);
        assert_eq!(check.abs_error.2, 0.0);
    }

    /// Declares `df/dx` only, and gets it wrong by a factor of two.
    struct Sloppy;

    impl Component for Sloppy {
        fn setup(&mut self, vars: &mut VariableRegistry) -> Result<()> {
            vars.add_param("x", VarSpec::value(1.5))?;
            vars.add_param("y", VarSpec::value(2.0))?;
            vars.add_output("f", VarSpec::value(0.0))
        }

        fn compute_outputs(&mut self, params: &VecView, unknowns: &mut VecViewMut) -> Result<()> {
            unknowns.set_scalar("f", params.scalar("x")? * params.scalar("y")?)
        }

        fn linearize(&mut self, params: &VecView, _u: &VecView, _r: &VecView) -> Result<Option<Jacobian>> {
            let mut jac = Jacobian::new();
            jac.insert_scalar("f", "x", 2.0 * params.scalar("y")?);
            Ok(Some(jac))
        }
    }

    fn model() -> Model {
        let mut root = Group::new();
        root.add("px", IndepVarComp::new("x", 3.0), &["x"]);
        root.add("py", IndepVarComp::new("y", -4.0), &["y"]);
        root.add("parab", Paraboloid::new(), &["x", "y"]);
        root.add("sloppy", Sloppy, &[]);
        let mut model = Model::build(root, &Serial, &UnitRegistry::new()).unwrap();
        model.run_once().unwrap();
        model
    }

    #[test]
    fn test_partials() {
        let mut model = model();
        let mut text = Vec::new();
        let report = check_partials(&mut model, &FdOptions::default(), Some(&mut text as &mut dyn Write)).unwrap();

        let parab = &report["parab"];
        assert_eq!(parab.len(), 2);
        for check in parab.values() {
            assert!(check.abs_error.2 < 1e-12);
            assert!(check.max_rel_error() < 1e-5);
        }
        assert_approx_eq!(parab[&("f_xy".to_string(), "x".to_string())].magnitude.2, 4.0, 1e-5);

        let sloppy = &report["sloppy"];
        let fx = &sloppy[&("f".to_string(), "x".to_string())];
        assert!(!fx.skipped);
        assert_approx_eq!(fx.j_fwd[(0, 0)], 4.0);
        assert_approx_eq!(fx.rel_error.0, 1.0, 1e-5);
        let fy = &sloppy[&("f".to_string(), "y".to_string())];
        assert!(fy.skipped);
        assert_eq!(fy.j_fwd[(0, 0)], 0.0);
        assert_approx_eq!(fy.j_fd[(0, 0)], 1.5, 1e-5);

        let text = String::from_utf8(text).unwrap();
        assert!(text.starts_with("Partial Derivatives Check\n\n"));
        assert!(text.contains("Component: 'parab'"));
        assert!(text.contains("  Variable 'f_xy' wrt 'x'"));
        assert!(text.contains("    Relative Error (Jfor - Jrev): 0.000000e+00"));
    }

    #[test]
    fn test_totals() {
        let mut model = model();
        let (inputs, outputs) = total_check_names(&model);
        assert_eq!(inputs, vec!["x", "y"]);
        assert_eq!(outputs, vec!["parab:f_xy", "sloppy:f"]);

        let mut nl = RunOnce;
        let mut ln = DirectSolver::new();
        let mut ctx = GradientContext { nonlinear: &mut nl, linear: &mut ln, fd_options: FdOptions::default() };
        let report = check_totals(&mut model, &mut ctx, None).unwrap();
        assert_eq!(report.len(), 4);
        let check = &report[&("parab:f_xy".to_string(), "y".to_string())];
        assert_approx_eq!(check.j_fwd[(0, 0)], 3.0);
        assert!(check.max_rel_error() < 1e-5);
    }
}
