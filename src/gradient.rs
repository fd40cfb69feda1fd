//! Total derivatives of model outputs with respect to model inputs.
//!
//! Forward mode solves `A x = e_j` once per scalar input entry and reads the
//! requested outputs out of each solution (columns). Reverse mode solves
//! `A^T y = e_i` once per scalar output entry (rows). Finite difference mode
//! perturbs the inputs and re-converges the whole model.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use nalgebra::DMatrix;

use crate::component::LinearMode;
use crate::finite_difference::{fd_jacobian, FdOptions};
use crate::solvers::{LinearSolver, NonlinearSolver};
use crate::system::Model;
use crate::{Error, Result};

/// How total derivatives are computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GradientMode {
    Forward,
    Reverse,
    FiniteDifference,
    /// Whatever the linear solver prefers
    Auto,
}

impl fmt::Display for GradientMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GradientMode::Forward => write!(f, "fwd"),
            GradientMode::Reverse => write!(f, "rev"),
            GradientMode::FiniteDifference => write!(f, "fd"),
            GradientMode::Auto => write!(f, "auto"),
        }
    }
}

impl FromStr for GradientMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fwd" => Ok(GradientMode::Forward),
            "rev" => Ok(GradientMode::Reverse),
            "fd" => Ok(GradientMode::FiniteDifference),
            "auto" => Ok(GradientMode::Auto),
            _ => Err(Error::InvalidOption { option: "mode", allowed: "['auto', 'fwd', 'rev', 'fd']", value: s.to_string() }),
        }
    }
}

/// Shape of a [`TotalJacobian`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnFormat {
    /// One matrix, outputs down and inputs across
    Dense,
    /// One block per `(output, input)` pair
    Keyed,
}

impl FromStr for ReturnFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dense" | "array" => Ok(ReturnFormat::Dense),
            "keyed" | "dict" => Ok(ReturnFormat::Keyed),
            _ => Err(Error::InvalidOption {
                option: "return_format",
                allowed: "['dense', 'keyed'] (or 'array', 'dict')",
                value: s.to_string(),
            }),
        }
    }
}

/// Result of a total derivative calculation.
#[derive(Debug, Clone, PartialEq)]
pub enum TotalJacobian {
    /// `(sum of output sizes) x (sum of input sizes)`
    Dense(DMatrix<f64>),
    /// `(output, input)` to `output_size x input_size`
    Keyed(BTreeMap<(String, String), DMatrix<f64>>),
}

impl TotalJacobian {
    pub fn as_dense(&self) -> Option<&DMatrix<f64>> {
        match self {
            TotalJacobian::Dense(m) => Some(m),
            TotalJacobian::Keyed(_) => None,
        }
    }

    pub fn as_keyed(&self) -> Option<&BTreeMap<(String, String), DMatrix<f64>>> {
        match self {
            TotalJacobian::Keyed(blocks) => Some(blocks),
            TotalJacobian::Dense(_) => None,
        }
    }

    /// Block for one pair of a keyed result.
    pub fn get(&self, output: &str, input: &str) -> Option<&DMatrix<f64>> {
        self.as_keyed()?.get(&(output.to_string(), input.to_string()))
    }
}

/// Solvers and settings a gradient calculation runs with.
pub struct GradientContext<'a> {
    pub nonlinear: &'a mut dyn NonlinearSolver,
    pub linear: &'a mut dyn LinearSolver,
    /// Whole-model finite difference settings; `force_fd` overrides the mode
    pub fd_options: FdOptions,
}

/// A requested name with its range in the unknowns vector.
struct Resolved {
    name: String,
    range: Range<usize>,
}

fn resolve_all(model: &Model, names: &[&str]) -> Result<Vec<Resolved>> {
    names
        .iter()
        .map(|&name| {
            let (_, range) = model.unknown_indices(name)?;
            Ok(Resolved { name: name.to_string(), range })
        })
        .collect()
}

fn total_size(vars: &[Resolved]) -> usize {
    vars.iter().map(|v| v.range.len()).sum()
}

/// Computes `d outputs / d inputs` for the model at its current point.
///
/// Every name is resolved before any work is done; a parameter name stands
/// for the output it is connected to.
///
/// Both formats are filled from one dense matrix. The keyed format copies
/// out every `(output, input)` block, including all-zero ones, so it costs
/// an extra copy of the dense result.
pub fn calc_gradient(
    model: &mut Model,
    ctx: &mut GradientContext,
    inputs: &[&str],
    outputs: &[&str],
    mode: GradientMode,
    format: ReturnFormat,
) -> Result<TotalJacobian> {
    let ins = resolve_all(model, inputs)?;
    let outs = resolve_all(model, outputs)?;

    let mode = if ctx.fd_options.force_fd { GradientMode::FiniteDifference } else { mode };
    let direction = match mode {
        GradientMode::Forward => Some(LinearMode::Forward),
        GradientMode::Reverse => Some(LinearMode::Reverse),
        GradientMode::FiniteDifference => None,
        GradientMode::Auto => Some(ctx.linear.preference().resolve().ok_or(Error::AutoModeUnsupported)?),
    };
    log::debug!("total derivatives of {outputs:?} wrt {inputs:?} in {mode} mode");

    let dense = match direction {
        Some(direction) => {
            model.linearize()?;
            linear_totals(model, &mut *ctx.linear, &ins, &outs, direction)?
        }
        None => total_fd_jacobian(model, ctx, &ins, &outs)?,
    };

    Ok(match format {
        ReturnFormat::Dense => TotalJacobian::Dense(dense),
        ReturnFormat::Keyed => TotalJacobian::Keyed(split_blocks(&dense, &ins, &outs)),
    })
}

fn linear_totals(
    model: &mut Model,
    linear: &mut dyn LinearSolver,
    ins: &[Resolved],
    outs: &[Resolved],
    mode: LinearMode,
) -> Result<DMatrix<f64>> {
    let mut jac = DMatrix::zeros(total_size(outs), total_size(ins));
    let mut rhs = vec![0.0; model.size()];

    let (seeds, targets) = match mode {
        LinearMode::Forward => (ins, outs),
        LinearMode::Reverse => (outs, ins),
    };

    let mut j = 0;
    for seed in seeds {
        for irhs in seed.range.clone() {
            rhs[irhs] = 1.0;
            let dx = linear.solve(&rhs, model, mode)?;
            rhs[irhs] = 0.0;

            let mut i = 0;
            for target in targets {
                for (k, idx) in target.range.clone().enumerate() {
                    match mode {
                        LinearMode::Forward => jac[(i + k, j)] = dx[idx],
                        LinearMode::Reverse => jac[(j, i + k)] = dx[idx],
                    }
                }
                i += target.range.len();
            }
            j += 1;
        }
    }
    Ok(jac)
}

/// Whole-model finite difference: each input entry is perturbed in the
/// unknowns vector and the nonlinear solver re-converges the model.
///
/// The model's vectors are restored afterwards.
fn total_fd_jacobian(
    model: &mut Model,
    ctx: &mut GradientContext,
    ins: &[Resolved],
    outs: &[Resolved],
) -> Result<DMatrix<f64>> {
    let snapshot = model.vectors.clone();
    let x0: Vec<f64> = ins.iter().flat_map(|v| snapshot.unknowns[v.range.clone()].to_vec()).collect();
    let nonlinear = &mut *ctx.nonlinear;
    let linear = &mut *ctx.linear;

    let result = fd_jacobian(&x0, total_size(outs), &ctx.fd_options, |x| {
        model.vectors.unknowns.copy_from_slice(&snapshot.unknowns);
        model.vectors.params.copy_from_slice(&snapshot.params);
        let mut k = 0;
        for v in ins {
            model.vectors.unknowns[v.range.clone()].copy_from_slice(&x[k..k + v.range.len()]);
            k += v.range.len();
        }
        nonlinear.solve(model, linear)?;
        Ok(outs.iter().flat_map(|v| model.vectors.unknowns[v.range.clone()].to_vec()).collect())
    });

    model.vectors = snapshot;
    result
}

fn split_blocks(dense: &DMatrix<f64>, ins: &[Resolved], outs: &[Resolved]) -> BTreeMap<(String, String), DMatrix<f64>> {
    let mut blocks = BTreeMap::new();
    let mut row = 0;
    for out in outs {
        let mut col = 0;
        for inp in ins {
            let block = dense.view((row, col), (out.range.len(), inp.range.len())).into_owned();
            blocks.insert((out.name.clone(), inp.name.clone()), block);
            col += inp.range.len();
        }
        row += out.range.len();
    }
    blocks
}
