//! # Plexus: hierarchical model assembly with total derivatives
//!
//! A model is a tree of groups whose leaves are components. Every component
//! declares parameters (inputs), outputs and implicit states; the tree is
//! flattened at setup into an arena, connections are resolved (explicitly
//! declared or implied by matching promoted names), and flat vectors are
//! allocated for values, residuals and their derivative counterparts.
//!
//! On top of that the crate computes total derivatives of selected outputs
//! with respect to selected inputs, either by repeated directional linear
//! solves (forward or adjoint) or by finite differencing the whole model, and
//! it can cross-check every component's analytic partials.
//!
//! ## Example
//!
//! ```
//! use plexus::components::{IndepVarComp, Paraboloid};
//! use plexus::{Group, Problem};
//!
//! let mut root = Group::new();
//! root.add("px", IndepVarComp::new("x", 3.0), &["x"]);
//! root.add("py", IndepVarComp::new("y", -4.0), &["y"]);
//! root.add("parab", Paraboloid::new(), &["x", "y", "f_xy"]);
//!
//! let mut problem = Problem::new(root);
//! problem.setup().unwrap();
//! problem.run().unwrap();
//! assert_eq!(problem.get_scalar("f_xy").unwrap(), -15.0);
//!
//! let jac = problem.calc_gradient(&["x", "y"], &["f_xy"], "fwd", "dense").unwrap();
//! let jac = jac.as_dense().unwrap();
//! assert!((jac[(0, 0)] - -4.0).abs() < 1e-10);
//! assert!((jac[(0, 1)] - 3.0).abs() < 1e-10);
//! ```
//!
//! ## Optional Features
//!
//! - **`autodiff`** (default): dual-number Jacobian blocks using `num-dual`
//! - **`serde`**: `Serialize`/`Deserialize` for option structs

use std::any::Any;
use std::fmt;
use std::rc::Rc;

#[cfg(feature = "autodiff")]
pub mod autodiff;

pub mod check;
pub mod component;
pub mod components;
pub mod connections;
pub mod driver;
pub mod finite_difference;
pub mod gradient;
pub mod partition;
pub mod problem;
pub mod solvers;
pub mod system;
pub mod units;
pub mod vector;

pub use component::{Component, Jacobian, LinearContext, LinearMode};
pub use finite_difference::{FdForm, FdOptions};
pub use gradient::{GradientMode, ReturnFormat, TotalJacobian};
pub use problem::Problem;
pub use system::{Group, Model};
pub use vector::{VecView, VecViewMut};

/// Separator between the parts of an absolute pathname.
pub const SEPARATOR: char = ':';

/// Joins a system pathname and a local name.
pub fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() { name.to_string() } else { format!("{parent}{SEPARATOR}{name}") }
}

/// Result type for model operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building, setting up or differentiating a model.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A variable was declared without a value and without a shape
    #[error("Shape of {kind} '{name}' must be specified because 'val' is not set")]
    ShapeRequired { kind: VarKind, name: String },
    /// A variable name was registered twice in one component
    #[error("{owner}: variable '{name}' already exists")]
    DuplicateVariable { owner: String, name: String },
    /// A variable was registered after setup
    #[error("{owner}: can't add variable '{name}' because setup has already been called")]
    RegistryFrozen { owner: String, name: String },
    /// Two children of one group share a name
    #[error("Group '{group}' already contains a subsystem named '{name}'")]
    DuplicateSubsystem { group: String, name: String },
    /// A promote pattern matched nothing in the child
    #[error("'{system}' promotes '{pattern}' but no variable matches")]
    UnmatchedPromotion { system: String, pattern: String },
    /// `setup` was called on a problem that is already set up
    #[error("Problem has already been set up")]
    AlreadySetUp,
    /// `setup` was called again after an earlier attempt failed and consumed the tree
    #[error("Problem setup failed earlier: {0}")]
    SetupFailed(String),
    /// A string option is not one of its enumerated values
    #[error("{option} must be one of {allowed}, got '{value}'")]
    InvalidOption { option: &'static str, allowed: &'static str, value: String },
    /// A target is connected explicitly and implicitly to different sources
    #[error("'{target}' is explicitly connected to '{explicit}' but implicitly connected to '{implicit}'")]
    ConnectionConflict { target: String, explicit: String, implicit: String },
    /// A promoted name resolves to several outputs
    #[error("Promoted name '{name}' matches multiple unknowns: {matches:?}")]
    AmbiguousPromotion { name: String, matches: Vec<String> },
    /// Connected variables carry units with no linear conversion
    #[error(
        "Unit '{source_units}' in source '{source_name}' is incompatible with unit '{target_units}' in target '{target_name}'"
    )]
    IncompatibleUnits {
        source_name: String,
        source_units: String,
        target_name: String,
        target_units: String,
    },
    /// A declared connection is structurally invalid
    #[error("Can't connect '{source_name}' to '{target}': {reason}")]
    InvalidConnection { source_name: String, target: String, reason: String },
    /// A unit string could not be interpreted
    #[error(transparent)]
    Units(#[from] units::UnitError),
    /// A cached Jacobian block has the wrong shape
    #[error(
        "Jacobian in component '{component}' between the variables '{output}' and '{input}' is the wrong size. It should be {expected_rows} by {expected_cols} but is {rows} by {cols}"
    )]
    JacobianShape {
        component: String,
        output: String,
        input: String,
        expected_rows: usize,
        expected_cols: usize,
        rows: usize,
        cols: usize,
    },
    /// A cached Jacobian block is keyed on something that is not a derivative pair
    #[error("Jacobian in component '{component}' has an invalid key ('{output}', '{input}'): {reason}")]
    InvalidJacobianKey { component: String, output: String, input: String, reason: String },
    /// Automatic choice between forward and reverse is not available
    #[error("Automatic mode selection not supported; configure the linear solver with 'fwd' or 'rev'")]
    AutoModeUnsupported,
    /// Vectors were accessed before setup built them
    #[error("Vectors have not yet been initialized for '{0}'")]
    Uninitialized(String),
    /// A system that is not active on this process was asked for data
    #[error("'{0}' is not active on this process")]
    Inactive(String),
    /// A named variable does not exist in the addressed vector
    #[error("'{owner}' has no variable named '{name}'")]
    UnknownVariable { owner: String, name: String },
    /// A gradient name is neither an output nor a connected parameter
    #[error("'{0}' cannot be resolved to any known output")]
    UnresolvedName(String),
    /// A subsystem pathname does not exist
    #[error("No subsystem named '{0}'")]
    UnknownSubsystem(String),
    /// Numeric access to a pass-by-object variable
    #[error("'{0}' is passed by object and has no numeric storage")]
    NotNumeric(String),
    /// A value of the wrong length was written to a variable
    #[error("'{name}' holds {expected} values but {actual} were given")]
    SizeMismatch { name: String, expected: usize, actual: usize },
    /// The dense linear system is singular
    #[error("Linear system of size {0} is singular")]
    SingularMatrix(usize),
    /// An iterative linear solve did not converge
    #[error("Linear solve failed to converge after {iterations} iterations (residual {residual:e})")]
    LinearSolveFailed { iterations: usize, residual: f64 },
    /// A nonlinear solve did not converge or diverged
    #[error("Nonlinear solve failed after {iterations} iterations (residual {residual:e}): {reason}")]
    NonlinearSolveFailed { iterations: usize, residual: f64, reason: &'static str },
    /// A component reported a failure of its own
    #[error("Component '{component}' failed: {message}")]
    Component { component: String, message: String },
    /// Writing a report failed
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Role of a variable inside its component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum VarKind {
    /// Input, connected to at most one source
    Param,
    /// Explicitly computed output
    Output,
    /// Output determined implicitly by driving its residual to zero
    State,
}

impl fmt::Display for VarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarKind::Param => write!(f, "param"),
            VarKind::Output => write!(f, "output"),
            VarKind::State => write!(f, "state"),
        }
    }
}

/// Value held by a variable.
#[derive(Clone)]
pub enum Value {
    /// A single float
    Scalar(f64),
    /// A dense float array in row-major order
    Array { data: Vec<f64>, shape: Vec<usize> },
    /// Opaque, non-differentiable payload passed by reference
    Object(Rc<dyn Any>),
}

impl Value {
    /// Creates a one-dimensional array value.
    pub fn array(data: Vec<f64>) -> Self {
        let shape = vec![data.len()];
        Value::Array { data, shape }
    }

    /// Creates a zero-filled value of the given shape; `[1]` gives a scalar.
    pub fn zeros(shape: &[usize]) -> Self {
        if shape == [1] {
            Value::Scalar(0.0)
        } else {
            Value::Array { data: vec![0.0; shape.iter().product()], shape: shape.to_vec() }
        }
    }

    /// Whether the value can live in a derivative vector.
    pub fn is_differentiable(&self) -> bool {
        !matches!(self, Value::Object(_))
    }

    /// Flattened numeric data, empty for objects.
    pub fn flat(&self) -> Vec<f64> {
        match self {
            Value::Scalar(v) => vec![*v],
            Value::Array { data, .. } => data.clone(),
            Value::Object(_) => Vec::new(),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Scalar(v) => write!(f, "{v:?}"),
            Value::Array { data, shape } => write!(f, "{data:?} (shape {shape:?})"),
            Value::Object(_) => write!(f, "<object>"),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Scalar(v)
    }
}

impl From<Vec<f64>> for Value {
    fn from(data: Vec<f64>) -> Self {
        Value::array(data)
    }
}

impl<const N: usize> From<[f64; N]> for Value {
    fn from(data: [f64; N]) -> Self {
        Value::array(data.to_vec())
    }
}

/// Declaration of a variable before it is registered.
///
/// The value is explicitly optional: an unset value needs a shape.
///
/// # Examples
///
/// ```
/// use plexus::{VariableRegistry, VarSpec};
///
/// let mut vars = VariableRegistry::new("comp");
/// vars.add_param("x", VarSpec::value(2.0).units("m")).unwrap();
/// vars.add_output("y", VarSpec::shape(&[3])).unwrap();
/// assert_eq!(vars.unknown("y").unwrap().size, 3);
/// assert!(vars.add_output("z", VarSpec::unset()).is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct VarSpec {
    value: Option<Value>,
    shape: Option<Vec<usize>>,
    units: Option<String>,
    pass_by_obj: bool,
}

impl VarSpec {
    /// A variable with an initial value.
    pub fn value(value: impl Into<Value>) -> Self {
        VarSpec { value: Some(value.into()), ..Default::default() }
    }

    /// A zero-initialized variable of the given shape.
    pub fn shape(shape: &[usize]) -> Self {
        VarSpec { shape: Some(shape.to_vec()), ..Default::default() }
    }

    /// A variable with neither value nor shape; registration fails.
    pub fn unset() -> Self {
        VarSpec::default()
    }

    /// An opaque payload passed by reference.
    pub fn object(value: Rc<dyn Any>) -> Self {
        VarSpec { value: Some(Value::Object(value)), pass_by_obj: true, ..Default::default() }
    }

    /// Sets the physical units.
    pub fn units(mut self, units: &str) -> Self {
        self.units = Some(units.to_string());
        self
    }

    /// Forces pass-by-object even for a numeric value.
    pub fn pass_by_obj(mut self) -> Self {
        self.pass_by_obj = true;
        self
    }
}

/// Metadata for one registered variable.
#[derive(Debug, Clone)]
pub struct VarMeta {
    /// Absolute pathname after setup, local name before
    pub pathname: String,
    /// Name inside the owning component
    pub relative_name: String,
    /// Name as seen from the root after promotion
    pub promoted_name: String,
    pub kind: VarKind,
    /// Initial value
    pub value: Value,
    pub shape: Vec<usize>,
    /// Number of flat entries; zero when passed by object
    pub size: usize,
    pub units: Option<String>,
    /// `(scale, offset)` applied when data arrives from the source
    pub unit_conv: Option<(f64, f64)>,
    pub pass_by_obj: bool,
    /// Owned by a component that is not active on this process
    pub remote: bool,
}

impl VarMeta {
    /// Whether the variable is an implicit state.
    pub fn is_state(&self) -> bool {
        self.kind == VarKind::State
    }

    /// Whether the variable is a parameter.
    pub fn is_param(&self) -> bool {
        self.kind == VarKind::Param
    }

    /// Whether the variable takes part in derivative vectors.
    pub fn is_differentiable(&self) -> bool {
        !self.pass_by_obj && !self.remote
    }
}

/// Per-component store of variable declarations.
///
/// Variables are declared with local names while the model is being built.
/// [`finalize`](VariableRegistry::finalize) rewrites them to absolute
/// pathnames and freezes the registry.
#[derive(Debug, Clone)]
pub struct VariableRegistry {
    owner: String,
    params: Vec<VarMeta>,
    unknowns: Vec<VarMeta>,
    finalized: bool,
}

impl VariableRegistry {
    /// Creates an empty registry for the named component.
    pub fn new(owner: &str) -> Self {
        VariableRegistry {
            owner: owner.to_string(),
            params: Vec::new(),
            unknowns: Vec::new(),
            finalized: false,
        }
    }

    /// Declares a parameter.
    pub fn add_param(&mut self, name: &str, spec: VarSpec) -> Result<()> {
        let meta = self.build(name, spec, VarKind::Param)?;
        self.params.push(meta);
        Ok(())
    }

    /// Declares an explicit output.
    pub fn add_output(&mut self, name: &str, spec: VarSpec) -> Result<()> {
        let meta = self.build(name, spec, VarKind::Output)?;
        self.unknowns.push(meta);
        Ok(())
    }

    /// Declares an implicit state.
    pub fn add_state(&mut self, name: &str, spec: VarSpec) -> Result<()> {
        let meta = self.build(name, spec, VarKind::State)?;
        self.unknowns.push(meta);
        Ok(())
    }

    fn check_name(&self, name: &str) -> Result<()> {
        if self.finalized {
            return Err(Error::RegistryFrozen { owner: self.owner.clone(), name: name.to_string() });
        }
        if self.param(name).is_some() || self.unknown(name).is_some() {
            return Err(Error::DuplicateVariable {
                owner: self.owner.clone(),
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn build(&self, name: &str, spec: VarSpec, kind: VarKind) -> Result<VarMeta> {
        self.check_name(name)?;

        let VarSpec { value, shape, units, pass_by_obj } = spec;
        let value = match (value, &shape) {
            (Some(value), _) => value,
            (None, Some(shape)) => Value::zeros(shape),
            (None, None) => return Err(Error::ShapeRequired { kind, name: name.to_string() }),
        };

        if let Value::Array { data, shape } = &value {
            let expected: usize = shape.iter().product();
            if !pass_by_obj && expected != data.len() {
                return Err(Error::SizeMismatch { name: name.to_string(), expected, actual: data.len() });
            }
        }

        let (shape, size, pass_by_obj) = match &value {
            Value::Scalar(_) if !pass_by_obj => (vec![1], 1, false),
            Value::Array { data, shape } if !pass_by_obj => (shape.clone(), data.len(), false),
            _ => (shape.unwrap_or_default(), 0, true),
        };

        Ok(VarMeta {
            pathname: name.to_string(),
            relative_name: name.to_string(),
            promoted_name: name.to_string(),
            kind,
            value,
            shape,
            size,
            units,
            unit_conv: None,
            pass_by_obj,
            remote: false,
        })
    }

    /// Rewrites every name to an absolute pathname and freezes the registry.
    ///
    /// Variables of an inactive component are flagged remote so that no
    /// storage is allocated for them.
    pub fn finalize(&mut self, pathname: &str, active: bool) {
        self.owner = pathname.to_string();
        for meta in self.params.iter_mut().chain(self.unknowns.iter_mut()) {
            meta.pathname = join_path(pathname, &meta.relative_name);
            meta.remote = !active;
        }
        self.finalized = true;
    }

    /// Whether `finalize` has run.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Pathname (or name, before setup) of the owning component.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// All parameters in declaration order.
    pub fn params(&self) -> &[VarMeta] {
        &self.params
    }

    /// All outputs and states in declaration order.
    pub fn unknowns(&self) -> &[VarMeta] {
        &self.unknowns
    }

    pub(crate) fn params_mut(&mut self) -> &mut [VarMeta] {
        &mut self.params
    }

    pub(crate) fn unknowns_mut(&mut self) -> &mut [VarMeta] {
        &mut self.unknowns
    }

    /// Looks up a parameter by local name.
    pub fn param(&self, name: &str) -> Option<&VarMeta> {
        self.params.iter().find(|m| m.relative_name == name)
    }

    /// Looks up an output or state by local name.
    pub fn unknown(&self, name: &str) -> Option<&VarMeta> {
        self.unknowns.iter().find(|m| m.relative_name == name)
    }

    /// Local names of the states.
    pub fn states(&self) -> impl Iterator<Item = &str> {
        self.unknowns.iter().filter(|m| m.is_state()).map(|m| m.relative_name.as_str())
    }
}
