//! The top-level object users interact with.

use std::io::Write;

use crate::check::{check_partials, check_totals, PartialReport, TotalReport};
use crate::driver::{Driver, Recorder};
use crate::finite_difference::FdOptions;
use crate::gradient::{calc_gradient, GradientContext, GradientMode, ReturnFormat, TotalJacobian};
use crate::partition::{Partition, Serial};
use crate::solvers::{DirectSolver, LinearSolver, NonlinearSolver, RunOnce, SolverStats};
use crate::system::{Group, Model, Node};
use crate::units::UnitRegistry;
use crate::{Error, Result, Value};

/// A model tree together with its solvers, driver and settings.
///
/// Build it from the root [`Group`], adjust it with the `with_*` methods,
/// then call [`setup`](Problem::setup) once before running or
/// differentiating.
pub struct Problem {
    root: Option<Group>,
    model: Option<Model>,
    setup_error: Option<String>,
    nonlinear: Box<dyn NonlinearSolver>,
    linear: Box<dyn LinearSolver>,
    partition: Box<dyn Partition>,
    units: UnitRegistry,
    fd_options: FdOptions,
    driver: Driver,
}

impl Problem {
    /// A problem with [`RunOnce`], a [`DirectSolver`] and every system active.
    pub fn new(root: Group) -> Self {
        Problem {
            root: Some(root),
            model: None,
            setup_error: None,
            nonlinear: Box::new(RunOnce),
            linear: Box::new(DirectSolver::new()),
            partition: Box::new(Serial),
            units: UnitRegistry::new(),
            fd_options: FdOptions::default(),
            driver: Driver::new(),
        }
    }

    pub fn with_nonlinear_solver(mut self, solver: impl NonlinearSolver + 'static) -> Self {
        self.nonlinear = Box::new(solver);
        self
    }

    pub fn with_linear_solver(mut self, solver: impl LinearSolver + 'static) -> Self {
        self.linear = Box::new(solver);
        self
    }

    pub fn with_partition(mut self, partition: impl Partition + 'static) -> Self {
        self.partition = Box::new(partition);
        self
    }

    pub fn with_units(mut self, units: UnitRegistry) -> Self {
        self.units = units;
        self
    }

    /// Root-level finite difference settings, used by `fd` gradients and the
    /// derivative checks. `force_fd` makes every gradient a finite difference.
    pub fn with_fd_options(mut self, options: FdOptions) -> Self {
        self.fd_options = options;
        self
    }

    pub fn with_driver(mut self, driver: Driver) -> Self {
        self.driver = driver;
        self
    }

    pub fn with_recorder(mut self, recorder: impl Recorder + 'static) -> Self {
        self.driver.add_recorder(recorder);
        self
    }

    /// Flattens the tree, resolves connections and allocates vectors.
    pub fn setup(&mut self) -> Result<()> {
        if let Some(reason) = &self.setup_error {
            return Err(Error::SetupFailed(reason.clone()));
        }
        let root = self.root.take().ok_or(Error::AlreadySetUp)?;
        let built = Model::build(root, self.partition.as_ref(), &self.units)
            .and_then(|model| self.driver.setup(&model).map(|()| model));
        match built {
            Ok(model) => {
                self.model = Some(model);
                Ok(())
            }
            Err(err) => {
                self.setup_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    pub fn model(&self) -> Result<&Model> {
        self.model.as_ref().ok_or_else(|| Error::Uninitialized("root".to_string()))
    }

    pub fn model_mut(&mut self) -> Result<&mut Model> {
        self.model.as_mut().ok_or_else(|| Error::Uninitialized("root".to_string()))
    }

    /// Runs the driver, unless the root is inactive on this process.
    pub fn run(&mut self) -> Result<SolverStats> {
        let model = self.model.as_mut().ok_or_else(|| Error::Uninitialized("root".to_string()))?;
        if !model.nodes()[0].active {
            return Ok(SolverStats::new());
        }
        self.driver.run(model, self.nonlinear.as_mut(), self.linear.as_mut())
    }

    /// Value of an unknown or parameter by absolute or promoted name.
    pub fn get(&self, name: &str) -> Result<Value> {
        self.model.as_ref().ok_or_else(|| Error::Uninitialized(name.to_string()))?.get(name)
    }

    /// First numeric value of a variable.
    pub fn get_scalar(&self, name: &str) -> Result<f64> {
        self.get(name)?.flat().first().copied().ok_or_else(|| Error::NotNumeric(name.to_string()))
    }

    pub fn set(&mut self, name: &str, values: &[f64]) -> Result<()> {
        self.model.as_mut().ok_or_else(|| Error::Uninitialized(name.to_string()))?.set(name, values)
    }

    /// The system at `pathname`; `""` is the root.
    pub fn subsystem(&self, pathname: &str) -> Result<&Node> {
        let model = self.model()?;
        Ok(&model.nodes()[model.node_index(pathname)?])
    }

    /// Writes the system tree with sizes and vector slices.
    pub fn dump(&self, out: &mut dyn Write) -> Result<()> {
        self.model()?.dump(out)
    }

    /// Total derivatives of `outputs` with respect to `inputs`.
    ///
    /// `mode` is one of `fwd`, `rev`, `fd` or `auto`; `format` is `dense`
    /// (`array`) or `keyed` (`dict`). Both are validated before anything is
    /// computed.
    pub fn calc_gradient(&mut self, inputs: &[&str], outputs: &[&str], mode: &str, format: &str) -> Result<TotalJacobian> {
        let mode: GradientMode = mode.parse()?;
        let format: ReturnFormat = format.parse()?;
        let model = self.model.as_mut().ok_or_else(|| Error::Uninitialized("root".to_string()))?;
        let mut ctx = GradientContext {
            nonlinear: self.nonlinear.as_mut(),
            linear: self.linear.as_mut(),
            fd_options: self.fd_options,
        };
        calc_gradient(model, &mut ctx, inputs, outputs, mode, format)
    }

    /// Compares every component's analytic partials with finite differences,
    /// writing a report to `out` when given.
    pub fn check_partial_derivatives(&mut self, out: Option<&mut dyn Write>) -> Result<PartialReport> {
        let options = FdOptions { force_fd: false, ..self.fd_options };
        check_partials(self.model_mut()?, &options, out)
    }

    /// Compares forward, reverse and finite difference total derivatives of
    /// every output with respect to the independent variables.
    pub fn check_total_derivatives(&mut self, out: Option<&mut dyn Write>) -> Result<TotalReport> {
        let model = self.model.as_mut().ok_or_else(|| Error::Uninitialized("root".to_string()))?;
        let mut ctx = GradientContext {
            nonlinear: self.nonlinear.as_mut(),
            linear: self.linear.as_mut(),
            fd_options: self.fd_options,
        };
        check_totals(model, &mut ctx, out)
    }
}
