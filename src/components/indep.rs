//! Independent variables.

use crate::component::{Component, Jacobian};
use crate::vector::VecView;
use crate::{Result, Value, VarSpec, VariableRegistry};

/// Outputs with no parameters, set from outside the model.
///
/// Their residual is always zero, so they act as the inputs of total
/// derivative calculations.
#[derive(Debug, Clone)]
pub struct IndepVarComp {
    outputs: Vec<(String, Value, Option<String>)>,
}

impl IndepVarComp {
    /// Creates a component with one output.
    pub fn new(name: &str, value: impl Into<Value>) -> Self {
        IndepVarComp { outputs: vec![(name.to_string(), value.into(), None)] }
    }

    /// Adds another output.
    pub fn add(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.outputs.push((name.to_string(), value.into(), None));
        self
    }

    /// Sets the units of an output added earlier.
    pub fn units(mut self, name: &str, units: &str) -> Self {
        if let Some(entry) = self.outputs.iter_mut().find(|(n, _, _)| n == name) {
            entry.2 = Some(units.to_string());
        }
        self
    }
}

impl Component for IndepVarComp {
    fn setup(&mut self, vars: &mut VariableRegistry) -> Result<()> {
        for (name, value, units) in &self.outputs {
            let spec = match value {
                Value::Object(obj) => VarSpec::object(obj.clone()),
                other => VarSpec::value(other.clone()),
            };
            let spec = match units {
                Some(u) => spec.units(u),
                None => spec,
            };
            vars.add_output(name, spec)?;
        }
        Ok(())
    }

    fn linearize(&mut self, _params: &VecView, _unknowns: &VecView, _resids: &VecView) -> Result<Option<Jacobian>> {
        Ok(Some(Jacobian::new()))
    }
}
