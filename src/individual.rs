//! Variables and individuals.
//!
//! An [`Individual`] holds only data: the drawn value of every declared
//! variable plus its fitness. Behaviour that needs the generators or the
//! model takes the declarations and the live facility as arguments, so
//! individuals clone, compare and serialise as plain values.

use std::fmt::Write as _;

use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::gen::Generator;
use crate::model::{Collection, Facility};
use crate::selector::Selector;
use crate::value::Value;

/// Full in-order repair passes attempted before giving up on an individual.
pub const MAX_REPAIR_PASSES: usize = 8;

/// How a variable's values are summarised in the logbook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tracking {
    /// Min, max, average and standard deviation of a numeric value.
    Numerical,
    /// Count of each distinct value.
    Discrete,
}

#[derive(Debug, Clone)]
pub struct VariableDecl {
    pub generator: Generator,
    pub selector: Selector,
    pub item: String,
    pub collection: Collection,
    pub track: Option<Tracking>,
}

impl VariableDecl {
    /// A variable written into the target component's parameters.
    pub fn new(generator: Generator, selector: Selector, item: &str) -> Self {
        VariableDecl {
            generator,
            selector,
            item: item.to_string(),
            collection: Collection::Parameters,
            track: None,
        }
    }

    pub fn in_collection(mut self, collection: Collection) -> Self {
        self.collection = collection;
        self
    }

    pub fn tracked(mut self, track: Tracking) -> Self {
        self.track = Some(track);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    /// `component[item]`, fixed when the individual is created.
    pub name: String,
    pub component: String,
    pub item: String,
    pub collection: Collection,
    pub value: Option<Value>,
}

impl Variable {
    fn new(decl: &VariableDecl, facility: &Facility) -> Result<Self> {
        let component = decl.selector.resolve(facility)?.name().to_string();
        Ok(Variable {
            name: format!("{component}[{}]", decl.item),
            component,
            item: decl.item.clone(),
            collection: decl.collection,
            value: None,
        })
    }

    /// Write the current value into the target field.
    pub fn update_facility(&self, decl: &VariableDecl, facility: &mut Facility) -> Result<()> {
        let Some(value) = &self.value else {
            return Ok(());
        };
        let component = decl.selector.resolve_mut(facility).map_err(|e| match e {
            Error::Lookup { selector, .. } => Error::Target {
                selector,
                item: self.item.clone(),
            },
            other => other,
        })?;
        component
            .container_mut(self.collection)
            .set(&self.item, value.clone())
    }

    fn is_valid(&self, decl: &VariableDecl, facility: &Facility) -> Result<bool> {
        match &self.value {
            Some(value) => decl.generator.is_valid(value, facility),
            None => Ok(false),
        }
    }

    pub fn describe(&self, decl: &VariableDecl) -> String {
        match &self.value {
            Some(value) => format!("{}={}", self.name, decl.generator.describe(value)),
            None => format!("{}=<undrawn>", self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Individual {
    pub variables: Vec<Variable>,
    /// One entry per objective, in declaration order; `None` until evaluated.
    #[serde(with = "crate::io::opt_floats")]
    pub fitness: Option<Vec<f64>>,
    pub error: Option<String>,
}

impl Individual {
    /// An individual with one undrawn variable per declaration.
    pub fn new(decls: &[VariableDecl], facility: &Facility) -> Result<Self> {
        let variables = decls
            .iter()
            .map(|d| Variable::new(d, facility))
            .collect::<Result<Vec<_>>>()?;
        Ok(Individual {
            variables,
            fitness: None,
            error: None,
        })
    }

    fn paired<'a>(
        &'a self,
        decls: &'a [VariableDecl],
    ) -> impl Iterator<Item = (&'a Variable, &'a VariableDecl)> {
        self.variables.iter().zip(decls)
    }

    /// Draw every variable in declaration order, writing each into the model
    /// before the next is drawn.
    pub fn draw(
        &mut self,
        decls: &[VariableDecl],
        facility: &mut Facility,
        rng: &mut StdRng,
    ) -> Result<()> {
        facility.load_parameters()?;
        for (var, decl) in self.variables.iter_mut().zip(decls) {
            var.value = Some(decl.generator.draw(rng, facility)?);
            var.update_facility(decl, facility)?;
        }
        self.fitness = None;
        self.error = None;
        Ok(())
    }

    /// Reset the model to its baseline and write in every stored value.
    pub fn apply_to_facility(&self, decls: &[VariableDecl], facility: &mut Facility) -> Result<()> {
        facility.load_parameters()?;
        for (var, decl) in self.paired(decls) {
            var.update_facility(decl, facility)?;
        }
        Ok(())
    }

    /// Applies this individual to the model, then checks each variable in order.
    pub fn is_valid(&self, decls: &[VariableDecl], facility: &mut Facility) -> Result<bool> {
        self.apply_to_facility(decls, facility)?;
        for (var, decl) in self.paired(decls) {
            if !var.is_valid(decl, facility)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Repair invalid variables in declaration order until a pass finds none,
    /// leaving the model holding the repaired values.
    pub fn repair(&mut self, decls: &[VariableDecl], facility: &mut Facility) -> Result<()> {
        self.apply_to_facility(decls, facility)?;
        let mut first_invalid = None;
        for _ in 0..MAX_REPAIR_PASSES {
            first_invalid = None;
            for (var, decl) in self.variables.iter_mut().zip(decls) {
                if var.is_valid(decl, facility)? {
                    continue;
                }
                first_invalid.get_or_insert_with(|| var.name.clone());
                let current = var.value.clone().unwrap_or(Value::Bool(false));
                var.value = Some(decl.generator.repair(&current, facility)?);
                var.update_facility(decl, facility)?;
            }
            if first_invalid.is_none() {
                return Ok(());
            }
        }
        if self.is_valid(decls, facility)? {
            return Ok(());
        }
        Err(Error::RepairFailure {
            variable: first_invalid.unwrap_or_default(),
            passes: MAX_REPAIR_PASSES,
        })
    }

    pub fn get_variable(
        &self,
        component_name: &str,
        item: &str,
        collection: Collection,
    ) -> Option<&Variable> {
        self.variables
            .iter()
            .find(|v| v.component == component_name && v.item == item && v.collection == collection)
    }

    pub fn has_variable(&self, component_name: &str, item: &str, collection: Collection) -> bool {
        self.get_variable(component_name, item, collection).is_some()
    }

    pub fn describe(&self, decls: &[VariableDecl]) -> String {
        let mut out = String::from("<Individual");
        for (var, decl) in self.paired(decls) {
            let _ = write!(out, "\n\t{}", var.describe(decl));
        }
        if let Some(fitness) = &self.fitness {
            let _ = write!(out, "\n\tfitness={fitness:?}");
        }
        out.push('>');
        out
    }
}
