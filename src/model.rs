//! The component tree consumed by the optimiser: facility, products, process
//! sequences and steps. Numerical behaviour lives in [`Process`] impls
//! supplied by the model author.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::container::SpecifiedMap;
use crate::error::{Error, Result};
use crate::specs::{SpecSet, Specification};
use crate::units::Quantity;
use crate::value::Value;

/// Which of a component's three containers a field lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Inputs,
    Outputs,
    Parameters,
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Collection::Inputs => "inputs",
            Collection::Outputs => "outputs",
            Collection::Parameters => "parameters",
        })
    }
}

/// A named bundle of field declarations. Components are composed from roles
/// instead of inheriting them.
#[derive(Debug, Clone, Default)]
pub struct Role {
    pub name: String,
    pub inputs: SpecSet,
    pub outputs: SpecSet,
    pub parameters: SpecSet,
}

impl Role {
    pub fn new(name: &str) -> Self {
        Role {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn input(mut self, key: &str, spec: Specification) -> Self {
        self.inputs.insert(key, spec);
        self
    }

    pub fn output(mut self, key: &str, spec: Specification) -> Self {
        self.outputs.insert(key, spec);
        self
    }

    pub fn parameter(mut self, key: &str, spec: Specification) -> Self {
        self.parameters.insert(key, spec);
        self
    }
}

#[derive(Debug, Clone)]
pub struct Component {
    name: String,
    pub inputs: SpecifiedMap,
    pub outputs: SpecifiedMap,
    pub parameters: SpecifiedMap,
    defaults: SpecifiedMap,
    overrides: BTreeMap<(Collection, String), Value>,
}

impl Component {
    pub fn new(name: &str, role: &Role) -> Self {
        Self::compose(name, &[role])
    }

    /// Build a component whose field declarations are the union of `roles`;
    /// a later role's declaration replaces an earlier one for the same key.
    pub fn compose(name: &str, roles: &[&Role]) -> Self {
        let inputs = SpecSet::compose(roles.iter().map(|r| &r.inputs));
        let outputs = SpecSet::compose(roles.iter().map(|r| &r.outputs));
        let parameters = SpecSet::compose(roles.iter().map(|r| &r.parameters));
        Self::from_specs(name, inputs, outputs, parameters)
    }

    pub fn from_specs(name: &str, inputs: SpecSet, outputs: SpecSet, parameters: SpecSet) -> Self {
        let parameters = SpecifiedMap::new("parameter", parameters);
        Component {
            name: name.to_string(),
            inputs: SpecifiedMap::new("input", inputs),
            outputs: SpecifiedMap::new("output", outputs),
            defaults: parameters.clone(),
            parameters,
            overrides: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn container(&self, collection: Collection) -> &SpecifiedMap {
        match collection {
            Collection::Inputs => &self.inputs,
            Collection::Outputs => &self.outputs,
            Collection::Parameters => &self.parameters,
        }
    }

    pub fn container_mut(&mut self, collection: Collection) -> &mut SpecifiedMap {
        match collection {
            Collection::Inputs => &mut self.inputs,
            Collection::Outputs => &mut self.outputs,
            Collection::Parameters => &mut self.parameters,
        }
    }

    /// Set a parameter and record it as the value restored by
    /// [`load_parameters`](Self::load_parameters).
    pub fn set_default(&mut self, key: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.defaults.set(key, value.clone())?;
        self.parameters.set(key, value)
    }

    pub fn set_default_text(&mut self, key: &str, text: &str) -> Result<()> {
        self.defaults.set_text(key, text)?;
        let value = self.defaults.get(key)?;
        self.parameters.set(key, value)
    }

    /// Make the current parameter values the baseline.
    pub fn store_defaults(&mut self) {
        self.defaults = self.parameters.clone();
    }

    /// Pin a field to `value` every time parameters are reloaded. The value is
    /// checked now so a bad override is reported at the call site.
    pub fn set_override(
        &mut self,
        collection: Collection,
        key: &str,
        value: impl Into<Value>,
    ) -> Result<()> {
        let mut trial = self.container(collection).clone();
        trial.set_coerced(key, value)?;
        let checked = trial.get(key)?;
        self.overrides.insert((collection, key.to_string()), checked);
        Ok(())
    }

    pub fn clear_overrides(&mut self) {
        self.overrides.clear();
    }

    fn apply_overrides(&mut self) -> Result<()> {
        let overrides: Vec<_> = self
            .overrides
            .iter()
            .map(|((c, k), v)| (*c, k.clone(), v.clone()))
            .collect();
        for (collection, key, value) in overrides {
            self.container_mut(collection).set(&key, value)?;
        }
        Ok(())
    }

    /// Restore parameters to the stored baseline, then apply overrides.
    pub fn load_parameters(&mut self) -> Result<()> {
        self.parameters = self.defaults.clone();
        self.apply_overrides()
    }
}

/// The numerical behaviour of a component. Reads the component's inputs and
/// parameters, writes its outputs.
pub trait Process {
    fn run(&mut self, component: &mut Component) -> Result<()>;
}

impl<F> Process for F
where
    F: FnMut(&mut Component) -> Result<()>,
{
    fn run(&mut self, component: &mut Component) -> Result<()> {
        self(component)
    }
}

fn evaluation_failure(component: &str, err: Error) -> Error {
    match err {
        e @ Error::ModelEvaluation { .. } => e,
        other => Error::ModelEvaluation {
            component: component.to_string(),
            reason: other.to_string(),
        },
    }
}

pub struct Step {
    pub component: Component,
    process: Box<dyn Process>,
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step").field("component", &self.component).finish_non_exhaustive()
    }
}

impl Step {
    pub fn new(component: Component, process: impl Process + 'static) -> Self {
        Step {
            component,
            process: Box::new(process),
        }
    }

    pub fn name(&self) -> &str {
        self.component.name()
    }

    pub fn run(&mut self) -> Result<()> {
        let name = self.component.name().to_string();
        self.process
            .run(&mut self.component)
            .map_err(|e| evaluation_failure(&name, e))
    }
}

/// Steps executed front to back, each step's declared inputs read from the
/// previous step's outputs.
#[derive(Debug)]
pub struct ProcessSequence {
    pub component: Component,
    steps: Vec<Step>,
}

impl ProcessSequence {
    pub fn new(name: &str, steps: Vec<Step>) -> Result<Self> {
        let (first, last) = match (steps.first(), steps.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Err(Error::Config(format!("process sequence {name} has no steps"))),
        };
        let component = Component::from_specs(
            name,
            first.component.inputs.spec().clone(),
            last.component.outputs.spec().clone(),
            SpecSet::new(),
        );
        Ok(ProcessSequence { component, steps })
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn steps_mut(&mut self) -> &mut [Step] {
        &mut self.steps
    }

    pub fn find_step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name() == name)
    }

    pub fn find_step_mut(&mut self, name: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.name() == name)
    }

    pub fn run(&mut self) -> Result<()> {
        let name = self.component.name().to_string();
        let wrap = |e: Error| evaluation_failure(&name, e);
        if let Some(first) = self.steps.first_mut() {
            copy_declared(&self.component.inputs, &mut first.component.inputs, false)
                .map_err(wrap)?;
        }
        for i in 0..self.steps.len() {
            if i > 0 {
                let (done, rest) = self.steps.split_at_mut(i);
                copy_declared(&done[i - 1].component.outputs, &mut rest[0].component.inputs, true)
                    .map_err(wrap)?;
            }
            self.steps[i].run()?;
        }
        if let Some(last) = self.steps.last() {
            self.component.outputs.clear();
            copy_declared(&last.component.outputs, &mut self.component.outputs, false)
                .map_err(wrap)?;
        }
        Ok(())
    }

    /// `item` from each step's outputs, in step order.
    pub fn step_outputs(&self, item: &str) -> Result<Vec<Value>> {
        self.steps.iter().map(|s| s.component.outputs.get(item)).collect()
    }

    /// Change in `item` between each step's inputs and outputs, expressed in
    /// the unit of the first step's output.
    pub fn step_increments(&self, item: &str) -> Result<Vec<Quantity>> {
        let mut increments = Vec::with_capacity(self.steps.len());
        for step in &self.steps {
            let after = step.component.outputs.get(item)?;
            let before = step.component.inputs.get(item)?;
            let (Some(after), Some(before)) = (after.as_quantity(), before.as_quantity()) else {
                return Err(Error::validation(
                    step.name(),
                    item,
                    "increments are only defined for quantities",
                ));
            };
            let delta = after.checked_sub(before)?;
            let delta = match increments.first() {
                Some(Quantity { unit, .. }) => delta.to(unit)?,
                None => delta,
            };
            increments.push(delta);
        }
        Ok(increments)
    }
}

/// Copy every field `to` declares from `from`. When `strict`, a declared
/// field absent from `from` is an error; otherwise it is skipped.
fn copy_declared(from: &SpecifiedMap, to: &mut SpecifiedMap, strict: bool) -> Result<()> {
    let keys: Vec<String> = to
        .spec()
        .iter()
        .filter(|(_, spec)| !spec.is_computed() && spec.nested_fields().is_none())
        .map(|(k, _)| k.to_string())
        .collect();
    for key in keys {
        if !strict && !from.is_set(&key) {
            continue;
        }
        to.set(&key, from.get(&key)?)?;
    }
    Ok(())
}

#[derive(Debug)]
pub struct Product {
    pub component: Component,
    pub sequence: Option<ProcessSequence>,
    process: Option<Box<dyn Process>>,
}

impl Product {
    pub fn new(component: Component, sequence: Option<ProcessSequence>) -> Self {
        Product {
            component,
            sequence,
            process: None,
        }
    }

    /// Product-level calculation run after the sequence.
    pub fn with_process(mut self, process: impl Process + 'static) -> Self {
        self.process = Some(Box::new(process));
        self
    }

    pub fn name(&self) -> &str {
        self.component.name()
    }

    /// Run the sequence from zeroed inputs, hand its outputs to the product's
    /// matching inputs, then run the product's own process.
    pub fn evaluate(&mut self) -> Result<()> {
        let name = self.component.name().to_string();
        if let Some(sequence) = self.sequence.as_mut() {
            let zeros: Vec<(String, Value)> = sequence
                .component
                .inputs
                .spec()
                .iter()
                .filter_map(|(k, spec)| spec.zero().map(|z| (k.to_string(), z)))
                .collect();
            for (key, zero) in zeros {
                sequence
                    .component
                    .inputs
                    .set(&key, zero)
                    .map_err(|e| evaluation_failure(&name, e))?;
            }
            sequence.run()?;
            copy_declared(&sequence.component.outputs, &mut self.component.inputs, false)
                .map_err(|e| evaluation_failure(&name, e))?;
        }
        if let Some(process) = self.process.as_mut() {
            process
                .run(&mut self.component)
                .map_err(|e| evaluation_failure(&name, e))?;
        }
        Ok(())
    }
}

impl fmt::Debug for dyn Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<process>")
    }
}

/// Parameter values of every component, in tree order.
#[derive(Debug, Clone)]
pub struct ParameterSnapshot(Vec<SpecifiedMap>);

#[derive(Debug)]
pub struct Facility {
    pub component: Component,
    products: Vec<Product>,
    process: Option<Box<dyn Process>>,
}

impl Facility {
    pub fn new(component: Component) -> Self {
        Facility {
            component,
            products: Vec::new(),
            process: None,
        }
    }

    /// Facility-level calculation run after every product has been evaluated.
    pub fn with_process(mut self, process: impl Process + 'static) -> Self {
        self.process = Some(Box::new(process));
        self
    }

    pub fn add_product(&mut self, product: Product) -> usize {
        self.products.push(product);
        self.products.len() - 1
    }

    pub fn products(&self) -> &[Product] {
        &self.products
    }

    pub fn product(&self, index: usize) -> Option<&Product> {
        self.products.get(index)
    }

    pub fn product_mut(&mut self, index: usize) -> Option<&mut Product> {
        self.products.get_mut(index)
    }

    pub fn name(&self) -> &str {
        self.component.name()
    }

    /// Every component in the tree: the facility, then per product the
    /// product, its sequence and the sequence's steps.
    pub fn components(&self) -> Vec<&Component> {
        let mut out = vec![&self.component];
        for product in &self.products {
            out.push(&product.component);
            if let Some(seq) = &product.sequence {
                out.push(&seq.component);
                out.extend(seq.steps.iter().map(|s| &s.component));
            }
        }
        out
    }

    pub fn components_mut(&mut self) -> Vec<&mut Component> {
        let mut out = vec![&mut self.component];
        for product in &mut self.products {
            out.push(&mut product.component);
            if let Some(seq) = &mut product.sequence {
                out.push(&mut seq.component);
                out.extend(seq.steps.iter_mut().map(|s| &mut s.component));
            }
        }
        out
    }

    /// Evaluate every product, then the facility's own process. Any failure
    /// is reported as [`Error::ModelEvaluation`].
    pub fn run(&mut self) -> Result<()> {
        for product in &mut self.products {
            product.evaluate()?;
        }
        if let Some(process) = self.process.as_mut() {
            let name = self.component.name().to_string();
            process
                .run(&mut self.component)
                .map_err(|e| evaluation_failure(&name, e))?;
        }
        Ok(())
    }

    pub fn load_parameters(&mut self) -> Result<()> {
        for component in self.components_mut() {
            component.load_parameters()?;
        }
        Ok(())
    }

    pub fn store_defaults(&mut self) {
        for component in self.components_mut() {
            component.store_defaults();
        }
    }

    pub fn snapshot(&self) -> ParameterSnapshot {
        ParameterSnapshot(self.components().iter().map(|c| c.parameters.clone()).collect())
    }

    pub fn restore(&mut self, snapshot: &ParameterSnapshot) {
        for (component, params) in self.components_mut().into_iter().zip(&snapshot.0) {
            component.parameters = params.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mass_role() -> Role {
        Role::new("mass balance")
            .input("mass", Specification::parse_quantity("g", "mass in").unwrap())
            .output("mass", Specification::parse_quantity("g", "mass out").unwrap())
    }

    fn yield_step(name: &str, fraction: f64) -> Step {
        let role = mass_role().parameter(
            "yield",
            Specification::parse_quantity("dimensionless", "step yield").unwrap(),
        );
        let mut component = Component::new(name, &role);
        component.set_default("yield", fraction).unwrap();
        Step::new(component, |c: &mut Component| -> Result<()> {
            let m = c.inputs.get_f64("mass")?;
            let y = c.parameters.get_f64("yield")?;
            c.outputs.set_coerced("mass", m * y)
        })
    }

    fn source_step() -> Step {
        Step::new(Component::new("source", &mass_role()), |c: &mut Component| -> Result<()> {
            let m = c.inputs.get_f64("mass")?;
            c.outputs.set_coerced("mass", m + 100.0)
        })
    }

    #[test]
    fn test_compose_merges_roles_with_override() {
        let base = Role::new("base")
            .parameter("a", Specification::parse_quantity("g", "base a").unwrap())
            .parameter("b", Specification::parse_quantity("L", "base b").unwrap());
        let over = Role::new("over").parameter("a", Specification::parse_quantity("kg", "over a").unwrap());
        let c = Component::compose("c", &[&base, &over]);
        assert_eq!(c.parameters.spec().len(), 2);
        assert_eq!(c.parameters.spec().get("a").unwrap().description, "over a");
    }

    #[test]
    fn test_sequence_chains_outputs_to_inputs() {
        let seq = ProcessSequence::new(
            "seq",
            vec![source_step(), yield_step("capture", 0.5), yield_step("polish", 0.8)],
        )
        .unwrap();
        let mut product = Product::new(Component::new("mAb", &Role::new("product")), Some(seq));
        product.evaluate().unwrap();

        let seq = product.sequence.as_ref().unwrap();
        let masses: Vec<f64> = seq
            .step_outputs("mass")
            .unwrap()
            .iter()
            .filter_map(Value::as_f64)
            .collect();
        assert_eq!(masses, vec![100.0, 50.0, 40.0]);
        let inc: Vec<f64> = seq
            .step_increments("mass")
            .unwrap()
            .iter()
            .map(|q| q.magnitude)
            .collect();
        assert_eq!(inc, vec![100.0, -50.0, -10.0]);
        assert_eq!(seq.component.outputs.get_f64("mass").unwrap(), 40.0);
        assert!(seq.find_step("polish").is_some());
        assert!(seq.find_step("missing").is_none());
    }

    #[test]
    fn test_empty_sequence_rejected() {
        assert!(matches!(ProcessSequence::new("empty", vec![]), Err(Error::Config(_))));
    }

    #[test]
    fn test_failure_reported_as_model_evaluation() {
        let fail = |_: &mut Component| -> Result<()> {
            Err(Error::validation("output", "mass", "negative"))
        };
        let failing = Step::new(Component::new("bad", &mass_role()), fail);
        let seq = ProcessSequence::new("seq", vec![failing]).unwrap();
        let mut facility = Facility::new(Component::new("plant", &Role::new("facility")));
        facility.add_product(Product::new(Component::new("p", &Role::new("product")), Some(seq)));
        match facility.run() {
            Err(Error::ModelEvaluation { component, .. }) => assert_eq!(component, "bad"),
            other => panic!("expected a model evaluation error, got {other:?}"),
        }
    }

    #[test]
    fn test_load_parameters_restores_defaults_and_overrides() {
        let seq = ProcessSequence::new("seq", vec![yield_step("capture", 0.5)]).unwrap();
        let mut facility = Facility::new(Component::new("plant", &Role::new("facility")));
        facility.add_product(Product::new(Component::new("p", &Role::new("product")), Some(seq)));

        let step = |f: &mut Facility| {
            f.product_mut(0)
                .and_then(|p| p.sequence.as_mut())
                .and_then(|s| s.find_step_mut("capture"))
                .map(|s| &mut s.component)
                .unwrap()
                .parameters
                .get_f64("yield")
                .unwrap()
        };
        {
            let c = &mut facility.products[0].sequence.as_mut().unwrap().steps[0].component;
            c.parameters.set_coerced("yield", 0.9).unwrap();
        }
        assert_eq!(step(&mut facility), 0.9);
        facility.load_parameters().unwrap();
        assert_eq!(step(&mut facility), 0.5);

        {
            let c = &mut facility.products[0].sequence.as_mut().unwrap().steps[0].component;
            c.set_override(Collection::Parameters, "yield", 0.7).unwrap();
            assert!(c.set_override(Collection::Parameters, "yield", "high").is_err());
        }
        facility.load_parameters().unwrap();
        assert_eq!(step(&mut facility), 0.7);
    }

    #[test]
    fn test_snapshot_restore() {
        let role = Role::new("facility").parameter(
            "batches",
            Specification::value(crate::specs::ValueKind::Int, "batch count"),
        );
        let mut facility = Facility::new(Component::new("plant", &role));
        facility.component.parameters.set("batches", 3_i64).unwrap();
        let snap = facility.snapshot();
        facility.component.parameters.set("batches", 7_i64).unwrap();
        facility.restore(&snap);
        assert_eq!(facility.component.parameters.get("batches").unwrap(), Value::Int(3));
    }
}
