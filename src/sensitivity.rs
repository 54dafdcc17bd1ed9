//! Monte Carlo sensitivity analysis.
//!
//! Each sample restores the parameters the facility held when the run
//! started, perturbs the declared fields in declaration order and runs the
//! model. Failed samples are discarded and retried until the requested
//! number of successes is reached or the failure ceiling is passed.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::AnalyserParameters;
use crate::container::SpecifiedMap;
use crate::dist::Distribution;
use crate::error::{Error, Result};
use crate::model::{Collection, Facility, ParameterSnapshot};
use crate::optimiser::EvaluationTarget;
use crate::selector::{ItemPath, Selector};
use crate::specs::{SpecKind, SpecSet, Specification, ValueKind};
use crate::units::{Quantity, Unit};
use crate::value::{quantity_in, Value};

/// Key of the sample count in the analyser's parameter container.
pub const NUMBER_OF_SAMPLES: &str = "numberOfSamples";
/// Output holding the number of discarded samples of the last run.
pub const FAILED_RUNS: &str = "failed_runs";
/// Output holding the seed of the last run, in decimal.
pub const SEED: &str = "seed";

#[derive(Debug, Clone)]
pub struct OutputDecl {
    pub label: String,
    pub selector: Selector,
    pub item: ItemPath,
    pub collection: Collection,
    /// Unit the samples are recorded in, taken from the field's specification.
    pub unit: Option<Unit>,
}

#[derive(Debug, Clone)]
pub struct Perturbation {
    pub distribution: Distribution,
    pub selector: Selector,
    pub item: String,
    pub collection: Collection,
}

impl Perturbation {
    fn apply(&self, facility: &mut Facility, rng: &mut StdRng) -> Result<()> {
        let value = self.distribution.draw(rng)?;
        self.selector
            .resolve_mut(facility)?
            .container_mut(self.collection)
            .set(&self.item, value)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSummary {
    #[serde(with = "crate::io::float")]
    pub min: f64,
    #[serde(with = "crate::io::float")]
    pub max: f64,
    #[serde(with = "crate::io::float")]
    pub average: f64,
    /// Population variance, in the square of `unit`.
    #[serde(with = "crate::io::float")]
    pub variance: f64,
    #[serde(with = "crate::io::floats")]
    pub samples: Vec<f64>,
    pub unit: Option<String>,
}

impl OutputSummary {
    fn from_samples(samples: Vec<f64>, unit: Option<&Unit>) -> Self {
        let n = samples.len() as f64;
        let min = samples.iter().copied().fold(f64::INFINITY, f64::min);
        let max = samples.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let average = samples.iter().sum::<f64>() / n;
        let variance = samples.iter().map(|x| (x - average).powi(2)).sum::<f64>() / n;
        OutputSummary {
            min,
            max,
            average,
            variance,
            samples,
            unit: unit.map(|u| u.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOutputs {
    /// Keyed by output label.
    pub outputs: BTreeMap<String, OutputSummary>,
    /// Samples discarded because the model failed.
    pub failed_runs: usize,
    pub seed: u64,
}

/// Statistic fields of every output group, in the analyser's output container.
/// Each group also holds the raw samples under `all`.
const STATS: [&str; 4] = ["min", "max", "avg", "var"];

fn run_fields() -> SpecSet {
    SpecSet::new()
        .with(
            FAILED_RUNS,
            Specification::value(ValueKind::Int, "samples discarded because the model failed"),
        )
        .with(SEED, Specification::value(ValueKind::Text, "seed of the last run"))
}

fn stat_group(field: Option<&Specification>, label: &str) -> Specification {
    let base = match field {
        Some(spec) if matches!(spec.kind, SpecKind::Quantity(_)) => spec.clone(),
        _ => Specification::value(ValueKind::Float, label),
    };
    let fields = SpecSet::new()
        .with("min", base.with_same_units(&format!("minimum of {label}")))
        .with("max", base.with_same_units(&format!("maximum of {label}")))
        .with("avg", base.with_same_units(&format!("average of {label}")))
        .with("var", base.with_squared_units(&format!("variance of {label}")))
        .with("all", Specification::value(ValueKind::List, &format!("samples of {label}")));
    Specification::nested(fields, &format!("statistics of {label}"))
}

fn stat_value(x: f64, unit: Option<&Unit>) -> Value {
    match unit {
        Some(unit) => Value::Quantity(Quantity::new(x, unit.clone())),
        None => Value::Float(x),
    }
}

#[derive(Debug)]
pub struct SensitivityAnalyser {
    facility: Facility,
    settings: AnalyserParameters,
    /// Mirrors `settings`, so selectors can read the sample count.
    parameters: SpecifiedMap,
    output_specs: SpecSet,
    /// Statistics of the last run, one nested group per output label.
    outputs: SpecifiedMap,
    declared: Vec<OutputDecl>,
    variables: Vec<Perturbation>,
    seed: Option<u64>,
    started: bool,
    results: Option<AnalysisOutputs>,
}

impl SensitivityAnalyser {
    pub fn new(facility: Facility) -> Self {
        let spec = SpecSet::new().with(
            NUMBER_OF_SAMPLES,
            Specification::value(ValueKind::Int, "successful model runs to collect"),
        );
        let mut analyser = SensitivityAnalyser {
            facility,
            settings: AnalyserParameters::default(),
            parameters: SpecifiedMap::new("parameter", spec),
            output_specs: run_fields(),
            outputs: SpecifiedMap::new("output", run_fields()),
            declared: Vec::new(),
            variables: Vec::new(),
            seed: None,
            started: false,
            results: None,
        };
        let mirrored = analyser.mirror_settings();
        debug_assert!(mirrored.is_ok(), "{mirrored:?}");
        analyser
    }

    pub fn with_parameters(facility: Facility, settings: AnalyserParameters) -> Result<Self> {
        let mut analyser = Self::new(facility);
        analyser.set_parameters(settings)?;
        Ok(analyser)
    }

    fn mirror_settings(&mut self) -> Result<()> {
        let n = i64::try_from(self.settings.number_of_samples)
            .map_err(|_| Error::Config("number_of_samples is too large".into()))?;
        self.parameters.set(NUMBER_OF_SAMPLES, n)
    }

    pub fn set_parameters(&mut self, settings: AnalyserParameters) -> Result<()> {
        settings
            .validate()
            .map_err(|e| Error::Config(format!("{e:#}")))?;
        self.settings = settings;
        self.mirror_settings()
    }

    pub fn settings(&self) -> &AnalyserParameters {
        &self.settings
    }

    pub fn parameters(&self) -> &SpecifiedMap {
        &self.parameters
    }

    /// Observe `item` of the selected component's outputs under `label`.
    pub fn add_output(&mut self, label: &str, selector: Selector, item: impl Into<ItemPath>) -> Result<()> {
        self.add_output_from(label, selector, item, Collection::Outputs)
    }

    pub fn add_output_from(
        &mut self,
        label: &str,
        selector: Selector,
        item: impl Into<ItemPath>,
        collection: Collection,
    ) -> Result<()> {
        if self.started {
            return Err(Error::AlreadyStarted("adding an output"));
        }
        if self.output_specs.contains(label) {
            return Err(Error::Config(format!("output label {label} is already in use")));
        }
        let item = item.into();
        let container = selector.resolve(&self.facility)?.container(collection);
        let field = match item.segments() {
            [key] => container.spec().get(key),
            _ => None,
        };
        let unit = field.and_then(Specification::unit).cloned();
        self.output_specs.insert(label, stat_group(field, label));
        self.outputs = SpecifiedMap::new("output", self.output_specs.clone());
        self.declared.push(OutputDecl {
            label: label.to_string(),
            selector,
            item,
            collection,
            unit,
        });
        Ok(())
    }

    /// Perturb `item` of the selected component's parameters on every sample.
    pub fn add_variable(&mut self, distribution: Distribution, selector: Selector, item: &str) -> Result<()> {
        self.add_perturbation(Perturbation {
            distribution,
            selector,
            item: item.to_string(),
            collection: Collection::Parameters,
        })
    }

    pub fn add_perturbation(&mut self, perturbation: Perturbation) -> Result<()> {
        if self.started {
            return Err(Error::AlreadyStarted("adding a variable"));
        }
        perturbation.selector.resolve(&self.facility)?;
        self.variables.push(perturbation);
        Ok(())
    }

    pub fn set_seed(&mut self, seed: u64) {
        self.seed = Some(seed);
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    pub fn facility(&self) -> &Facility {
        &self.facility
    }

    pub fn facility_mut(&mut self) -> &mut Facility {
        &mut self.facility
    }

    pub fn declared_outputs(&self) -> &[OutputDecl] {
        &self.declared
    }

    /// Statistics of the last run as a validated container, e.g.
    /// `outputs().get_path(&["titre", "avg"])`.
    pub fn outputs(&self) -> &SpecifiedMap {
        &self.outputs
    }

    pub fn results(&self) -> Option<&AnalysisOutputs> {
        self.results.as_ref()
    }

    /// Collect `number_of_samples` successful runs and summarise each output.
    /// The facility's parameters are left as they were before the call.
    pub fn run(&mut self) -> Result<&AnalysisOutputs> {
        self.settings
            .validate()
            .map_err(|e| Error::Config(format!("{e:#}")))?;
        self.started = true;
        self.outputs.clear();
        self.results = None;

        let seed = self.seed.unwrap_or_else(rand::random);
        let mut rng = StdRng::seed_from_u64(seed);
        let requested = self.settings.number_of_samples;
        info!(samples = requested, seed, "running sensitivity analysis");

        let baseline = self.facility.snapshot();
        let sampled = self.sample(&baseline, &mut rng);
        self.facility.restore(&baseline);
        let (samples, failed_runs) = sampled?;

        let mut outputs = BTreeMap::new();
        for (decl, xs) in self.declared.iter().zip(samples) {
            let summary = OutputSummary::from_samples(xs, decl.unit.as_ref());
            let squared = decl.unit.as_ref().map(|u| u.powi(2));
            let stats = [summary.min, summary.max, summary.average, summary.variance];
            for (i, (key, x)) in STATS.iter().zip(stats).enumerate() {
                let unit = if i == 3 { squared.as_ref() } else { decl.unit.as_ref() };
                self.outputs.set_path(&[decl.label.as_str(), *key], stat_value(x, unit))?;
            }
            let all = summary
                .samples
                .iter()
                .map(|&x| stat_value(x, decl.unit.as_ref()))
                .collect();
            self.outputs
                .set_path(&[decl.label.as_str(), "all"], Value::List(all))?;
            outputs.insert(decl.label.clone(), summary);
        }
        self.outputs
            .set(FAILED_RUNS, i64::try_from(failed_runs).unwrap_or(i64::MAX))?;
        self.outputs.set(SEED, seed.to_string())?;
        info!(samples = requested, failed_runs, "sensitivity analysis done");

        Ok(self.results.insert(AnalysisOutputs {
            outputs,
            failed_runs,
            seed,
        }))
    }

    fn sample(
        &mut self,
        baseline: &ParameterSnapshot,
        rng: &mut StdRng,
    ) -> Result<(Vec<Vec<f64>>, usize)> {
        let requested = self.settings.number_of_samples;
        let ceiling = self.settings.failure_ceiling();
        let mut samples = vec![Vec::with_capacity(requested); self.declared.len()];
        let mut successes = 0;
        let mut failed = 0;

        while successes < requested {
            self.facility.restore(baseline);
            for var in &self.variables {
                var.apply(&mut self.facility, rng)?;
            }
            match self.facility.run().and_then(|()| self.read_outputs()) {
                Ok(values) => {
                    for (column, x) in samples.iter_mut().zip(values) {
                        column.push(x);
                    }
                    successes += 1;
                }
                Err(e) if e.is_evaluation_failure() => {
                    failed += 1;
                    debug!(error = %e, failed, "sample discarded");
                    if failed > ceiling {
                        return Err(Error::SamplingExhausted {
                            failed,
                            successes,
                            requested,
                        });
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok((samples, failed))
    }

    fn read_outputs(&self) -> Result<Vec<f64>> {
        self.declared
            .iter()
            .map(|decl| {
                let value = decl
                    .selector
                    .resolve(&self.facility)?
                    .container(decl.collection)
                    .get_path(decl.item.segments())?;
                let x = match &decl.unit {
                    Some(unit) => quantity_in(&value, unit),
                    None => match value {
                        Value::Int(_) | Value::Float(_) | Value::Quantity(_) => value.as_f64(),
                        _ => None,
                    },
                };
                x.ok_or_else(|| {
                    Error::validation(
                        "output",
                        &decl.label,
                        format!("{} is not a number", value.kind_name()),
                    )
                })
            })
            .collect()
    }
}

/// Nested use: every evaluation is a full analysis, reseeded from the
/// optimiser's generator. `Selector::Root` names the analyser itself, so an
/// objective `(Root, ("titre", "avg"))` reads the average of output `titre`.
impl EvaluationTarget for SensitivityAnalyser {
    fn facility(&self) -> &Facility {
        &self.facility
    }

    fn facility_mut(&mut self) -> &mut Facility {
        &mut self.facility
    }

    fn evaluate(&mut self, rng: &mut StdRng) -> Result<()> {
        self.seed = Some(rng.gen());
        self.run().map(|_| ())
    }

    fn lookup(&self, selector: &Selector, collection: Collection, path: &ItemPath) -> Result<Value> {
        match (selector, collection) {
            (Selector::Root, Collection::Outputs) => self.outputs.get_path(path.segments()),
            (Selector::Root, Collection::Parameters) => self.parameters.get_path(path.segments()),
            (Selector::Root, Collection::Inputs) => {
                Err(Error::lookup(selector, "the analyser has no inputs"))
            }
            _ => selector
                .resolve(&self.facility)?
                .container(collection)
                .get_path(path.segments()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Component, Role};

    fn facility() -> Facility {
        let role = Role::new("facility")
            .parameter("x", Specification::value(ValueKind::Float, "x"))
            .output("y", Specification::value(ValueKind::Float, "y"));
        let mut f = Facility::new(Component::new("plant", &role)).with_process(|c: &mut Component| -> Result<()> {
            let x = c.parameters.get_f64("x")?;
            c.outputs.set("y", 2.0 * x)
        });
        f.component.set_default("x", 1.0).unwrap();
        f.load_parameters().unwrap();
        f
    }

    #[test]
    fn test_summary_uses_population_variance() {
        let s = OutputSummary::from_samples(vec![1.0, 2.0, 3.0, 4.0], None);
        assert_eq!((s.min, s.max, s.average, s.variance), (1.0, 4.0, 2.5, 1.25));
        assert_eq!(s.samples.len(), 4);
    }

    #[test]
    fn test_parameters_mirror_sample_count() {
        let mut a = SensitivityAnalyser::new(facility());
        assert_eq!(a.parameters().get(NUMBER_OF_SAMPLES).unwrap(), Value::Int(10));
        a.set_parameters(AnalyserParameters {
            number_of_samples: 3,
            max_failed_runs: None,
        })
        .unwrap();
        assert_eq!(a.parameters().get(NUMBER_OF_SAMPLES).unwrap(), Value::Int(3));
        let zero = AnalyserParameters {
            number_of_samples: 0,
            max_failed_runs: None,
        };
        assert!(matches!(a.set_parameters(zero), Err(Error::Config(_))));
    }

    #[test]
    fn test_run_restores_parameters_and_fills_outputs() {
        let mut a = SensitivityAnalyser::new(facility());
        a.add_output("double", Selector::Facility, "y").unwrap();
        a.add_variable(Distribution::uniform_plain(0.0, 1.0).unwrap(), Selector::Facility, "x")
            .unwrap();
        a.set_seed(3);
        let results = a.run().unwrap().clone();
        let summary = &results.outputs["double"];
        assert_eq!(summary.samples.len(), 10);
        assert!(summary.min >= 0.0 && summary.max < 2.0);
        assert_eq!(results.failed_runs, 0);
        assert_eq!(results.seed, 3);
        assert_eq!(
            a.outputs().get_path(&["double", "avg"]).unwrap(),
            Value::Float(summary.average)
        );
        assert_eq!(a.facility().component.parameters.get("x").unwrap(), Value::Float(1.0));
    }

    #[test]
    fn test_outputs_hold_samples_and_run_details() {
        let mut a = SensitivityAnalyser::new(facility());
        a.add_output("double", Selector::Facility, "y").unwrap();
        a.add_variable(Distribution::uniform_plain(0.0, 1.0).unwrap(), Selector::Facility, "x")
            .unwrap();
        a.set_seed(12);
        let results = a.run().unwrap().clone();

        let expected: Vec<Value> = results.outputs["double"]
            .samples
            .iter()
            .map(|&x| Value::Float(x))
            .collect();
        assert_eq!(a.outputs().get_path(&["double", "all"]).unwrap(), Value::List(expected));
        assert_eq!(a.outputs().get(FAILED_RUNS).unwrap(), Value::Int(0));
        assert_eq!(a.outputs().get(SEED).unwrap(), Value::from("12"));
    }

    #[test]
    fn test_reserved_output_labels_rejected() {
        let mut a = SensitivityAnalyser::new(facility());
        for label in [FAILED_RUNS, SEED] {
            assert!(matches!(
                a.add_output(label, Selector::Facility, "y"),
                Err(Error::Config(_))
            ));
        }
    }

    #[test]
    fn test_declarations_frozen_after_run() {
        let mut a = SensitivityAnalyser::new(facility());
        a.add_output("double", Selector::Facility, "y").unwrap();
        a.run().unwrap();
        assert!(matches!(
            a.add_output("again", Selector::Facility, "y"),
            Err(Error::AlreadyStarted(_))
        ));
    }

    #[test]
    fn test_unknown_selector_rejected_at_declaration() {
        let mut a = SensitivityAnalyser::new(facility());
        assert!(matches!(
            a.add_output("nope", Selector::Product(2), "y"),
            Err(Error::Lookup { .. })
        ));
    }
}
