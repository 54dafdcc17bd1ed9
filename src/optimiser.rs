//! Genetic algorithm driver.
//!
//! Single-objective runs use binary tournaments and keep the best of parents
//! plus offspring; multi-objective runs use NSGA-II tournaments and
//! NSGA-II survivor selection. Every random decision is drawn from one
//! `StdRng` seeded at the start of [`Optimiser::run`], so a run is replayed
//! exactly by setting the same seed.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{OptimiserParameters, StudyConfig};
use crate::error::{Error, Result};
use crate::gen::Generator;
use crate::individual::{Individual, Tracking, VariableDecl};
use crate::logbook::Logbook;
use crate::model::{Collection, Facility};
use crate::nsga2;
use crate::selector::{ItemPath, Selector};
use crate::value::Value;

/// Something the optimiser can score individuals against: a bare facility,
/// or a sensitivity analyser wrapping one.
pub trait EvaluationTarget {
    fn facility(&self) -> &Facility;
    fn facility_mut(&mut self) -> &mut Facility;
    /// Run the model with the individual's values already applied.
    /// Randomised targets draw their own seed from `rng`.
    fn evaluate(&mut self, rng: &mut StdRng) -> Result<()>;
    /// Read an objective value after [`evaluate`](Self::evaluate).
    fn lookup(&self, selector: &Selector, collection: Collection, path: &ItemPath) -> Result<Value>;
}

impl EvaluationTarget for Facility {
    fn facility(&self) -> &Facility {
        self
    }

    fn facility_mut(&mut self) -> &mut Facility {
        self
    }

    fn evaluate(&mut self, _rng: &mut StdRng) -> Result<()> {
        self.run()
    }

    fn lookup(&self, selector: &Selector, collection: Collection, path: &ItemPath) -> Result<Value> {
        selector
            .resolve(self)?
            .container(collection)
            .get_path(path.segments())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Minimise,
    Maximise,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Objective {
    pub selector: Selector,
    pub item: ItemPath,
    pub collection: Collection,
    pub direction: Direction,
    /// Relative importance; must be positive.
    pub weight: f64,
}

impl Objective {
    pub fn new(selector: Selector, item: impl Into<ItemPath>, direction: Direction) -> Self {
        Objective {
            selector,
            item: item.into(),
            collection: Collection::Outputs,
            direction,
            weight: 1.0,
        }
    }

    pub fn minimise(selector: Selector, item: impl Into<ItemPath>) -> Self {
        Self::new(selector, item, Direction::Minimise)
    }

    pub fn maximise(selector: Selector, item: impl Into<ItemPath>) -> Self {
        Self::new(selector, item, Direction::Maximise)
    }

    pub fn weighted(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn in_collection(mut self, collection: Collection) -> Self {
        self.collection = collection;
        self
    }

    /// Positive when larger values are better.
    pub fn signed_weight(&self) -> f64 {
        match self.direction {
            Direction::Maximise => self.weight,
            Direction::Minimise => -self.weight,
        }
    }

    /// Fitness recorded when an evaluation fails: the worst possible value.
    pub fn sentinel(&self) -> f64 {
        match self.direction {
            Direction::Maximise => f64::NEG_INFINITY,
            Direction::Minimise => f64::INFINITY,
        }
    }

    /// Map a raw fitness value to a key where smaller is better.
    pub fn key(&self, value: f64) -> f64 {
        -self.signed_weight() * value
    }

    /// The objective's value after an evaluation. A non-finite value counts
    /// as a failed evaluation.
    fn read(&self, target: &impl EvaluationTarget) -> Result<f64> {
        let value = target.lookup(&self.selector, self.collection, &self.item)?;
        let x = value.as_f64().ok_or_else(|| {
            Error::lookup(
                &self.selector,
                format!("objective {} is {}, not a number", self.item, value.kind_name()),
            )
        })?;
        if !x.is_finite() {
            return Err(Error::ModelEvaluation {
                component: self.selector.to_string(),
                reason: format!("objective {} evaluated to {x}", self.item),
            });
        }
        Ok(x)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Configuring,
    Running,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimiserOutputs {
    pub final_population: Vec<Individual>,
    /// Best individual for each objective taken alone, without duplicates,
    /// in population order.
    pub best_individuals: Vec<Individual>,
    #[serde(with = "crate::io::nested_floats")]
    pub best_objective_values: Vec<Vec<f64>>,
    pub seed: u64,
    /// Evaluations scored with the failure sentinel.
    #[serde(default)]
    pub failed_evaluations: usize,
}

impl OptimiserOutputs {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Per objective, the first individual in `population` with the best value
/// for that objective alone; then duplicates (equal genomes) are dropped,
/// keeping population order.
pub fn best_individuals(population: &[Individual], objectives: &[Objective]) -> Vec<Individual> {
    let keys = fitness_keys(population, objectives);
    let mut best: Vec<usize> = Vec::with_capacity(objectives.len());
    for m in 0..objectives.len() {
        let mut best_i: Option<usize> = None;
        for (i, key) in keys.iter().enumerate() {
            if best_i.map_or(true, |b| key[m] < keys[b][m]) {
                best_i = Some(i);
            }
        }
        best.extend(best_i);
    }
    let mut deduped: Vec<Individual> = Vec::new();
    for ind in population {
        let is_best = best.iter().any(|&b| population[b].variables == ind.variables);
        if is_best && !deduped.iter().any(|d| d.variables == ind.variables) {
            deduped.push(ind.clone());
        }
    }
    deduped
}

fn fitness_keys(population: &[Individual], objectives: &[Objective]) -> Vec<Vec<f64>> {
    population
        .iter()
        .map(|ind| {
            objectives
                .iter()
                .enumerate()
                .map(|(m, obj)| {
                    let value = ind
                        .fitness
                        .as_ref()
                        .and_then(|f| f.get(m).copied())
                        .unwrap_or_else(|| obj.sentinel());
                    let key = obj.key(value);
                    if key.is_nan() {
                        f64::INFINITY
                    } else {
                        key
                    }
                })
                .collect()
        })
        .collect()
}

pub struct Optimiser<T: EvaluationTarget> {
    target: T,
    parameters: OptimiserParameters,
    variables: Vec<VariableDecl>,
    objectives: Vec<Objective>,
    phase: Phase,
    seed: Option<u64>,
    logbook: Logbook,
    outputs: Option<OptimiserOutputs>,
}

impl<T: EvaluationTarget> Optimiser<T> {
    pub fn new(target: T) -> Self {
        Optimiser {
            target,
            parameters: OptimiserParameters::default(),
            variables: Vec::new(),
            objectives: Vec::new(),
            phase: Phase::Configuring,
            seed: None,
            logbook: Logbook::new(),
            outputs: None,
        }
    }

    pub fn with_parameters(target: T, parameters: OptimiserParameters) -> Result<Self> {
        parameters
            .validate()
            .map_err(|e| Error::Config(format!("{e:#}")))?;
        let mut opt = Self::new(target);
        opt.parameters = parameters;
        Ok(opt)
    }

    /// Optimiser settings and seed from a study file.
    pub fn from_study(target: T, study: &StudyConfig) -> Result<Self> {
        let mut opt = Self::with_parameters(target, study.optimiser.clone())?;
        opt.seed = study.seed;
        Ok(opt)
    }

    fn ensure_configuring(&self, what: &'static str) -> Result<()> {
        if self.phase == Phase::Configuring {
            Ok(())
        } else {
            Err(Error::AlreadyStarted(what))
        }
    }

    /// Declare a variable written into the selected component's parameters.
    pub fn add_variable(&mut self, generator: Generator, selector: Selector, item: &str) -> Result<()> {
        self.add_variable_decl(VariableDecl::new(generator, selector, item))
    }

    pub fn add_variable_decl(&mut self, decl: VariableDecl) -> Result<()> {
        self.ensure_configuring("adding a variable")?;
        self.variables.push(decl);
        Ok(())
    }

    pub fn add_objective(
        &mut self,
        selector: Selector,
        item: impl Into<ItemPath>,
        direction: Direction,
    ) -> Result<()> {
        self.add_objective_decl(Objective::new(selector, item, direction))
    }

    pub fn add_objective_decl(&mut self, objective: Objective) -> Result<()> {
        self.ensure_configuring("adding an objective")?;
        if !(objective.weight > 0.0) || !objective.weight.is_finite() {
            return Err(Error::Config(format!(
                "objective {} needs a positive weight, got {}",
                objective.item, objective.weight
            )));
        }
        self.objectives.push(objective);
        Ok(())
    }

    /// Seed for the next run. Without one, each run picks a fresh seed and
    /// records it in the outputs.
    pub fn set_seed(&mut self, seed: u64) {
        self.seed = Some(seed);
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    pub fn parameters(&self) -> &OptimiserParameters {
        &self.parameters
    }

    pub fn parameters_mut(&mut self) -> &mut OptimiserParameters {
        &mut self.parameters
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn variables(&self) -> &[VariableDecl] {
        &self.variables
    }

    pub fn objectives(&self) -> &[Objective] {
        &self.objectives
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn target_mut(&mut self) -> &mut T {
        &mut self.target
    }

    pub fn into_target(self) -> T {
        self.target
    }

    pub fn logbook(&self) -> &Logbook {
        &self.logbook
    }

    pub fn outputs(&self) -> Option<&OptimiserOutputs> {
        self.outputs.as_ref()
    }

    /// Run the genetic algorithm for the configured number of generations.
    pub fn run(&mut self) -> Result<&OptimiserOutputs> {
        self.parameters
            .validate()
            .map_err(|e| Error::Config(format!("{e:#}")))?;
        if self.variables.is_empty() {
            return Err(Error::Config("no variables declared".into()));
        }
        if self.objectives.is_empty() {
            return Err(Error::Config("no objectives declared".into()));
        }
        self.phase = Phase::Running;

        let seed = self.seed.unwrap_or_else(rand::random);
        let mut rng = StdRng::seed_from_u64(seed);
        let params = self.parameters.clone();
        let n = params.population_size;
        info!(
            population = n,
            generations = params.max_generations,
            seed,
            "running optimiser"
        );

        let mut run = Run {
            target: &mut self.target,
            decls: &self.variables,
            objectives: &self.objectives,
            params: &params,
            rng: &mut rng,
            failed: 0,
        };
        run.target.facility_mut().load_parameters()?;

        let tracked: Vec<(usize, Tracking)> = self
            .variables
            .iter()
            .enumerate()
            .filter_map(|(i, d)| d.track.map(|t| (i, t)))
            .collect();
        self.logbook.clear();

        let mut pop = Vec::with_capacity(n);
        for _ in 0..n {
            pop.push(run.new_individual()?);
        }
        for ind in pop.iter_mut() {
            run.evaluate(ind)?;
        }

        for generation in 0..params.max_generations {
            self.logbook
                .record(generation, &pop, self.objectives.len(), &tracked);
            debug!(generation, "evolving generation");

            let mut offspring = run.select_parents(&pop);
            for i in (0..offspring.len().saturating_sub(1)).step_by(2) {
                if run.rng.gen::<f64>() < params.crossover_probability {
                    let (left, right) = offspring.split_at_mut(i + 1);
                    run.crossover(&mut left[i], &mut right[0])?;
                }
            }
            for child in offspring.iter_mut() {
                run.mutate(child)?;
                child.fitness = None;
            }
            for child in offspring.iter_mut() {
                run.evaluate(child)?;
            }

            pop.extend(offspring);
            pop = run.select_survivors(pop, n);
        }
        self.logbook
            .record(params.max_generations, &pop, self.objectives.len(), &tracked);

        let failed = run.failed;
        let best = best_individuals(&pop, &self.objectives);
        let best_values = best
            .iter()
            .map(|ind| ind.fitness.clone().unwrap_or_default())
            .collect();
        info!(seed, failed_evaluations = failed, "optimisation done");

        self.phase = Phase::Complete;
        Ok(self.outputs.insert(OptimiserOutputs {
            final_population: pop,
            best_individuals: best,
            best_objective_values: best_values,
            seed,
            failed_evaluations: failed,
        }))
    }

    /// Restore outputs saved with [`OptimiserOutputs::to_json`]. The saved
    /// individuals must match this optimiser's variable and objective
    /// declarations; every value is re-checked against its field's
    /// specification but kept in the unit it was saved in.
    pub fn load_results(&mut self, json: &str) -> Result<&OptimiserOutputs> {
        let mut loaded = OptimiserOutputs::from_json(json)?;
        let template = Individual::new(&self.variables, self.target.facility())?;
        for ind in loaded
            .final_population
            .iter_mut()
            .chain(loaded.best_individuals.iter_mut())
        {
            self.check_loaded(&template, ind)?;
        }
        self.phase = Phase::Complete;
        Ok(self.outputs.insert(loaded))
    }

    fn check_loaded(&self, template: &Individual, ind: &mut Individual) -> Result<()> {
        if ind.variables.len() != template.variables.len() {
            return Err(Error::Config(format!(
                "saved individual has {} variables, expected {}",
                ind.variables.len(),
                template.variables.len()
            )));
        }
        if let Some(fitness) = &ind.fitness {
            if fitness.len() != self.objectives.len() {
                return Err(Error::Config(format!(
                    "saved fitness has {} values, expected {}",
                    fitness.len(),
                    self.objectives.len()
                )));
            }
        }
        let facility = self.target.facility();
        for ((var, expected), decl) in ind
            .variables
            .iter_mut()
            .zip(&template.variables)
            .zip(&self.variables)
        {
            if var.name != expected.name || var.collection != expected.collection {
                return Err(Error::Config(format!(
                    "saved variable {} does not match declared variable {}",
                    var.name, expected.name
                )));
            }
            if let Some(value) = var.value.take() {
                let container = decl.selector.resolve(facility)?.container(decl.collection);
                let spec = container.spec().get(&decl.item).ok_or_else(|| {
                    Error::validation(container.name(), &decl.item, "not declared")
                })?;
                spec.validate(value.clone())
                    .map_err(|reason| Error::validation(container.name(), &decl.item, reason))?;
                var.value = Some(value);
            }
        }
        Ok(())
    }
}

/// Borrowed state of one optimiser run.
struct Run<'a, T: EvaluationTarget> {
    target: &'a mut T,
    decls: &'a [VariableDecl],
    objectives: &'a [Objective],
    params: &'a OptimiserParameters,
    rng: &'a mut StdRng,
    failed: usize,
}

impl<'a, T: EvaluationTarget> Run<'a, T> {
    fn new_individual(&mut self) -> Result<Individual> {
        let facility = self.target.facility_mut();
        let mut ind = Individual::new(self.decls, facility)?;
        ind.draw(self.decls, facility, self.rng)?;
        ind.repair(self.decls, facility)?;
        Ok(ind)
    }

    fn evaluate(&mut self, ind: &mut Individual) -> Result<()> {
        ind.apply_to_facility(self.decls, self.target.facility_mut())?;
        ind.error = None;
        let outcome = self.target.evaluate(self.rng).and_then(|()| {
            self.objectives
                .iter()
                .map(|obj| obj.read(&*self.target))
                .collect::<Result<Vec<f64>>>()
        });
        match outcome {
            Ok(fitness) => ind.fitness = Some(fitness),
            Err(e) if e.is_evaluation_failure() => {
                warn!(error = %e, "evaluation failed; assigning worst fitness");
                ind.fitness = Some(self.objectives.iter().map(Objective::sentinel).collect());
                ind.error = Some(e.to_string());
                self.failed += 1;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    fn select_parents(&mut self, pop: &[Individual]) -> Vec<Individual> {
        let keys = fitness_keys(pop, self.objectives);
        let single = self.objectives.len() == 1;
        (0..pop.len())
            .map(|_| {
                let a = self.rng.gen_range(0..pop.len());
                let b = self.rng.gen_range(0..pop.len());
                let winner = if single {
                    if keys[b][0] < keys[a][0] {
                        b
                    } else {
                        a
                    }
                } else {
                    nsga2::tournament(&keys, a, b)
                };
                pop[winner].clone()
            })
            .collect()
    }

    fn select_survivors(&self, combined: Vec<Individual>, n: usize) -> Vec<Individual> {
        let keys = fitness_keys(&combined, self.objectives);
        let chosen = if self.objectives.len() == 1 {
            nsga2::select_best(&keys, n)
        } else {
            nsga2::select_nsga2(&keys, n)
        };
        let mut slots: Vec<Option<Individual>> = combined.into_iter().map(Some).collect();
        chosen.into_iter().filter_map(|i| slots[i].take()).collect()
    }

    /// Swap genes between two parents, then repair both.
    fn crossover(&mut self, a: &mut Individual, b: &mut Individual) -> Result<()> {
        for (va, vb) in a.variables.iter_mut().zip(b.variables.iter_mut()) {
            if self.rng.gen::<f64>() < self.params.gene_crossover_probability {
                std::mem::swap(&mut va.value, &mut vb.value);
            }
        }
        a.fitness = None;
        b.fitness = None;
        let facility = self.target.facility_mut();
        a.repair(self.decls, facility)?;
        b.repair(self.decls, facility)
    }

    /// Redraw each gene with probability `mutation_rate / genes`, then repair.
    fn mutate(&mut self, ind: &mut Individual) -> Result<()> {
        let gene_prob = self.params.mutation_rate / ind.variables.len().max(1) as f64;
        let facility = self.target.facility_mut();
        ind.apply_to_facility(self.decls, facility)?;
        for (var, decl) in ind.variables.iter_mut().zip(self.decls) {
            if self.rng.gen::<f64>() < gene_prob {
                var.value = Some(decl.generator.draw(self.rng, facility)?);
                var.update_facility(decl, facility)?;
            }
        }
        ind.repair(self.decls, facility)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::individual::Variable;

    fn scored(tag: i64, fitness: &[f64]) -> Individual {
        Individual {
            variables: vec![Variable {
                name: "plant[x]".into(),
                component: "plant".into(),
                item: "x".into(),
                collection: Collection::Parameters,
                value: Some(Value::Int(tag)),
            }],
            fitness: Some(fitness.to_vec()),
            error: None,
        }
    }

    #[test]
    fn test_keys_and_sentinels() {
        let min = Objective::minimise(Selector::Facility, "cost");
        let max = Objective::maximise(Selector::Facility, "yield").weighted(2.0);
        assert_eq!(min.key(3.0), 3.0);
        assert_eq!(max.key(3.0), -6.0);
        assert_eq!(min.key(min.sentinel()), f64::INFINITY);
        assert_eq!(max.key(max.sentinel()), f64::INFINITY);
    }

    #[test]
    fn test_best_individuals_per_objective() {
        let pop = vec![scored(1, &[1.0, 9.0]), scored(2, &[2.0, 2.0]), scored(3, &[5.0, 1.0])];
        let objectives = vec![
            Objective::minimise(Selector::Facility, "a"),
            Objective::minimise(Selector::Facility, "b"),
        ];
        let best = best_individuals(&pop, &objectives);
        assert_eq!(best.len(), 2);
        assert_eq!(best[0].fitness, Some(vec![1.0, 9.0]));
        assert_eq!(best[1].fitness, Some(vec![5.0, 1.0]));
    }

    #[test]
    fn test_best_individuals_dedupes_and_keeps_first_on_ties() {
        let pop = vec![scored(7, &[1.0, 1.0]), scored(8, &[1.0, 3.0]), scored(7, &[1.0, 1.0])];
        let objectives = vec![
            Objective::minimise(Selector::Facility, "a"),
            Objective::minimise(Selector::Facility, "b"),
        ];
        let best = best_individuals(&pop, &objectives);
        assert_eq!(best.len(), 1);
        assert_eq!(best[0].variables[0].value, Some(Value::Int(7)));
    }

    #[test]
    fn test_nan_fitness_never_best() {
        let pop = vec![scored(1, &[f64::NAN]), scored(2, &[1.0])];
        let objectives = vec![Objective::minimise(Selector::Facility, "a")];
        let best = best_individuals(&pop, &objectives);
        assert_eq!(best.len(), 1);
        assert_eq!(best[0].fitness, Some(vec![1.0]));

        let keys = fitness_keys(&pop, &objectives);
        assert_eq!(keys[0][0], f64::INFINITY);
        assert_eq!(nsga2::select_best(&keys, 1), vec![1]);
    }

    #[test]
    fn test_outputs_json_keeps_sentinels() {
        let outputs = OptimiserOutputs {
            final_population: vec![scored(1, &[f64::INFINITY]), scored(2, &[0.5])],
            best_individuals: vec![scored(2, &[0.5])],
            best_objective_values: vec![vec![0.5]],
            seed: 99,
            failed_evaluations: 1,
        };
        let back = OptimiserOutputs::from_json(&outputs.to_json().unwrap()).unwrap();
        assert_eq!(back, outputs);
    }

    #[test]
    fn test_zero_weight_rejected() {
        let facility = Facility::new(crate::model::Component::new(
            "plant",
            &crate::model::Role::new("facility"),
        ));
        let mut opt = Optimiser::new(facility);
        let err = opt
            .add_objective_decl(Objective::minimise(Selector::Facility, "x").weighted(0.0))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
