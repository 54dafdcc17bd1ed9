use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Genetic algorithm settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OptimiserParameters {
    /// Individuals evaluated in each generation
    #[serde(default = "default_population_size")]
    pub population_size: usize,
    /// Generations to evolve; the initial population is generation 0
    #[serde(default = "default_max_generations")]
    pub max_generations: usize,
    /// Probability that a pair of offspring undergoes crossover
    #[serde(default = "default_crossover_probability")]
    pub crossover_probability: f64,
    /// If crossover happens, probability that any single gene is swapped
    #[serde(default = "default_gene_crossover_probability")]
    pub gene_crossover_probability: f64,
    /// Average number of genes per individual redrawn each generation
    #[serde(default = "default_mutation_rate")]
    pub mutation_rate: f64,
}

fn default_population_size() -> usize {
    20
}

fn default_max_generations() -> usize {
    10
}

fn default_crossover_probability() -> f64 {
    0.8
}

fn default_gene_crossover_probability() -> f64 {
    0.5
}

fn default_mutation_rate() -> f64 {
    1.0
}

impl Default for OptimiserParameters {
    fn default() -> Self {
        Self {
            population_size: default_population_size(),
            max_generations: default_max_generations(),
            crossover_probability: default_crossover_probability(),
            gene_crossover_probability: default_gene_crossover_probability(),
            mutation_rate: default_mutation_rate(),
        }
    }
}

impl OptimiserParameters {
    pub fn validate(&self) -> Result<()> {
        if self.population_size == 0 {
            bail!("optimiser.population_size must be >= 1");
        }
        if !(0.0..=1.0).contains(&self.crossover_probability) {
            bail!("optimiser.crossover_probability must be in [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.gene_crossover_probability) {
            bail!("optimiser.gene_crossover_probability must be in [0, 1]");
        }
        if !(self.mutation_rate >= 0.0) || !self.mutation_rate.is_finite() {
            bail!("optimiser.mutation_rate must be a non-negative number");
        }
        Ok(())
    }
}

/// Monte Carlo sampling settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AnalyserParameters {
    /// Successful model runs to collect
    #[serde(default = "default_number_of_samples")]
    pub number_of_samples: usize,
    /// Failed runs tolerated before giving up (default: 10 per requested sample)
    #[serde(default)]
    pub max_failed_runs: Option<usize>,
}

fn default_number_of_samples() -> usize {
    10
}

impl Default for AnalyserParameters {
    fn default() -> Self {
        Self {
            number_of_samples: default_number_of_samples(),
            max_failed_runs: None,
        }
    }
}

impl AnalyserParameters {
    pub fn failure_ceiling(&self) -> usize {
        self.max_failed_runs
            .unwrap_or_else(|| self.number_of_samples.saturating_mul(10))
    }

    pub fn validate(&self) -> Result<()> {
        if self.number_of_samples == 0 {
            bail!("analyser.number_of_samples must be >= 1");
        }
        Ok(())
    }
}

/// A study file: optimiser settings, optional nested analyser, optional seed.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct StudyConfig {
    #[serde(default)]
    pub optimiser: OptimiserParameters,
    pub analyser: Option<AnalyserParameters>,
    pub seed: Option<u64>,
}

impl StudyConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let cfg: StudyConfig = toml::from_str(text).context("failed to parse study config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        Self::from_toml_str(&text)
            .with_context(|| format!("invalid config: {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        self.optimiser.validate()?;
        if let Some(ref analyser) = self.analyser {
            analyser.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let cfg = StudyConfig::from_toml_str("[optimiser]\npopulation_size = 4\n").unwrap();
        assert_eq!(cfg.optimiser.population_size, 4);
        assert_eq!(cfg.optimiser.max_generations, 10);
        assert_eq!(cfg.optimiser.crossover_probability, 0.8);
        assert!(cfg.analyser.is_none());
        assert!(cfg.seed.is_none());
    }

    #[test]
    fn test_full_study() {
        let text = r#"
            seed = 1234

            [optimiser]
            population_size = 8
            max_generations = 3
            crossover_probability = 0.5
            gene_crossover_probability = 0.25
            mutation_rate = 2.0

            [analyser]
            number_of_samples = 10
        "#;
        let cfg = StudyConfig::from_toml_str(text).unwrap();
        assert_eq!(cfg.seed, Some(1234));
        let analyser = cfg.analyser.unwrap();
        assert_eq!(analyser.number_of_samples, 10);
        assert_eq!(analyser.failure_ceiling(), 100);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let err = StudyConfig::from_toml_str("[optimiser]\ncrossover_probability = 1.5\n")
            .unwrap_err();
        assert!(format!("{err:#}").contains("crossover_probability"));
        assert!(StudyConfig::from_toml_str("[optimiser]\npopulation_size = 0\n").is_err());
        assert!(StudyConfig::from_toml_str("[analyser]\nnumber_of_samples = 0\n").is_err());
        assert!(StudyConfig::from_toml_str("[optimiser]\nmutation_rate = -1.0\n").is_err());
    }
}
