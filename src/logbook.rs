//! Per-generation statistics of an optimiser run.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::individual::{Individual, Tracking};
use crate::value::{quantity_in, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitnessStats {
    #[serde(with = "crate::io::floats")]
    pub min: Vec<f64>,
    #[serde(with = "crate::io::floats")]
    pub max: Vec<f64>,
    #[serde(with = "crate::io::floats")]
    pub avg: Vec<f64>,
    /// Sample standard deviation (n - 1 denominator).
    #[serde(with = "crate::io::floats")]
    pub std: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TrackedStats {
    Numerical {
        #[serde(with = "crate::io::float")]
        min: f64,
        #[serde(with = "crate::io::float")]
        max: f64,
        #[serde(with = "crate::io::float")]
        avg: f64,
        #[serde(with = "crate::io::float")]
        std: f64,
        unit: Option<String>,
    },
    Discrete { counts: BTreeMap<String, usize> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub generation: usize,
    pub fitness: FitnessStats,
    /// Keyed by variable name, e.g. `capture[resin]`.
    pub tracked: BTreeMap<String, TrackedStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Logbook {
    records: Vec<GenerationRecord>,
}

/// (min, max, mean, sample std) of `xs`; NaN for an empty slice.
pub(crate) fn summarise(xs: &[f64]) -> (f64, f64, f64, f64) {
    if xs.is_empty() {
        return (f64::NAN, f64::NAN, f64::NAN, f64::NAN);
    }
    let n = xs.len() as f64;
    let min = xs.iter().copied().fold(f64::INFINITY, f64::min);
    let max = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mean = xs.iter().sum::<f64>() / n;
    let std = if xs.len() > 1 {
        (xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
    } else {
        0.0
    };
    (min, max, mean, std)
}

fn fitness_stats(population: &[Individual], n_obj: usize) -> FitnessStats {
    let mut stats = FitnessStats {
        min: Vec::with_capacity(n_obj),
        max: Vec::with_capacity(n_obj),
        avg: Vec::with_capacity(n_obj),
        std: Vec::with_capacity(n_obj),
    };
    for m in 0..n_obj {
        let column: Vec<f64> = population
            .iter()
            .filter_map(|ind| ind.fitness.as_ref().and_then(|f| f.get(m)).copied())
            .collect();
        let (min, max, avg, std) = summarise(&column);
        stats.min.push(min);
        stats.max.push(max);
        stats.avg.push(avg);
        stats.std.push(std);
    }
    stats
}

fn track(population: &[Individual], index: usize, mode: Tracking) -> TrackedStats {
    let values: Vec<&Value> = population
        .iter()
        .filter_map(|ind| ind.variables.get(index)?.value.as_ref())
        .collect();
    match mode {
        Tracking::Discrete => {
            let mut counts = BTreeMap::new();
            for v in values {
                *counts.entry(v.to_string()).or_insert(0) += 1;
            }
            TrackedStats::Discrete { counts }
        }
        Tracking::Numerical => {
            let unit = values.first().and_then(|v| v.as_quantity()).map(|q| q.unit.clone());
            // Non-numeric values make the statistics undefined.
            let xs: Option<Vec<f64>> = values
                .iter()
                .map(|v| match &unit {
                    Some(u) => quantity_in(v, u),
                    None => match v {
                        Value::Int(_) | Value::Float(_) => v.as_f64(),
                        _ => None,
                    },
                })
                .collect();
            let (min, max, avg, std) = match xs {
                Some(xs) => summarise(&xs),
                None => (f64::NAN, f64::NAN, f64::NAN, f64::NAN),
            };
            TrackedStats::Numerical {
                min,
                max,
                avg,
                std,
                unit: unit.map(|u| u.to_string()),
            }
        }
    }
}

impl Logbook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Summarise `population`. `tracked` lists the variable positions to
    /// summarise and how.
    pub fn record(
        &mut self,
        generation: usize,
        population: &[Individual],
        n_objectives: usize,
        tracked: &[(usize, Tracking)],
    ) {
        let tracked = tracked
            .iter()
            .filter_map(|&(index, mode)| {
                let name = population.first()?.variables.get(index)?.name.clone();
                Some((name, track(population, index, mode)))
            })
            .collect();
        self.records.push(GenerationRecord {
            generation,
            fitness: fitness_stats(population, n_objectives),
            tracked,
        });
    }

    pub fn records(&self) -> &[GenerationRecord] {
        &self.records
    }

    pub fn get(&self, generation: usize) -> Option<&GenerationRecord> {
        self.records.iter().find(|r| r.generation == generation)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::individual::Variable;
    use crate::model::Collection;

    fn ind(value: Value, fitness: f64) -> Individual {
        Individual {
            variables: vec![Variable {
                name: "plant[n]".into(),
                component: "plant".into(),
                item: "n".into(),
                collection: Collection::Parameters,
                value: Some(value),
            }],
            fitness: Some(vec![fitness]),
            error: None,
        }
    }

    #[test]
    fn test_summarise_uses_sample_std() {
        let (min, max, avg, std) = summarise(&[1.0, 2.0, 3.0, 4.0]);
        assert_eq!((min, max, avg), (1.0, 4.0, 2.5));
        assert!((std - (5.0_f64 / 3.0).sqrt()).abs() < 1e-12);
        assert_eq!(summarise(&[7.0]).3, 0.0);
    }

    #[test]
    fn test_record_fitness_and_tracking() {
        let pop = vec![
            ind(Value::Int(1), 3.0),
            ind(Value::Int(1), 5.0),
            ind(Value::Int(4), 4.0),
        ];
        let mut book = Logbook::new();
        book.record(0, &pop, 1, &[(0, Tracking::Discrete)]);
        book.record(1, &pop, 1, &[(0, Tracking::Numerical)]);

        let first = book.get(0).unwrap();
        assert_eq!(first.fitness.min, vec![3.0]);
        assert_eq!(first.fitness.max, vec![5.0]);
        assert_eq!(first.fitness.avg, vec![4.0]);
        match &first.tracked["plant[n]"] {
            TrackedStats::Discrete { counts } => {
                assert_eq!(counts["1"], 2);
                assert_eq!(counts["4"], 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        match &book.get(1).unwrap().tracked["plant[n]"] {
            TrackedStats::Numerical { min, max, avg, .. } => {
                assert_eq!((*min, *max, *avg), (1.0, 4.0, 2.0));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_infinite_fitness_survives_json() {
        let pop = vec![ind(Value::Int(1), f64::INFINITY), ind(Value::Int(2), 1.0)];
        let mut book = Logbook::new();
        book.record(0, &pop, 1, &[]);
        let json = serde_json::to_string(&book).unwrap();
        let back: Logbook = serde_json::from_str(&json).unwrap();
        assert_eq!(back.records()[0].fitness.max, vec![f64::INFINITY]);
        assert_eq!(back.records()[0].fitness.min, vec![1.0]);
    }
}
