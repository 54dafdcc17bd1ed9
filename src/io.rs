//! Result files: population CSV, JSON bundles, and serde helpers for
//! floats that may be infinite (failure sentinels) or NaN.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Result;
use crate::individual::Individual;
use crate::logbook::Logbook;
use crate::optimiser::OptimiserOutputs;

/// JSON has no infinities; non-finite floats travel as strings.
#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum Repr {
    Num(f64),
    Text(String),
}

impl Repr {
    fn from_f64(x: f64) -> Self {
        if x.is_finite() {
            Repr::Num(x)
        } else if x.is_nan() {
            Repr::Text("NaN".into())
        } else if x > 0.0 {
            Repr::Text("inf".into())
        } else {
            Repr::Text("-inf".into())
        }
    }

    fn into_f64<E: serde::de::Error>(self) -> std::result::Result<f64, E> {
        match self {
            Repr::Num(x) => Ok(x),
            Repr::Text(s) => match s.as_str() {
                "inf" | "Infinity" => Ok(f64::INFINITY),
                "-inf" | "-Infinity" => Ok(f64::NEG_INFINITY),
                "NaN" | "nan" => Ok(f64::NAN),
                other => Err(E::custom(format!("expected a number, got {other:?}"))),
            },
        }
    }
}

pub(crate) mod float {
    use super::*;

    pub fn serialize<S: Serializer>(x: &f64, s: S) -> std::result::Result<S::Ok, S::Error> {
        Repr::from_f64(*x).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<f64, D::Error> {
        Repr::deserialize(d)?.into_f64()
    }
}

pub(crate) mod floats {
    use super::*;

    pub fn serialize<S: Serializer>(xs: &[f64], s: S) -> std::result::Result<S::Ok, S::Error> {
        s.collect_seq(xs.iter().map(|&x| Repr::from_f64(x)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Vec<f64>, D::Error> {
        Vec::<Repr>::deserialize(d)?
            .into_iter()
            .map(Repr::into_f64)
            .collect()
    }
}

pub(crate) mod opt_floats {
    use super::*;

    pub fn serialize<S: Serializer>(
        xs: &Option<Vec<f64>>,
        s: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        match xs {
            Some(xs) => s.serialize_some(&xs.iter().map(|&x| Repr::from_f64(x)).collect::<Vec<_>>()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> std::result::Result<Option<Vec<f64>>, D::Error> {
        match Option::<Vec<Repr>>::deserialize(d)? {
            Some(xs) => xs
                .into_iter()
                .map(Repr::into_f64)
                .collect::<std::result::Result<Vec<f64>, D::Error>>()
                .map(Some),
            None => Ok(None),
        }
    }
}

pub(crate) mod nested_floats {
    use super::*;

    pub fn serialize<S: Serializer>(xs: &[Vec<f64>], s: S) -> std::result::Result<S::Ok, S::Error> {
        let rows: Vec<Vec<Repr>> = xs
            .iter()
            .map(|row| row.iter().map(|&x| Repr::from_f64(x)).collect())
            .collect();
        rows.serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> std::result::Result<Vec<Vec<f64>>, D::Error> {
        Vec::<Vec<Repr>>::deserialize(d)?
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .map(Repr::into_f64)
                    .collect::<std::result::Result<Vec<f64>, D::Error>>()
            })
            .collect()
    }
}

/// Writes one row per individual: variable values, fitness values, error.
pub struct CsvWriter<W: Write> {
    w: BufWriter<W>,
}

impl CsvWriter<File> {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let f = File::create(path)?;
        Ok(Self::new(f))
    }
}

fn csv_field(text: &str) -> String {
    if text.contains(|c: char| matches!(c, ',' | '"' | '\n')) {
        format!("\"{}\"", text.replace('"', "\"\""))
    } else {
        text.to_string()
    }
}

impl<W: Write> CsvWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            w: BufWriter::new(inner),
        }
    }

    /// Header from the first individual's variable names.
    pub fn write_header(&mut self, template: &Individual, n_objectives: usize) -> Result<()> {
        let mut cols: Vec<String> = template.variables.iter().map(|v| csv_field(&v.name)).collect();
        cols.extend((0..n_objectives).map(|m| format!("fitness_{m}")));
        cols.push("error".into());
        writeln!(self.w, "{}", cols.join(","))?;
        Ok(())
    }

    pub fn write_row(&mut self, ind: &Individual, n_objectives: usize) -> Result<()> {
        let mut cols: Vec<String> = ind
            .variables
            .iter()
            .map(|v| v.value.as_ref().map(|x| csv_field(&x.to_string())).unwrap_or_default())
            .collect();
        for m in 0..n_objectives {
            let cell = ind
                .fitness
                .as_ref()
                .and_then(|f| f.get(m))
                .map(|x| x.to_string())
                .unwrap_or_default();
            cols.push(cell);
        }
        cols.push(ind.error.as_deref().map(csv_field).unwrap_or_default());
        writeln!(self.w, "{}", cols.join(","))?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.w.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> Result<W> {
        self.w.into_inner().map_err(|e| e.into_error().into())
    }
}

/// Write a population as CSV. An empty population gives an empty file.
pub fn write_population_csv(
    path: impl AsRef<Path>,
    population: &[Individual],
    n_objectives: usize,
) -> Result<()> {
    let mut w = CsvWriter::create(path)?;
    if let Some(first) = population.first() {
        w.write_header(first, n_objectives)?;
    }
    for ind in population {
        w.write_row(ind, n_objectives)?;
    }
    w.flush()
}

/// Outputs and per-generation statistics of one optimiser run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultBundle {
    pub outputs: OptimiserOutputs,
    pub logbook: Logbook,
}

pub fn write_json_bundle(path: impl AsRef<Path>, bundle: &ResultBundle) -> Result<()> {
    let json = serde_json::to_string_pretty(bundle)?;
    fs::write(path, json)?;
    Ok(())
}

pub fn read_json_bundle(path: impl AsRef<Path>) -> Result<ResultBundle> {
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::individual::Variable;
    use crate::model::Collection;
    use crate::value::Value;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Probe {
        #[serde(with = "float")]
        x: f64,
        #[serde(with = "opt_floats")]
        xs: Option<Vec<f64>>,
    }

    #[test]
    fn test_non_finite_floats_as_strings() {
        let p = Probe {
            x: f64::NEG_INFINITY,
            xs: Some(vec![1.5, f64::INFINITY]),
        };
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, r#"{"x":"-inf","xs":[1.5,"inf"]}"#);
        assert_eq!(serde_json::from_str::<Probe>(&json).unwrap(), p);

        let none: Probe = serde_json::from_str(r#"{"x":2,"xs":null}"#).unwrap();
        assert_eq!(none.x, 2.0);
        assert!(none.xs.is_none());
        assert!(serde_json::from_str::<Probe>(r#"{"x":"big","xs":null}"#).is_err());
    }

    #[test]
    fn test_csv_rows() {
        let ind = Individual {
            variables: vec![Variable {
                name: "capture[resin]".into(),
                component: "capture".into(),
                item: "resin".into(),
                collection: Collection::Parameters,
                value: Some(Value::Text("a,b".into())),
            }],
            fitness: Some(vec![2.5]),
            error: None,
        };
        let mut w = CsvWriter::new(Vec::new());
        w.write_header(&ind, 1).unwrap();
        w.write_row(&ind, 1).unwrap();
        let text = String::from_utf8(w.into_inner().unwrap()).unwrap();
        assert_eq!(text, "capture[resin],fitness_0,error\n\"a,b\",2.5,\n");
    }
}
