//! Keyed container whose writes are checked against a [`SpecSet`].

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::specs::{SpecKind, SpecSet, Specification};
use crate::value::Value;

/// Mapping from declared field name to a value satisfying that field's
/// specification. Nested specifications become child containers.
#[derive(Debug, Clone)]
pub struct SpecifiedMap {
    name: String,
    spec: SpecSet,
    values: BTreeMap<String, Value>,
    groups: BTreeMap<String, SpecifiedMap>,
}

impl SpecifiedMap {
    /// `name` describes what is stored here ("parameter", "output", ...) and
    /// appears in error messages.
    pub fn new(name: &str, spec: SpecSet) -> Self {
        let groups = spec
            .iter()
            .filter_map(|(key, s)| {
                s.nested_fields()
                    .map(|fields| (key.to_string(), SpecifiedMap::new(name, fields.clone())))
            })
            .collect();
        SpecifiedMap {
            name: name.to_string(),
            spec,
            values: BTreeMap::new(),
            groups,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn spec(&self) -> &SpecSet {
        &self.spec
    }

    fn field_spec(&self, key: &str) -> Result<&Specification> {
        self.spec.get(key).ok_or_else(|| {
            Error::validation(&self.name, key, format!("no {} named {key} is declared", self.name))
        })
    }

    /// Store `value` under `key`. Nothing is written unless the value passes
    /// validation.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> Result<()> {
        let spec = self.field_spec(key)?;
        let checked = spec
            .validate(value.into())
            .map_err(|reason| Error::validation(&self.name, key, reason))?;
        self.values.insert(key.to_string(), checked);
        Ok(())
    }

    /// Like [`set`](Self::set) but first converts plain input (e.g. a bare
    /// magnitude for a quantity field).
    pub fn set_coerced(&mut self, key: &str, value: impl Into<Value>) -> Result<()> {
        let spec = self.field_spec(key)?;
        let checked = spec
            .coerce(value.into())
            .map_err(|reason| Error::validation(&self.name, key, reason))?;
        self.values.insert(key.to_string(), checked);
        Ok(())
    }

    pub fn set_text(&mut self, key: &str, text: &str) -> Result<()> {
        let spec = self.field_spec(key)?;
        let checked = spec
            .parse(text)
            .map_err(|reason| Error::validation(&self.name, key, reason))?;
        self.values.insert(key.to_string(), checked);
        Ok(())
    }

    /// Fails with [`Error::Validation`] for an undeclared key and with
    /// [`Error::Missing`] for a declared key that holds no value yet.
    pub fn get(&self, key: &str) -> Result<Value> {
        if let SpecKind::Computed(func) = &self.field_spec(key)?.kind {
            return func.as_ref()(self);
        }
        self.values.get(key).cloned().ok_or_else(|| Error::Missing {
            container: self.name.clone(),
            key: key.to_string(),
        })
    }

    /// Reads a numeric field as a plain magnitude in its stored unit.
    pub fn get_f64(&self, key: &str) -> Result<f64> {
        let value = self.get(key)?;
        value.as_f64().ok_or_else(|| {
            Error::validation(&self.name, key, format!("{} is not numeric", value.kind_name()))
        })
    }

    pub fn is_set(&self, key: &str) -> bool {
        self.values.contains_key(key) || self.spec.get(key).is_some_and(Specification::is_computed)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    /// Forget every stored value, including those of nested groups.
    pub fn clear(&mut self) {
        self.values.clear();
        for group in self.groups.values_mut() {
            group.clear();
        }
    }

    pub fn group(&self, key: &str) -> Option<&SpecifiedMap> {
        self.groups.get(key)
    }

    pub fn group_mut(&mut self, key: &str) -> Option<&mut SpecifiedMap> {
        self.groups.get_mut(key)
    }

    /// Read through nested groups, e.g. `["titre", "avg"]`.
    pub fn get_path<S: AsRef<str>>(&self, path: &[S]) -> Result<Value> {
        match path {
            [] => Err(Error::validation(&self.name, "", "empty field path")),
            [key] => self.get(key.as_ref()),
            [head, rest @ ..] => {
                let head = head.as_ref();
                self.field_spec(head)?;
                self.group(head)
                    .ok_or_else(|| Error::validation(&self.name, head, "not a nested group"))?
                    .get_path(rest)
            }
        }
    }

    pub fn set_path<S: AsRef<str>>(&mut self, path: &[S], value: impl Into<Value>) -> Result<()> {
        match path {
            [] => Err(Error::validation(&self.name, "", "empty field path")),
            [key] => self.set(key.as_ref(), value),
            [head, rest @ ..] => {
                let name = self.name.clone();
                self.group_mut(head.as_ref())
                    .ok_or_else(|| {
                        Error::validation(name, head.as_ref(), "not a nested group")
                    })?
                    .set_path(rest, value)
            }
        }
    }

    /// Stored (non-computed) values in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::{Quantity, Unit};

    fn volume_spec() -> SpecSet {
        SpecSet::new()
            .with("volume", Specification::parse_quantity("L", "working volume").unwrap())
            .with(
                "mode",
                Specification::enumerated(&["batch", "perfusion"], "operating mode"),
            )
    }

    #[test]
    fn test_set_converts_to_canonical_unit() {
        let mut params = SpecifiedMap::new("parameter", volume_spec());
        params.set("volume", Quantity::parse("1500 mL").unwrap()).unwrap();
        let v = params.get("volume").unwrap();
        assert_eq!(v, Value::Quantity(Quantity::new(1.5, Unit::parse("L").unwrap())));
    }

    #[test]
    fn test_rejected_write_leaves_container_unchanged() {
        let mut params = SpecifiedMap::new("parameter", volume_spec());
        params.set("volume", Quantity::parse("2 L").unwrap()).unwrap();
        params.set("mode", "batch").unwrap();

        let err = params.set("volume", Quantity::parse("3 kg").unwrap()).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        let err = params.set("mode", "continuous").unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        let err = params.set("colour", "blue").unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));

        assert_eq!(params.get_f64("volume").unwrap(), 2.0);
        assert_eq!(params.get("mode").unwrap(), Value::from("batch"));
        assert!(!params.is_set("colour"));
    }

    #[test]
    fn test_unset_field_is_missing() {
        let params = SpecifiedMap::new("parameter", volume_spec());
        let err = params.get("volume").unwrap_err();
        assert!(matches!(err, Error::Missing { .. }), "{err}");
    }

    #[test]
    fn test_undeclared_field_is_validation_error() {
        let params = SpecifiedMap::new("parameter", volume_spec());
        let err = params.get("colour").unwrap_err();
        assert!(matches!(err, Error::Validation { .. }), "{err}");
        assert!(!err.is_evaluation_failure());
        let err = params.get_path(&["colour", "hue"]).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }), "{err}");
        let err = params.get_path(&["volume", "max"]).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }), "{err}");
    }

    #[test]
    fn test_computed_field_reads_siblings() {
        let spec = volume_spec().with(
            "volume_ml",
            Specification::computed(
                |map| Ok(Value::Float(map.get_f64("volume")? * 1000.0)),
                "volume in mL",
            ),
        );
        let mut params = SpecifiedMap::new("parameter", spec);
        params.set_coerced("volume", 0.5).unwrap();
        assert_eq!(params.get("volume_ml").unwrap(), Value::Float(500.0));
        assert!(params.set("volume_ml", 1.0).is_err());
    }

    #[test]
    fn test_nested_paths() {
        let inner = SpecSet::new()
            .with("avg", Specification::parse_quantity("g", "average").unwrap())
            .with("var", Specification::parse_quantity("g^2", "variance").unwrap());
        let spec = SpecSet::new().with("mass", Specification::nested(inner, "mass stats"));
        let mut outputs = SpecifiedMap::new("output", spec);

        outputs
            .set_path(&["mass", "avg"], Quantity::parse("2 kg").unwrap())
            .unwrap();
        assert_eq!(outputs.get_path(&["mass", "avg"]).unwrap().as_f64(), Some(2000.0));
        assert!(outputs.set("mass", 1.0).is_err());
        assert!(outputs.get_path(&["mass", "var"]).is_err());

        outputs.clear();
        assert!(outputs.get_path(&["mass", "avg"]).is_err());
    }
}
