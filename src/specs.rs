//! Specifications: descriptors governing what may be stored under a field.
//!
//! A component's inputs, outputs and parameters are each described by a
//! [`SpecSet`]. Sets compose: a component built from several roles gets the
//! union of their fields, later roles overriding earlier ones for the same key.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::container::SpecifiedMap;
use crate::error::Result;
use crate::units::{Quantity, Unit, UnitError};
use crate::value::{TableData, Value};

/// Prefix marking inline CSV text in a table field, as opposed to a file name.
pub const CSV_TAG: &str = "&CSV::";

pub type ComputeFn = Arc<dyn Fn(&SpecifiedMap) -> Result<Value> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Bool,
    Int,
    Float,
    /// Either an int or a float.
    Number,
    Text,
    List,
}

impl ValueKind {
    fn accepts(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (ValueKind::Bool, Value::Bool(_))
                | (ValueKind::Int, Value::Int(_))
                | (ValueKind::Float, Value::Float(_))
                | (ValueKind::Number, Value::Int(_) | Value::Float(_))
                | (ValueKind::Text, Value::Text(_))
                | (ValueKind::List, Value::List(_))
        )
    }

    fn parse(&self, text: &str) -> std::result::Result<Value, String> {
        let text = text.trim();
        let bad = || format!("cannot read \"{text}\" as {self:?}");
        match self {
            ValueKind::Bool => match text {
                "true" | "True" => Ok(Value::Bool(true)),
                "false" | "False" => Ok(Value::Bool(false)),
                _ => Err(bad()),
            },
            ValueKind::Int => text.parse().map(Value::Int).map_err(|_| bad()),
            // Whole numbers are accepted for floats; they are easy to write by hand.
            ValueKind::Float => text.parse().map(Value::Float).map_err(|_| bad()),
            ValueKind::Number => text
                .parse()
                .map(Value::Int)
                .or_else(|_| text.parse().map(Value::Float))
                .map_err(|_| bad()),
            ValueKind::Text => Ok(Value::Text(text.to_string())),
            ValueKind::List => Err(bad()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnKind {
    Value(ValueKind),
    Quantity(Unit),
    Enumerated(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableSpec {
    pub columns: Vec<ColumnSpec>,
    pub index: Option<String>,
}

impl TableSpec {
    pub fn new(index: Option<&str>) -> Self {
        TableSpec {
            columns: Vec::new(),
            index: index.map(str::to_string),
        }
    }

    pub fn column(mut self, name: &str, kind: ColumnKind) -> Self {
        self.columns.push(ColumnSpec {
            name: name.to_string(),
            kind,
        });
        self
    }

    fn check_cell(kind: &ColumnKind, cell: Value) -> std::result::Result<Value, String> {
        match kind {
            ColumnKind::Value(vk) => {
                if vk.accepts(&cell) {
                    Ok(cell)
                } else {
                    Err(format!("cell \"{cell}\" is not {vk:?}"))
                }
            }
            ColumnKind::Quantity(unit) => check_quantity(unit, cell),
            ColumnKind::Enumerated(members) => check_member(members, cell),
        }
    }

    fn parse_cell(kind: &ColumnKind, text: &str) -> std::result::Result<Value, String> {
        match kind {
            ColumnKind::Value(vk) => vk.parse(text),
            ColumnKind::Quantity(unit) => match text.trim().parse::<f64>() {
                Ok(m) => Ok(Value::Quantity(Quantity::new(m, unit.clone()))),
                Err(_) => {
                    let q = Quantity::parse(text).map_err(|e| e.to_string())?;
                    check_quantity(unit, Value::Quantity(q))
                }
            },
            ColumnKind::Enumerated(members) => {
                check_member(members, Value::Text(text.trim().to_string()))
            }
        }
    }

    /// Read comma-separated text whose first line is the header.
    pub fn parse_csv(&self, text: &str) -> std::result::Result<TableData, String> {
        let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());
        let header: Vec<String> = lines
            .next()
            .ok_or_else(|| "CSV data has no header line".to_string())?
            .split(',')
            .map(|h| h.trim().to_string())
            .collect();
        let kinds = header
            .iter()
            .map(|h| {
                self.columns
                    .iter()
                    .find(|c| &c.name == h)
                    .map(|c| &c.kind)
                    .ok_or_else(|| format!("unexpected column {h}"))
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let mut rows = Vec::new();
        for (n, line) in lines.enumerate() {
            let cells: Vec<&str> = line.split(',').collect();
            if cells.len() != header.len() {
                return Err(format!(
                    "row {} has {} cells, expected {}",
                    n + 1,
                    cells.len(),
                    header.len()
                ));
            }
            let row = cells
                .iter()
                .zip(kinds.iter())
                .map(|(cell, kind)| Self::parse_cell(kind, cell))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.push(row);
        }
        self.validate(TableData {
            columns: header,
            rows,
            index: self.index.clone(),
        })
    }

    pub fn validate(&self, table: TableData) -> std::result::Result<TableData, String> {
        let mut expected: Vec<&str> = self.columns.iter().map(|c| c.name.as_str()).collect();
        let mut actual: Vec<&str> = table.columns.iter().map(String::as_str).collect();
        expected.sort_unstable();
        actual.sort_unstable();
        if expected != actual {
            return Err(format!(
                "table has the wrong columns; expected {expected:?} not {actual:?}"
            ));
        }
        let kinds: Vec<&ColumnKind> = table
            .columns
            .iter()
            .filter_map(|name| self.columns.iter().find(|c| &c.name == name))
            .map(|c| &c.kind)
            .collect();
        let mut rows = Vec::with_capacity(table.rows.len());
        for row in table.rows {
            if row.len() != kinds.len() {
                return Err(format!("row has {} cells, expected {}", row.len(), kinds.len()));
            }
            let checked = row
                .into_iter()
                .zip(kinds.iter())
                .map(|(cell, kind)| Self::check_cell(kind, cell))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows.push(checked);
        }
        Ok(TableData {
            columns: table.columns,
            rows,
            index: self.index.clone(),
        })
    }
}

fn check_quantity(unit: &Unit, value: Value) -> std::result::Result<Value, String> {
    match value {
        Value::Quantity(q) => q
            .to(unit)
            .map(Value::Quantity)
            .map_err(|_| format!("value \"{q}\" does not have units {unit}")),
        Value::Int(_) | Value::Float(_) if unit.is_dimensionless() => {
            let magnitude = value.as_f64().unwrap_or_default();
            Ok(Value::Quantity(Quantity::new(magnitude, unit.clone())))
        }
        Value::Int(_) | Value::Float(_) => Err(format!(
            "number \"{value}\" provided but quantity with units {unit} required"
        )),
        other => Err(format!(
            "{} \"{other}\" provided but quantity with units {unit} required",
            other.kind_name()
        )),
    }
}

fn check_member(members: &[String], value: Value) -> std::result::Result<Value, String> {
    let known = matches!(&value, Value::Text(s) if members.iter().any(|m| m == s));
    if known {
        Ok(value)
    } else {
        Err(format!("value \"{value}\" is not one of {members:?}"))
    }
}

#[derive(Clone)]
pub enum SpecKind {
    Quantity(Unit),
    Value(ValueKind),
    Enumerated(Vec<String>),
    Nested(SpecSet),
    Table(TableSpec),
    /// Derived on read from sibling fields of the same container.
    Computed(ComputeFn),
}

impl fmt::Debug for SpecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpecKind::Quantity(u) => f.debug_tuple("Quantity").field(&u.to_string()).finish(),
            SpecKind::Value(k) => f.debug_tuple("Value").field(k).finish(),
            SpecKind::Enumerated(m) => f.debug_tuple("Enumerated").field(m).finish(),
            SpecKind::Nested(s) => f.debug_tuple("Nested").field(s).finish(),
            SpecKind::Table(t) => f.debug_tuple("Table").field(t).finish(),
            SpecKind::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Specification {
    pub kind: SpecKind,
    pub description: String,
    /// Hidden parameters are not offered for editing by front ends.
    pub hidden: bool,
}

impl Specification {
    fn of(kind: SpecKind, description: &str) -> Self {
        Specification {
            kind,
            description: description.to_string(),
            hidden: false,
        }
    }

    pub fn quantity(unit: Unit, description: &str) -> Self {
        Self::of(SpecKind::Quantity(unit), description)
    }

    /// Quantity specification from a unit expression such as `"g/L"`.
    pub fn parse_quantity(units: &str, description: &str) -> std::result::Result<Self, UnitError> {
        Ok(Self::quantity(Unit::parse(units)?, description))
    }

    pub fn value(kind: ValueKind, description: &str) -> Self {
        Self::of(SpecKind::Value(kind), description)
    }

    pub fn enumerated<S: AsRef<str>>(members: &[S], description: &str) -> Self {
        let members = members.iter().map(|m| m.as_ref().to_string()).collect();
        Self::of(SpecKind::Enumerated(members), description)
    }

    pub fn nested(fields: SpecSet, description: &str) -> Self {
        Self::of(SpecKind::Nested(fields), description)
    }

    pub fn table(table: TableSpec, description: &str) -> Self {
        Self::of(SpecKind::Table(table), description)
    }

    pub fn computed<F>(func: F, description: &str) -> Self
    where
        F: Fn(&SpecifiedMap) -> Result<Value> + Send + Sync + 'static,
    {
        Self::of(SpecKind::Computed(Arc::new(func)), description)
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn nested_fields(&self) -> Option<&SpecSet> {
        match &self.kind {
            SpecKind::Nested(fields) => Some(fields),
            _ => None,
        }
    }

    pub fn is_computed(&self) -> bool {
        matches!(self.kind, SpecKind::Computed(_))
    }

    pub fn unit(&self) -> Option<&Unit> {
        match &self.kind {
            SpecKind::Quantity(u) => Some(u),
            _ => None,
        }
    }

    /// Check `value` against this specification, returning it in canonical
    /// form (quantities converted to the declared unit).
    pub fn validate(&self, value: Value) -> std::result::Result<Value, String> {
        match &self.kind {
            SpecKind::Quantity(unit) => check_quantity(unit, value),
            SpecKind::Value(kind) => {
                if kind.accepts(&value) {
                    Ok(value)
                } else {
                    Err(format!(
                        "value \"{value}\" is not an instance of {kind:?}"
                    ))
                }
            }
            SpecKind::Enumerated(members) => check_member(members, value),
            SpecKind::Table(table) => match value {
                Value::Table(t) => table.validate(t).map(Value::Table),
                other => Err(format!(
                    "a table specification needs table data, not {}",
                    other.kind_name()
                )),
            },
            SpecKind::Nested(_) => {
                Err("a nested group cannot be assigned whole; set its fields".to_string())
            }
            SpecKind::Computed(_) => {
                Err("the value of a computed specification cannot be set manually".to_string())
            }
        }
    }

    /// Parse the textual form used in stored defaults.
    pub fn parse(&self, text: &str) -> std::result::Result<Value, String> {
        match &self.kind {
            SpecKind::Quantity(_) => {
                let q = Quantity::parse(text).map_err(|e| {
                    format!("failed to parse {text} as a value with units: {e}")
                })?;
                self.validate(Value::Quantity(q))
            }
            SpecKind::Value(kind) => kind.parse(text),
            SpecKind::Enumerated(_) => self.validate(Value::Text(text.trim().to_string())),
            SpecKind::Table(table) => {
                let body = text.strip_prefix(CSV_TAG).unwrap_or(text);
                table.parse_csv(body).map(Value::Table)
            }
            SpecKind::Nested(_) => Err("nested groups are parsed field by field".to_string()),
            SpecKind::Computed(_) => {
                Err("the value of a computed specification cannot be set explicitly".to_string())
            }
        }
    }

    /// Make a plain value valid where an obvious reading exists, e.g. a bare
    /// magnitude for a quantity field or an int for a float field.
    pub fn coerce(&self, value: Value) -> std::result::Result<Value, String> {
        match (&self.kind, value) {
            (SpecKind::Quantity(unit), Value::Int(i)) => {
                Ok(Value::Quantity(Quantity::new(i as f64, unit.clone())))
            }
            (SpecKind::Quantity(unit), Value::Float(x)) => {
                Ok(Value::Quantity(Quantity::new(x, unit.clone())))
            }
            (SpecKind::Quantity(_), Value::Text(s)) => self.parse(&s),
            (SpecKind::Value(ValueKind::Float), Value::Int(i)) => Ok(Value::Float(i as f64)),
            (SpecKind::Value(ValueKind::Int), Value::Float(x)) => Ok(Value::Int(x.trunc() as i64)),
            (SpecKind::Value(ValueKind::Text), other) => Ok(Value::Text(other.to_string())),
            (SpecKind::Value(kind), Value::Text(s)) if *kind != ValueKind::Text => kind.parse(&s),
            (_, other) => self.validate(other),
        }
    }

    /// The additive identity for numeric fields.
    pub fn zero(&self) -> Option<Value> {
        match &self.kind {
            SpecKind::Quantity(unit) => Some(Value::Quantity(Quantity::new(0.0, unit.clone()))),
            SpecKind::Value(ValueKind::Int) => Some(Value::Int(0)),
            SpecKind::Value(ValueKind::Float | ValueKind::Number) => Some(Value::Float(0.0)),
            _ => None,
        }
    }

    pub fn with_same_units(&self, description: &str) -> Self {
        let mut spec = self.clone();
        spec.description = description.to_string();
        spec
    }

    /// For a quantity, the same specification with squared units (e.g. for a
    /// variance); plain numeric specifications are unchanged.
    pub fn with_squared_units(&self, description: &str) -> Self {
        let mut spec = self.with_same_units(description);
        if let SpecKind::Quantity(unit) = &self.kind {
            spec.kind = SpecKind::Quantity(unit.powi(2));
        }
        spec
    }
}

/// Field name to specification mapping.
#[derive(Debug, Clone, Default)]
pub struct SpecSet {
    fields: BTreeMap<String, Specification>,
}

impl SpecSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, spec: Specification) -> Self {
        self.insert(key, spec);
        self
    }

    pub fn insert(&mut self, key: &str, spec: Specification) {
        self.fields.insert(key.to_string(), spec);
    }

    /// Union of `layers`, later layers shadowing earlier ones.
    pub fn compose<'a>(layers: impl IntoIterator<Item = &'a SpecSet>) -> SpecSet {
        let mut out = SpecSet::new();
        for layer in layers {
            for (key, spec) in &layer.fields {
                out.fields.insert(key.clone(), spec.clone());
            }
        }
        out
    }

    pub fn get(&self, key: &str) -> Option<&Specification> {
        self.fields.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Specification)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
