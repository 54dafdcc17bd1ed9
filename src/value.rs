//! Values stored in validated containers and carried by variables.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::units::{Quantity, Unit};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Quantity(Quantity),
    Table(TableData),
    List(Vec<Value>),
}

impl Value {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::Quantity(_) => "quantity",
            Value::Table(_) => "table",
            Value::List(_) => "list",
        }
    }

    /// Plain magnitude of a numeric value; quantities are taken in their own unit.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(x) => Some(*x),
            Value::Quantity(q) => Some(q.magnitude),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_quantity(&self) -> Option<&Quantity> {
        match self {
            Value::Quantity(q) => Some(q),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&TableData> {
        match self {
            Value::Table(t) => Some(t),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => f.write_str(s),
            Value::Quantity(q) => write!(f, "{q}"),
            Value::Table(t) => write!(f, "<table {}x{}>", t.rows.len(), t.columns.len()),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Quantity> for Value {
    fn from(q: Quantity) -> Self {
        Value::Quantity(q)
    }
}

impl From<TableData> for Value {
    fn from(t: TableData) -> Self {
        Value::Table(t)
    }
}

/// Rows of typed cells; the column order is the order of `columns`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableData {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    #[serde(default)]
    pub index: Option<String>,
}

impl TableData {
    pub fn column_position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// The row whose index column holds `key`.
    pub fn row(&self, key: &Value) -> Option<&[Value]> {
        let index = self.column_position(self.index.as_deref()?)?;
        self.rows
            .iter()
            .find(|row| row.get(index) == Some(key))
            .map(|row| row.as_slice())
    }

    pub fn cell(&self, key: &Value, column: &str) -> Option<&Value> {
        let position = self.column_position(column)?;
        self.row(key)?.get(position)
    }

    pub fn column(&self, name: &str) -> Option<Vec<&Value>> {
        let position = self.column_position(name)?;
        Some(self.rows.iter().filter_map(|r| r.get(position)).collect())
    }
}

pub(crate) fn quantity_in(value: &Value, unit: &Unit) -> Option<f64> {
    match value {
        Value::Quantity(q) => q.magnitude_in(unit).ok(),
        Value::Int(_) | Value::Float(_) if unit.is_dimensionless() => value.as_f64(),
        _ => None,
    }
}
