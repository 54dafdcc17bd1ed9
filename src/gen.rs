//! Generators: how the optimiser draws, checks and repairs one variable.
//!
//! Every draw takes the caller's random stream explicitly. Validity and
//! repair may read the live facility, which by then holds the values of all
//! variables declared earlier in the same individual.

use std::fmt;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::Rng;

use crate::error::{Error, Result};
use crate::model::{Collection, Facility};
use crate::selector::Selector;
use crate::units::{Quantity, Unit};
use crate::value::{quantity_in, Value};

/// A field of some component, read when a bound is resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldRef {
    pub selector: Selector,
    pub collection: Collection,
    pub item: String,
}

impl FieldRef {
    pub fn new(selector: Selector, collection: Collection, item: &str) -> Self {
        FieldRef {
            selector,
            collection,
            item: item.to_string(),
        }
    }

    pub fn read(&self, facility: &Facility) -> Result<Value> {
        self.selector
            .resolve(facility)?
            .container(self.collection)
            .get(&self.item)
    }
}

/// One end of a range.
#[derive(Debug, Clone, PartialEq)]
pub enum Bound {
    /// A magnitude in the generator's unit.
    Fixed(f64),
    /// Another field's current value, as `value * scale + offset`.
    Field {
        field: FieldRef,
        scale: f64,
        offset: f64,
    },
    /// A cell of a table field, in the row whose index equals `key`'s value.
    TableCell {
        table: FieldRef,
        key: FieldRef,
        column: String,
    },
}

impl Bound {
    pub fn field(selector: Selector, collection: Collection, item: &str) -> Self {
        Bound::Field {
            field: FieldRef::new(selector, collection, item),
            scale: 1.0,
            offset: 0.0,
        }
    }

    pub fn scaled(self, by: f64, plus: f64) -> Self {
        match self {
            Bound::Field { field, scale, offset } => Bound::Field {
                field,
                scale: scale * by,
                offset: offset * by + plus,
            },
            Bound::Fixed(x) => Bound::Fixed(x * by + plus),
            other => other,
        }
    }

    fn magnitude(value: &Value, unit: Option<&Unit>) -> Option<f64> {
        match unit {
            Some(unit) => quantity_in(value, unit),
            None => match value {
                Value::Int(_) | Value::Float(_) => value.as_f64(),
                Value::Quantity(q) if q.unit.is_dimensionless() => {
                    q.magnitude_in(&Unit::dimensionless()).ok()
                }
                _ => None,
            },
        }
    }

    pub fn resolve(&self, facility: &Facility, unit: Option<&Unit>) -> Result<f64> {
        let (value, origin, scale, offset) = match self {
            Bound::Fixed(x) => return Ok(*x),
            Bound::Field { field, scale, offset } => {
                (field.read(facility)?, field, *scale, *offset)
            }
            Bound::TableCell { table, key, column } => {
                let data = table.read(facility)?;
                let data = data.as_table().ok_or_else(|| {
                    Error::lookup(&table.selector, format!("{} is not a table", table.item))
                })?;
                let row = key.read(facility)?;
                let cell = data.cell(&row, column).cloned().ok_or_else(|| {
                    Error::lookup(
                        &table.selector,
                        format!("table {} has no {column} cell for row {row}", table.item),
                    )
                })?;
                (cell, table, 1.0, 0.0)
            }
        };
        let x = Self::magnitude(&value, unit).ok_or_else(|| {
            Error::lookup(
                &origin.selector,
                format!(
                    "{} value {value} cannot bound a range in {}",
                    origin.item,
                    unit.map_or_else(|| "plain numbers".to_string(), Unit::to_string)
                ),
            )
        })?;
        Ok(x * scale + offset)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RangeGen {
    pub min: Bound,
    pub max: Bound,
    /// Draw whole numbers, both ends inclusive.
    pub integer: bool,
    pub unit: Option<Unit>,
}

impl RangeGen {
    fn bounds(&self, facility: &Facility) -> Result<(f64, f64)> {
        let unit = self.unit.as_ref();
        let mut lo = self.min.resolve(facility, unit)?;
        let mut hi = self.max.resolve(facility, unit)?;
        if self.integer {
            lo = lo.ceil();
            hi = hi.floor();
        }
        if lo > hi || lo.is_nan() || hi.is_nan() {
            return Err(Error::Config(format!("empty range [{lo}, {hi}]")));
        }
        Ok((lo, hi))
    }

    fn wrap(&self, x: f64) -> Value {
        match (&self.unit, self.integer) {
            (Some(unit), _) => Value::Quantity(Quantity::new(x, unit.clone())),
            (None, true) => Value::Int(x as i64),
            (None, false) => Value::Float(x),
        }
    }

    fn magnitude(&self, value: &Value) -> Option<f64> {
        match (&self.unit, value) {
            (Some(unit), _) => quantity_in(value, unit),
            (None, Value::Int(i)) => Some(*i as f64),
            (None, Value::Float(x)) => Some(*x),
            _ => None,
        }
    }

    fn draw(&self, rng: &mut StdRng, facility: &Facility) -> Result<Value> {
        let (lo, hi) = self.bounds(facility)?;
        let x = if self.integer {
            rng.gen_range(lo as i64..=hi as i64) as f64
        } else if lo < hi {
            rng.gen_range(lo..hi)
        } else {
            lo
        };
        Ok(self.wrap(x))
    }

    fn is_valid(&self, value: &Value, facility: &Facility) -> Result<bool> {
        let (lo, hi) = self.bounds(facility)?;
        Ok(self.magnitude(value).is_some_and(|x| {
            x >= lo && x <= hi && (!self.integer || x.fract() == 0.0) && self.wrap(x) == *value
        }))
    }

    fn repair(&self, value: &Value, facility: &Facility) -> Result<Value> {
        let (lo, hi) = self.bounds(facility)?;
        let x = match self.magnitude(value) {
            Some(x) if x.is_nan() => lo,
            Some(x) if self.integer => x.round().clamp(lo, hi),
            Some(x) => x.clamp(lo, hi),
            None => lo,
        };
        Ok(self.wrap(x))
    }
}

/// Extension point for generators not expressible as a range, choice or
/// binary flag. `repair` must be idempotent.
pub trait GeneratorPolicy: fmt::Debug + Send + Sync {
    fn draw(&self, rng: &mut StdRng, facility: &Facility) -> Result<Value>;
    fn is_valid(&self, value: &Value, facility: &Facility) -> Result<bool>;
    fn repair(&self, value: &Value, facility: &Facility) -> Result<Value>;
    fn describe(&self, value: &Value) -> String {
        value.to_string()
    }
}

#[derive(Debug, Clone)]
pub enum Generator {
    /// `true` or `false` with equal probability.
    Binary,
    Range(RangeGen),
    Choice(Vec<Value>),
    Custom(Arc<dyn GeneratorPolicy>),
}

impl Generator {
    pub fn binary() -> Self {
        Generator::Binary
    }

    /// Whole numbers in `[min, max]`.
    pub fn int_range(min: i64, max: i64) -> Self {
        Generator::Range(RangeGen {
            min: Bound::Fixed(min as f64),
            max: Bound::Fixed(max as f64),
            integer: true,
            unit: None,
        })
    }

    /// Reals drawn from `[min, max)`.
    pub fn range(min: f64, max: f64) -> Self {
        Generator::Range(RangeGen {
            min: Bound::Fixed(min),
            max: Bound::Fixed(max),
            integer: false,
            unit: None,
        })
    }

    /// Continuous quantity range; the result carries `min`'s unit.
    pub fn quantity_range(min: Quantity, max: Quantity) -> Result<Self> {
        let hi = max.magnitude_in(&min.unit)?;
        Ok(Generator::Range(RangeGen {
            min: Bound::Fixed(min.magnitude),
            max: Bound::Fixed(hi),
            integer: false,
            unit: Some(min.unit),
        }))
    }

    /// A range whose ends may follow other fields of the model.
    pub fn bounded(min: Bound, max: Bound, integer: bool, unit: Option<Unit>) -> Self {
        Generator::Range(RangeGen {
            min,
            max,
            integer,
            unit,
        })
    }

    pub fn choice<V: Into<Value>>(choices: impl IntoIterator<Item = V>) -> Self {
        Generator::Choice(choices.into_iter().map(Into::into).collect())
    }

    pub fn custom(policy: impl GeneratorPolicy + 'static) -> Self {
        Generator::Custom(Arc::new(policy))
    }

    pub fn draw(&self, rng: &mut StdRng, facility: &Facility) -> Result<Value> {
        match self {
            Generator::Binary => Ok(Value::Bool(rng.gen())),
            Generator::Range(range) => range.draw(rng, facility),
            Generator::Choice(choices) => {
                if choices.is_empty() {
                    return Err(Error::Config("choice generator has no choices".into()));
                }
                Ok(choices[rng.gen_range(0..choices.len())].clone())
            }
            Generator::Custom(policy) => policy.draw(rng, facility),
        }
    }

    pub fn is_valid(&self, value: &Value, facility: &Facility) -> Result<bool> {
        match self {
            Generator::Binary => Ok(matches!(value, Value::Bool(_))),
            Generator::Range(range) => range.is_valid(value, facility),
            Generator::Choice(choices) => Ok(choices.contains(value)),
            Generator::Custom(policy) => policy.is_valid(value, facility),
        }
    }

    /// Map `value` to a valid one. Valid values come back unchanged, so
    /// repairing twice gives the same result as repairing once.
    pub fn repair(&self, value: &Value, facility: &Facility) -> Result<Value> {
        match self {
            Generator::Binary => Ok(Value::Bool(match value {
                Value::Bool(b) => *b,
                other => other.as_f64().is_some_and(|x| x != 0.0),
            })),
            Generator::Range(range) => range.repair(value, facility),
            Generator::Choice(choices) => {
                if choices.contains(value) {
                    return Ok(value.clone());
                }
                nearest_choice(choices, value)
                    .cloned()
                    .ok_or_else(|| Error::Config("choice generator has no choices".into()))
            }
            Generator::Custom(policy) => policy.repair(value, facility),
        }
    }

    pub fn describe(&self, value: &Value) -> String {
        match self {
            Generator::Binary => match value {
                Value::Bool(true) => "yes".to_string(),
                Value::Bool(false) => "no".to_string(),
                other => other.to_string(),
            },
            Generator::Custom(policy) => policy.describe(value),
            _ => value.to_string(),
        }
    }
}

fn distance(a: &Value, b: &Value) -> Option<f64> {
    match (a, b) {
        (Value::Quantity(_), Value::Quantity(q)) => Some((quantity_in(a, &q.unit)? - q.magnitude).abs()),
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
            Some((a.as_f64()? - b.as_f64()?).abs())
        }
        _ => None,
    }
}

/// Closest numeric choice to `value`, earliest on ties; the first choice when
/// nothing is comparable.
fn nearest_choice<'a>(choices: &'a [Value], value: &Value) -> Option<&'a Value> {
    let mut best: Option<(&Value, f64)> = None;
    for choice in choices {
        if let Some(d) = distance(value, choice).filter(|d| !d.is_nan()) {
            if best.map_or(true, |(_, bd)| d < bd) {
                best = Some((choice, d));
            }
        }
    }
    best.map(|(c, _)| c).or_else(|| choices.first())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Component, Role};
    use crate::specs::{Specification, ValueKind};
    use rand::SeedableRng;

    fn empty_facility() -> Facility {
        Facility::new(Component::new("plant", &Role::new("facility")))
    }

    #[test]
    fn test_int_range_draws_inclusive_ends() {
        let facility = empty_facility();
        let gen = Generator::int_range(1, 3);
        let mut rng = StdRng::seed_from_u64(7);
        let mut seen = [false; 3];
        for _ in 0..200 {
            let v = gen.draw(&mut rng, &facility).unwrap();
            let Value::Int(i) = v else { panic!("expected int, got {v:?}") };
            assert!((1..=3).contains(&i));
            seen[(i - 1) as usize] = true;
            assert!(gen.is_valid(&v, &facility).unwrap());
        }
        assert_eq!(seen, [true; 3], "every value in the range should be drawn");
    }

    #[test]
    fn test_range_repair_clamps_and_rounds() {
        let facility = empty_facility();
        let ints = Generator::int_range(0, 10);
        assert_eq!(ints.repair(&Value::Int(15), &facility).unwrap(), Value::Int(10));
        assert_eq!(ints.repair(&Value::Float(4.6), &facility).unwrap(), Value::Int(5));
        assert!(!ints.is_valid(&Value::Float(5.0), &facility).unwrap());
        assert_eq!(ints.repair(&Value::Int(-3), &facility).unwrap(), Value::Int(0));

        let reals = Generator::range(-1.0, 1.0);
        assert_eq!(reals.repair(&Value::Float(2.5), &facility).unwrap(), Value::Float(1.0));
        assert_eq!(reals.repair(&Value::Float(f64::NAN), &facility).unwrap(), Value::Float(-1.0));
        assert_eq!(reals.repair(&Value::Float(0.25), &facility).unwrap(), Value::Float(0.25));
    }

    #[test]
    fn test_quantity_range_uses_min_unit() {
        let facility = empty_facility();
        let gen = Generator::quantity_range(
            Quantity::parse("500 mL").unwrap(),
            Quantity::parse("2 L").unwrap(),
        )
        .unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let v = gen.draw(&mut rng, &facility).unwrap();
        let q = v.as_quantity().unwrap();
        assert_eq!(q.unit, Unit::parse("mL").unwrap());
        assert!((500.0..2000.0).contains(&q.magnitude));
        let fixed = gen
            .repair(&Value::Quantity(Quantity::parse("3 L").unwrap()), &facility)
            .unwrap();
        assert_eq!(fixed.as_quantity().unwrap().magnitude, 2000.0);
    }

    #[test]
    fn test_choice_repair_snaps_to_nearest() {
        let facility = empty_facility();
        let gen = Generator::choice([1_i64, 5, 10]);
        assert_eq!(gen.repair(&Value::Int(4), &facility).unwrap(), Value::Int(5));
        assert_eq!(gen.repair(&Value::Float(7.5), &facility).unwrap(), Value::Int(5));
        assert_eq!(gen.repair(&Value::from("x"), &facility).unwrap(), Value::Int(1));

        let names = Generator::choice(["a", "b"]);
        assert_eq!(names.repair(&Value::from("c"), &facility).unwrap(), Value::from("a"));
    }

    #[test]
    fn test_binary() {
        let facility = empty_facility();
        let gen = Generator::binary();
        assert_eq!(gen.repair(&Value::Int(2), &facility).unwrap(), Value::Bool(true));
        assert_eq!(gen.repair(&Value::from("no"), &facility).unwrap(), Value::Bool(false));
        assert_eq!(gen.describe(&Value::Bool(true)), "yes");
    }

    #[test]
    fn test_field_bound_follows_model() {
        let role = Role::new("facility")
            .parameter("cap", Specification::value(ValueKind::Int, "upper limit"));
        let mut facility = Facility::new(Component::new("plant", &role));
        facility.component.parameters.set("cap", 4_i64).unwrap();

        let gen = Generator::bounded(
            Bound::Fixed(0.0),
            Bound::field(Selector::Facility, Collection::Parameters, "cap"),
            true,
            None,
        );
        assert!(gen.is_valid(&Value::Int(4), &facility).unwrap());
        facility.component.parameters.set("cap", 2_i64).unwrap();
        assert!(!gen.is_valid(&Value::Int(4), &facility).unwrap());
        assert_eq!(gen.repair(&Value::Int(4), &facility).unwrap(), Value::Int(2));
    }
}
