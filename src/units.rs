//! Units-aware quantities.
//!
//! A [`Unit`] is a product of registered base symbols raised to integer
//! powers, e.g. `g/L` or `m^2*s^-1`. Every symbol maps to a dimension vector
//! (mass, length, time, currency) and a scale factor relative to the base
//! symbol of that dimension (g, m, s, GBP). Conversion between two units of
//! the same dimension multiplies by the ratio of their factors.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Div, Mul, Neg};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnitError {
    #[error("unknown unit symbol '{0}'")]
    Unknown(String),
    #[error("malformed unit expression '{expr}': {reason}")]
    Malformed { expr: String, reason: String },
    #[error("cannot convert from '{from}' to '{to}'")]
    Incompatible { from: String, to: String },
}

/// Exponents of the base dimensions: mass, length, time, currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Dimension([i8; 4]);

impl Dimension {
    pub const NONE: Dimension = Dimension([0, 0, 0, 0]);
    const MASS: Dimension = Dimension([1, 0, 0, 0]);
    const LENGTH: Dimension = Dimension([0, 1, 0, 0]);
    const VOLUME: Dimension = Dimension([0, 3, 0, 0]);
    const TIME: Dimension = Dimension([0, 0, 1, 0]);
    const CURRENCY: Dimension = Dimension([0, 0, 0, 1]);

    fn scaled(self, power: i32) -> Dimension {
        let mut out = self.0;
        for e in out.iter_mut() {
            *e = (*e as i32 * power) as i8;
        }
        Dimension(out)
    }

    fn combine(self, other: Dimension) -> Dimension {
        let mut out = self.0;
        for (e, o) in out.iter_mut().zip(other.0.iter()) {
            *e += *o;
        }
        Dimension(out)
    }

    pub fn is_dimensionless(&self) -> bool {
        *self == Dimension::NONE
    }
}

struct BaseSymbol {
    symbol: &'static str,
    dimension: Dimension,
    factor: f64,
}

const REGISTRY: &[BaseSymbol] = &[
    BaseSymbol { symbol: "dimensionless", dimension: Dimension::NONE, factor: 1.0 },
    BaseSymbol { symbol: "count", dimension: Dimension::NONE, factor: 1.0 },
    BaseSymbol { symbol: "percent", dimension: Dimension::NONE, factor: 0.01 },
    BaseSymbol { symbol: "g", dimension: Dimension::MASS, factor: 1.0 },
    BaseSymbol { symbol: "kg", dimension: Dimension::MASS, factor: 1e3 },
    BaseSymbol { symbol: "mg", dimension: Dimension::MASS, factor: 1e-3 },
    BaseSymbol { symbol: "ug", dimension: Dimension::MASS, factor: 1e-6 },
    BaseSymbol { symbol: "m", dimension: Dimension::LENGTH, factor: 1.0 },
    BaseSymbol { symbol: "km", dimension: Dimension::LENGTH, factor: 1e3 },
    BaseSymbol { symbol: "cm", dimension: Dimension::LENGTH, factor: 1e-2 },
    BaseSymbol { symbol: "mm", dimension: Dimension::LENGTH, factor: 1e-3 },
    BaseSymbol { symbol: "L", dimension: Dimension::VOLUME, factor: 1e-3 },
    BaseSymbol { symbol: "mL", dimension: Dimension::VOLUME, factor: 1e-6 },
    BaseSymbol { symbol: "uL", dimension: Dimension::VOLUME, factor: 1e-9 },
    BaseSymbol { symbol: "s", dimension: Dimension::TIME, factor: 1.0 },
    BaseSymbol { symbol: "ms", dimension: Dimension::TIME, factor: 1e-3 },
    BaseSymbol { symbol: "min", dimension: Dimension::TIME, factor: 60.0 },
    BaseSymbol { symbol: "h", dimension: Dimension::TIME, factor: 3600.0 },
    BaseSymbol { symbol: "day", dimension: Dimension::TIME, factor: 86_400.0 },
    BaseSymbol { symbol: "week", dimension: Dimension::TIME, factor: 604_800.0 },
    BaseSymbol { symbol: "year", dimension: Dimension::TIME, factor: 31_536_000.0 },
    BaseSymbol { symbol: "GBP", dimension: Dimension::CURRENCY, factor: 1.0 },
    BaseSymbol { symbol: "EUR", dimension: Dimension::CURRENCY, factor: 0.8 },
    BaseSymbol { symbol: "USD", dimension: Dimension::CURRENCY, factor: 0.75 },
];

const ALIASES: &[(&str, &str)] = &[
    ("gram", "g"),
    ("kilogram", "kg"),
    ("metre", "m"),
    ("meter", "m"),
    ("litre", "L"),
    ("liter", "L"),
    ("l", "L"),
    ("second", "s"),
    ("minute", "min"),
    ("hour", "h"),
    ("hr", "h"),
    ("days", "day"),
    ("percentage", "percent"),
];

fn lookup(symbol: &str) -> Result<&'static BaseSymbol, UnitError> {
    let canonical = ALIASES
        .iter()
        .find(|(alias, _)| *alias == symbol)
        .map(|(_, target)| *target)
        .unwrap_or(symbol);
    REGISTRY
        .iter()
        .find(|b| b.symbol == canonical)
        .ok_or_else(|| UnitError::Unknown(symbol.to_string()))
}

/// A unit expression, kept as its symbolic terms so that it prints back the
/// way it was written.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Unit {
    terms: Vec<(String, i32)>,
    dimension: Dimension,
    factor: f64,
}

impl Unit {
    pub fn dimensionless() -> Self {
        Unit {
            terms: Vec::new(),
            dimension: Dimension::NONE,
            factor: 1.0,
        }
    }

    /// Parse a unit expression such as `g/L`, `m / s`, `m**2` or `kg*m/s^2`.
    pub fn parse(expr: &str) -> Result<Self, UnitError> {
        let normalised = expr.replace("**", "^").replace(' ', "");
        let malformed = |reason: &str| UnitError::Malformed {
            expr: expr.to_string(),
            reason: reason.to_string(),
        };
        if normalised.is_empty() {
            return Ok(Unit::dimensionless());
        }

        let mut terms: Vec<(String, i32)> = Vec::new();
        let mut sign = 1;
        let mut token = String::new();
        let mut flush = |token: &mut String, sign: i32| -> Result<(), UnitError> {
            if token.is_empty() {
                return Err(malformed("empty factor"));
            }
            let (symbol, power) = match token.split_once('^') {
                Some((s, p)) => (
                    s.to_string(),
                    p.parse::<i32>().map_err(|_| malformed("bad exponent"))?,
                ),
                None => (token.clone(), 1),
            };
            token.clear();
            if symbol == "1" {
                return Ok(());
            }
            let base = lookup(&symbol)?;
            if base.symbol == "dimensionless" {
                return Ok(());
            }
            push_term(&mut terms, base.symbol, power * sign);
            Ok(())
        };

        for ch in normalised.chars() {
            match ch {
                '*' => {
                    flush(&mut token, sign)?;
                    sign = 1;
                }
                '/' => {
                    flush(&mut token, sign)?;
                    sign = -1;
                }
                _ => token.push(ch),
            }
        }
        flush(&mut token, sign)?;
        Unit::from_terms(terms)
    }

    fn from_terms(terms: Vec<(String, i32)>) -> Result<Self, UnitError> {
        let mut dimension = Dimension::NONE;
        let mut factor = 1.0;
        for (symbol, power) in &terms {
            let base = lookup(symbol)?;
            dimension = dimension.combine(base.dimension.scaled(*power));
            factor *= base.factor.powi(*power);
        }
        Ok(Unit {
            terms,
            dimension,
            factor,
        })
    }

    pub fn dimension(&self) -> Dimension {
        self.dimension
    }

    pub fn is_dimensionless(&self) -> bool {
        self.dimension.is_dimensionless()
    }

    pub fn is_compatible(&self, other: &Unit) -> bool {
        self.dimension == other.dimension
    }

    /// Multiplier taking a magnitude in `self` to a magnitude in `target`.
    pub fn conversion_factor(&self, target: &Unit) -> Result<f64, UnitError> {
        if !self.is_compatible(target) {
            return Err(UnitError::Incompatible {
                from: self.to_string(),
                to: target.to_string(),
            });
        }
        if self.factor == target.factor {
            return Ok(1.0);
        }
        Ok(self.factor / target.factor)
    }

    pub fn powi(&self, power: i32) -> Unit {
        let terms = self
            .terms
            .iter()
            .map(|(s, p)| (s.clone(), p * power))
            .filter(|(_, p)| *p != 0)
            .collect();
        Unit {
            terms,
            dimension: self.dimension.scaled(power),
            factor: self.factor.powi(power),
        }
    }

    fn combined(&self, other: &Unit, sign: i32) -> Unit {
        let mut terms = self.terms.clone();
        for (symbol, power) in &other.terms {
            push_term(&mut terms, symbol, power * sign);
        }
        let other_dimension = other.dimension.scaled(sign);
        Unit {
            terms,
            dimension: self.dimension.combine(other_dimension),
            factor: self.factor * other.factor.powi(sign),
        }
    }
}

fn push_term(terms: &mut Vec<(String, i32)>, symbol: &str, power: i32) {
    match terms.iter_mut().find(|(s, _)| s == symbol) {
        Some(term) => term.1 += power,
        None => terms.push((symbol.to_string(), power)),
    }
    terms.retain(|(_, p)| *p != 0);
}

impl PartialEq for Unit {
    fn eq(&self, other: &Self) -> bool {
        self.dimension == other.dimension && self.factor == other.factor
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let numerator: Vec<String> = self
            .terms
            .iter()
            .filter(|(_, p)| *p > 0)
            .map(|(s, p)| if *p == 1 { s.clone() } else { format!("{s}^{p}") })
            .collect();
        let denominator: Vec<String> = self
            .terms
            .iter()
            .filter(|(_, p)| *p < 0)
            .map(|(s, p)| if *p == -1 { s.clone() } else { format!("{s}^{}", -p) })
            .collect();
        if numerator.is_empty() && denominator.is_empty() {
            return f.write_str("dimensionless");
        }
        if numerator.is_empty() {
            f.write_str("1")?;
        } else {
            f.write_str(&numerator.join("*"))?;
        }
        for d in denominator {
            write!(f, "/{d}")?;
        }
        Ok(())
    }
}

impl From<Unit> for String {
    fn from(unit: Unit) -> String {
        unit.to_string()
    }
}

impl TryFrom<String> for Unit {
    type Error = UnitError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Unit::parse(&value)
    }
}

/// A magnitude measured in a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quantity {
    pub magnitude: f64,
    pub unit: Unit,
}

impl Quantity {
    pub fn new(magnitude: f64, unit: Unit) -> Self {
        Quantity { magnitude, unit }
    }

    /// Parse `"<number> <unit expression>"`; a bare number is dimensionless.
    pub fn parse(text: &str) -> Result<Self, UnitError> {
        let text = text.trim();
        let split = text
            .find(|c: char| c.is_whitespace() || c == '*')
            .unwrap_or(text.len());
        let (number, rest) = text.split_at(split);
        let magnitude = number.parse::<f64>().map_err(|_| UnitError::Malformed {
            expr: text.to_string(),
            reason: format!("'{number}' is not a number"),
        })?;
        let rest = rest.trim_start().trim_start_matches('*');
        Ok(Quantity::new(magnitude, Unit::parse(rest)?))
    }

    pub fn dimensionless(magnitude: f64) -> Self {
        Quantity::new(magnitude, Unit::dimensionless())
    }

    pub fn to(&self, unit: &Unit) -> Result<Quantity, UnitError> {
        let factor = self.unit.conversion_factor(unit)?;
        Ok(Quantity::new(self.magnitude * factor, unit.clone()))
    }

    pub fn magnitude_in(&self, unit: &Unit) -> Result<f64, UnitError> {
        Ok(self.to(unit)?.magnitude)
    }

    pub fn checked_add(&self, other: &Quantity) -> Result<Quantity, UnitError> {
        let rhs = other.magnitude_in(&self.unit)?;
        Ok(Quantity::new(self.magnitude + rhs, self.unit.clone()))
    }

    pub fn checked_sub(&self, other: &Quantity) -> Result<Quantity, UnitError> {
        let rhs = other.magnitude_in(&self.unit)?;
        Ok(Quantity::new(self.magnitude - rhs, self.unit.clone()))
    }
}

impl PartialEq for Quantity {
    fn eq(&self, other: &Self) -> bool {
        match other.magnitude_in(&self.unit) {
            Ok(m) => self.magnitude == m,
            Err(_) => false,
        }
    }
}

impl PartialOrd for Quantity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        let rhs = other.magnitude_in(&self.unit).ok()?;
        self.magnitude.partial_cmp(&rhs)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.unit.is_dimensionless() && self.unit.terms.is_empty() {
            write!(f, "{}", self.magnitude)
        } else {
            write!(f, "{} {}", self.magnitude, self.unit)
        }
    }
}

impl Mul<f64> for Quantity {
    type Output = Quantity;

    fn mul(self, rhs: f64) -> Quantity {
        Quantity::new(self.magnitude * rhs, self.unit)
    }
}

impl Mul<Quantity> for f64 {
    type Output = Quantity;

    fn mul(self, rhs: Quantity) -> Quantity {
        rhs * self
    }
}

impl Div<f64> for Quantity {
    type Output = Quantity;

    fn div(self, rhs: f64) -> Quantity {
        Quantity::new(self.magnitude / rhs, self.unit)
    }
}

impl Mul<&Quantity> for &Quantity {
    type Output = Quantity;

    fn mul(self, rhs: &Quantity) -> Quantity {
        Quantity::new(self.magnitude * rhs.magnitude, self.unit.combined(&rhs.unit, 1))
    }
}

impl Div<&Quantity> for &Quantity {
    type Output = Quantity;

    fn div(self, rhs: &Quantity) -> Quantity {
        Quantity::new(self.magnitude / rhs.magnitude, self.unit.combined(&rhs.unit, -1))
    }
}

impl Neg for Quantity {
    type Output = Quantity;

    fn neg(self) -> Quantity {
        Quantity::new(-self.magnitude, self.unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_compound_units() {
        let u = Unit::parse("g / L").unwrap();
        assert_eq!(u.to_string(), "g/L");
        assert_eq!(u, Unit::parse("kg/m^3").unwrap());

        let v = Unit::parse("m**2 * s^-1").unwrap();
        assert_eq!(v.to_string(), "m^2/s");
        assert!(Unit::parse("").unwrap().is_dimensionless());
        assert!(Unit::parse("count").unwrap().is_dimensionless());
    }

    #[test]
    fn test_unknown_symbol_rejected() {
        assert_eq!(
            Unit::parse("furlong"),
            Err(UnitError::Unknown("furlong".to_string()))
        );
        assert!(matches!(Unit::parse("m^x"), Err(UnitError::Malformed { .. })));
    }

    #[test]
    fn test_conversion() {
        let cm = Quantity::parse("3 cm").unwrap();
        let m = Unit::parse("m").unwrap();
        assert!((cm.magnitude_in(&m).unwrap() - 0.03).abs() < 1e-15);

        let eur = Quantity::parse("5 EUR").unwrap();
        let gbp = Unit::parse("GBP").unwrap();
        assert_eq!(eur.to(&gbp).unwrap().magnitude, 4.0);

        let s = Unit::parse("s").unwrap();
        assert!(matches!(cm.to(&s), Err(UnitError::Incompatible { .. })));
    }

    #[test]
    fn test_same_unit_conversion_is_identity() {
        let q = Quantity::parse("0.1 g/L").unwrap();
        let again = q.to(&Unit::parse("g/L").unwrap()).unwrap();
        assert_eq!(again.magnitude.to_bits(), q.magnitude.to_bits());
    }

    #[test]
    fn test_squared_units_round_trip_through_text() {
        let u = Unit::parse("g/L").unwrap().powi(2);
        let reparsed = Unit::parse(&u.to_string()).unwrap();
        assert_eq!(u, reparsed);
        assert_eq!(u.to_string(), "g^2/L^2");
    }

    #[test]
    fn test_quantity_arithmetic() {
        let mass = Quantity::parse("10 g").unwrap();
        let volume = Quantity::parse("2 L").unwrap();
        let conc = &mass / &volume;
        assert_eq!(conc, Quantity::parse("5 g/L").unwrap());
        assert_eq!(2.0 * mass.clone(), Quantity::parse("20 g").unwrap());
        assert!(mass.checked_add(&volume).is_err());
        assert_eq!(
            mass.checked_add(&Quantity::parse("1 kg").unwrap()).unwrap(),
            Quantity::parse("1010 g").unwrap()
        );
    }
}
