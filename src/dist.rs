//! Continuous distributions used to perturb parameters during sensitivity
//! analysis. Any drawn value is acceptable; whether the model copes with it
//! is discovered by running the model.

use rand::rngs::StdRng;
use rand_distr::{Distribution as _, Normal, Triangular, Uniform};

use crate::error::{Error, Result};
use crate::units::{Quantity, Unit};
use crate::value::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Distribution {
    /// Uniform over `[min, max)`.
    Uniform { min: f64, max: f64, unit: Option<Unit> },
    Triangular {
        min: f64,
        mode: f64,
        max: f64,
        unit: Option<Unit>,
    },
    Gaussian {
        mean: f64,
        std_dev: f64,
        unit: Option<Unit>,
    },
}

fn interval(min: &Quantity, max: &Quantity) -> Result<(f64, f64)> {
    let hi = max.magnitude_in(&min.unit)?;
    if !(min.magnitude < hi) {
        return Err(Error::Config(format!(
            "distribution interval must be non-empty, got [{min}, {max}]"
        )));
    }
    Ok((min.magnitude, hi))
}

impl Distribution {
    pub fn uniform(min: Quantity, max: Quantity) -> Result<Self> {
        let (lo, hi) = interval(&min, &max)?;
        Ok(Distribution::Uniform {
            min: lo,
            max: hi,
            unit: Some(min.unit),
        })
    }

    /// Symmetric triangle peaking at the midpoint.
    pub fn triangular(min: Quantity, max: Quantity) -> Result<Self> {
        let (lo, hi) = interval(&min, &max)?;
        Ok(Distribution::Triangular {
            min: lo,
            mode: (lo + hi) / 2.0,
            max: hi,
            unit: Some(min.unit),
        })
    }

    pub fn triangular_with_mode(min: Quantity, mode: Quantity, max: Quantity) -> Result<Self> {
        let (lo, hi) = interval(&min, &max)?;
        let mode = mode.magnitude_in(&min.unit)?;
        if !(lo..=hi).contains(&mode) {
            return Err(Error::Config(format!(
                "triangular mode {mode} lies outside [{lo}, {hi}]"
            )));
        }
        Ok(Distribution::Triangular {
            min: lo,
            mode,
            max: hi,
            unit: Some(min.unit),
        })
    }

    /// Normal distribution given its mean and variance. The variance is in
    /// the square of the mean's unit.
    pub fn gaussian(mean: Quantity, variance: Quantity) -> Result<Self> {
        let variance = variance.magnitude_in(&mean.unit.powi(2))?;
        if !(variance >= 0.0) {
            return Err(Error::Config(format!("variance must be non-negative, got {variance}")));
        }
        Ok(Distribution::Gaussian {
            mean: mean.magnitude,
            std_dev: variance.sqrt(),
            unit: Some(mean.unit),
        })
    }

    /// Unitless variant of [`uniform`](Self::uniform) for plain float fields.
    pub fn uniform_plain(min: f64, max: f64) -> Result<Self> {
        if !(min < max) {
            return Err(Error::Config(format!(
                "distribution interval must be non-empty, got [{min}, {max}]"
            )));
        }
        Ok(Distribution::Uniform { min, max, unit: None })
    }

    pub fn gaussian_plain(mean: f64, variance: f64) -> Result<Self> {
        if !(variance >= 0.0) {
            return Err(Error::Config(format!("variance must be non-negative, got {variance}")));
        }
        Ok(Distribution::Gaussian {
            mean,
            std_dev: variance.sqrt(),
            unit: None,
        })
    }

    pub fn unit(&self) -> Option<&Unit> {
        match self {
            Distribution::Uniform { unit, .. }
            | Distribution::Triangular { unit, .. }
            | Distribution::Gaussian { unit, .. } => unit.as_ref(),
        }
    }

    pub fn draw(&self, rng: &mut StdRng) -> Result<Value> {
        let x = match *self {
            Distribution::Uniform { min, max, .. } => Uniform::new(min, max).sample(rng),
            Distribution::Triangular { min, mode, max, .. } => Triangular::new(min, max, mode)
                .map_err(|e| Error::Config(format!("triangular distribution: {e}")))?
                .sample(rng),
            Distribution::Gaussian { mean, std_dev, .. } => Normal::new(mean, std_dev)
                .map_err(|e| Error::Config(format!("gaussian distribution: {e}")))?
                .sample(rng),
        };
        Ok(match self.unit() {
            Some(unit) => Value::Quantity(Quantity::new(x, unit.clone())),
            None => Value::Float(x),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn q(text: &str) -> Quantity {
        Quantity::parse(text).unwrap()
    }

    #[test]
    fn test_uniform_stays_in_interval() {
        let dist = Distribution::uniform(q("1 g"), q("2000 mg")).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..500 {
            let v = dist.draw(&mut rng).unwrap();
            let m = v.as_quantity().unwrap().magnitude;
            assert!((1.0..2.0).contains(&m), "{m} outside [1, 2)");
        }
    }

    #[test]
    fn test_triangular_default_mode_is_midpoint() {
        match Distribution::triangular(q("2 L"), q("4 L")).unwrap() {
            Distribution::Triangular { mode, .. } => assert_eq!(mode, 3.0),
            other => panic!("unexpected {other:?}"),
        }
        assert!(Distribution::triangular_with_mode(q("2 L"), q("5 L"), q("4 L")).is_err());
    }

    #[test]
    fn test_gaussian_takes_variance() {
        let dist = Distribution::gaussian(q("10 g"), q("4 g^2")).unwrap();
        assert!(matches!(dist, Distribution::Gaussian { std_dev, .. } if std_dev == 2.0));
        assert!(Distribution::gaussian(q("10 g"), q("4 g")).is_err());
        assert!(Distribution::gaussian_plain(0.0, -1.0).is_err());
    }

    #[test]
    fn test_empty_interval_rejected() {
        assert!(Distribution::uniform(q("2 g"), q("1 g")).is_err());
        assert!(Distribution::uniform(q("2 g"), q("1 L")).is_err());
        assert!(Distribution::uniform_plain(1.0, 1.0).is_err());
    }

    #[test]
    fn test_same_seed_same_draws() {
        let dist = Distribution::gaussian_plain(5.0, 1.0).unwrap();
        let mut a = StdRng::seed_from_u64(11);
        let mut b = StdRng::seed_from_u64(11);
        for _ in 0..20 {
            assert_eq!(dist.draw(&mut a).unwrap(), dist.draw(&mut b).unwrap());
        }
    }
}
