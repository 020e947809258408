use std::collections::BTreeMap;
use std::ops::Index;

use serde::{Deserialize, Serialize};

use crate::error::PharmsimError;

/// The named physiological quantities of one subject
///
/// Produced by the pre-transformation of a model. Besides the quantities used by the dynamics
/// (clearances, volumes, rate constants), it carries the per-compartment dosing modifiers: lag
/// time, bioavailability, modeled infusion duration and modeled infusion rate.
///
/// Dosing modifiers belong to the compartment, not to the dose: every administration into a
/// compartment uses the values resolved at its nominal time. Inputs that need different lags
/// must target different compartments.
///
/// Values keep their insertion order, so they can be read positionally with
/// [fetch_quantities!](crate::fetch_quantities) or by name with [Quantities::get].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Quantities {
    names: Vec<String>,
    values: Vec<f64>,
    lag: BTreeMap<usize, f64>,
    bioavailability: BTreeMap<usize, f64>,
    duration: BTreeMap<usize, f64>,
    rate: BTreeMap<usize, f64>,
}

impl Quantities {
    pub fn new() -> Self {
        Quantities::default()
    }

    /// Add or overwrite a named quantity
    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        let name = name.into();
        match self.names.iter().position(|n| *n == name) {
            Some(i) => self.values[i] = value,
            None => {
                self.names.push(name);
                self.values.push(value);
            }
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: f64) -> Self {
        self.insert(name, value);
        self
    }

    /// Absorption lag of compartment `cmt`
    pub fn with_lag(mut self, cmt: usize, lag: f64) -> Self {
        self.lag.insert(cmt, lag);
        self
    }

    /// Fraction of a dose into compartment `cmt` that reaches it
    pub fn with_bioavailability(mut self, cmt: usize, f: f64) -> Self {
        self.bioavailability.insert(cmt, f);
        self
    }

    /// Duration of infusions into `cmt` given with a modeled duration
    pub fn with_duration(mut self, cmt: usize, duration: f64) -> Self {
        self.duration.insert(cmt, duration);
        self
    }

    /// Rate of infusions into `cmt` given with a modeled rate
    pub fn with_rate(mut self, cmt: usize, rate: f64) -> Self {
        self.rate.insert(cmt, rate);
        self
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| self.values[i])
    }

    /// Like [Quantities::get], failing with [PharmsimError::MissingParameter]
    pub fn require(&self, name: &str) -> Result<f64, PharmsimError> {
        self.get(name)
            .ok_or_else(|| PharmsimError::MissingParameter(name.to_string()))
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.names
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().copied())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Lag of `cmt`, zero when not declared
    pub fn lag(&self, cmt: usize) -> f64 {
        self.lag.get(&cmt).copied().unwrap_or(0.0)
    }

    /// Bioavailability of `cmt`, one when not declared
    pub fn bioavailability(&self, cmt: usize) -> f64 {
        self.bioavailability.get(&cmt).copied().unwrap_or(1.0)
    }

    pub fn duration(&self, cmt: usize) -> Option<f64> {
        self.duration.get(&cmt).copied()
    }

    pub fn rate(&self, cmt: usize) -> Option<f64> {
        self.rate.get(&cmt).copied()
    }

    /// Check the dosing modifiers and that every value is finite
    ///
    /// Compartment indices must be below `nstates`.
    pub(crate) fn check_intrinsic(&self, nstates: usize) -> Result<(), PharmsimError> {
        if let Some((name, value)) = self.iter().find(|(_, v)| !v.is_finite()) {
            return Err(PharmsimError::domain(name, value, "must be finite"));
        }
        let modifiers: [(&str, &BTreeMap<usize, f64>, fn(f64) -> bool, &str); 4] = [
            ("lag", &self.lag, |v| v >= 0.0, "must be non-negative"),
            (
                "bioavailability",
                &self.bioavailability,
                |v| v >= 0.0,
                "must be non-negative",
            ),
            ("duration", &self.duration, |v| v > 0.0, "must be positive"),
            ("rate", &self.rate, |v| v > 0.0, "must be positive"),
        ];
        for (label, map, valid, constraint) in modifiers {
            for (&cmt, &value) in map {
                if cmt >= nstates {
                    return Err(PharmsimError::InvalidInput(format!(
                        "{} declared for compartment {} but the model has {} states",
                        label, cmt, nstates
                    )));
                }
                if !value.is_finite() || !valid(value) {
                    return Err(PharmsimError::domain(
                        format!("{}[{}]", label, cmt),
                        value,
                        constraint,
                    ));
                }
            }
        }
        Ok(())
    }
}

impl Index<usize> for Quantities {
    type Output = f64;

    fn index(&self, index: usize) -> &f64 {
        &self.values[index]
    }
}

/// Declared constraint on a resolved quantity
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Constraint {
    Positive,
    NonNegative,
    Bounded { lower: f64, upper: f64 },
}

impl Constraint {
    pub fn check(&self, name: &str, value: f64) -> Result<(), PharmsimError> {
        let ok = match self {
            Constraint::Positive => value > 0.0,
            Constraint::NonNegative => value >= 0.0,
            Constraint::Bounded { lower, upper } => value >= *lower && value <= *upper,
        };
        if ok {
            return Ok(());
        }
        let constraint = match self {
            Constraint::Positive => "must be positive".to_string(),
            Constraint::NonNegative => "must be non-negative".to_string(),
            Constraint::Bounded { lower, upper } => format!("must lie in [{}, {}]", lower, upper),
        };
        Err(PharmsimError::domain(name, value, constraint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_and_positional_access() {
        let mut q = Quantities::new().with("CL", 2.0).with("V", 20.0);
        assert_eq!(q.get("V"), Some(20.0));
        assert_eq!(q[0], 2.0);
        q.insert("CL", 3.0);
        assert_eq!(q.len(), 2);
        assert_eq!(q.require("CL").unwrap(), 3.0);
        assert!(q.require("KA").is_err());
    }

    #[test]
    fn dosing_modifier_defaults() {
        let q = Quantities::new().with_lag(0, 0.5).with_duration(1, 2.0);
        assert_eq!(q.lag(0), 0.5);
        assert_eq!(q.lag(1), 0.0);
        assert_eq!(q.bioavailability(0), 1.0);
        assert_eq!(q.duration(1), Some(2.0));
        assert_eq!(q.rate(1), None);
    }

    #[test]
    fn intrinsic_checks() {
        assert!(Quantities::new().with("V", 1.0).check_intrinsic(1).is_ok());
        assert!(Quantities::new()
            .with("V", f64::NAN)
            .check_intrinsic(1)
            .is_err());
        assert!(Quantities::new().with_lag(0, -1.0).check_intrinsic(1).is_err());
        assert!(Quantities::new()
            .with_duration(0, 0.0)
            .check_intrinsic(1)
            .is_err());
        assert!(matches!(
            Quantities::new().with_lag(3, 1.0).check_intrinsic(2),
            Err(PharmsimError::InvalidInput(_))
        ));
    }

    #[test]
    fn constraints() {
        assert!(Constraint::Positive.check("V", 1.0).is_ok());
        assert!(Constraint::Positive.check("V", 0.0).is_err());
        assert!(Constraint::NonNegative.check("tlag", 0.0).is_ok());
        assert!(Constraint::Bounded {
            lower: 0.0,
            upper: 1.0
        }
        .check("F", 1.2)
        .is_err());
    }
}
