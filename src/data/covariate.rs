use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};
use thiserror::Error;

/// Error type for covariate operations
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CovariateError {
    #[error("Covariate '{name}' already has an observation at time {time}")]
    ObservationExists { name: String, time: f64 },
    #[error("Covariate '{name}' has a non-finite observation at time {time}")]
    NonFinite { name: String, time: f64 },
    #[error("Covariate '{0}' has no observations")]
    Empty(String),
    #[error("Covariate '{0}' not found")]
    NotFound(String),
}

/// Method used to interpolate covariate values between observations
#[derive(Serialize, Clone, Copy, Debug, Deserialize, PartialEq)]
pub enum Interpolation {
    /// Linear interpolation between two points with slope and intercept
    Linear { slope: f64, intercept: f64 },
    /// Constant value carried forward
    CarryForward { value: f64 },
}

/// A half-open interval `[from, to)` with its interpolant
#[derive(Serialize, Clone, Debug, Deserialize)]
struct Segment {
    from: f64,
    to: f64,
    method: Interpolation,
}

impl Segment {
    #[inline]
    fn contains(&self, time: f64) -> bool {
        self.from <= time && time < self.to
    }

    #[inline]
    fn value(&self, time: f64) -> f64 {
        match self.method {
            Interpolation::Linear { slope, intercept } => slope * time + intercept,
            Interpolation::CarryForward { value } => value,
        }
    }
}

/// A covariate observed at one or more times
///
/// Between observations the value is interpolated linearly, or carried forward when the
/// covariate is `fixed`. Before the first observation the first value is carried backwards,
/// after the last observation the last value is carried forward.
#[derive(Serialize, Clone, Debug, Deserialize)]
pub struct Covariate {
    name: String,
    /// Observations as `(time, value)`, kept sorted by time
    observations: Vec<(f64, f64)>,
    segments: Vec<Segment>,
    fixed: bool,
}

impl Covariate {
    /// Create a new covariate without observations
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the covariate
    /// * `fixed` - Whether this covariate should use carry-forward interpolation
    pub fn new(name: impl Into<String>, fixed: bool) -> Self {
        Covariate {
            name: name.into(),
            observations: Vec::new(),
            segments: Vec::new(),
            fixed,
        }
    }

    /// A covariate with a single value for all times
    pub fn constant(name: impl Into<String>, value: f64) -> Self {
        let mut covariate = Covariate::new(name, true);
        covariate.observations.push((0.0, value));
        covariate.rebuild();
        covariate
    }

    /// Add an observation, keeping the observations ordered by time
    pub fn add_observation(&mut self, time: f64, value: f64) -> Result<(), CovariateError> {
        if !time.is_finite() || !value.is_finite() {
            return Err(CovariateError::NonFinite {
                name: self.name.clone(),
                time,
            });
        }
        if self.observations.iter().any(|&(t, _)| t == time) {
            return Err(CovariateError::ObservationExists {
                name: self.name.clone(),
                time,
            });
        }
        let position = self.observations.partition_point(|&(t, _)| t < time);
        self.observations.insert(position, (time, value));
        self.rebuild();
        Ok(())
    }

    fn rebuild(&mut self) {
        self.segments = self
            .observations
            .windows(2)
            .map(|pair| {
                let (t0, v0) = pair[0];
                let (t1, v1) = pair[1];
                let method = if self.fixed {
                    Interpolation::CarryForward { value: v0 }
                } else {
                    let slope = (v1 - v0) / (t1 - t0);
                    Interpolation::Linear {
                        slope,
                        intercept: v0 - slope * t0,
                    }
                };
                Segment {
                    from: t0,
                    to: t1,
                    method,
                }
            })
            .collect();
    }

    /// Interpolate the covariate value at a specific time
    #[inline]
    pub fn interpolate(&self, time: f64) -> Result<f64, CovariateError> {
        let (first, last) = match (self.observations.first(), self.observations.last()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => return Err(CovariateError::Empty(self.name.clone())),
        };
        if time < first.0 {
            return Ok(first.1);
        }
        if time >= last.0 {
            return Ok(last.1);
        }
        let index = self.segments.partition_point(|segment| segment.to <= time);
        match self.segments.get(index) {
            Some(segment) if segment.contains(time) => Ok(segment.value(time)),
            _ => Ok(last.1),
        }
    }

    /// Get the name of the covariate
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Observations as `(time, value)` pairs, ordered by time
    pub fn observations(&self) -> &[(f64, f64)] {
        &self.observations
    }

    /// Check if this covariate uses carry-forward interpolation
    pub fn fixed(&self) -> bool {
        self.fixed
    }

    /// True when the covariate takes more than one value over time
    pub fn is_time_varying(&self) -> bool {
        self.observations
            .windows(2)
            .any(|pair| pair[0].1 != pair[1].1)
    }
}

impl fmt::Display for Covariate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Covariate '{}'", self.name)?;
        if self.fixed {
            write!(f, " (fixed)")?;
        }
        writeln!(f, ":")?;
        for (time, value) in &self.observations {
            writeln!(f, "  t = {:.2}: {:.4}", time, value)?;
        }
        Ok(())
    }
}

/// A collection of [Covariate]s, keyed by name
#[derive(Serialize, Clone, Debug, Default, Deserialize)]
pub struct Covariates {
    covariates: BTreeMap<String, Covariate>,
}

impl Covariates {
    /// Create a new empty collection of covariates
    pub fn new() -> Self {
        Covariates::default()
    }

    /// Add a covariate to the collection, replacing any covariate with the same name
    pub fn add_covariate(&mut self, covariate: Covariate) {
        self.covariates
            .insert(covariate.name().to_string(), covariate);
    }

    /// Add an observation for the named covariate, creating it (interpolated linearly) if needed
    pub fn observe(
        &mut self,
        name: impl Into<String>,
        time: f64,
        value: f64,
        fixed: bool,
    ) -> Result<(), CovariateError> {
        let name = name.into();
        self.covariates
            .entry(name.clone())
            .or_insert_with(|| Covariate::new(name, fixed))
            .add_observation(time, value)
    }

    /// Get a covariate by name
    pub fn get_covariate(&self, name: &str) -> Option<&Covariate> {
        self.covariates.get(name)
    }

    /// Interpolated value of the named covariate at `time`
    pub fn value(&self, name: &str, time: f64) -> Result<f64, CovariateError> {
        self.get_covariate(name)
            .ok_or_else(|| CovariateError::NotFound(name.to_string()))?
            .interpolate(time)
    }

    /// Values of all covariates at `time`
    pub fn values_at(&self, time: f64) -> Result<BTreeMap<String, f64>, CovariateError> {
        self.covariates
            .iter()
            .map(|(name, covariate)| Ok((name.clone(), covariate.interpolate(time)?)))
            .collect()
    }

    /// True if any covariate changes value over time
    pub fn is_time_varying(&self) -> bool {
        self.covariates.values().any(Covariate::is_time_varying)
    }

    /// Times at which any covariate was observed, sorted and deduplicated
    pub fn observation_times(&self) -> Vec<f64> {
        let mut times: Vec<f64> = self
            .covariates
            .values()
            .flat_map(|c| c.observations.iter().map(|&(t, _)| t))
            .collect();
        times.sort_by(f64::total_cmp);
        times.dedup();
        times
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.covariates.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.covariates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.covariates.len()
    }
}

impl fmt::Display for Covariates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for covariate in self.covariates.values() {
            write!(f, "{}", covariate)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn linear_interpolation() {
        let mut wt = Covariate::new("wt", false);
        wt.add_observation(10.0, 80.0).unwrap();
        wt.add_observation(0.0, 70.0).unwrap();

        assert_relative_eq!(wt.interpolate(0.0).unwrap(), 70.0);
        assert_relative_eq!(wt.interpolate(5.0).unwrap(), 75.0);
        assert_relative_eq!(wt.interpolate(-3.0).unwrap(), 70.0);
        assert_relative_eq!(wt.interpolate(25.0).unwrap(), 80.0);
        assert!(wt.is_time_varying());
    }

    #[test]
    fn carry_forward_interpolation() {
        let mut crcl = Covariate::new("crcl", true);
        crcl.add_observation(0.0, 100.0).unwrap();
        crcl.add_observation(24.0, 60.0).unwrap();

        assert_relative_eq!(crcl.interpolate(12.0).unwrap(), 100.0);
        assert_relative_eq!(crcl.interpolate(24.0).unwrap(), 60.0);
    }

    #[test]
    fn duplicate_and_empty() {
        let mut age = Covariate::new("age", false);
        assert_eq!(
            age.interpolate(1.0),
            Err(CovariateError::Empty("age".to_string()))
        );
        age.add_observation(0.0, 40.0).unwrap();
        assert!(matches!(
            age.add_observation(0.0, 41.0),
            Err(CovariateError::ObservationExists { .. })
        ));
        assert!(!age.is_time_varying());
    }

    #[test]
    fn collection_lookup() {
        let mut covariates = Covariates::new();
        covariates.observe("wt", 0.0, 70.0, false).unwrap();
        covariates.observe("wt", 2.0, 72.0, false).unwrap();
        covariates.add_covariate(Covariate::constant("sex", 1.0));

        assert_relative_eq!(covariates.value("wt", 1.0).unwrap(), 71.0);
        assert_relative_eq!(covariates.value("sex", 100.0).unwrap(), 1.0);
        assert!(covariates.value("age", 0.0).is_err());
        assert_eq!(covariates.observation_times(), vec![0.0, 2.0]);
        assert_eq!(covariates.values_at(2.0).unwrap().len(), 2);
    }
}
