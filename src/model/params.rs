use std::collections::BTreeMap;

use nalgebra::{Cholesky, SymmetricEigen};

use crate::error::PharmsimError;
use crate::simulator::M;

/// Value of a fixed effect
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Scalar(f64),
    Vector(Vec<f64>),
    Matrix(M),
}

impl ParamValue {
    fn shape(&self) -> &'static str {
        match self {
            ParamValue::Scalar(_) => "scalar",
            ParamValue::Vector(_) => "vector",
            ParamValue::Matrix(_) => "matrix",
        }
    }
}

/// Named population-level parameters of a model
///
/// ```ignore
/// let fixed = FixedEffects::new()
///     .with_scalar("tvcl", 1.2)
///     .with_vector("theta", vec![0.75, 1.0])
///     .with_matrix("omega", dmatrix![0.09, 0.0; 0.0, 0.04]);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FixedEffects {
    values: BTreeMap<String, ParamValue>,
}

impl FixedEffects {
    pub fn new() -> Self {
        FixedEffects::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: ParamValue) {
        self.values.insert(name.into(), value);
    }

    pub fn with_scalar(mut self, name: impl Into<String>, value: f64) -> Self {
        self.insert(name, ParamValue::Scalar(value));
        self
    }

    pub fn with_vector(mut self, name: impl Into<String>, value: Vec<f64>) -> Self {
        self.insert(name, ParamValue::Vector(value));
        self
    }

    pub fn with_matrix(mut self, name: impl Into<String>, value: M) -> Self {
        self.insert(name, ParamValue::Matrix(value));
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    fn require(&self, name: &str) -> Result<&ParamValue, PharmsimError> {
        self.get(name)
            .ok_or_else(|| PharmsimError::MissingParameter(name.to_string()))
    }

    fn wrong_shape(name: &str, expected: &str, found: &ParamValue) -> PharmsimError {
        PharmsimError::domain(
            name,
            f64::NAN,
            format!("expected a {}, found a {}", expected, found.shape()),
        )
    }

    /// Scalar fixed effect by name
    pub fn scalar(&self, name: &str) -> Result<f64, PharmsimError> {
        match self.require(name)? {
            ParamValue::Scalar(v) => Ok(*v),
            other => Err(Self::wrong_shape(name, "scalar", other)),
        }
    }

    pub fn vector(&self, name: &str) -> Result<&[f64], PharmsimError> {
        match self.require(name)? {
            ParamValue::Vector(v) => Ok(v),
            other => Err(Self::wrong_shape(name, "vector", other)),
        }
    }

    pub fn matrix(&self, name: &str) -> Result<&M, PharmsimError> {
        match self.require(name)? {
            ParamValue::Matrix(m) => Ok(m),
            other => Err(Self::wrong_shape(name, "matrix", other)),
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Validity constraint of a single fixed effect
#[derive(Debug, Clone, PartialEq)]
pub enum Domain {
    /// Any finite scalar
    Real,
    /// Finite scalar strictly greater than zero
    Positive,
    /// Scalar within `[lower, upper]`
    Bounded { lower: f64, upper: f64 },
    /// Vector of `len` elements, each within `[lower, upper]`
    Vector { len: usize, lower: f64, upper: f64 },
    /// Symmetric positive semidefinite matrix of size `dim`
    Psd { dim: usize },
    /// Symmetric positive definite matrix of size `dim`
    Pd { dim: usize },
}

/// Tolerance used for symmetry and eigenvalue checks, relative to the matrix scale
const MATRIX_TOL: f64 = 1e-10;

pub(crate) fn is_symmetric(m: &M) -> bool {
    let scale = m.amax().max(1.0);
    m.is_square() && (m - m.transpose()).amax() <= MATRIX_TOL * scale
}

/// Smallest eigenvalue of a symmetric matrix
pub(crate) fn min_eigenvalue(m: &M) -> f64 {
    SymmetricEigen::new(m.clone())
        .eigenvalues
        .iter()
        .cloned()
        .fold(f64::INFINITY, f64::min)
}

impl Domain {
    fn check(&self, name: &str, value: &ParamValue) -> Result<(), PharmsimError> {
        let violation = |v: f64, why: String| Err(PharmsimError::domain(name, v, why));
        match (self, value) {
            (Domain::Real, ParamValue::Scalar(v)) => {
                if !v.is_finite() {
                    return violation(*v, "must be finite".into());
                }
            }
            (Domain::Positive, ParamValue::Scalar(v)) => {
                if !(*v > 0.0 && v.is_finite()) {
                    return violation(*v, "must be positive".into());
                }
            }
            (Domain::Bounded { lower, upper }, ParamValue::Scalar(v)) => {
                if !(*v >= *lower && *v <= *upper) {
                    return violation(*v, format!("must lie in [{}, {}]", lower, upper));
                }
            }
            (Domain::Vector { len, lower, upper }, ParamValue::Vector(values)) => {
                if values.len() != *len {
                    return violation(
                        values.len() as f64,
                        format!("must have {} elements", len),
                    );
                }
                if let Some(v) = values.iter().find(|v| !(**v >= *lower && **v <= *upper)) {
                    return violation(*v, format!("elements must lie in [{}, {}]", lower, upper));
                }
            }
            (Domain::Psd { dim } | Domain::Pd { dim }, ParamValue::Matrix(m)) => {
                if m.nrows() != *dim || m.ncols() != *dim {
                    return violation(m.nrows() as f64, format!("must be {0}x{0}", dim));
                }
                if m.iter().any(|v| !v.is_finite()) {
                    return violation(f64::NAN, "must be finite".into());
                }
                if !is_symmetric(m) {
                    return violation(f64::NAN, "must be symmetric".into());
                }
                if matches!(self, Domain::Pd { .. }) {
                    if Cholesky::new(m.clone()).is_none() {
                        return violation(min_eigenvalue(m), "must be positive definite".into());
                    }
                } else {
                    let lambda = min_eigenvalue(m);
                    if lambda < -MATRIX_TOL * m.amax().max(1.0) {
                        return violation(lambda, "must be positive semidefinite".into());
                    }
                }
            }
            (expected, found) => {
                let expected = match expected {
                    Domain::Vector { .. } => "vector",
                    Domain::Psd { .. } | Domain::Pd { .. } => "matrix",
                    _ => "scalar",
                };
                return Err(FixedEffects::wrong_shape(name, expected, found));
            }
        }
        Ok(())
    }
}

/// The declared fixed-effect domain of a model
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamDomain {
    entries: Vec<(String, Domain)>,
}

impl ParamDomain {
    pub fn new() -> Self {
        ParamDomain::default()
    }

    pub fn with(mut self, name: impl Into<String>, domain: Domain) -> Self {
        self.entries.push((name.into(), domain));
        self
    }

    pub fn real(self, name: &str) -> Self {
        self.with(name, Domain::Real)
    }

    pub fn positive(self, name: &str) -> Self {
        self.with(name, Domain::Positive)
    }

    pub fn bounded(self, name: &str, lower: f64, upper: f64) -> Self {
        self.with(name, Domain::Bounded { lower, upper })
    }

    pub fn vector(self, name: &str, len: usize, lower: f64, upper: f64) -> Self {
        self.with(name, Domain::Vector { len, lower, upper })
    }

    pub fn psd(self, name: &str, dim: usize) -> Self {
        self.with(name, Domain::Psd { dim })
    }

    pub fn pd(self, name: &str, dim: usize) -> Self {
        self.with(name, Domain::Pd { dim })
    }

    pub fn entries(&self) -> &[(String, Domain)] {
        &self.entries
    }

    /// Check that every declared fixed effect is present and within its domain
    pub fn validate(&self, fixed: &FixedEffects) -> Result<(), PharmsimError> {
        for (name, domain) in &self.entries {
            domain.check(name, fixed.require(name)?)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::dmatrix;

    fn domain() -> ParamDomain {
        ParamDomain::new()
            .positive("cl")
            .bounded("f", 0.0, 1.0)
            .vector("theta", 2, -10.0, 10.0)
            .psd("omega", 2)
    }

    fn fixed() -> FixedEffects {
        FixedEffects::new()
            .with_scalar("cl", 1.0)
            .with_scalar("f", 0.6)
            .with_vector("theta", vec![1.0, -2.0])
            .with_matrix("omega", dmatrix![0.1, 0.02; 0.02, 0.2])
    }

    #[test]
    fn valid_fixed_effects() {
        assert!(domain().validate(&fixed()).is_ok());
        assert_eq!(fixed().scalar("cl").unwrap(), 1.0);
        assert_eq!(fixed().vector("theta").unwrap(), &[1.0, -2.0]);
    }

    #[test]
    fn violations_are_reported() {
        let fe = fixed().with_scalar("cl", 0.0);
        assert!(matches!(
            domain().validate(&fe),
            Err(PharmsimError::DomainViolation { ref quantity, .. }) if quantity == "cl"
        ));

        let fe = fixed().with_scalar("f", 1.5);
        assert!(domain().validate(&fe).is_err());

        let fe = fixed().with_vector("theta", vec![1.0]);
        assert!(domain().validate(&fe).is_err());

        let fe = fixed().with_matrix("omega", dmatrix![1.0, 2.0; 2.0, 1.0]);
        assert!(domain().validate(&fe).is_err());

        let fe = fixed().with_matrix("omega", dmatrix![1.0, 0.5; 0.0, 1.0]);
        assert!(domain().validate(&fe).is_err());
    }

    #[test]
    fn missing_and_wrong_shape() {
        let mut fe = fixed();
        fe.values.remove("cl");
        assert_eq!(
            domain().validate(&fe),
            Err(PharmsimError::MissingParameter("cl".to_string()))
        );
        let fe = fixed().with_vector("cl", vec![1.0]);
        assert!(domain().validate(&fe).is_err());
        assert!(fixed().matrix("cl").is_err());
    }

    #[test]
    fn semidefinite_versus_definite() {
        let singular = dmatrix![1.0, 1.0; 1.0, 1.0];
        let fe = FixedEffects::new().with_matrix("omega", singular);
        assert!(ParamDomain::new().psd("omega", 2).validate(&fe).is_ok());
        assert!(ParamDomain::new().pd("omega", 2).validate(&fe).is_err());
    }
}
