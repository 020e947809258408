use std::collections::BTreeMap;

use nalgebra::{Cholesky, SymmetricEigen};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::error::PharmsimError;
use crate::model::params::{is_symmetric, FixedEffects};
use crate::simulator::{M, V};

/// Covariance of a block of random effects
#[derive(Debug, Clone, PartialEq)]
pub enum Covariance {
    /// A constant matrix
    Fixed(M),
    /// Independent effects with the given variances
    Diagonal(Vec<f64>),
    /// The matrix fixed effect with this name
    Parameter(String),
}

/// A multivariate normal block with zero mean
#[derive(Debug, Clone, PartialEq)]
pub struct RandomBlock {
    name: String,
    dim: usize,
    covariance: Covariance,
}

impl RandomBlock {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    fn covariance(&self, fixed: &FixedEffects) -> Result<M, PharmsimError> {
        let m = match &self.covariance {
            Covariance::Fixed(m) => m.clone(),
            Covariance::Diagonal(variances) => M::from_diagonal(&V::from_column_slice(variances)),
            Covariance::Parameter(name) => fixed.matrix(name)?.clone(),
        };
        if m.nrows() != self.dim || m.ncols() != self.dim {
            return Err(PharmsimError::domain(
                &self.name,
                m.nrows() as f64,
                format!("covariance must be {0}x{0}", self.dim),
            ));
        }
        Ok(m)
    }

    /// Lower factor `L` with `L * L^T = covariance`
    fn factor(&self, fixed: &FixedEffects) -> Result<M, PharmsimError> {
        let cov = self.covariance(fixed)?;
        if cov.iter().any(|v| !v.is_finite()) || !is_symmetric(&cov) {
            return Err(PharmsimError::domain(
                &self.name,
                f64::NAN,
                "covariance must be finite and symmetric",
            ));
        }
        if let Some(chol) = Cholesky::new(cov.clone()) {
            return Ok(chol.l());
        }
        // semidefinite: Q * sqrt(Lambda)
        let eigen = SymmetricEigen::new(cov.clone());
        let tol = 1e-10 * cov.amax().max(1.0);
        if let Some(lambda) = eigen.eigenvalues.iter().find(|l| **l < -tol) {
            return Err(PharmsimError::domain(
                &self.name,
                *lambda,
                "covariance must be positive semidefinite",
            ));
        }
        let sqrt = eigen.eigenvalues.map(|l| l.max(0.0).sqrt());
        Ok(eigen.eigenvectors * M::from_diagonal(&sqrt))
    }
}

/// Random-effect distribution of a model, made of independent blocks
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RandomEffectsSpec {
    blocks: Vec<RandomBlock>,
}

impl RandomEffectsSpec {
    pub fn new() -> Self {
        RandomEffectsSpec::default()
    }

    /// Add a block of `dim` effects
    pub fn block(mut self, name: impl Into<String>, dim: usize, covariance: Covariance) -> Self {
        self.blocks.push(RandomBlock {
            name: name.into(),
            dim,
            covariance,
        });
        self
    }

    /// Add a single effect with variance `variance`
    pub fn scalar(self, name: impl Into<String>, variance: f64) -> Self {
        self.block(name, 1, Covariance::Diagonal(vec![variance]))
    }

    pub fn blocks(&self) -> &[RandomBlock] {
        &self.blocks
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Draw one realisation of every block
    pub fn sample<R: Rng + ?Sized>(
        &self,
        fixed: &FixedEffects,
        rng: &mut R,
    ) -> Result<RandomEffects, PharmsimError> {
        let mut effects = RandomEffects::new();
        for block in &self.blocks {
            let l = block.factor(fixed)?;
            let z = V::from_fn(block.dim, |_, _| rng.sample(StandardNormal));
            let eta = l * z;
            effects.insert(block.name.clone(), eta.iter().cloned().collect());
        }
        Ok(effects)
    }

    /// Check supplied random effects against the declared blocks
    pub fn validate(&self, effects: &RandomEffects) -> Result<(), PharmsimError> {
        for block in &self.blocks {
            let values = effects.get(&block.name).ok_or_else(|| {
                PharmsimError::InvalidInput(format!("missing random effect '{}'", block.name))
            })?;
            if values.len() != block.dim {
                return Err(PharmsimError::InvalidInput(format!(
                    "random effect '{}' has {} elements, expected {}",
                    block.name,
                    values.len(),
                    block.dim
                )));
            }
            if let Some(v) = values.iter().find(|v| !v.is_finite()) {
                return Err(PharmsimError::domain(&block.name, *v, "must be finite"));
            }
        }
        if let Some(extra) = effects
            .names()
            .find(|name| !self.blocks.iter().any(|b| b.name == *name))
        {
            return Err(PharmsimError::InvalidInput(format!(
                "unknown random effect '{}'",
                extra
            )));
        }
        Ok(())
    }
}

/// Realised random effects of one subject, by block name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RandomEffects {
    values: BTreeMap<String, Vec<f64>>,
}

impl RandomEffects {
    pub fn new() -> Self {
        RandomEffects::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, values: Vec<f64>) {
        self.values.insert(name.into(), values);
    }

    pub fn with(mut self, name: impl Into<String>, values: Vec<f64>) -> Self {
        self.insert(name, values);
        self
    }

    pub fn get(&self, name: &str) -> Option<&[f64]> {
        self.values.get(name).map(Vec::as_slice)
    }

    /// Element `index` of block `name`, zero when the block is absent
    ///
    /// Absent blocks read as zero so a model can be evaluated at the population typical values.
    pub fn eta(&self, name: &str, index: usize) -> f64 {
        self.get(name)
            .and_then(|v| v.get(index))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use nalgebra::dmatrix;
    use rand::{rngs::StdRng, SeedableRng};

    fn spec() -> RandomEffectsSpec {
        RandomEffectsSpec::new()
            .block("eta", 2, Covariance::Parameter("omega".into()))
            .scalar("eta_f", 0.04)
    }

    #[test]
    fn sampling_is_reproducible() {
        let fixed = FixedEffects::new().with_matrix("omega", dmatrix![0.09, 0.01; 0.01, 0.04]);
        let a = spec()
            .sample(&fixed, &mut StdRng::seed_from_u64(7))
            .unwrap();
        let b = spec()
            .sample(&fixed, &mut StdRng::seed_from_u64(7))
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.get("eta").map(|v| v.len()), Some(2));
        assert!(spec().validate(&a).is_ok());
    }

    #[test]
    fn sample_covariance_matches() {
        let omega = dmatrix![0.09, 0.03; 0.03, 0.04];
        let fixed = FixedEffects::new().with_matrix("omega", omega.clone());
        let spec = RandomEffectsSpec::new().block("eta", 2, Covariance::Parameter("omega".into()));
        let mut rng = StdRng::seed_from_u64(42);
        let n = 20_000;
        let mut acc = M::zeros(2, 2);
        for _ in 0..n {
            let eta = spec.sample(&fixed, &mut rng).unwrap();
            let v = V::from_column_slice(eta.get("eta").unwrap());
            acc += &v * v.transpose();
        }
        acc /= n as f64;
        for (estimate, expected) in acc.iter().zip(omega.iter()) {
            assert_abs_diff_eq!(estimate, expected, epsilon = 0.01);
        }
    }

    #[test]
    fn semidefinite_covariance_is_sampled() {
        let spec = RandomEffectsSpec::new().block(
            "eta",
            2,
            Covariance::Fixed(dmatrix![0.04, 0.04; 0.04, 0.04]),
        );
        let eta = spec
            .sample(&FixedEffects::new(), &mut StdRng::seed_from_u64(1))
            .unwrap();
        let v = eta.get("eta").unwrap();
        assert_abs_diff_eq!(v[0], v[1], epsilon = 1e-6);
    }

    #[test]
    fn indefinite_covariance_is_rejected() {
        let spec =
            RandomEffectsSpec::new().block("eta", 2, Covariance::Fixed(dmatrix![1.0, 2.0; 2.0, 1.0]));
        assert!(matches!(
            spec.sample(&FixedEffects::new(), &mut StdRng::seed_from_u64(1)),
            Err(PharmsimError::DomainViolation { .. })
        ));
    }

    #[test]
    fn supplied_effects_are_checked() {
        let ok = RandomEffects::new()
            .with("eta", vec![0.1, -0.1])
            .with("eta_f", vec![0.0]);
        assert!(spec().validate(&ok).is_ok());
        assert!(spec()
            .validate(&RandomEffects::new().with("eta", vec![0.1]))
            .is_err());
        assert!(spec()
            .validate(&ok.clone().with("eta_v", vec![0.0]))
            .is_err());
        assert_eq!(ok.eta("eta", 1), -0.1);
        assert_eq!(ok.eta("eta_ka", 0), 0.0);
    }
}
