use std::borrow::Cow;
use std::sync::Arc;

use rand::Rng;

use crate::data::Covariates;
use crate::error::PharmsimError;
use crate::model::{FixedEffects, Model, Quantities, RandomEffects};
use crate::simulator::T;

/// Random effects and quantities of one subject
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub random_effects: RandomEffects,
    pub quantities: Quantities,
}

/// Resolve the quantities of a subject at time `t`
///
/// Supplied random effects are checked against the model's distribution; when `random` is
/// `None`, one sample is drawn from `rng`. The quantities returned by the model's `pre` stage
/// are checked against the declared constraints and the built-in checks on dosing modifiers.
///
/// # Arguments
///
/// * `model` - The model
/// * `fixed` - Fixed effects, validated against the model's domain
/// * `random` - Random effects, or `None` to sample them
/// * `covariates` - Covariates of the subject
/// * `t` - Time at which time-varying covariates are evaluated
/// * `rng` - Source of randomness used only when sampling
pub fn resolve<Md: Model + ?Sized, R: Rng + ?Sized>(
    model: &Md,
    fixed: &FixedEffects,
    random: Option<&RandomEffects>,
    covariates: &Covariates,
    t: T,
    rng: &mut R,
) -> Result<Resolved, PharmsimError> {
    model.parameter_domain().validate(fixed)?;
    let random_effects = match random {
        Some(random) => {
            model.random_effects().validate(random)?;
            random.clone()
        }
        None => model.random_effects().sample(fixed, rng)?,
    };
    let quantities = evaluate(model, fixed, &random_effects, covariates, t)?;
    Ok(Resolved {
        random_effects,
        quantities,
    })
}

/// Run the `pre` stage and check its result
pub(crate) fn evaluate<Md: Model + ?Sized>(
    model: &Md,
    fixed: &FixedEffects,
    random: &RandomEffects,
    covariates: &Covariates,
    t: T,
) -> Result<Quantities, PharmsimError> {
    let q = model.pre(fixed, random, covariates, t)?;
    q.check_intrinsic(model.nstates())?;
    for (name, constraint) in model.constraints() {
        constraint.check(name, q.require(name)?)?;
    }
    Ok(q)
}

/// Quantities of one subject as a function of time
///
/// Without time-varying covariates the quantities are resolved once; otherwise the `pre`
/// stage is evaluated again at every requested time.
pub(crate) struct QuantitySource<Md: Model> {
    model: Arc<Md>,
    fixed: Arc<FixedEffects>,
    random: RandomEffects,
    covariates: Covariates,
    base: Quantities,
    varying: bool,
}

impl<Md: Model> QuantitySource<Md> {
    pub(crate) fn new(
        model: Arc<Md>,
        fixed: Arc<FixedEffects>,
        random: RandomEffects,
        covariates: &Covariates,
        base: Quantities,
    ) -> Self {
        QuantitySource {
            model,
            fixed,
            random,
            varying: covariates.is_time_varying(),
            covariates: covariates.clone(),
            base,
        }
    }

    pub(crate) fn model(&self) -> &Md {
        &self.model
    }

    pub(crate) fn is_time_varying(&self) -> bool {
        self.varying
    }

    /// Times at which time-varying covariates change course
    pub(crate) fn change_times(&self) -> Vec<T> {
        if self.varying {
            self.covariates.observation_times()
        } else {
            Vec::new()
        }
    }

    pub(crate) fn at(&self, t: T) -> Result<Cow<'_, Quantities>, PharmsimError> {
        if self.varying {
            evaluate(
                self.model.as_ref(),
                &self.fixed,
                &self.random,
                &self.covariates,
                t,
            )
            .map(Cow::Owned)
        } else {
            Ok(Cow::Borrowed(&self.base))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Covariate, Covariates};
    use crate::model::{Constraint, Ode, ParamDomain, RandomEffectsSpec};
    use crate::simulator::V;
    use crate::fetch_cov;
    use rand::{rngs::StdRng, SeedableRng};

    fn model() -> Ode {
        Ode::new(
            1,
            |fe, re, cov, t| {
                fetch_cov!(cov, t, wt);
                let cl = fe.scalar("tvcl")? * (wt / 70.0) * re.eta("eta_cl", 0).exp();
                let v = fe.scalar("tvv")?;
                Ok(Quantities::new().with("cl", cl).with("v", v))
            },
            |x: &V, q: &Quantities, _t, rateiv: &V, dx: &mut V| {
                dx[0] = -q[0] / q[1] * x[0] + rateiv[0];
            },
            |x: &V, q: &Quantities, _t, y: &mut V| {
                y[0] = x[0] / q[1];
            },
            &["cp"],
        )
        .with_domain(ParamDomain::new().positive("tvcl").real("tvv"))
        .with_random_effects(RandomEffectsSpec::new().scalar("eta_cl", 0.1))
        .with_constraint("v", Constraint::Positive)
    }

    fn covariates(wt: f64) -> Covariates {
        let mut covariates = Covariates::new();
        covariates.add_covariate(Covariate::constant("wt", wt));
        covariates
    }

    #[test]
    fn supplied_random_effects_are_used() {
        let fixed = FixedEffects::new()
            .with_scalar("tvcl", 2.0)
            .with_scalar("tvv", 10.0);
        let eta = RandomEffects::new().with("eta_cl", vec![0.0]);
        let resolved = resolve(
            &model(),
            &fixed,
            Some(&eta),
            &covariates(35.0),
            0.0,
            &mut StdRng::seed_from_u64(0),
        )
        .unwrap();
        assert_eq!(resolved.quantities.get("cl"), Some(1.0));
        assert_eq!(resolved.random_effects, eta);
    }

    #[test]
    fn sampling_is_seeded() {
        let fixed = FixedEffects::new()
            .with_scalar("tvcl", 2.0)
            .with_scalar("tvv", 10.0);
        let a = resolve(&model(), &fixed, None, &covariates(70.0), 0.0, &mut StdRng::seed_from_u64(5))
            .unwrap();
        let b = resolve(&model(), &fixed, None, &covariates(70.0), 0.0, &mut StdRng::seed_from_u64(5))
            .unwrap();
        assert_eq!(a, b);
        assert_ne!(a.quantities.get("cl"), Some(2.0));
    }

    #[test]
    fn violations_are_detected_before_integration() {
        let fixed = FixedEffects::new()
            .with_scalar("tvcl", 2.0)
            .with_scalar("tvv", -10.0);
        let result = resolve(
            &model(),
            &fixed,
            Some(&RandomEffects::new().with("eta_cl", vec![0.0])),
            &covariates(70.0),
            0.0,
            &mut StdRng::seed_from_u64(0),
        );
        assert!(matches!(
            result,
            Err(PharmsimError::DomainViolation { ref quantity, .. }) if quantity == "v"
        ));

        let missing = resolve(
            &model(),
            &fixed,
            None,
            &Covariates::new(),
            0.0,
            &mut StdRng::seed_from_u64(0),
        );
        assert!(matches!(missing, Err(PharmsimError::Covariate(_))));
    }
}
