pub mod params;
pub mod quantities;
pub mod random;

pub use params::*;
pub use quantities::*;
pub use random::*;

use crate::data::Covariates;
use crate::error::PharmsimError;
use crate::simulator::{T, V};

/// A hierarchical pharmacometric model
///
/// A model is built once and never mutated. It declares its fixed-effect domain and its
/// random-effect distribution, and defines four stages:
/// - `pre`: fixed effects, random effects and covariates to [Quantities]
/// - `init`: the initial state from the quantities
/// - `dynamics`: the state derivative, given the infusion input of every compartment
/// - `derived`: the named outputs
///
/// [Ode] implements this trait from plain functions; implement it directly when the stages
/// need to carry data.
pub trait Model: Send + Sync {
    /// Number of states (compartments)
    fn nstates(&self) -> usize;

    /// Names of the derived outputs, in the order `derived` writes them
    fn output_names(&self) -> &[String];

    fn parameter_domain(&self) -> &ParamDomain;

    fn random_effects(&self) -> &RandomEffectsSpec;

    /// Constraints checked on the quantities returned by `pre`
    fn constraints(&self) -> &[(String, Constraint)];

    fn pre(
        &self,
        fixed: &FixedEffects,
        random: &RandomEffects,
        covariates: &Covariates,
        t: T,
    ) -> Result<Quantities, PharmsimError>;

    fn init(&self, q: &Quantities, t: T, x: &mut V);

    /// `rateiv` holds the summed input rate of every infusion open at `t`, per compartment
    fn dynamics(&self, x: &V, q: &Quantities, t: T, rateiv: &V, dx: &mut V);

    fn derived(&self, x: &V, q: &Quantities, t: T, y: &mut V);
}

/// Pre-transformation of a model
///
/// # Example
/// ```ignore
/// use pharmsim::*;
/// let pre: Pre = |fe, re, cov, t| {
///     fetch_cov!(cov, t, wt);
///     let cl = fe.scalar("tvcl")? * (wt / 70.0).powf(0.75) * re.eta("eta", 0).exp();
///     let v = fe.scalar("tvv")? * re.eta("eta", 1).exp();
///     Ok(Quantities::new().with("cl", cl).with("v", v))
/// };
/// ```
pub type Pre = fn(&FixedEffects, &RandomEffects, &Covariates, T) -> Result<Quantities, PharmsimError>;

/// Initial state
/// Params:
/// - q: the resolved quantities
/// - t: the start time
/// - x: the state, zero on entry
pub type Init = fn(&Quantities, T, &mut V);

/// Right-hand side of the model
///
/// # Example
/// ```ignore
/// use pharmsim::*;
/// let dynamics: Dynamics = |x, q, _t, rateiv, dx| {
///     fetch_quantities!(q, cl, v);
///     dx[0] = -cl / v * x[0] + rateiv[0];
/// };
/// ```
pub type Dynamics = fn(&V, &Quantities, T, &V, &mut V);

/// Output equations, writing one value per output name
pub type Derived = fn(&V, &Quantities, T, &mut V);

/// A [Model] defined by plain functions
#[derive(Clone, Debug)]
pub struct Ode {
    nstates: usize,
    outputs: Vec<String>,
    domain: ParamDomain,
    random: RandomEffectsSpec,
    constraints: Vec<(String, Constraint)>,
    pre: Pre,
    init: Init,
    dynamics: Dynamics,
    derived: Derived,
}

fn zero_init(_q: &Quantities, _t: T, _x: &mut V) {}

impl Ode {
    pub fn new(nstates: usize, pre: Pre, dynamics: Dynamics, derived: Derived, outputs: &[&str]) -> Self {
        Ode {
            nstates,
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            domain: ParamDomain::new(),
            random: RandomEffectsSpec::new(),
            constraints: Vec::new(),
            pre,
            init: zero_init,
            dynamics,
            derived,
        }
    }

    pub fn with_init(mut self, init: Init) -> Self {
        self.init = init;
        self
    }

    pub fn with_domain(mut self, domain: ParamDomain) -> Self {
        self.domain = domain;
        self
    }

    pub fn with_random_effects(mut self, random: RandomEffectsSpec) -> Self {
        self.random = random;
        self
    }

    pub fn with_constraint(mut self, quantity: &str, constraint: Constraint) -> Self {
        self.constraints.push((quantity.to_string(), constraint));
        self
    }
}

impl Model for Ode {
    fn nstates(&self) -> usize {
        self.nstates
    }

    fn output_names(&self) -> &[String] {
        &self.outputs
    }

    fn parameter_domain(&self) -> &ParamDomain {
        &self.domain
    }

    fn random_effects(&self) -> &RandomEffectsSpec {
        &self.random
    }

    fn constraints(&self) -> &[(String, Constraint)] {
        &self.constraints
    }

    #[inline(always)]
    fn pre(
        &self,
        fixed: &FixedEffects,
        random: &RandomEffects,
        covariates: &Covariates,
        t: T,
    ) -> Result<Quantities, PharmsimError> {
        (self.pre)(fixed, random, covariates, t)
    }

    #[inline(always)]
    fn init(&self, q: &Quantities, t: T, x: &mut V) {
        (self.init)(q, t, x)
    }

    #[inline(always)]
    fn dynamics(&self, x: &V, q: &Quantities, t: T, rateiv: &V, dx: &mut V) {
        (self.dynamics)(x, q, t, rateiv, dx)
    }

    #[inline(always)]
    fn derived(&self, x: &V, q: &Quantities, t: T, y: &mut V) {
        (self.derived)(x, q, t, y)
    }
}
