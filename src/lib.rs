//! Event-driven simulation of pharmacometric models
//!
//! A [Model] turns fixed effects, random effects and covariates into named quantities, and
//! those into the dynamics and outputs of a system of ordinary differential equations. A
//! [Simulator] integrates the model for every [Subject] of a [Population] across its dosing
//! events, one subject per task.
//!
//! ```ignore
//! use pharmsim::prelude::*;
//!
//! let model = Ode::new(
//!     1,
//!     |fe, re, _cov, _t| {
//!         let cl = fe.scalar("tvcl")? * re.eta("eta", 0).exp();
//!         Ok(Quantities::new().with("cl", cl).with("v", fe.scalar("tvv")?))
//!     },
//!     |x, q, _t, rateiv, dx| {
//!         fetch_quantities!(q, cl, v);
//!         dx[0] = -cl / v * x[0] + rateiv[0];
//!     },
//!     |x, q, _t, y| y[0] = x[0] / q[1],
//!     &["cp"],
//! )
//! .with_random_effects(RandomEffectsSpec::new().scalar("eta", 0.09));
//!
//! let subject = Subject::builder("1").bolus(0.0, 100.0, 0).repeat(3, 12.0).build()?;
//! let fixed = FixedEffects::new().with_scalar("tvcl", 5.0).with_scalar("tvv", 50.0);
//! let result = Simulator::new(model, fixed)?.simulate(&Population::from(vec![subject]), None, None)?;
//! ```

pub mod data;
pub mod error;
pub mod model;
pub mod simulator;

pub use crate::data::builder::SubjectBuilderExt;
pub use crate::data::Interpolation::*;
pub use crate::data::*;
pub use crate::error::{ErrorKind, PharmsimError, SubjectError};
pub use crate::model::*;
pub use crate::simulator::{
    simulate, CancelToken, PopulationResult, PopulationSummary, SimulationOptions,
    SimulationResult, Simulator, SolverSettings, SteadyStateSettings, SubjectOutcome,
};
pub use nalgebra::dmatrix;

pub mod prelude {
    pub mod data {
        pub use crate::data::{
            Covariate, Covariates, DosageRegimen, Dose, Evid, Population, Rate, Sample, SsMode,
            Subject,
        };
    }
    pub mod simulator {
        pub use crate::simulator::{
            normalize, resolve, AtomicEvent, EventKind, PopulationResult, SimulationOptions,
            SimulationResult, Simulator, SteadyStateTrace,
        };
    }

    pub use crate::data::builder::SubjectBuilderExt;
    pub use crate::data::Interpolation::*;
    pub use crate::data::*;
    pub use crate::error::{ErrorKind, PharmsimError};
    pub use crate::model::*;
    pub use crate::simulator::{
        simulate, CancelToken, SimulationOptions, SimulationResult, Simulator, SolverSettings,
        SteadyStateSettings, M, T, V,
    };
    pub use crate::{fetch_cov, fetch_quantities};
}

/// Bind resolved quantities to local names, by position
///
/// ```ignore
/// fetch_quantities!(q, cl, v);
/// dx[0] = -cl / v * x[0];
/// ```
#[macro_export]
macro_rules! fetch_quantities {
    ($q:expr, $($name:ident),*) => {
        let q = &$q;
        let mut idx = 0;
        $(
            #[allow(unused_mut)]
            let mut $name = q[idx];
            idx += 1;
        )*
        let _ = idx;
    };
}

/// Bind covariate values at `t` to local names, propagating a missing covariate with `?`
///
/// ```ignore
/// fetch_cov!(cov, t, wt, crcl);
/// ```
#[macro_export]
macro_rules! fetch_cov {
    ($cov:expr, $t:expr, $($name:ident),*) => {
        $(
            let $name = $cov.value(stringify!($name), $t)?;
        )*
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantities_by_position() {
        let q = Quantities::new().with("ke", 0.2).with("v", 10.0);
        fetch_quantities!(q, ke, v);
        assert_eq!(ke, 0.2);
        assert_eq!(v, 10.0);
    }

    #[test]
    fn covariates_by_name() {
        fn lookup(cov: &Covariates) -> Result<(f64, f64), PharmsimError> {
            fetch_cov!(cov, 5.0, wt, age);
            Ok((wt, age))
        }
        let mut cov = Covariates::new();
        cov.observe("wt", 0.0, 70.0, false).unwrap();
        cov.observe("wt", 10.0, 80.0, false).unwrap();
        assert!(lookup(&cov).is_err());
        cov.observe("age", 0.0, 40.0, true).unwrap();
        assert_eq!(lookup(&cov).unwrap(), (75.0, 40.0));
    }
}
