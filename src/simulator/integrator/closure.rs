use std::cell::{Cell, RefCell};
use std::rc::Rc;

use diffsol::{
    ConstantOp, LinearOp, NonLinearOp, NonLinearOpJacobian, OdeEquations, OdeEquationsRef, Op,
};

use crate::error::PharmsimError;
use crate::model::Model;
use crate::simulator::resolver::QuantitySource;
use crate::simulator::{M, T, V};

/// State shared by the right-hand side of every segment of one subject
///
/// The infusion forcing is set by the integrator between segments. Quantities are taken no
/// later than `limit`, the left limit of the segment end, so a step landing on a covariate
/// change still sees the value of the current segment. While `frozen` is set, every evaluation
/// uses the quantities at that time instead. Errors raised while
/// re-resolving time-varying quantities inside the solver are parked here and picked up after
/// the step.
pub(crate) struct RhsContext<Md: Model> {
    source: QuantitySource<Md>,
    rates: RefCell<V>,
    limit: Cell<T>,
    frozen: Cell<Option<T>>,
    error: RefCell<Option<PharmsimError>>,
    params: Vec<f64>,
}

impl<Md: Model> RhsContext<Md> {
    pub(crate) fn new(source: QuantitySource<Md>, nstates: usize, params: Vec<f64>) -> Self {
        RhsContext {
            source,
            rates: RefCell::new(V::zeros(nstates)),
            limit: Cell::new(T::INFINITY),
            frozen: Cell::new(None),
            error: RefCell::new(None),
            params,
        }
    }

    pub(crate) fn source(&self) -> &QuantitySource<Md> {
        &self.source
    }

    pub(crate) fn params(&self) -> &[f64] {
        &self.params
    }

    pub(crate) fn set_rates(&self, rates: &V) {
        self.rates.borrow_mut().copy_from(rates);
    }

    pub(crate) fn set_limit(&self, t: T) {
        self.limit.set(t);
    }

    /// Evaluate every quantity at `t` until unfrozen with `None`
    pub(crate) fn freeze(&self, t: Option<T>) {
        self.frozen.set(t);
    }

    pub(crate) fn take_error(&self) -> Option<PharmsimError> {
        self.error.borrow_mut().take()
    }

    pub(crate) fn eval(&self, x: &V, t: T, y: &mut V) {
        let at = self.frozen.get().unwrap_or_else(|| t.min(self.limit.get()));
        match self.source.at(at) {
            Ok(q) => self
                .source
                .model()
                .dynamics(x, &q, t, &self.rates.borrow(), y),
            Err(e) => {
                y.fill(0.0);
                self.error.borrow_mut().get_or_insert(e);
            }
        }
    }
}

pub(crate) struct PmRhs<'a, Md: Model> {
    nstates: usize,
    nparams: usize,
    ctx: &'a RhsContext<Md>,
}

impl<Md: Model> Op for PmRhs<'_, Md> {
    type T = T;
    type V = V;
    type M = M;
    fn nstates(&self) -> usize {
        self.nstates
    }
    fn nout(&self) -> usize {
        self.nstates
    }
    fn nparams(&self) -> usize {
        self.nparams
    }
}

impl<Md: Model> NonLinearOp for PmRhs<'_, Md> {
    fn call_inplace(&self, x: &Self::V, t: Self::T, y: &mut Self::V) {
        self.ctx.eval(x, t, y);
    }
}

impl<Md: Model> NonLinearOpJacobian for PmRhs<'_, Md> {
    /// Forward difference of the dynamics along `v`
    fn jac_mul_inplace(&self, x: &Self::V, t: Self::T, v: &Self::V, y: &mut Self::V) {
        let norm = v.norm();
        if norm == 0.0 {
            y.fill(0.0);
            return;
        }
        let eps = f64::EPSILON.sqrt() * (1.0 + x.norm()) / norm;
        let mut f0 = V::zeros(self.nstates);
        self.ctx.eval(x, t, &mut f0);
        let shifted = x + v * eps;
        self.ctx.eval(&shifted, t, y);
        *y -= &f0;
        *y /= eps;
    }
}

pub(crate) struct PmMass {
    nstates: usize,
    nparams: usize,
}

impl Op for PmMass {
    type T = T;
    type V = V;
    type M = M;
    fn nstates(&self) -> usize {
        self.nstates
    }
    fn nout(&self) -> usize {
        self.nstates
    }
    fn nparams(&self) -> usize {
        self.nparams
    }
}

impl LinearOp for PmMass {
    fn gemv_inplace(&self, _x: &Self::V, _t: Self::T, _beta: Self::T, _y: &mut Self::V) {}
}

pub(crate) struct PmInit {
    nstates: usize,
    nparams: usize,
    init: V,
}

impl Op for PmInit {
    type T = T;
    type V = V;
    type M = M;
    fn nstates(&self) -> usize {
        self.nstates
    }
    fn nout(&self) -> usize {
        self.nstates
    }
    fn nparams(&self) -> usize {
        self.nparams
    }
}

impl ConstantOp for PmInit {
    fn call_inplace(&self, _t: Self::T, y: &mut Self::V) {
        y.copy_from(&self.init);
    }
}

pub(crate) struct PmRoot {
    nstates: usize,
    nparams: usize,
}

impl Op for PmRoot {
    type T = T;
    type V = V;
    type M = M;
    fn nstates(&self) -> usize {
        self.nstates
    }
    fn nout(&self) -> usize {
        0
    }
    fn nparams(&self) -> usize {
        self.nparams
    }
}

impl NonLinearOp for PmRoot {
    fn call_inplace(&self, _x: &Self::V, _t: Self::T, _y: &mut Self::V) {}
}

pub(crate) struct PmOut {
    nstates: usize,
    nparams: usize,
}

impl Op for PmOut {
    type T = T;
    type V = V;
    type M = M;
    fn nstates(&self) -> usize {
        self.nstates
    }
    fn nout(&self) -> usize {
        self.nstates
    }
    fn nparams(&self) -> usize {
        self.nparams
    }
}

impl NonLinearOp for PmOut {
    fn call_inplace(&self, x: &Self::V, _t: Self::T, y: &mut Self::V) {
        y.copy_from(x);
    }
}

/// The ODE of one segment between two breakpoints, starting from `init`
pub(crate) struct PmProblem<Md: Model + 'static> {
    ctx: Rc<RhsContext<Md>>,
    nstates: usize,
    init: V,
    p: Vec<f64>,
}

impl<Md: Model + 'static> PmProblem<Md> {
    pub(crate) fn new(ctx: Rc<RhsContext<Md>>, init: V) -> Self {
        let p = ctx.params.clone();
        PmProblem {
            nstates: init.len(),
            ctx,
            init,
            p,
        }
    }
}

impl<Md: Model + 'static> Op for PmProblem<Md> {
    type T = T;
    type V = V;
    type M = M;
    fn nstates(&self) -> usize {
        self.nstates
    }
    fn nout(&self) -> usize {
        self.nstates
    }
    fn nparams(&self) -> usize {
        self.p.len()
    }
}

impl<'b, Md: Model + 'static> OdeEquationsRef<'b> for PmProblem<Md> {
    type Rhs = PmRhs<'b, Md>;
    type Mass = PmMass;
    type Init = PmInit;
    type Root = PmRoot;
    type Out = PmOut;
}

impl<Md: Model + 'static> OdeEquations for PmProblem<Md> {
    fn rhs(&self) -> PmRhs<'_, Md> {
        PmRhs {
            nstates: self.nstates,
            nparams: self.p.len(),
            ctx: &self.ctx,
        }
    }

    fn mass(&self) -> Option<PmMass> {
        None
    }

    fn init(&self) -> PmInit {
        PmInit {
            nstates: self.nstates,
            nparams: self.p.len(),
            init: self.init.clone(),
        }
    }

    fn get_params(&self, p: &mut V) {
        p.copy_from(&V::from_column_slice(&self.p));
    }

    fn root(&self) -> Option<PmRoot> {
        None
    }

    fn out(&self) -> Option<PmOut> {
        None
    }

    fn set_params(&mut self, p: &V) {
        self.p = p.iter().cloned().collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Covariates;
    use crate::model::{FixedEffects, Ode, Quantities, RandomEffects};
    use approx::assert_relative_eq;
    use std::sync::Arc;

    fn context() -> RhsContext<Ode> {
        let model = Ode::new(
            2,
            |_, _, _, _| Ok(Quantities::new().with("k", 0.5)),
            |x: &V, q: &Quantities, _t, rateiv: &V, dx: &mut V| {
                dx[0] = -q[0] * x[0] * x[0] + rateiv[0];
                dx[1] = q[0] * x[0] * x[0];
            },
            |x: &V, _q: &Quantities, _t, y: &mut V| y[0] = x[1],
            &["total"],
        );
        let q = Quantities::new().with("k", 0.5);
        let source = QuantitySource::new(
            Arc::new(model),
            Arc::new(FixedEffects::new()),
            RandomEffects::new(),
            &Covariates::new(),
            q,
        );
        RhsContext::new(source, 2, vec![0.5])
    }

    #[test]
    fn rhs_includes_forcing() {
        let ctx = context();
        ctx.set_rates(&V::from_vec(vec![3.0, 0.0]));
        let rhs = PmRhs {
            nstates: 2,
            nparams: 1,
            ctx: &ctx,
        };
        let mut y = V::zeros(2);
        rhs.call_inplace(&V::from_vec(vec![2.0, 0.0]), 0.0, &mut y);
        assert_relative_eq!(y[0], -2.0 + 3.0);
        assert_relative_eq!(y[1], 2.0);
        assert!(ctx.take_error().is_none());
    }

    #[test]
    fn errors_are_parked() {
        let ctx = context();
        ctx.error
            .borrow_mut()
            .get_or_insert(PharmsimError::Cancelled);
        assert_eq!(ctx.take_error(), Some(PharmsimError::Cancelled));
        assert_eq!(ctx.take_error(), None);
    }

    #[test]
    fn frozen_quantities_ignore_the_evaluation_time() {
        let model = Ode::new(
            1,
            |_, _, cov: &Covariates, t| Ok(Quantities::new().with("k", cov.value("k", t)?)),
            |x: &V, q: &Quantities, _t, _rateiv: &V, dx: &mut V| dx[0] = -q[0] * x[0],
            |x: &V, _q: &Quantities, _t, y: &mut V| y[0] = x[0],
            &["x"],
        );
        let mut cov = Covariates::new();
        cov.observe("k", 0.0, 1.0, true).unwrap();
        cov.observe("k", 10.0, 3.0, true).unwrap();
        let source = QuantitySource::new(
            Arc::new(model),
            Arc::new(FixedEffects::new()),
            RandomEffects::new(),
            &cov,
            Quantities::new().with("k", 1.0),
        );
        let ctx = RhsContext::new(source, 1, Vec::new());
        let x = V::from_vec(vec![1.0]);
        let mut y = V::zeros(1);

        ctx.eval(&x, 20.0, &mut y);
        assert_eq!(y[0], -3.0);
        ctx.freeze(Some(0.0));
        ctx.eval(&x, 20.0, &mut y);
        assert_eq!(y[0], -1.0);
        ctx.freeze(None);
        ctx.eval(&x, 20.0, &mut y);
        assert_eq!(y[0], -3.0);
        assert!(ctx.take_error().is_none());
    }

    #[test]
    fn jacobian_product_matches_analytic() {
        let ctx = context();
        let rhs = PmRhs {
            nstates: 2,
            nparams: 1,
            ctx: &ctx,
        };
        let x = V::from_vec(vec![2.0, 1.0]);
        let v = V::from_vec(vec![1.0, 0.0]);
        let mut y = V::zeros(2);
        rhs.jac_mul_inplace(&x, 0.0, &v, &mut y);
        // d/dx0 of -k x0^2 is -2 k x0
        assert_relative_eq!(y[0], -2.0, epsilon = 1e-5);
        assert_relative_eq!(y[1], 2.0, epsilon = 1e-5);
    }
}
