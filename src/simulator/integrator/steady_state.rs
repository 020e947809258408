use serde::Serialize;

use crate::data::SsMode;
use crate::error::PharmsimError;
use crate::model::Model;
use crate::simulator::integrator::{initial_state, negligible, Integrator};
use crate::simulator::options::SteadyStateSettings;
use crate::simulator::schedule::SteadyStateDose;
use crate::simulator::{T, V};

/// Convergence history of one steady-state event
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SteadyStateTrace {
    pub time: T,
    pub cmt: usize,
    pub mode: SsMode,
    /// Number of dosing intervals simulated
    pub cycles: usize,
    /// State at the start of every interval, followed by the converged state
    pub troughs: Vec<Vec<f64>>,
}

pub(crate) struct SteadyStateSolution {
    pub state: V,
    pub trace: SteadyStateTrace,
}

/// Inputs of a single dosing interval `[start, start + ii)` at steady state
///
/// Infusions from earlier doses that overlap the interval are folded in, so a dose whose
/// infusion outlasts the interval contributes to several parts of it.
#[derive(Debug, Clone, PartialEq)]
struct Cycle {
    start: T,
    end: T,
    boluses: Vec<(T, usize, f64)>,
    infusions: Vec<(T, T, usize, f64)>,
}

impl Cycle {
    fn new(dose: &SteadyStateDose, start: T) -> Self {
        let ii = dose.ii;
        let end = start + ii;
        let mut boluses = Vec::new();
        let mut infusions = Vec::new();
        let entry = start + dose.lag;
        if dose.is_bolus() || negligible(entry, entry + dose.duration) {
            let mut phase = dose.lag.rem_euclid(ii);
            if phase >= ii {
                phase = 0.0;
            }
            boluses.push((start + phase, dose.cmt, dose.amount));
        } else {
            let rate = dose.amount / dose.duration;
            let first = -(((dose.lag + dose.duration) / ii).ceil() as i64) - 1;
            for k in first..=0 {
                let entry = start + k as f64 * ii + dose.lag;
                let from = entry.max(start);
                let to = (entry + dose.duration).min(end);
                if to > from {
                    infusions.push((from, to, dose.cmt, rate));
                }
            }
        }
        Cycle {
            start,
            end,
            boluses,
            infusions,
        }
    }

    fn cuts(&self) -> Vec<T> {
        let mut cuts = vec![self.start, self.end];
        cuts.extend(self.boluses.iter().map(|b| b.0));
        for &(from, to, _, _) in &self.infusions {
            cuts.push(from);
            cuts.push(to);
        }
        cuts.sort_by(f64::total_cmp);
        cuts.dedup();
        cuts
    }

    fn run<Md: Model + 'static>(
        &self,
        integrator: &Integrator<'_, Md>,
        mut x: V,
    ) -> Result<V, PharmsimError> {
        let nstates = integrator.nstates();
        for window in self.cuts().windows(2) {
            let (from, to) = (window[0], window[1]);
            for &(_, cmt, amount) in self.boluses.iter().filter(|b| b.0 == from) {
                x[cmt] += amount;
            }
            let mut rates = V::zeros(nstates);
            for &(_, _, cmt, rate) in self
                .infusions
                .iter()
                .filter(|i| i.0 <= from && from < i.1)
            {
                rates[cmt] += rate;
            }
            integrator.context().set_rates(&rates);
            x = integrator.advance(x, from, to)?;
        }
        Ok(x)
    }
}

fn converged(previous: &V, current: &V, settings: &SteadyStateSettings) -> bool {
    previous.iter().zip(current.iter()).all(|(a, b)| {
        (a - b).abs() <= settings.rtol * a.abs().max(b.abs()) + settings.atol
    })
}

/// Periodic state just before the dose at `t`, from the implied infinite history of doses
///
/// Dosing intervals are simulated until the state at the start of consecutive intervals
/// agrees. In [SsMode::Reset] the history starts from the model's initial condition, in
/// [SsMode::Superpose] from zero, so the result can be added to the current state. The
/// history only sees the quantities resolved at `t`.
pub(crate) fn solve<Md: Model + 'static>(
    integrator: &Integrator<'_, Md>,
    dose: &SteadyStateDose,
    t: T,
    settings: &SteadyStateSettings,
) -> Result<SteadyStateSolution, PharmsimError> {
    integrator.context().freeze(Some(t));
    let solution = iterate(integrator, dose, t, settings);
    integrator.context().freeze(None);
    solution
}

fn iterate<Md: Model + 'static>(
    integrator: &Integrator<'_, Md>,
    dose: &SteadyStateDose,
    t: T,
    settings: &SteadyStateSettings,
) -> Result<SteadyStateSolution, PharmsimError> {
    let cycle = Cycle::new(dose, t);
    let mut x = match dose.mode {
        SsMode::Reset => initial_state(integrator, t)?,
        SsMode::Superpose => V::zeros(integrator.nstates()),
    };
    let mut troughs = Vec::new();
    for cycles in 1..=settings.max_cycles {
        troughs.push(x.iter().cloned().collect());
        let next = cycle.run(integrator, x.clone())?;
        if converged(&x, &next, settings) {
            tracing::debug!(time = t, cmt = dose.cmt, cycles, "steady state converged");
            troughs.push(next.iter().cloned().collect());
            return Ok(SteadyStateSolution {
                state: next,
                trace: SteadyStateTrace {
                    time: t,
                    cmt: dose.cmt,
                    mode: dose.mode,
                    cycles,
                    troughs,
                },
            });
        }
        x = next;
    }
    tracing::warn!(
        time = t,
        cycles = settings.max_cycles,
        "steady state did not converge"
    );
    Err(PharmsimError::SteadyStateNonConvergence {
        time: t,
        cycles: settings.max_cycles,
    })
}
