mod closure;
pub mod steady_state;

pub(crate) use closure::RhsContext;

use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Instant;

use diffsol::{
    ode_solver::method::OdeSolverMethod, NalgebraLU, OdeBuilder, OdeSolverStopReason,
};

use crate::data::SsMode;
use crate::error::PharmsimError;
use crate::model::Model;
use crate::simulator::options::{SolverSettings, SteadyStateSettings};
use crate::simulator::output;
use crate::simulator::schedule::{AtomicEvent, EventKind, SteadyStateDose};
use crate::simulator::{M, T, V};
use closure::PmProblem;
use steady_state::SteadyStateTrace;

/// Segments shorter than this, relative to `max(1, |t|)`, take a single explicit step
const SEGMENT_TOL: f64 = 1e-12;

/// Whether `[from, to]` is too short for the solver
pub(crate) fn negligible(from: T, to: T) -> bool {
    to - from <= SEGMENT_TOL * from.abs().max(to.abs()).max(1.0)
}

/// Something that happens at a breakpoint
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Action {
    Reset,
    SteadyState(SteadyStateDose),
    Bolus { cmt: usize, amount: f64 },
    Close { id: usize },
    Open { id: usize, cmt: usize, rate: f64 },
    /// Record the outputs for output time `index`
    Record(usize),
}

impl Action {
    /// Order of application at a shared time
    fn rank(&self) -> u8 {
        match self {
            Action::Reset => 0,
            Action::SteadyState(_) => 1,
            Action::Bolus { .. } => 2,
            Action::Close { .. } => 3,
            Action::Open { .. } => 4,
            Action::Record(_) => 5,
        }
    }
}

/// A time at which integration must stop, with everything that happens there
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Breakpoint {
    pub time: T,
    pub actions: Vec<Action>,
}

/// Union of event times, infusion ends and output times, in order
///
/// An infusion too short to integrate is given as a bolus of its amount, so it always closes
/// after it opens.
pub(crate) fn breakpoints(events: &[AtomicEvent], output_times: &[T]) -> Vec<Breakpoint> {
    let mut entries: Vec<(T, Action)> = Vec::with_capacity(events.len() * 2 + output_times.len());
    for (id, event) in events.iter().enumerate() {
        match event.kind {
            EventKind::Reset => entries.push((event.time, Action::Reset)),
            EventKind::SteadyState => {
                if let Some(dose) = event.steady_state {
                    entries.push((event.time, Action::SteadyState(dose)));
                }
            }
            EventKind::Infusion if !negligible(event.time, event.end()) => {
                // rate over the representable duration, so the full amount is delivered
                entries.push((
                    event.time,
                    Action::Open {
                        id,
                        cmt: event.cmt,
                        rate: event.amount / (event.end() - event.time),
                    },
                ));
                entries.push((event.end(), Action::Close { id }));
            }
            EventKind::Bolus | EventKind::Infusion => entries.push((
                event.time,
                Action::Bolus {
                    cmt: event.cmt,
                    amount: event.amount,
                },
            )),
        }
    }
    entries.extend(
        output_times
            .iter()
            .enumerate()
            .map(|(index, &t)| (t, Action::Record(index))),
    );
    entries.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.rank().cmp(&b.1.rank())));

    let mut breakpoints: Vec<Breakpoint> = Vec::new();
    for (time, action) in entries {
        match breakpoints.last_mut() {
            Some(last) if last.time == time => last.actions.push(action),
            _ => breakpoints.push(Breakpoint {
                time,
                actions: vec![action],
            }),
        }
    }
    breakpoints
}

/// Add breakpoints without actions at `cuts` that fall strictly inside the run
pub(crate) fn add_cuts(breakpoints: &mut Vec<Breakpoint>, cuts: &[T]) {
    let (first, last) = match (breakpoints.first(), breakpoints.last()) {
        (Some(first), Some(last)) => (first.time.min(0.0), last.time),
        _ => return,
    };
    for &time in cuts {
        if time <= first || time >= last {
            continue;
        }
        let position = breakpoints.partition_point(|b| b.time < time);
        if breakpoints[position].time != time {
            breakpoints.insert(
                position,
                Breakpoint {
                    time,
                    actions: Vec::new(),
                },
            );
        }
    }
}

/// Integrates one subject segment by segment
pub(crate) struct Integrator<'s, Md: Model + 'static> {
    ctx: Rc<RhsContext<Md>>,
    nstates: usize,
    solver: &'s SolverSettings,
    started: Instant,
    timeout: Option<f64>,
}

impl<'s, Md: Model + 'static> Integrator<'s, Md> {
    pub(crate) fn new(
        ctx: Rc<RhsContext<Md>>,
        solver: &'s SolverSettings,
        started: Instant,
        timeout: Option<f64>,
    ) -> Self {
        let nstates = ctx.source().model().nstates();
        Integrator {
            ctx,
            nstates,
            solver,
            started,
            timeout,
        }
    }

    pub(crate) fn context(&self) -> &RhsContext<Md> {
        &self.ctx
    }

    pub(crate) fn nstates(&self) -> usize {
        self.nstates
    }

    fn check_deadline(&self, t: T) -> Result<(), PharmsimError> {
        match self.timeout {
            Some(seconds) if self.started.elapsed().as_secs_f64() > seconds => {
                Err(PharmsimError::Timeout { seconds, time: t })
            }
            _ => Ok(()),
        }
    }

    /// Integrate `x` from `from` to exactly `to` under the current forcing
    pub(crate) fn advance(&self, x: V, from: T, to: T) -> Result<V, PharmsimError> {
        if to <= from {
            return Ok(x);
        }
        if negligible(from, to) {
            return self.euler(x, from, to);
        }
        let failure = |reason: String| PharmsimError::IntegrationFailure { from, to, reason };
        self.ctx
            .set_limit(to - SEGMENT_TOL * to.abs().max(1.0));

        let problem = OdeBuilder::<M>::new()
            .atol(vec![self.solver.atol; self.nstates])
            .rtol(self.solver.rtol)
            .t0(from)
            .h0(self.solver.h0.min(to - from))
            .p(self.ctx.params().to_vec())
            .build_from_eqn(PmProblem::new(self.ctx.clone(), x))
            .map_err(|e| failure(e.to_string()))?;
        let mut solver = problem
            .bdf::<NalgebraLU<f64>>()
            .map_err(|e| failure(e.to_string()))?;
        solver
            .set_stop_time(to)
            .map_err(|e| failure(e.to_string()))?;

        let mut steps = 0usize;
        loop {
            match solver.step() {
                Ok(OdeSolverStopReason::TstopReached) => break,
                Ok(_) => {
                    steps += 1;
                    if let Some(e) = self.ctx.take_error() {
                        return Err(e);
                    }
                    if steps > self.solver.max_steps {
                        return Err(failure(format!(
                            "exceeded {} steps (reached t = {})",
                            self.solver.max_steps,
                            solver.state().t
                        )));
                    }
                    self.check_deadline(solver.state().t)?;
                }
                Err(e) => {
                    return Err(self
                        .ctx
                        .take_error()
                        .unwrap_or_else(|| failure(e.to_string())));
                }
            }
        }
        if let Some(e) = self.ctx.take_error() {
            return Err(e);
        }
        let y = solver.state().y.clone();
        if y.iter().any(|v| !v.is_finite()) {
            return Err(failure("state is no longer finite".to_string()));
        }
        tracing::trace!(from, to, steps, "segment integrated");
        Ok(y)
    }

    /// One explicit step over a segment too short for the solver
    fn euler(&self, x: V, from: T, to: T) -> Result<V, PharmsimError> {
        self.ctx.set_limit(from);
        let mut dx = V::zeros(self.nstates);
        self.ctx.eval(&x, from, &mut dx);
        if let Some(e) = self.ctx.take_error() {
            return Err(e);
        }
        Ok(x + dx * (to - from))
    }
}

/// What the main run produced
pub(crate) struct Trajectory {
    pub outputs: Vec<Vec<f64>>,
    pub states: Option<Vec<Vec<f64>>>,
    pub steady_state: Vec<SteadyStateTrace>,
    pub end_time: T,
}

fn infusion_rates(active: &BTreeMap<usize, (usize, f64)>, nstates: usize) -> V {
    let mut rates = V::zeros(nstates);
    for &(cmt, rate) in active.values() {
        rates[cmt] += rate;
    }
    rates
}

pub(crate) fn initial_state<Md: Model + 'static>(
    integrator: &Integrator<'_, Md>,
    t: T,
) -> Result<V, PharmsimError> {
    let source = integrator.context().source();
    let q = source.at(t)?;
    let mut x = V::zeros(integrator.nstates());
    source.model().init(&q, t, &mut x);
    Ok(x)
}

/// Start time of a run: zero, or the first breakpoint if it comes earlier
pub(crate) fn start_time(breakpoints: &[Breakpoint]) -> T {
    breakpoints.first().map_or(0.0, |b| b.time).min(0.0)
}

/// Integrate across all breakpoints, applying their actions
///
/// Jumps at a breakpoint are applied before its outputs are recorded, so recorded values are
/// post-jump. The run ends at the last breakpoint.
pub(crate) fn run<Md: Model + 'static>(
    integrator: &Integrator<'_, Md>,
    events: &[AtomicEvent],
    output_times: &[T],
    save_states: bool,
    ss_settings: &SteadyStateSettings,
) -> Result<Trajectory, PharmsimError> {
    let nstates = integrator.nstates();
    let source = integrator.context().source();
    let model = source.model();
    let mut breakpoints = breakpoints(events, output_times);
    add_cuts(&mut breakpoints, &source.change_times());
    let t0 = start_time(&breakpoints);

    if source.is_time_varying() {
        for breakpoint in &breakpoints {
            source.at(breakpoint.time)?;
        }
    }

    let mut x = initial_state(integrator, t0)?;
    let mut t = t0;
    let mut active: BTreeMap<usize, (usize, f64)> = BTreeMap::new();
    integrator.context().set_rates(&V::zeros(nstates));

    let mut outputs = vec![Vec::new(); output_times.len()];
    let mut states = save_states.then(|| vec![Vec::new(); output_times.len()]);
    let mut traces = Vec::new();

    for breakpoint in &breakpoints {
        x = integrator.advance(x, t, breakpoint.time)?;
        t = t.max(breakpoint.time);
        for action in &breakpoint.actions {
            match action {
                Action::Reset => {
                    active.clear();
                    x = initial_state(integrator, t)?;
                }
                Action::SteadyState(dose) => {
                    let solution = steady_state::solve(integrator, dose, t, ss_settings)?;
                    match dose.mode {
                        SsMode::Reset => {
                            active.clear();
                            x = solution.state;
                        }
                        SsMode::Superpose => x += &solution.state,
                    }
                    traces.push(solution.trace);
                }
                Action::Bolus { cmt, amount } => x[*cmt] += amount,
                Action::Close { id } => {
                    active.remove(id);
                }
                Action::Open { id, cmt, rate } => {
                    active.insert(*id, (*cmt, *rate));
                }
                Action::Record(index) => {
                    let q = source.at(t)?;
                    outputs[*index] = output::derive(model, &x, &q, t)?;
                    if let Some(states) = states.as_mut() {
                        states[*index] = x.iter().cloned().collect();
                    }
                }
            }
        }
        integrator
            .context()
            .set_rates(&infusion_rates(&active, nstates));
    }

    Ok(Trajectory {
        outputs,
        states,
        steady_state: traces,
        end_time: t,
    })
}
