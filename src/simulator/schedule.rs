use std::borrow::Cow;
use std::cmp::Ordering;
use std::fmt;

use serde::Serialize;

use crate::data::{DosageRegimen, Dose, Evid, Rate, SsMode};
use crate::error::PharmsimError;
use crate::model::Quantities;
use crate::simulator::T;

/// Kind of an [AtomicEvent]
///
/// The declaration order is the order of application for events taking effect at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum EventKind {
    Reset,
    SteadyState,
    Bolus,
    Infusion,
}

/// The periodic dose behind a steady-state event
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SteadyStateDose {
    pub mode: SsMode,
    pub ii: T,
    pub cmt: usize,
    /// Amount after bioavailability
    pub amount: f64,
    pub lag: T,
    /// Infusion duration, zero for a bolus
    pub duration: T,
}

impl SteadyStateDose {
    pub fn is_bolus(&self) -> bool {
        self.duration == 0.0
    }
}

/// A single administration, reset or steady-state event at its effective time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AtomicEvent {
    /// Effective time, after lag
    pub time: T,
    pub kind: EventKind,
    pub cmt: usize,
    /// Amount after bioavailability
    pub amount: f64,
    /// Infusion duration, zero for other kinds
    pub duration: T,
    /// Nominal time of this administration, before lag
    pub nominal_time: T,
    /// Time of the regimen record the event was expanded from
    pub record_time: T,
    pub steady_state: Option<SteadyStateDose>,
}

impl AtomicEvent {
    /// Time at which the event stops acting
    pub fn end(&self) -> T {
        self.time + self.duration
    }

    /// Infusion rate, zero for other kinds
    pub fn rate(&self) -> f64 {
        if self.kind == EventKind::Infusion {
            self.amount / self.duration
        } else {
            0.0
        }
    }

    fn marker(kind: EventKind, time: T, cmt: usize, record_time: T) -> Self {
        AtomicEvent {
            time,
            kind,
            cmt,
            amount: 0.0,
            duration: 0.0,
            nominal_time: time,
            record_time,
            steady_state: None,
        }
    }
}

impl fmt::Display for AtomicEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            EventKind::Reset => write!(f, "{:>10.4}  reset", self.time),
            EventKind::SteadyState => write!(f, "{:>10.4}  steady state (cmt {})", self.time, self.cmt),
            EventKind::Bolus => write!(
                f,
                "{:>10.4}  bolus {:.4} into cmt {}",
                self.time, self.amount, self.cmt
            ),
            EventKind::Infusion => write!(
                f,
                "{:>10.4}  infusion {:.4} into cmt {} over {:.4}",
                self.time, self.amount, self.cmt, self.duration
            ),
        }
    }
}

fn canonical_order(a: &AtomicEvent, b: &AtomicEvent) -> Ordering {
    a.time
        .total_cmp(&b.time)
        .then(a.kind.cmp(&b.kind))
        .then(a.record_time.total_cmp(&b.record_time))
}

/// Normalize a regimen with constant quantities
///
/// See [normalize_with].
pub fn normalize(
    regimen: &DosageRegimen,
    quantities: &Quantities,
    nstates: usize,
) -> Result<Vec<AtomicEvent>, PharmsimError> {
    normalize_with(regimen, nstates, |_| Ok(Cow::Borrowed(quantities)))
}

/// Expand a regimen into its canonical sequence of [AtomicEvent]s
///
/// Additional doses are expanded to `time + k * ii`. Lag shifts every administration,
/// bioavailability scales its amount, and modeled rates or durations are taken from the
/// quantities at the nominal dose time. Events are ordered by effective time, then by
/// [EventKind], then by the time of their record; remaining ties keep regimen order.
///
/// A steady-state dose produces a steady-state event at its nominal time, followed by the
/// administrations of the implied earlier doses that are still running at that time.
pub fn normalize_with<'q, F>(
    regimen: &DosageRegimen,
    nstates: usize,
    mut quantities_at: F,
) -> Result<Vec<AtomicEvent>, PharmsimError>
where
    F: FnMut(T) -> Result<Cow<'q, Quantities>, PharmsimError>,
{
    let mut events = Vec::new();
    for dose in regimen {
        dose.validate()?;
        if matches!(dose.evid(), Evid::Reset | Evid::ResetDose) {
            events.push(AtomicEvent::marker(
                EventKind::Reset,
                dose.time(),
                dose.cmt(),
                dose.time(),
            ));
        }
        if !dose.is_administration() {
            continue;
        }
        if dose.cmt() >= nstates {
            return Err(PharmsimError::InvalidInput(format!(
                "dose at t = {} targets compartment {} but the model has {} states",
                dose.time(),
                dose.cmt(),
                nstates
            )));
        }
        for k in 0..=dose.addl() {
            let nominal = dose.time() + k as f64 * dose.ii();
            let q = quantities_at(nominal)?;
            expand(dose, nominal, &q, k == 0, &mut events)?;
        }
    }
    events.sort_by(canonical_order);
    Ok(events)
}

fn expand(
    dose: &Dose,
    nominal: T,
    q: &Quantities,
    first: bool,
    events: &mut Vec<AtomicEvent>,
) -> Result<(), PharmsimError> {
    let cmt = dose.cmt();
    let lag = q.lag(cmt);
    let amount = q.bioavailability(cmt) * dose.amount();
    let missing = |what: &str| {
        PharmsimError::domain(
            format!("{}[{}]", what, cmt),
            f64::NAN,
            format!("required by the dose at t = {}", dose.time()),
        )
    };
    let duration = match dose.rate() {
        Rate::Bolus => 0.0,
        Rate::Fixed(rate) => amount / rate,
        Rate::Modeled => amount / q.rate(cmt).ok_or_else(|| missing("rate"))?,
        Rate::ModeledDuration => q.duration(cmt).ok_or_else(|| missing("duration"))?,
    };
    let kind = if dose.rate().is_bolus() {
        EventKind::Bolus
    } else {
        EventKind::Infusion
    };
    if kind == EventKind::Infusion && !(duration > 0.0) {
        // nothing is delivered
        return Ok(());
    }
    let event = AtomicEvent {
        time: nominal + lag,
        kind,
        cmt,
        amount,
        duration,
        nominal_time: nominal,
        record_time: dose.time(),
        steady_state: None,
    };

    if let (true, Some(mode)) = (first, dose.ss()) {
        let ii = dose.ii();
        events.push(AtomicEvent {
            steady_state: Some(SteadyStateDose {
                mode,
                ii,
                cmt,
                amount,
                lag,
                duration,
            }),
            ..AtomicEvent::marker(EventKind::SteadyState, nominal, cmt, dose.time())
        });
        // implied earlier doses still acting after the steady-state time
        let mut j = 1;
        loop {
            let start = nominal - j as f64 * ii + lag;
            let end = start + duration;
            if start < nominal && end <= nominal {
                break;
            }
            let carried_start = start.max(nominal);
            let carried_duration = end - carried_start;
            events.push(AtomicEvent {
                time: carried_start,
                amount: if kind == EventKind::Infusion {
                    amount * carried_duration / duration
                } else {
                    amount
                },
                duration: carried_duration,
                nominal_time: nominal - j as f64 * ii,
                ..event.clone()
            });
            j += 1;
        }
    }
    events.push(event);
    Ok(())
}

/// Merge two canonical event sequences into one
pub fn merge(a: &[AtomicEvent], b: &[AtomicEvent]) -> Vec<AtomicEvent> {
    let mut merged: Vec<AtomicEvent> = a.iter().chain(b.iter()).cloned().collect();
    merged.sort_by(canonical_order);
    merged
}

/// Latest time at which any event acts
pub fn last_effect(events: &[AtomicEvent]) -> Option<T> {
    events.iter().map(AtomicEvent::end).max_by(f64::total_cmp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn q() -> Quantities {
        Quantities::new()
    }

    #[test]
    fn additional_doses_are_expanded() {
        let regimen = DosageRegimen::from(vec![Dose::bolus(0.0, 100.0, 0).with_addl(3, 12.0)]);
        let events = normalize(&regimen, &q(), 1).unwrap();
        let times: Vec<f64> = events.iter().map(|e| e.time).collect();
        assert_eq!(times, vec![0.0, 12.0, 24.0, 36.0]);
        assert!(events.iter().all(|e| e.record_time == 0.0));
        assert_eq!(last_effect(&events), Some(36.0));
    }

    #[test]
    fn lag_and_bioavailability() {
        let regimen = DosageRegimen::from(vec![
            Dose::bolus(0.0, 100.0, 0),
            Dose::infusion(0.0, 100.0, 0, 2.0),
        ]);
        let q = q().with_lag(0, 0.5).with_bioavailability(0, 0.8);
        let events = normalize(&regimen, &q, 2).unwrap();
        assert_eq!(events[0].kind, EventKind::Bolus);
        assert_relative_eq!(events[0].time, 0.5);
        assert_relative_eq!(events[0].amount, 80.0);
        assert_eq!(events[1].kind, EventKind::Infusion);
        assert_relative_eq!(events[1].time, 0.5);
        // fixed rate 50: 80 units take 1.6 time units
        assert_relative_eq!(events[1].duration, 1.6);
        assert_relative_eq!(events[1].rate(), 50.0);
    }

    #[test]
    fn modeled_rate_and_duration() {
        let regimen = DosageRegimen::from(vec![
            Dose::new(0.0, 100.0, 0, Rate::ModeledDuration),
            Dose::new(1.0, 100.0, 1, Rate::Modeled),
        ]);
        let q = q().with_duration(0, 4.0).with_rate(1, 20.0);
        let events = normalize(&regimen, &q, 2).unwrap();
        assert_relative_eq!(events[0].duration, 4.0);
        assert_relative_eq!(events[0].rate(), 25.0);
        assert_relative_eq!(events[1].duration, 5.0);
    }

    #[test]
    fn missing_modeled_duration_is_a_domain_violation() {
        let regimen = DosageRegimen::from(vec![Dose::new(0.0, 100.0, 0, Rate::ModeledDuration)]);
        assert!(matches!(
            normalize(&regimen, &q(), 1),
            Err(PharmsimError::DomainViolation { .. })
        ));
    }

    #[test]
    fn boluses_precede_infusions_and_resets_come_first() {
        let regimen = DosageRegimen::from(vec![
            Dose::infusion(5.0, 10.0, 0, 1.0),
            Dose::bolus(5.0, 1.0, 0),
            Dose::reset(5.0),
        ]);
        let kinds: Vec<EventKind> = normalize(&regimen, &q(), 1)
            .unwrap()
            .iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![EventKind::Reset, EventKind::Bolus, EventKind::Infusion]
        );
    }

    #[test]
    fn steady_state_carries_long_infusions() {
        // 30 h infusions every 12 h: two earlier doses still run at t = 0
        let regimen = DosageRegimen::from(vec![
            Dose::infusion(0.0, 300.0, 0, 30.0).with_ss(SsMode::Reset, 12.0)
        ]);
        let events = normalize(&regimen, &q(), 1).unwrap();
        assert_eq!(events[0].kind, EventKind::SteadyState);
        let carried: Vec<&AtomicEvent> = events[1..]
            .iter()
            .filter(|e| e.nominal_time < 0.0)
            .collect();
        assert_eq!(carried.len(), 2);
        assert_relative_eq!(carried[0].end(), 18.0);
        assert_relative_eq!(carried[1].end(), 6.0);
        for event in &carried {
            assert_relative_eq!(event.rate(), 10.0);
        }
        assert_eq!(events.len(), 4);
    }

    #[test]
    fn steady_state_bolus_has_no_carried_doses() {
        let regimen =
            DosageRegimen::from(vec![Dose::bolus(0.0, 100.0, 0).with_ss(SsMode::Superpose, 12.0)]);
        let events = normalize(&regimen, &q(), 1).unwrap();
        assert_eq!(events.len(), 2);
        let ss = events[0].steady_state.unwrap();
        assert_eq!(ss.mode, SsMode::Superpose);
        assert!(ss.is_bolus());
    }

    #[test]
    fn compartment_out_of_range() {
        let regimen = DosageRegimen::from(vec![Dose::bolus(0.0, 1.0, 3)]);
        assert!(matches!(
            normalize(&regimen, &q(), 2),
            Err(PharmsimError::InvalidInput(_))
        ));
    }
}
