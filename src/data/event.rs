use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::PharmsimError;

/// How the amount of a [Dose] enters its compartment
///
/// The numeric encoding follows the usual dataset convention: `0` is a bolus, a positive value
/// is a fixed infusion rate, `-1` takes the rate from the model and `-2` takes the duration
/// from the model.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub enum Rate {
    /// Instantaneous input
    Bolus,
    /// Zero-order input at a fixed rate (amount per time unit)
    Fixed(f64),
    /// Zero-order input at the rate given by the model's `rate` quantity for the compartment
    Modeled,
    /// Zero-order input over the duration given by the model's `duration` quantity for the compartment
    ModeledDuration,
}

impl Rate {
    /// Decode a dataset `RATE` value
    pub fn from_code(code: f64) -> Result<Rate, PharmsimError> {
        if code == 0.0 {
            Ok(Rate::Bolus)
        } else if code == -1.0 {
            Ok(Rate::Modeled)
        } else if code == -2.0 {
            Ok(Rate::ModeledDuration)
        } else if code > 0.0 && code.is_finite() {
            Ok(Rate::Fixed(code))
        } else {
            Err(PharmsimError::InvalidInput(format!(
                "rate {} is not a valid rate code",
                code
            )))
        }
    }

    pub fn code(&self) -> f64 {
        match self {
            Rate::Bolus => 0.0,
            Rate::Fixed(rate) => *rate,
            Rate::Modeled => -1.0,
            Rate::ModeledDuration => -2.0,
        }
    }

    pub fn is_bolus(&self) -> bool {
        matches!(self, Rate::Bolus)
    }
}

/// Steady-state handling of a dose
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SsMode {
    /// `ss = 1`: the system is replaced by the periodic steady state before the dose
    Reset,
    /// `ss = 2`: the periodic steady state is added to the current state
    Superpose,
}

impl SsMode {
    /// Decode a dataset `SS` value, `0` meaning no steady state
    pub fn from_code(code: u8) -> Result<Option<SsMode>, PharmsimError> {
        match code {
            0 => Ok(None),
            1 => Ok(Some(SsMode::Reset)),
            2 => Ok(Some(SsMode::Superpose)),
            other => Err(PharmsimError::InvalidInput(format!(
                "ss = {} is not a valid steady-state code",
                other
            ))),
        }
    }
}

/// Event evidence of a regimen record
///
/// Observation records are not part of a regimen: they are the [Sample](crate::data::Sample)s
/// of a subject. A dose-and-observation record is a [Dose] together with a sample at the same
/// time, whose outputs are recorded after the dose.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Evid {
    /// Administration of a dose
    #[default]
    Dose,
    /// The system returns to its initial condition and running infusions stop
    Reset,
    /// A reset immediately followed by the dose
    ResetDose,
}

/// A single record of a [DosageRegimen](crate::data::DosageRegimen)
///
/// A record may stand for many administrations: `addl` additional doses are given every `ii`
/// time units after `time`. Compartments are zero-indexed.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Dose {
    time: f64,
    amount: f64,
    cmt: usize,
    rate: Rate,
    addl: usize,
    ii: f64,
    ss: Option<SsMode>,
    evid: Evid,
}

impl Dose {
    /// Create a new dose record
    ///
    /// # Arguments
    ///
    /// * `time` - Nominal administration time
    /// * `amount` - Amount of drug administered
    /// * `cmt` - The compartment number (zero-indexed) receiving the dose
    /// * `rate` - How the amount is delivered
    pub fn new(time: f64, amount: f64, cmt: usize, rate: Rate) -> Self {
        Dose {
            time,
            amount,
            cmt,
            rate,
            addl: 0,
            ii: 0.0,
            ss: None,
            evid: Evid::Dose,
        }
    }

    /// Instantaneous dose
    pub fn bolus(time: f64, amount: f64, cmt: usize) -> Self {
        Dose::new(time, amount, cmt, Rate::Bolus)
    }

    /// Zero-order infusion of `amount` over `duration`, stored as the equivalent fixed rate
    pub fn infusion(time: f64, amount: f64, cmt: usize, duration: f64) -> Self {
        Dose::new(time, amount, cmt, Rate::Fixed(amount / duration))
    }

    /// A reset record for the whole system
    pub fn reset(time: f64) -> Self {
        Dose {
            evid: Evid::Reset,
            ..Dose::bolus(time, 0.0, 0)
        }
    }

    /// Give `addl` additional doses every `ii`
    pub fn with_addl(mut self, addl: usize, ii: f64) -> Self {
        self.addl = addl;
        self.ii = ii;
        self
    }

    /// Mark the dose as given at steady state with interdose interval `ii`
    pub fn with_ss(mut self, mode: SsMode, ii: f64) -> Self {
        self.ss = Some(mode);
        self.ii = ii;
        self
    }

    pub fn with_evid(mut self, evid: Evid) -> Self {
        self.evid = evid;
        self
    }

    pub fn time(&self) -> f64 {
        self.time
    }
    pub fn amount(&self) -> f64 {
        self.amount
    }
    pub fn cmt(&self) -> usize {
        self.cmt
    }
    pub fn rate(&self) -> Rate {
        self.rate
    }
    pub fn addl(&self) -> usize {
        self.addl
    }
    pub fn ii(&self) -> f64 {
        self.ii
    }
    pub fn ss(&self) -> Option<SsMode> {
        self.ss
    }
    pub fn evid(&self) -> Evid {
        self.evid
    }

    pub(crate) fn shift(&mut self, dt: f64) {
        self.time += dt;
    }

    /// True if this record administers drug (as opposed to a plain reset)
    pub fn is_administration(&self) -> bool {
        !matches!(self.evid, Evid::Reset)
    }

    /// Check the record on its own, independent of any model
    pub fn validate(&self) -> Result<(), PharmsimError> {
        let invalid = |msg: String| Err(PharmsimError::InvalidInput(msg));
        if !self.time.is_finite() {
            return invalid(format!("dose time {} is not finite", self.time));
        }
        if self.evid == Evid::Reset {
            return Ok(());
        }
        if !self.amount.is_finite() || self.amount < 0.0 {
            return invalid(format!(
                "dose at t = {} has invalid amount {}",
                self.time, self.amount
            ));
        }
        if let Rate::Fixed(rate) = self.rate {
            if !(rate > 0.0 && rate.is_finite()) {
                return invalid(format!(
                    "infusion at t = {} has invalid rate {}",
                    self.time, rate
                ));
            }
        }
        if (self.addl > 0 || self.ss.is_some()) && !(self.ii > 0.0 && self.ii.is_finite()) {
            return invalid(format!(
                "dose at t = {} repeats but has interdose interval {}",
                self.time, self.ii
            ));
        }
        Ok(())
    }
}

impl fmt::Display for Dose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.evid {
            Evid::Reset => return write!(f, "Reset at t = {:.2}", self.time),
            Evid::ResetDose => write!(f, "Reset, then ")?,
            Evid::Dose => {}
        }
        match self.rate {
            Rate::Bolus => write!(f, "Bolus")?,
            Rate::Fixed(rate) => write!(f, "Infusion at rate {:.4}", rate)?,
            Rate::Modeled => write!(f, "Infusion at modeled rate")?,
            Rate::ModeledDuration => write!(f, "Infusion over modeled duration")?,
        }
        write!(
            f,
            ": t = {:.2}, amount = {:.4}, cmt = {}",
            self.time, self.amount, self.cmt
        )?;
        if self.addl > 0 {
            write!(f, ", addl = {}, ii = {}", self.addl, self.ii)?;
        }
        match self.ss {
            Some(SsMode::Reset) => write!(f, ", ss = 1"),
            Some(SsMode::Superpose) => write!(f, ", ss = 2"),
            None => Ok(()),
        }
    }
}
