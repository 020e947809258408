use crate::data::*;
use crate::error::PharmsimError;

pub trait SubjectBuilderExt {
    fn builder(id: impl Into<String>) -> SubjectBuilder;
}

impl SubjectBuilderExt for Subject {
    fn builder(id: impl Into<String>) -> SubjectBuilder {
        SubjectBuilder {
            id: id.into(),
            doses: Vec::new(),
            covariates: Vec::new(),
            samples: Vec::new(),
        }
    }
}

/// Incremental construction of a [Subject]
///
/// ```ignore
/// let subject = Subject::builder("1")
///     .bolus(0.0, 100.0, 0)
///     .repeat(3, 12.0)
///     .covariate("wt", 0.0, 70.0)
///     .missing_observation(6.0, "cp")
///     .build()?;
/// ```
pub struct SubjectBuilder {
    id: String,
    doses: Vec<Dose>,
    covariates: Vec<(String, f64, f64, bool)>,
    samples: Vec<Sample>,
}

impl SubjectBuilder {
    pub fn dose(mut self, dose: Dose) -> Self {
        self.doses.push(dose);
        self
    }

    pub fn bolus(self, time: f64, amount: f64, cmt: usize) -> Self {
        self.dose(Dose::bolus(time, amount, cmt))
    }

    pub fn infusion(self, time: f64, amount: f64, cmt: usize, duration: f64) -> Self {
        self.dose(Dose::infusion(time, amount, cmt, duration))
    }

    /// Reset the system at `time`
    pub fn reset(self, time: f64) -> Self {
        self.dose(Dose::reset(time))
    }

    /// Repeat the last dose `addl` more times every `ii`
    pub fn repeat(mut self, addl: usize, ii: f64) -> Self {
        if let Some(last) = self.doses.pop() {
            self.doses.push(last.with_addl(addl, ii));
        }
        self
    }

    /// Give the last dose at steady state with interval `ii`
    pub fn steady_state(mut self, mode: SsMode, ii: f64) -> Self {
        if let Some(last) = self.doses.pop() {
            self.doses.push(last.with_ss(mode, ii));
        }
        self
    }

    /// Observation of a linearly interpolated covariate
    pub fn covariate(mut self, name: &str, time: f64, value: f64) -> Self {
        self.covariates
            .push((name.to_string(), time, value, false));
        self
    }

    /// Observation of a carry-forward covariate
    pub fn fixed_covariate(mut self, name: &str, time: f64, value: f64) -> Self {
        self.covariates.push((name.to_string(), time, value, true));
        self
    }

    pub fn observation(mut self, time: f64, analyte: &str, value: f64) -> Self {
        self.samples.push(Sample::new(time, analyte, Some(value)));
        self
    }

    /// A sample time without a measured value
    pub fn missing_observation(mut self, time: f64, analyte: &str) -> Self {
        self.samples.push(Sample::new(time, analyte, None));
        self
    }

    pub fn build(self) -> Result<Subject, PharmsimError> {
        let mut covariates = Covariates::new();
        for (name, time, value, fixed) in self.covariates {
            covariates.observe(name, time, value, fixed)?;
        }
        let regimen = DosageRegimen::from_doses(self.doses);
        regimen.validate()?;
        Ok(Subject::new(self.id, regimen, covariates).with_samples(self.samples))
    }
}
