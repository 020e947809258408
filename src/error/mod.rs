use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::data::covariate::CovariateError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PharmsimError {
    /// A fixed effect, random effect or resolved quantity breached its declared domain
    #[error("Domain violation for '{quantity}' = {value}: {constraint}")]
    DomainViolation {
        quantity: String,
        value: f64,
        constraint: String,
    },
    #[error("Steady state did not converge for the dose at t = {time} after {cycles} cycles")]
    SteadyStateNonConvergence { time: f64, cycles: usize },
    #[error("Integration failed between t = {from} and t = {to}: {reason}")]
    IntegrationFailure { from: f64, to: f64, reason: String },
    #[error("Derived output '{output}' could not be evaluated at t = {time}: {reason}")]
    DerivedEvaluationError {
        time: f64,
        output: String,
        reason: String,
    },
    #[error("Simulation exceeded the time limit of {seconds} s (reached t = {time})")]
    Timeout { seconds: f64, time: f64 },
    #[error("Simulation was cancelled")]
    Cancelled,
    #[error("Missing fixed effect '{0}'")]
    MissingParameter(String),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Covariate error: {0}")]
    Covariate(#[from] CovariateError),
}

/// Coarse classification of [PharmsimError], used by population summaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum ErrorKind {
    DomainViolation,
    SteadyStateNonConvergence,
    IntegrationFailure,
    DerivedEvaluationError,
    Timeout,
    Cancelled,
    InvalidInput,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::DomainViolation => "DomainViolation",
            ErrorKind::SteadyStateNonConvergence => "SteadyStateNonConvergence",
            ErrorKind::IntegrationFailure => "IntegrationFailure",
            ErrorKind::DerivedEvaluationError => "DerivedEvaluationError",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::InvalidInput => "InvalidInput",
        };
        write!(f, "{}", name)
    }
}

impl PharmsimError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PharmsimError::DomainViolation { .. } | PharmsimError::MissingParameter(_) => {
                ErrorKind::DomainViolation
            }
            PharmsimError::SteadyStateNonConvergence { .. } => {
                ErrorKind::SteadyStateNonConvergence
            }
            PharmsimError::IntegrationFailure { .. } => ErrorKind::IntegrationFailure,
            PharmsimError::DerivedEvaluationError { .. } => ErrorKind::DerivedEvaluationError,
            PharmsimError::Timeout { .. } => ErrorKind::Timeout,
            PharmsimError::Cancelled => ErrorKind::Cancelled,
            PharmsimError::InvalidInput(_) | PharmsimError::Covariate(_) => {
                ErrorKind::InvalidInput
            }
        }
    }

    pub(crate) fn domain(quantity: impl Into<String>, value: f64, constraint: impl Into<String>) -> Self {
        PharmsimError::DomainViolation {
            quantity: quantity.into(),
            value,
            constraint: constraint.into(),
        }
    }

    /// Where the failure happened, as a time window or iteration count, if known
    pub fn location(&self) -> Option<String> {
        match self {
            PharmsimError::SteadyStateNonConvergence { time, cycles } => {
                Some(format!("t = {} after {} cycles", time, cycles))
            }
            PharmsimError::IntegrationFailure { from, to, .. } => {
                Some(format!("t in [{}, {}]", from, to))
            }
            PharmsimError::DerivedEvaluationError { time, .. }
            | PharmsimError::Timeout { time, .. } => Some(format!("t = {}", time)),
            _ => None,
        }
    }
}

/// A [PharmsimError] tagged with the subject it belongs to
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Subject '{subject}': {error}")]
pub struct SubjectError {
    pub subject: String,
    #[source]
    pub error: PharmsimError,
}

impl SubjectError {
    pub fn new(subject: impl Into<String>, error: PharmsimError) -> Self {
        SubjectError {
            subject: subject.into(),
            error,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}
