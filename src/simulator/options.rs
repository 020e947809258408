use serde::{Deserialize, Serialize};

use crate::error::PharmsimError;

/// Settings of the adaptive integrator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverSettings {
    pub rtol: f64,
    pub atol: f64,
    /// Initial step size of every segment
    pub h0: f64,
    /// Maximum number of internal steps between two breakpoints
    pub max_steps: usize,
}

impl Default for SolverSettings {
    fn default() -> Self {
        SolverSettings {
            rtol: 1e-8,
            atol: 1e-10,
            h0: 1e-4,
            max_steps: 100_000,
        }
    }
}

/// Convergence settings of steady-state dosing
///
/// Cycle troughs `a` and `b` of a compartment agree when `|a - b| <= rtol * max(|a|, |b|) + atol`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SteadyStateSettings {
    pub rtol: f64,
    pub atol: f64,
    pub max_cycles: usize,
}

impl Default for SteadyStateSettings {
    fn default() -> Self {
        SteadyStateSettings {
            rtol: 1e-6,
            atol: 1e-9,
            max_cycles: 1000,
        }
    }
}

/// Options for a simulation run
///
/// ```ignore
/// let options = SimulationOptions::new()
///     .with_seed(1234)
///     .with_workers(4)
///     .with_states();
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationOptions {
    pub solver: SolverSettings,
    pub steady_state: SteadyStateSettings,
    /// Keep the raw state at every output time
    pub save_states: bool,
    /// Population seed, from which every subject's random stream is derived
    pub seed: u64,
    /// Number of worker threads, `None` for the global rayon pool
    pub workers: Option<usize>,
    /// Wall-clock limit of a single subject, in seconds
    pub subject_timeout: Option<f64>,
    pub show_progress: bool,
    /// Spacing of the default output grid
    pub default_grid_step: f64,
    /// How far the default output grid extends past the last event effect
    pub default_horizon: f64,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        SimulationOptions {
            solver: SolverSettings::default(),
            steady_state: SteadyStateSettings::default(),
            save_states: false,
            seed: 42,
            workers: None,
            subject_timeout: None,
            show_progress: false,
            default_grid_step: 1.0,
            default_horizon: 24.0,
        }
    }
}

impl SimulationOptions {
    pub fn new() -> Self {
        SimulationOptions::default()
    }

    pub fn with_tolerances(mut self, rtol: f64, atol: f64) -> Self {
        self.solver.rtol = rtol;
        self.solver.atol = atol;
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.solver.max_steps = max_steps;
        self
    }

    pub fn with_steady_state(mut self, settings: SteadyStateSettings) -> Self {
        self.steady_state = settings;
        self
    }

    pub fn with_states(mut self) -> Self {
        self.save_states = true;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.subject_timeout = Some(seconds);
        self
    }

    pub fn with_progress(mut self) -> Self {
        self.show_progress = true;
        self
    }

    pub fn with_default_grid(mut self, step: f64, horizon: f64) -> Self {
        self.default_grid_step = step;
        self.default_horizon = horizon;
        self
    }

    /// Parse options from JSON, filling absent fields with their defaults
    pub fn from_json(json: &str) -> Result<Self, PharmsimError> {
        let options: SimulationOptions = serde_json::from_str(json)
            .map_err(|e| PharmsimError::InvalidInput(format!("invalid options: {}", e)))?;
        options.validate()?;
        Ok(options)
    }

    pub fn to_json(&self) -> Result<String, PharmsimError> {
        serde_json::to_string_pretty(self).map_err(|e| PharmsimError::InvalidInput(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), PharmsimError> {
        let positive = |name: &str, v: f64| {
            if v > 0.0 && v.is_finite() {
                Ok(())
            } else {
                Err(PharmsimError::InvalidInput(format!(
                    "{} must be positive, got {}",
                    name, v
                )))
            }
        };
        positive("solver.rtol", self.solver.rtol)?;
        positive("solver.atol", self.solver.atol)?;
        positive("solver.h0", self.solver.h0)?;
        positive("steady_state.rtol", self.steady_state.rtol)?;
        positive("default_grid_step", self.default_grid_step)?;
        if !(self.steady_state.atol >= 0.0) || !(self.default_horizon >= 0.0) {
            return Err(PharmsimError::InvalidInput(
                "steady_state.atol and default_horizon must be non-negative".into(),
            ));
        }
        if self.solver.max_steps == 0 || self.steady_state.max_cycles == 0 {
            return Err(PharmsimError::InvalidInput(
                "max_steps and max_cycles must be at least one".into(),
            ));
        }
        if self.workers == Some(0) {
            return Err(PharmsimError::InvalidInput("workers must be at least one".into()));
        }
        if let Some(timeout) = self.subject_timeout {
            positive("subject_timeout", timeout)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_uses_defaults() {
        let options = SimulationOptions::from_json(
            r#"{ "seed": 7, "workers": 2, "solver": { "rtol": 1e-6 } }"#,
        )
        .unwrap();
        assert_eq!(options.seed, 7);
        assert_eq!(options.workers, Some(2));
        assert_eq!(options.solver.rtol, 1e-6);
        assert_eq!(options.solver.atol, SolverSettings::default().atol);
        assert_eq!(options.steady_state, SteadyStateSettings::default());
    }

    #[test]
    fn json_round_trip() {
        let options = SimulationOptions::new().with_seed(3).with_timeout(5.0).with_states();
        let parsed = SimulationOptions::from_json(&options.to_json().unwrap()).unwrap();
        assert_eq!(parsed, options);
    }

    #[test]
    fn invalid_options() {
        assert!(SimulationOptions::from_json(r#"{ "workers": 0 }"#).is_err());
        assert!(SimulationOptions::from_json(r#"{ "solver": { "rtol": -1.0 } }"#).is_err());
        assert!(SimulationOptions::from_json("not json").is_err());
    }
}
