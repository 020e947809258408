use std::fmt;

use ndarray::Array2;
use serde::Serialize;

use crate::error::PharmsimError;
use crate::model::{Model, Quantities, RandomEffects};
use crate::simulator::integrator::steady_state::SteadyStateTrace;
use crate::simulator::{T, V};

/// Evaluate the derived outputs of `model` at one time
///
/// Every output must be finite; the first one that is not is reported as a
/// [PharmsimError::DerivedEvaluationError].
pub fn derive<Md: Model + ?Sized>(
    model: &Md,
    x: &V,
    q: &Quantities,
    t: T,
) -> Result<Vec<f64>, PharmsimError> {
    let names = model.output_names();
    let mut y = V::zeros(names.len());
    model.derived(x, q, t, &mut y);
    if let Some((name, value)) = names.iter().zip(y.iter()).find(|(_, v)| !v.is_finite()) {
        return Err(PharmsimError::DerivedEvaluationError {
            time: t,
            output: name.clone(),
            reason: format!("evaluated to {}", value),
        });
    }
    Ok(y.iter().cloned().collect())
}

/// The simulated trajectory of one subject
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulationResult {
    pub(crate) id: String,
    pub(crate) times: Vec<T>,
    pub(crate) output_names: Vec<String>,
    /// One row per output time, one column per output
    pub(crate) outputs: Vec<Vec<f64>>,
    pub(crate) states: Option<Vec<Vec<f64>>>,
    pub(crate) quantities: Quantities,
    pub(crate) random_effects: RandomEffects,
    pub(crate) steady_state: Vec<SteadyStateTrace>,
    pub(crate) end_time: T,
}

impl SimulationResult {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Output times, in increasing order
    pub fn times(&self) -> &[T] {
        &self.times
    }

    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }

    /// Values of every output at every time
    pub fn outputs(&self) -> &[Vec<f64>] {
        &self.outputs
    }

    /// Values of the named output over time
    pub fn output(&self, name: &str) -> Option<Vec<f64>> {
        let column = self.output_names.iter().position(|n| n == name)?;
        Some(self.outputs.iter().map(|row| row[column]).collect())
    }

    /// `(time, value)` pairs of the named output
    pub fn series(&self, name: &str) -> Option<Vec<(T, f64)>> {
        self.output(name)
            .map(|values| self.times.iter().cloned().zip(values).collect())
    }

    /// Value of the named output at the first output time equal to `t`
    pub fn value_at(&self, name: &str, t: T) -> Option<f64> {
        let row = self.times.iter().position(|&time| time == t)?;
        let column = self.output_names.iter().position(|n| n == name)?;
        Some(self.outputs[row][column])
    }

    /// Raw states at every output time, if they were kept
    pub fn states(&self) -> Option<&[Vec<f64>]> {
        self.states.as_deref()
    }

    /// Outputs as a `time x output` array
    pub fn outputs_array(&self) -> Array2<f64> {
        to_array(&self.outputs, self.output_names.len())
    }

    /// States as a `time x state` array, if they were kept
    pub fn states_array(&self) -> Option<Array2<f64>> {
        self.states.as_ref().map(|states| {
            let ncols = states.first().map_or(0, Vec::len);
            to_array(states, ncols)
        })
    }

    /// Quantities resolved at the start of the simulation
    pub fn quantities(&self) -> &Quantities {
        &self.quantities
    }

    pub fn random_effects(&self) -> &RandomEffects {
        &self.random_effects
    }

    pub fn steady_state(&self) -> &[SteadyStateTrace] {
        &self.steady_state
    }

    /// Time at which integration stopped
    pub fn end_time(&self) -> T {
        self.end_time
    }

    pub fn to_json(&self) -> Result<String, PharmsimError> {
        serde_json::to_string(self).map_err(|e| PharmsimError::InvalidInput(e.to_string()))
    }
}

fn to_array(rows: &[Vec<f64>], ncols: usize) -> Array2<f64> {
    Array2::from_shape_fn((rows.len(), ncols), |(i, j)| rows[i][j])
}

impl fmt::Display for SimulationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Subject {}", self.id)?;
        write!(f, "{:>10}", "time")?;
        for name in &self.output_names {
            write!(f, " {:>14}", name)?;
        }
        writeln!(f)?;
        for (t, row) in self.times.iter().zip(&self.outputs) {
            write!(f, "{:>10.4}", t)?;
            for value in row {
                write!(f, " {:>14.6e}", value)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Ode;

    fn result() -> SimulationResult {
        SimulationResult {
            id: "1".into(),
            times: vec![0.0, 1.0, 2.0],
            output_names: vec!["cp".into(), "effect".into()],
            outputs: vec![vec![10.0, 0.0], vec![5.0, 1.0], vec![2.5, 1.5]],
            states: Some(vec![vec![100.0], vec![50.0], vec![25.0]]),
            quantities: Quantities::new(),
            random_effects: RandomEffects::new(),
            steady_state: Vec::new(),
            end_time: 2.0,
        }
    }

    #[test]
    fn access_by_name() {
        let result = result();
        assert_eq!(result.output("cp"), Some(vec![10.0, 5.0, 2.5]));
        assert_eq!(
            result.series("effect"),
            Some(vec![(0.0, 0.0), (1.0, 1.0), (2.0, 1.5)])
        );
        assert_eq!(result.value_at("cp", 1.0), Some(5.0));
        assert_eq!(result.output("auc"), None);
    }

    #[test]
    fn arrays() {
        let result = result();
        let outputs = result.outputs_array();
        assert_eq!(outputs.shape(), &[3, 2]);
        assert_eq!(outputs[[2, 1]], 1.5);
        let states = result.states_array().unwrap();
        assert_eq!(states.shape(), &[3, 1]);
        assert!(result.to_json().unwrap().contains("\"cp\""));
    }

    #[test]
    fn non_finite_outputs_are_errors() {
        let model = Ode::new(
            1,
            |_, _, _, _| Ok(Quantities::new().with("v", 0.0)),
            |_x: &V, _q: &Quantities, _t, _r: &V, _dx: &mut V| {},
            |x: &V, q: &Quantities, _t, y: &mut V| {
                y[0] = x[0];
                y[1] = x[0] / q[0];
            },
            &["amount", "cp"],
        );
        let q = Quantities::new().with("v", 0.0);
        let err = derive(&model, &V::from_vec(vec![1.0]), &q, 3.0).unwrap_err();
        assert_eq!(
            err,
            PharmsimError::DerivedEvaluationError {
                time: 3.0,
                output: "cp".into(),
                reason: "evaluated to inf".into(),
            }
        );
        assert_eq!(
            derive(&model, &V::from_vec(vec![0.5]), &Quantities::new().with("v", 2.0), 0.0).unwrap(),
            vec![0.5, 0.25]
        );
    }
}
