use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rayon::prelude::*;
use serde::Serialize;

use crate::data::{Population, Subject};
use crate::error::{ErrorKind, PharmsimError, SubjectError};
use crate::model::{FixedEffects, Model, RandomEffects};
use crate::simulator::integrator::{self, Integrator, RhsContext};
use crate::simulator::options::SimulationOptions;
use crate::simulator::output::SimulationResult;
use crate::simulator::resolver::{resolve, QuantitySource};
use crate::simulator::schedule::{last_effect, normalize_with};
use crate::simulator::T;

/// Cooperative cancellation of a population run
///
/// Subjects that have not started when the token is cancelled are reported as
/// [PharmsimError::Cancelled]; subjects already running finish normally.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Seed of the random stream of the subject at `index` (splitmix64)
pub fn subject_seed(seed: u64, index: usize) -> u64 {
    let mut z = seed.wrapping_add((index as u64).wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Runs a [Model] over subjects
///
/// ```ignore
/// let simulator = Simulator::new(model, fixed)?
///     .with_options(SimulationOptions::new().with_seed(7));
/// let result = simulator.simulate(&population, None, Some(&times))?;
/// println!("{}", result.summary());
/// ```
pub struct Simulator<Md: Model + 'static> {
    model: Arc<Md>,
    fixed: Arc<FixedEffects>,
    options: SimulationOptions,
    cancel: CancelToken,
}

impl<Md: Model + 'static> Simulator<Md> {
    /// Create a simulator, checking the fixed effects against the model's domain
    pub fn new(model: Md, fixed: FixedEffects) -> Result<Self, PharmsimError> {
        model.parameter_domain().validate(&fixed)?;
        Ok(Simulator {
            model: Arc::new(model),
            fixed: Arc::new(fixed),
            options: SimulationOptions::default(),
            cancel: CancelToken::new(),
        })
    }

    pub fn with_options(mut self, options: SimulationOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &SimulationOptions {
        &self.options
    }

    pub fn model(&self) -> &Md {
        &self.model
    }

    pub fn fixed_effects(&self) -> &FixedEffects {
        &self.fixed
    }

    /// A handle that cancels runs of this simulator
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Simulate a single subject
    ///
    /// # Arguments
    ///
    /// * `subject` - The subject
    /// * `random` - Random effects, or `None` to draw them from `rng`
    /// * `output_times` - Requested output times; see [Simulator::output_times] when `None`
    /// * `rng` - Random source used for sampling
    pub fn simulate_subject<R: Rng + ?Sized>(
        &self,
        subject: &Subject,
        random: Option<&RandomEffects>,
        output_times: Option<&[T]>,
        rng: &mut R,
    ) -> Result<SimulationResult, PharmsimError> {
        self.options.validate()?;
        let started = Instant::now();
        let model = self.model.as_ref();
        let nstates = model.nstates();

        let reference = reference_time(subject, output_times);
        let resolved = resolve(
            model,
            &self.fixed,
            random,
            subject.covariates(),
            reference,
            rng,
        )?;
        let source = QuantitySource::new(
            self.model.clone(),
            self.fixed.clone(),
            resolved.random_effects.clone(),
            subject.covariates(),
            resolved.quantities.clone(),
        );
        let events = normalize_with(subject.regimen(), nstates, |t| source.at(t))?;
        let times = self.output_times(subject, last_effect(&events), output_times)?;

        let ctx = Rc::new(RhsContext::new(
            source,
            nstates,
            resolved.quantities.values().to_vec(),
        ));
        let integrator = Integrator::new(
            ctx,
            &self.options.solver,
            started,
            self.options.subject_timeout,
        );
        let trajectory = integrator::run(
            &integrator,
            &events,
            &times,
            self.options.save_states,
            &self.options.steady_state,
        )?;
        tracing::debug!(
            subject = subject.id(),
            outputs = times.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "subject simulated"
        );

        Ok(SimulationResult {
            id: subject.id().to_string(),
            times,
            output_names: model.output_names().to_vec(),
            outputs: trajectory.outputs,
            states: trajectory.states,
            quantities: resolved.quantities,
            random_effects: resolved.random_effects,
            steady_state: trajectory.steady_state,
            end_time: trajectory.end_time,
        })
    }

    /// Output times of a subject
    ///
    /// Requested times are used as given, in increasing order. Without requested times the
    /// subject's sample times are used, and without samples a regular grid with spacing
    /// `default_grid_step` from the start up to `default_horizon` past the last event effect.
    pub fn output_times(
        &self,
        subject: &Subject,
        last_effect: Option<T>,
        requested: Option<&[T]>,
    ) -> Result<Vec<T>, PharmsimError> {
        let mut times = match requested {
            Some(times) => times.to_vec(),
            None if !subject.samples().is_empty() => subject.sample_times(),
            None => {
                let start = subject
                    .regimen()
                    .iter()
                    .map(|d| d.time())
                    .fold(0.0, f64::min);
                let stop = last_effect.unwrap_or(start).max(start) + self.options.default_horizon;
                let step = self.options.default_grid_step;
                let n = ((stop - start) / step + 1e-9).floor() as usize;
                (0..=n).map(|i| start + i as f64 * step).collect()
            }
        };
        if let Some(t) = times.iter().find(|t| !t.is_finite()) {
            return Err(PharmsimError::InvalidInput(format!(
                "output time {} is not finite",
                t
            )));
        }
        times.sort_by(f64::total_cmp);
        Ok(times)
    }

    fn simulate_indexed(
        &self,
        index: usize,
        subject: &Subject,
        random: Option<&RandomEffects>,
        output_times: Option<&[T]>,
    ) -> SubjectOutcome {
        let result = if self.cancel.is_cancelled() {
            Err(PharmsimError::Cancelled)
        } else {
            let mut rng = StdRng::seed_from_u64(subject_seed(self.options.seed, index));
            self.simulate_subject(subject, random, output_times, &mut rng)
        };
        SubjectOutcome {
            id: subject.id().to_string(),
            result: result.map_err(|error| {
                tracing::warn!(subject = subject.id(), %error, "subject failed");
                SubjectError::new(subject.id(), error)
            }),
        }
    }

    /// Simulate every subject of `population`, in parallel
    ///
    /// Failures of individual subjects are recorded in the [PopulationResult]; an `Err` is
    /// returned only for invalid options or mismatched `random` input. Subject `i` draws its
    /// random effects from a stream seeded with the population seed and `i`, so results do
    /// not depend on the number of workers.
    pub fn simulate(
        &self,
        population: &Population,
        random: Option<&[RandomEffects]>,
        output_times: Option<&[T]>,
    ) -> Result<PopulationResult, PharmsimError> {
        self.options.validate()?;
        if let Some(random) = random {
            if random.len() != population.len() {
                return Err(PharmsimError::InvalidInput(format!(
                    "{} random-effect sets for {} subjects",
                    random.len(),
                    population.len()
                )));
            }
        }

        let progress = self.options.show_progress.then(|| {
            let bar = ProgressBar::new(population.len() as u64);
            if let Ok(style) =
                ProgressStyle::with_template("{bar:40} {pos}/{len} subjects [{elapsed_precise}, ETA {eta}]")
            {
                bar.set_style(style);
            }
            bar
        });

        let work = || -> Vec<SubjectOutcome> {
            population
                .subjects()
                .par_iter()
                .enumerate()
                .map(|(index, subject)| {
                    let outcome = self.simulate_indexed(
                        index,
                        subject,
                        random.map(|r| &r[index]),
                        output_times,
                    );
                    if let Some(bar) = &progress {
                        bar.inc(1);
                    }
                    outcome
                })
                .collect()
        };

        let outcomes = match self.options.workers {
            Some(workers) => rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .build()
                .map_err(|e| {
                    PharmsimError::InvalidInput(format!("failed to create thread pool: {}", e))
                })?
                .install(work),
            None => work(),
        };
        if let Some(bar) = progress {
            bar.finish_and_clear();
        }

        let result = PopulationResult { outcomes };
        let summary = result.summary();
        tracing::info!(
            subjects = summary.total,
            failed = summary.failed.len(),
            "population simulation finished"
        );
        Ok(result)
    }
}

/// Earliest time of interest of a subject, at which its base quantities are resolved
fn reference_time(subject: &Subject, output_times: Option<&[T]>) -> T {
    let first_dose = subject.regimen().iter().map(|d| d.time());
    let first_output = output_times.unwrap_or_default().iter().cloned();
    first_dose
        .chain(first_output)
        .filter(|t| t.is_finite())
        .fold(0.0, f64::min)
}

/// Simulate a population with a new [Simulator]
pub fn simulate<Md: Model + 'static>(
    model: Md,
    population: &Population,
    fixed: FixedEffects,
    random: Option<&[RandomEffects]>,
    output_times: Option<&[T]>,
    options: SimulationOptions,
) -> Result<PopulationResult, PharmsimError> {
    Simulator::new(model, fixed)?
        .with_options(options)
        .simulate(population, random, output_times)
}

/// Result of one subject of a population run
#[derive(Debug, Clone, PartialEq)]
pub struct SubjectOutcome {
    pub id: String,
    pub result: Result<SimulationResult, SubjectError>,
}

/// Per-subject outcomes of a population run, in population order
#[derive(Debug, Clone, PartialEq)]
pub struct PopulationResult {
    outcomes: Vec<SubjectOutcome>,
}

impl PopulationResult {
    pub fn outcomes(&self) -> &[SubjectOutcome] {
        &self.outcomes
    }

    pub fn into_outcomes(self) -> Vec<SubjectOutcome> {
        self.outcomes
    }

    /// Successful results, in population order
    pub fn results(&self) -> impl Iterator<Item = &SimulationResult> {
        self.outcomes.iter().filter_map(|o| o.result.as_ref().ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &SubjectError> {
        self.outcomes.iter().filter_map(|o| o.result.as_ref().err())
    }

    pub fn get(&self, id: &str) -> Option<&SubjectOutcome> {
        self.outcomes.iter().find(|o| o.id == id)
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn summary(&self) -> PopulationSummary {
        let failed: Vec<FailedSubject> = self
            .failures()
            .map(|e| FailedSubject {
                id: e.subject.clone(),
                kind: e.kind(),
                location: e.error.location(),
                message: e.error.to_string(),
            })
            .collect();
        let mut by_kind = BTreeMap::new();
        for f in &failed {
            *by_kind.entry(f.kind).or_insert(0) += 1;
        }
        PopulationSummary {
            total: self.outcomes.len(),
            succeeded: self.outcomes.len() - failed.len(),
            by_kind,
            failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedSubject {
    pub id: String,
    pub kind: ErrorKind,
    /// Time window or iteration count at which the subject failed
    pub location: Option<String>,
    pub message: String,
}

/// Counts of a population run and one line per failed subject
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PopulationSummary {
    pub total: usize,
    pub succeeded: usize,
    pub by_kind: BTreeMap<ErrorKind, usize>,
    pub failed: Vec<FailedSubject>,
}

impl fmt::Display for PopulationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} of {} subjects simulated, {} failed",
            self.succeeded,
            self.total,
            self.failed.len()
        )?;
        for (kind, count) in &self.by_kind {
            writeln!(f, "  {}: {}", kind, count)?;
        }
        for failed in &self.failed {
            write!(f, "  subject {}: {}", failed.id, failed.kind)?;
            if let Some(location) = &failed.location {
                write!(f, " at {}", location)?;
            }
            writeln!(f, " ({})", failed.message)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_seeds_are_distinct() {
        let seeds: Vec<u64> = (0..100).map(|i| subject_seed(42, i)).collect();
        let mut unique = seeds.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), seeds.len());
        assert_eq!(subject_seed(42, 3), subject_seed(42, 3));
        assert_ne!(subject_seed(42, 3), subject_seed(43, 3));
    }

    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn summary_counts_failures() {
        let ok = SubjectOutcome {
            id: "1".into(),
            result: Err(SubjectError::new("1", PharmsimError::Cancelled)),
        };
        let failed = SubjectOutcome {
            id: "2".into(),
            result: Err(SubjectError::new(
                "2",
                PharmsimError::SteadyStateNonConvergence {
                    time: 0.0,
                    cycles: 5,
                },
            )),
        };
        let result = PopulationResult {
            outcomes: vec![ok, failed],
        };
        let summary = result.summary();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.succeeded, 0);
        assert_eq!(summary.by_kind.get(&ErrorKind::Cancelled), Some(&1));
        assert_eq!(
            summary.failed[1].location.as_deref(),
            Some("t = 0 after 5 cycles")
        );
        assert!(summary.to_string().contains("subject 2: SteadyStateNonConvergence"));
    }
}
