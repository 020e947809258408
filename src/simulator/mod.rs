pub mod integrator;
pub mod options;
pub mod output;
pub mod population;
pub mod resolver;
pub mod schedule;

pub use integrator::steady_state::SteadyStateTrace;
pub use options::{SimulationOptions, SolverSettings, SteadyStateSettings};
pub use output::{derive, SimulationResult};
pub use population::{
    simulate, subject_seed, CancelToken, FailedSubject, PopulationResult, PopulationSummary,
    Simulator, SubjectOutcome,
};
pub use resolver::{resolve, Resolved};
pub use schedule::{last_effect, merge, normalize, normalize_with, AtomicEvent, EventKind, SteadyStateDose};

pub type T = f64;
pub type V = nalgebra::DVector<T>;
pub type M = nalgebra::DMatrix<T>;
