pub mod builder;
pub mod covariate;
pub mod event;
pub mod regimen;
pub mod structs;

pub use covariate::*;
pub use event::*;
pub use regimen::*;
pub use structs::*;
