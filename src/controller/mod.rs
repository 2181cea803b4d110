//! Continuous optimization of a deployed program.
//!
//! - [`history`] -- bounded quality history and trend detection.
//! - [`policy`] -- trigger rules and adaptive ascent budgets.
//! - [`actor`] -- the background controller and its [`ControllerHandle`].

pub mod actor;
pub mod history;
pub mod policy;

pub use actor::{
    start, ControllerHandle, ControllerState, ControllerStatus, OptimizationResources,
};
pub use history::{QualityEntry, QualityHistory, QualitySource, QualityTrend};
pub use policy::{adapt_ascent_config, optimization_due, TriggerReason};
