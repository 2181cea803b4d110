//! Trajectories: executing programs against examples and grouping the results.
//!
//! This module provides:
//! - [`types::Trajectory`], [`types::TrajectoryOutcome`] -- one scored
//!   execution of a program against an example.
//! - [`executor::TrajectoryExecutor`] -- timeout-bounded, bounded-parallel
//!   execution on top of a [`executor::ProgramRunner`].
//! - [`bucket::Bucket`] -- per-example grouping ranked by score gap.

pub mod bucket;
pub mod executor;
pub mod types;

pub use bucket::{bucket_trajectories, Bucket};
pub use executor::{ProgramRunner, TrajectoryExecutor};
pub use types::{mean_score, success_rate, Trajectory, TrajectoryOutcome};
