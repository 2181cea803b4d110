//! Typed failures for every layer of the optimizer.
//!
//! Failures are absorbed as close to their source as possible:
//!
//! - [`ExecutionError`] -- one program call failed. Becomes a zero-score
//!   trajectory or a mutator failure and never leaves the step.
//! - [`MutatorError`] -- one candidate slot produced nothing.
//! - [`AscentError`] -- a whole run produced nothing usable. Surfaced to the
//!   caller, who keeps whatever program it had before.
//! - [`ControllerError`] -- returned by the controller's control surface.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::program::MutatorKind;

/// Why a single program-execution or critique call failed.
///
/// The optimizer treats every kind identically (score 0, no retry); the kind
/// is kept for logging and for callers that want to count failure modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    Timeout,
    RateLimited,
    CircuitOpen,
    NetworkError,
    InvalidResponse,
    ProviderError,
}

impl std::fmt::Display for ExecutionErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::CircuitOpen => "circuit_open",
            Self::NetworkError => "network_error",
            Self::InvalidResponse => "invalid_response",
            Self::ProviderError => "provider_error",
        };
        f.write_str(label)
    }
}

/// A failed call to the program-execution or critique collaborator.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct ExecutionError {
    pub kind: ExecutionErrorKind,
    pub message: String,
}

impl ExecutionError {
    pub fn new(kind: ExecutionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            ExecutionErrorKind::Timeout,
            format!("no response within {}ms", after.as_millis()),
        )
    }
}

/// A mutator could not derive a candidate from the given source and bucket.
#[derive(Debug, Clone, Error)]
pub enum MutatorError {
    #[error("no trajectory in bucket scored above the usefulness floor {floor}")]
    NoUsefulTrajectory { floor: f64 },

    #[error("bucket has no contrast between its best and worst trajectory")]
    NoContrast,

    #[error("program cannot hold any demonstrations (max_demos = 0)")]
    DemoCapacity,

    #[error("critique call failed: {0}")]
    Critique(#[from] ExecutionError),

    #[error("critique returned empty advice")]
    EmptyAdvice,

    #[error("{0} mutator is not configured")]
    Unavailable(MutatorKind),
}

/// Something required to run an optimization is missing or malformed.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConfigError {
    #[error("training set is empty")]
    EmptyTrainset,

    #[error("no metric configured")]
    MissingMetric,

    #[error("rule-append mutator is enabled but no teacher is configured")]
    MissingTeacher,

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// An ascent run produced no usable result.
#[derive(Debug, Clone, Error)]
pub enum AscentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("all {steps} steps degraded; no candidate was ever evaluated")]
    NoProgress { steps: usize },

    #[error("run timed out after {elapsed:?} before completing a single step")]
    TimedOut { elapsed: Duration },
}

/// Errors returned by [`ControllerHandle`](crate::controller::ControllerHandle).
#[derive(Debug, Clone, Error)]
pub enum ControllerError {
    #[error("an optimization run is already in flight")]
    AlreadyOptimizing,

    #[error("controller has stopped")]
    Stopped,

    #[error(transparent)]
    Config(#[from] ConfigError),
}
