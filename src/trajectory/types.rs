//! Trajectory records.
//!
//! A trajectory captures one execution of one program against one training
//! example: what went in, what came out (or why nothing did), and the score
//! the metric assigned. Trajectories only live for the duration of a single
//! optimization step.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ExecutionErrorKind;
use crate::program::Fields;

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// What the program-execution collaborator returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrajectoryOutcome {
    /// The program produced these outputs.
    Success(Fields),
    /// The call failed; the trajectory scores 0.
    Failed {
        /// Failure class reported by the collaborator (or `Timeout`).
        kind: ExecutionErrorKind,
        /// Human-readable failure message.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Trajectory
// ---------------------------------------------------------------------------

/// One scored execution of a program against an example.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trajectory {
    /// Id of the program that was executed.
    pub program_id: String,
    /// Id of the example it ran on; trajectories are bucketed by this.
    pub example_id: String,
    /// The example's inputs, as handed to the program.
    pub inputs: Fields,
    /// Outputs on success, or the failure.
    pub outcome: TrajectoryOutcome,
    /// Metric score in `[0, 1]`; always 0 for failed trajectories.
    pub score: f64,
    /// Wall time of the execution call (including a timeout, if one fired).
    pub duration: Duration,
}

impl Trajectory {
    /// Whether the execution call returned outputs.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, TrajectoryOutcome::Success(_))
    }

    /// The outputs, if the execution succeeded.
    pub fn outputs(&self) -> Option<&Fields> {
        match &self.outcome {
            TrajectoryOutcome::Success(outputs) => Some(outputs),
            TrajectoryOutcome::Failed { .. } => None,
        }
    }

    /// The failure kind, if the execution failed.
    pub fn failure_kind(&self) -> Option<ExecutionErrorKind> {
        match &self.outcome {
            TrajectoryOutcome::Success(_) => None,
            TrajectoryOutcome::Failed { kind, .. } => Some(*kind),
        }
    }
}

/// Mean score across trajectories (0 for an empty slice).
pub fn mean_score(trajectories: &[Trajectory]) -> f64 {
    if trajectories.is_empty() {
        return 0.0;
    }
    trajectories.iter().map(|t| t.score).sum::<f64>() / trajectories.len() as f64
}

/// Fraction of trajectories whose execution succeeded.
pub fn success_rate(trajectories: &[Trajectory]) -> f64 {
    if trajectories.is_empty() {
        return 0.0;
    }
    let successes = trajectories.iter().filter(|t| t.is_success()).count();
    successes as f64 / trajectories.len() as f64
}

#[cfg(test)]
pub(crate) fn scored(program_id: &str, example_id: &str, score: f64) -> Trajectory {
    use serde_json::json;

    Trajectory {
        program_id: program_id.to_string(),
        example_id: example_id.to_string(),
        inputs: Fields::from([("q".to_string(), json!(example_id))]),
        outcome: TrajectoryOutcome::Success(Fields::from([(
            "a".to_string(),
            json!(format!("{program_id}:{example_id}")),
        )])),
        score,
        duration: Duration::from_millis(5),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(example_id: &str) -> Trajectory {
        Trajectory {
            program_id: "p".into(),
            example_id: example_id.into(),
            inputs: Fields::new(),
            outcome: TrajectoryOutcome::Failed {
                kind: ExecutionErrorKind::NetworkError,
                reason: "connection reset".into(),
            },
            score: 0.0,
            duration: Duration::ZERO,
        }
    }

    #[test]
    fn outcome_accessors() {
        let ok = scored("p", "e", 0.7);
        assert!(ok.is_success());
        assert!(ok.outputs().is_some());
        assert_eq!(ok.failure_kind(), None);

        let bad = failed("e");
        assert!(!bad.is_success());
        assert!(bad.outputs().is_none());
        assert_eq!(bad.failure_kind(), Some(ExecutionErrorKind::NetworkError));
    }

    #[test]
    fn aggregate_scores() {
        let trajs = vec![scored("p", "a", 1.0), scored("p", "b", 0.5), failed("c")];
        assert!((mean_score(&trajs) - 0.5).abs() < 1e-9);
        assert!((success_rate(&trajs) - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(mean_score(&[]), 0.0);
        assert_eq!(success_rate(&[]), 0.0);
    }
}
