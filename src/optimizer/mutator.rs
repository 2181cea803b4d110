//! Candidate mutators.
//!
//! Each mutator derives one new program from a source program and an
//! informative bucket:
//!
//! - **Demonstration-append** turns the bucket's best trajectory into a
//!   few-shot demonstration.
//! - **Rule-append** asks a critic to contrast the bucket's best and worst
//!   trajectories and appends the resulting advice to the instructions.
//!
//! A mutator failure only empties one candidate slot; callers move on to the
//! next slot.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ExecutionError, ExecutionErrorKind, MutatorError};
use crate::program::{Demonstration, Fields, MutatorKind, Program, Signature};
use crate::trajectory::{Bucket, ProgramRunner, Trajectory};

// ---------------------------------------------------------------------------
// Critique contract
// ---------------------------------------------------------------------------

/// The parts of a trajectory a critic gets to see.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectorySummary {
    pub inputs: Fields,
    /// Outputs of a successful execution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Fields>,
    /// Failure reason of a failed execution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub score: f64,
}

impl From<&Trajectory> for TrajectorySummary {
    fn from(t: &Trajectory) -> Self {
        let failure = match &t.outcome {
            crate::trajectory::TrajectoryOutcome::Failed { kind, reason } => {
                Some(format!("{kind}: {reason}"))
            }
            crate::trajectory::TrajectoryOutcome::Success(_) => None,
        };
        Self {
            inputs: t.inputs.clone(),
            outputs: t.outputs().cloned(),
            failure,
            score: t.score,
        }
    }
}

/// One critique call: why did the better trajectory beat the worse one?
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CritiqueRequest {
    /// The source program's current instructions.
    pub instructions: String,
    /// Field layout and demonstration count of the source program.
    pub modules_description: String,
    pub worse_trajectory: TrajectorySummary,
    pub better_trajectory: TrajectorySummary,
    pub worse_score: f64,
    pub better_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Critique {
    pub discussion: String,
    /// A short rule to append to the instructions.
    pub advice: String,
}

/// The teacher side of rule-append.
pub trait Critic: Send + Sync {
    fn critique<'a>(
        &'a self,
        request: &'a CritiqueRequest,
    ) -> BoxFuture<'a, Result<Critique, ExecutionError>>;
}

// ---------------------------------------------------------------------------
// Teacher program critic
// ---------------------------------------------------------------------------

const TEACHER_INSTRUCTIONS: &str = "You are reviewing two attempts by the same program on the same input. \
The better attempt scored higher than the worse one. Compare them, explain in `discussion` what the \
better attempt did differently, then write `advice`: one or two imperative sentences that, added to the \
program's instructions, would make the worse attempt come out like the better one. The advice must be \
general enough to help on other inputs. Do not restate the existing instructions.";

/// A [`Critic`] backed by a teacher program run through a [`ProgramRunner`].
///
/// Every field of the [`CritiqueRequest`] becomes an input field of the
/// teacher; its `advice` output is required, `discussion` is optional.
pub struct ProgramCritic {
    runner: Arc<dyn ProgramRunner>,
    teacher: Program,
}

impl ProgramCritic {
    pub fn new(runner: Arc<dyn ProgramRunner>, teacher: Program) -> Self {
        Self { runner, teacher }
    }

    /// The built-in teacher program.
    pub fn default_teacher() -> Program {
        Program::new(
            Signature::new(
                [
                    "instructions",
                    "modules_description",
                    "worse_trajectory",
                    "better_trajectory",
                    "worse_score",
                    "better_score",
                ],
                ["discussion", "advice"],
            )
            .with_description("critique two trajectories and propose one instruction rule"),
            TEACHER_INSTRUCTIONS,
        )
    }
}

fn request_fields(request: &CritiqueRequest) -> Result<Fields, ExecutionError> {
    match serde_json::to_value(request) {
        Ok(serde_json::Value::Object(map)) => Ok(map.into_iter().collect()),
        Ok(_) => Err(ExecutionError::new(
            ExecutionErrorKind::InvalidResponse,
            "critique request did not serialize to an object",
        )),
        Err(e) => Err(ExecutionError::new(
            ExecutionErrorKind::InvalidResponse,
            format!("failed to encode critique request: {e}"),
        )),
    }
}

fn text_field(outputs: &Fields, name: &str) -> Option<String> {
    outputs.get(name).map(|v| match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

impl Critic for ProgramCritic {
    fn critique<'a>(
        &'a self,
        request: &'a CritiqueRequest,
    ) -> BoxFuture<'a, Result<Critique, ExecutionError>> {
        Box::pin(async move {
            let inputs = request_fields(request)?;
            let outputs = self.runner.execute(&self.teacher, &inputs).await?;
            let advice = text_field(&outputs, "advice").ok_or_else(|| {
                ExecutionError::new(
                    ExecutionErrorKind::InvalidResponse,
                    "teacher output has no `advice` field",
                )
            })?;
            Ok(Critique {
                discussion: text_field(&outputs, "discussion").unwrap_or_default(),
                advice,
            })
        })
    }
}

// ---------------------------------------------------------------------------
// Mutators
// ---------------------------------------------------------------------------

/// Appends the bucket's best trajectory as a demonstration.
#[derive(Debug, Clone)]
pub struct DemoAppend {
    pub max_demos: usize,
    /// A trajectory must score strictly above this to become a demonstration.
    pub floor: f64,
}

impl DemoAppend {
    pub fn mutate(&self, source: &Program, bucket: &Bucket) -> Result<Program, MutatorError> {
        if self.max_demos == 0 {
            return Err(MutatorError::DemoCapacity);
        }

        // Trajectories are sorted best first; failed ones score 0 and carry
        // no outputs, so the first successful one above the floor wins.
        let chosen = bucket
            .trajectories()
            .iter()
            .filter(|t| t.score > self.floor)
            .find_map(|t| t.outputs().map(|outputs| (t, outputs)))
            .ok_or(MutatorError::NoUsefulTrajectory { floor: self.floor })?;

        let (trajectory, outputs) = chosen;
        let demo = Demonstration {
            inputs: trajectory.inputs.clone(),
            outputs: outputs.clone(),
        };
        source
            .with_demonstration(demo, self.max_demos)
            .ok_or(MutatorError::DemoCapacity)
    }
}

/// Appends critic advice to the instructions.
#[derive(Clone)]
pub struct RuleAppend {
    pub critic: Arc<dyn Critic>,
    pub separator: String,
}

impl RuleAppend {
    pub async fn mutate(&self, source: &Program, bucket: &Bucket) -> Result<Program, MutatorError> {
        if bucket.len() < 2 || !bucket.is_informative() {
            return Err(MutatorError::NoContrast);
        }
        let better = bucket.best();
        let worse = bucket.worst();

        let request = CritiqueRequest {
            instructions: source.instructions.clone(),
            modules_description: describe_modules(source),
            worse_trajectory: TrajectorySummary::from(worse),
            better_trajectory: TrajectorySummary::from(better),
            worse_score: worse.score,
            better_score: better.score,
        };

        let critique = self.critic.critique(&request).await?;
        let advice = critique.advice.trim();
        if advice.is_empty() {
            return Err(MutatorError::EmptyAdvice);
        }
        debug!(
            source = %source.id,
            example = %bucket.example_id,
            discussion = %critique.discussion,
            advice,
            "critic proposed rule"
        );
        Ok(source.with_rule(advice, &self.separator))
    }
}

fn describe_modules(program: &Program) -> String {
    format!(
        "predict({}) with {} demonstration(s)",
        program.signature.describe(),
        program.demonstrations.len()
    )
}

/// Both mutators, with rule-append optional when no critic is configured.
#[derive(Clone)]
pub struct Mutators {
    pub demo: DemoAppend,
    pub rule: Option<RuleAppend>,
}

impl Mutators {
    /// Run the mutator of the given kind.
    pub async fn apply(
        &self,
        kind: MutatorKind,
        source: &Program,
        bucket: &Bucket,
    ) -> Result<Program, MutatorError> {
        match kind {
            MutatorKind::DemoAppend => self.demo.mutate(source, bucket),
            MutatorKind::RuleAppend => match &self.rule {
                Some(rule) => rule.mutate(source, bucket).await,
                None => Err(MutatorError::Unavailable(kind)),
            },
        }
    }

    /// Run `preferred`, and on failure try the other mutator once.
    ///
    /// The returned error is the one from the fallback attempt.
    pub async fn apply_with_fallback(
        &self,
        preferred: MutatorKind,
        source: &Program,
        bucket: &Bucket,
    ) -> Result<Program, MutatorError> {
        match self.apply(preferred, source, bucket).await {
            Ok(program) => Ok(program),
            Err(first) => {
                debug!(mutator = %preferred, error = %first, "mutator failed, trying fallback");
                self.apply(preferred.other(), source, bucket).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{seed_program, ScriptedCritic, ScriptedRunner};
    use crate::trajectory::types::scored;
    use crate::trajectory::TrajectoryOutcome;
    use serde_json::json;

    fn bucket(scores: &[f64]) -> Bucket {
        let trajs = scores
            .iter()
            .enumerate()
            .map(|(i, &s)| scored(&format!("p{i}"), "e1", s))
            .collect();
        Bucket::new("e1", trajs).unwrap()
    }

    fn demo(n: usize) -> Demonstration {
        Demonstration {
            inputs: Fields::from([("q".to_string(), json!(n))]),
            outputs: Fields::from([("answer".to_string(), json!(n * 2))]),
        }
    }

    fn rule_append(critic: ScriptedCritic) -> RuleAppend {
        RuleAppend {
            critic: Arc::new(critic),
            separator: "\n".into(),
        }
    }

    #[test]
    fn demo_append_uses_best_trajectory() {
        let mutator = DemoAppend { max_demos: 4, floor: 0.0 };
        let source = seed_program();
        let child = mutator.mutate(&source, &bucket(&[0.2, 0.9, 0.5])).unwrap();

        assert_eq!(child.demonstrations.len(), 1);
        assert_eq!(child.demonstrations[0].outputs["a"], json!("p1:e1"));
        assert_eq!(child.lineage.as_ref().unwrap().parent_id, source.id);
        assert_eq!(child.lineage.as_ref().unwrap().mutator, MutatorKind::DemoAppend);
        assert_ne!(child.id, source.id);
    }

    #[test]
    fn demo_append_at_capacity_evicts_oldest() {
        let mutator = DemoAppend { max_demos: 3, floor: 0.0 };
        let mut source = seed_program();
        source.demonstrations = vec![demo(1), demo(2), demo(3)];

        let child = mutator.mutate(&source, &bucket(&[1.0, 0.0])).unwrap();
        assert_eq!(child.demonstrations.len(), 3);
        assert_eq!(child.demonstrations[0], demo(2));
        assert_eq!(child.demonstrations[1], demo(3));
        assert_eq!(child.demonstrations[2].outputs["a"], json!("p0:e1"));
        // Source untouched.
        assert_eq!(source.demonstrations.len(), 3);
        assert_eq!(source.demonstrations[0], demo(1));
    }

    #[test]
    fn demo_append_respects_floor() {
        let mutator = DemoAppend { max_demos: 4, floor: 0.5 };
        let err = mutator.mutate(&seed_program(), &bucket(&[0.5, 0.1])).unwrap_err();
        assert!(matches!(err, MutatorError::NoUsefulTrajectory { .. }));

        let zero = DemoAppend { max_demos: 4, floor: 0.0 };
        let err = zero.mutate(&seed_program(), &bucket(&[0.0, 0.0])).unwrap_err();
        assert!(matches!(err, MutatorError::NoUsefulTrajectory { .. }));
    }

    #[test]
    fn demo_append_without_capacity_fails() {
        let mutator = DemoAppend { max_demos: 0, floor: 0.0 };
        let err = mutator.mutate(&seed_program(), &bucket(&[1.0])).unwrap_err();
        assert!(matches!(err, MutatorError::DemoCapacity));
    }

    #[tokio::test]
    async fn rule_append_appends_advice() {
        let critic = Arc::new(ScriptedCritic::fixed("  Show your work.  "));
        let mutator = RuleAppend {
            critic: critic.clone(),
            separator: "\n\n".into(),
        };
        let source = seed_program();

        let child = mutator.mutate(&source, &bucket(&[0.9, 0.1])).await.unwrap();
        assert_eq!(child.instructions, "Double q.\n\nShow your work.");
        assert_eq!(child.lineage.unwrap().mutator, MutatorKind::RuleAppend);
        assert_eq!(critic.requests(), 1);
    }

    #[tokio::test]
    async fn rule_append_needs_contrast() {
        let mutator = rule_append(ScriptedCritic::tips());
        for scores in [&[0.7][..], &[0.4, 0.4, 0.4][..]] {
            let err = mutator.mutate(&seed_program(), &bucket(scores)).await.unwrap_err();
            assert!(matches!(err, MutatorError::NoContrast));
        }
    }

    #[tokio::test]
    async fn rule_append_surfaces_critic_failures() {
        let err = rule_append(ScriptedCritic::failing())
            .mutate(&seed_program(), &bucket(&[1.0, 0.0]))
            .await
            .unwrap_err();
        assert!(matches!(err, MutatorError::Critique(_)));

        let err = rule_append(ScriptedCritic::fixed("   "))
            .mutate(&seed_program(), &bucket(&[1.0, 0.0]))
            .await
            .unwrap_err();
        assert!(matches!(err, MutatorError::EmptyAdvice));
    }

    #[tokio::test]
    async fn fallback_tries_other_mutator_once() {
        let mutators = Mutators {
            demo: DemoAppend { max_demos: 0, floor: 0.0 },
            rule: Some(rule_append(ScriptedCritic::fixed("Be brief."))),
        };
        let child = mutators
            .apply_with_fallback(MutatorKind::DemoAppend, &seed_program(), &bucket(&[1.0, 0.0]))
            .await
            .unwrap();
        assert_eq!(child.lineage.unwrap().mutator, MutatorKind::RuleAppend);

        let demo_only = Mutators {
            demo: DemoAppend { max_demos: 0, floor: 0.0 },
            rule: None,
        };
        let err = demo_only
            .apply_with_fallback(MutatorKind::DemoAppend, &seed_program(), &bucket(&[1.0, 0.0]))
            .await
            .unwrap_err();
        assert!(matches!(err, MutatorError::Unavailable(MutatorKind::RuleAppend)));
    }

    #[tokio::test]
    async fn program_critic_runs_teacher_program() {
        struct EchoTeacher;
        impl ProgramRunner for EchoTeacher {
            fn execute<'a>(
                &'a self,
                program: &'a Program,
                inputs: &'a Fields,
            ) -> BoxFuture<'a, Result<Fields, ExecutionError>> {
                Box::pin(async move {
                    assert!(program.signature.outputs.contains(&"advice".to_string()));
                    let better = inputs["better_score"].as_f64().unwrap_or_default();
                    Ok(Fields::from([
                        ("discussion".to_string(), json!("better one doubled")),
                        ("advice".to_string(), json!(format!("Aim for {better}."))),
                    ]))
                })
            }
        }

        let critic = ProgramCritic::new(Arc::new(EchoTeacher), ProgramCritic::default_teacher());
        let child = RuleAppend {
            critic: Arc::new(critic),
            separator: " ".into(),
        }
        .mutate(&seed_program(), &bucket(&[1.0, 0.0]))
        .await
        .unwrap();
        assert_eq!(child.instructions, "Double q. Aim for 1.");
    }

    #[tokio::test]
    async fn program_critic_requires_advice_field() {
        let critic = ProgramCritic::new(
            Arc::new(ScriptedRunner::correct()),
            ProgramCritic::default_teacher(),
        );
        let b = bucket(&[1.0, 0.0]);
        let request = CritiqueRequest {
            instructions: "x".into(),
            modules_description: "y".into(),
            worse_trajectory: TrajectorySummary::from(b.worst()),
            better_trajectory: TrajectorySummary::from(b.best()),
            worse_score: 0.0,
            better_score: 1.0,
        };
        // The scripted runner has no `q` input here and rejects the call.
        let err = critic.critique(&request).await.unwrap_err();
        assert_eq!(err.kind, ExecutionErrorKind::InvalidResponse);
    }

    #[test]
    fn summary_of_failed_trajectory_carries_reason() {
        let mut t = scored("p", "e", 0.0);
        t.outcome = TrajectoryOutcome::Failed {
            kind: ExecutionErrorKind::Timeout,
            reason: "no response".into(),
        };
        let summary = TrajectorySummary::from(&t);
        assert!(summary.outputs.is_none());
        assert_eq!(summary.failure.as_deref(), Some("timeout: no response"));
    }
}
