//! Trajectory execution: run programs against examples and score them.
//!
//! The [`TrajectoryExecutor`] wraps the external program runner with:
//!   1. a per-call timeout,
//!   2. metric scoring of successful outputs,
//!   3. bounded parallelism across a batch of (program, example) jobs.
//!
//! It never fails. A timeout or runner error becomes a failed trajectory with
//! score 0, so one bad call cannot stall or abort the rest of its batch.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use tokio::time::Instant;
use tracing::debug;

use crate::error::ExecutionError;
use crate::metric::{clamp_score, Metric};
use crate::program::{Example, Fields, Program};
use crate::trajectory::types::{Trajectory, TrajectoryOutcome};

// ---------------------------------------------------------------------------
// Runner trait (the program-execution collaborator)
// ---------------------------------------------------------------------------

/// Turns a program plus inputs into outputs, typically via a language model.
///
/// Retries, backoff and circuit breaking are the implementation's business;
/// the optimizer calls each job exactly once.
pub trait ProgramRunner: Send + Sync {
    fn execute<'a>(
        &'a self,
        program: &'a Program,
        inputs: &'a Fields,
    ) -> BoxFuture<'a, Result<Fields, ExecutionError>>;
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Runs and scores trajectories.
#[derive(Clone)]
pub struct TrajectoryExecutor {
    runner: Arc<dyn ProgramRunner>,
    metric: Arc<dyn Metric>,
    call_timeout: Duration,
    max_concurrency: usize,
}

impl TrajectoryExecutor {
    /// * `call_timeout` -- upper bound on a single runner call.
    /// * `max_concurrency` -- how many runner calls a batch keeps in flight.
    pub fn new(
        runner: Arc<dyn ProgramRunner>,
        metric: Arc<dyn Metric>,
        call_timeout: Duration,
        max_concurrency: usize,
    ) -> Self {
        Self {
            runner,
            metric,
            call_timeout,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Execute `program` on `example` and score the result.
    pub async fn run(&self, program: &Program, example: &Example) -> Trajectory {
        let started = Instant::now();
        let result =
            match tokio::time::timeout(self.call_timeout, self.runner.execute(program, &example.inputs))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(ExecutionError::timeout(self.call_timeout)),
            };
        let duration = started.elapsed();

        let (outcome, score) = match result {
            Ok(outputs) => {
                let score = clamp_score(self.metric.score(example, &outputs));
                (TrajectoryOutcome::Success(outputs), score)
            }
            Err(error) => {
                debug!(
                    program = %program.id,
                    example = %example.id,
                    kind = %error.kind,
                    error = %error.message,
                    "trajectory failed"
                );
                (
                    TrajectoryOutcome::Failed {
                        kind: error.kind,
                        reason: error.message,
                    },
                    0.0,
                )
            }
        };

        Trajectory {
            program_id: program.id.clone(),
            example_id: example.id.clone(),
            inputs: example.inputs.clone(),
            outcome,
            score,
            duration,
        }
    }

    /// Execute every job with at most `max_concurrency` calls in flight.
    ///
    /// Returns one trajectory per job, in job order, once all have finished
    /// or timed out.
    pub async fn run_batch(&self, jobs: &[(&Program, &Example)]) -> Vec<Trajectory> {
        let futures: Vec<BoxFuture<'_, Trajectory>> = jobs
            .iter()
            .map(|&(program, example)| Box::pin(self.run(program, example)) as BoxFuture<'_, Trajectory>)
            .collect();
        stream::iter(futures)
            .buffered(self.max_concurrency)
            .collect()
            .await
    }

    /// Mean score of `program` over `examples`.
    pub async fn evaluate(&self, program: &Program, examples: &[Example]) -> f64 {
        let jobs: Vec<(&Program, &Example)> = examples.iter().map(|e| (program, e)).collect();
        let trajectories = self.run_batch(&jobs).await;
        super::types::mean_score(&trajectories)
    }

    /// Mean score of each program over `examples`, sharing one concurrency
    /// budget across all programs. Results follow the order of `programs`.
    pub async fn evaluate_many(&self, programs: &[&Program], examples: &[Example]) -> Vec<f64> {
        if examples.is_empty() {
            return vec![0.0; programs.len()];
        }
        let jobs: Vec<(&Program, &Example)> = programs
            .iter()
            .flat_map(|p| examples.iter().map(move |e| (*p, e)))
            .collect();
        let trajectories = self.run_batch(&jobs).await;
        trajectories
            .chunks(examples.len())
            .map(super::types::mean_score)
            .collect()
    }
}
