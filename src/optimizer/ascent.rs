//! The mini-batch ascent loop.
//!
//! One run evolves a [`ProgramPool`] seeded with a single program:
//!
//! 1. draw a mini-batch from the training set,
//! 2. execute pool-sampled source programs on every example,
//! 3. bucket the trajectories by example and rank them by score gap,
//! 4. mutate low-temperature samples of the pool using the top buckets,
//! 5. score the candidates on the same mini-batch and register them,
//! 6. keep the best candidate as a step winner if it beat the baseline.
//!
//! After the last step, the seed and every winner are scored on the full
//! training set and the best one is returned. The seed wins every tie, so a
//! run never hands back something worse than what it started from.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use ordered_float::OrderedFloat;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::mutator::{Critic, DemoAppend, Mutators, RuleAppend};
use super::pool::ProgramPool;
use crate::config::{AscentConfig, WinnerTieBreak};
use crate::error::{AscentError, ConfigError, MutatorError};
use crate::metric::Metric;
use crate::program::{Example, MutatorKind, Program};
use crate::trajectory::{bucket_trajectories, mean_score, ProgramRunner, TrajectoryExecutor};

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Why a step made no progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedReason {
    AllTrajectoriesFailed,
    NoInformativeBuckets,
    NoCandidates,
}

impl std::fmt::Display for DegradedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AllTrajectoriesFailed => write!(f, "all_trajectories_failed"),
            Self::NoInformativeBuckets => write!(f, "no_informative_buckets"),
            Self::NoCandidates => write!(f, "no_candidates"),
        }
    }
}

/// What happened in one ascent step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub step: usize,
    pub batch_size: usize,
    /// Mean score of the step's sampled-source trajectories.
    pub baseline: f64,
    pub trajectories: usize,
    pub trajectories_failed: usize,
    pub informative_buckets: usize,
    pub candidates_generated: usize,
    pub candidates_failed: usize,
    /// Highest candidate mini-batch score, if any candidate was evaluated.
    pub best_candidate_score: Option<f64>,
    /// Id of the candidate kept as this step's winner.
    pub winner: Option<String>,
    pub degraded: Option<DegradedReason>,
}

impl StepReport {
    fn new(step: usize, batch_size: usize) -> Self {
        Self {
            step,
            batch_size,
            baseline: 0.0,
            trajectories: 0,
            trajectories_failed: 0,
            informative_buckets: 0,
            candidates_generated: 0,
            candidates_failed: 0,
            best_candidate_score: None,
            winner: None,
            degraded: None,
        }
    }
}

/// Result of a completed run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AscentOutcome {
    /// The selected program: the seed unless a winner strictly beat it.
    pub program: Program,
    /// Full training-set score of `program`.
    pub score: f64,
    /// Full training-set score of the seed.
    pub seed_score: f64,
    pub steps: Vec<StepReport>,
    pub winners: Vec<Program>,
    pub pool_size: usize,
    pub elapsed: Duration,
    pub improved: bool,
}

// ---------------------------------------------------------------------------
// Ascent
// ---------------------------------------------------------------------------

/// A configured ascent run, reusable across seeds.
#[derive(Clone)]
pub struct MiniBatchAscent {
    config: AscentConfig,
    executor: TrajectoryExecutor,
    mutators: Mutators,
    trainset: Arc<Vec<Example>>,
}

/// A step that ran to completion.
struct StepResult {
    report: StepReport,
    pool: ProgramPool,
    winner: Option<Program>,
}

impl MiniBatchAscent {
    /// Validate everything a run needs before any program call is made.
    ///
    /// A critic is only required while the rule-append weight is positive;
    /// when one is given anyway it also serves as the demo-append fallback.
    pub fn new(
        config: AscentConfig,
        runner: Arc<dyn ProgramRunner>,
        metric: Option<Arc<dyn Metric>>,
        critic: Option<Arc<dyn Critic>>,
        trainset: Arc<Vec<Example>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        if trainset.is_empty() {
            return Err(ConfigError::EmptyTrainset);
        }
        let metric = metric.ok_or(ConfigError::MissingMetric)?;
        if critic.is_none() && config.mutator_weights.rule_append > 0.0 {
            return Err(ConfigError::MissingTeacher);
        }

        let executor = TrajectoryExecutor::new(
            runner,
            metric,
            config.call_timeout(),
            config.max_concurrency,
        );
        let mutators = Mutators {
            demo: DemoAppend {
                max_demos: config.max_demos,
                floor: config.demo_score_floor,
            },
            rule: critic.map(|critic| RuleAppend {
                critic,
                separator: config.instruction_separator.clone(),
            }),
        };

        Ok(Self {
            config,
            executor,
            mutators,
            trainset,
        })
    }

    /// Run the full ascent from `seed`.
    pub async fn run(&self, seed: Program) -> Result<AscentOutcome, AscentError> {
        let started = Instant::now();
        let deadline = started + self.config.run_timeout();
        let mut rng = match self.config.rng_seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };

        info!(
            seed = %seed.id,
            steps = self.config.steps,
            batch_size = self.config.batch_size,
            trainset = self.trainset.len(),
            "starting ascent run"
        );

        let mut pool = ProgramPool::new(seed.clone());
        let mut reports: Vec<StepReport> = Vec::with_capacity(self.config.steps);
        let mut winners: Vec<Program> = Vec::new();

        for step in 1..=self.config.steps {
            match tokio::time::timeout_at(deadline, self.step(step, &pool, &mut rng)).await {
                Ok(result) => {
                    pool = result.pool;
                    if let Some(winner) = result.winner {
                        winners.push(winner);
                    }
                    reports.push(result.report);
                }
                Err(_) => {
                    warn!(step, completed = reports.len(), "run deadline reached, discarding step");
                    break;
                }
            }
        }

        if reports.is_empty() {
            return Err(AscentError::TimedOut {
                elapsed: started.elapsed(),
            });
        }
        if reports.iter().all(|r| r.degraded.is_some()) {
            warn!(steps = reports.len(), "every ascent step degraded");
            return Err(AscentError::NoProgress {
                steps: reports.len(),
            });
        }

        // Full-set selection: seed first so it wins ties.
        let mut contenders: Vec<&Program> = Vec::with_capacity(winners.len() + 1);
        contenders.push(&seed);
        contenders.extend(winners.iter());
        let scores = self
            .executor
            .evaluate_many(&contenders, &self.trainset)
            .await;
        let chosen = select_final(&scores);
        let program = contenders[chosen].clone();

        let outcome = AscentOutcome {
            improved: chosen != 0,
            score: scores[chosen],
            seed_score: scores[0],
            program,
            steps: reports,
            winners,
            pool_size: pool.len(),
            elapsed: started.elapsed(),
        };

        info!(
            program = %outcome.program.id,
            score = outcome.score,
            seed_score = outcome.seed_score,
            winners = outcome.winners.len(),
            pool_size = outcome.pool_size,
            improved = outcome.improved,
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "ascent run complete"
        );
        Ok(outcome)
    }

    /// Run one step against a working copy of `pool`.
    ///
    /// The copy is only handed back once the step completes, so a step cut
    /// short by the run deadline leaves the pool untouched.
    async fn step(&self, step: usize, pool: &ProgramPool, rng: &mut StdRng) -> StepResult {
        let mut pool = pool.clone();
        let size = self.config.batch_size.min(self.trainset.len());
        let batch: Vec<Example> = self
            .trainset
            .choose_multiple(rng, size)
            .cloned()
            .collect();
        let mut report = StepReport::new(step, batch.len());

        // Trajectories from pool-sampled sources.
        let sources: Vec<(Program, &Example)> = batch
            .iter()
            .flat_map(|example| std::iter::repeat(example).take(self.config.trajectories_per_example))
            .map(|example| (pool.sample(self.config.sampling_temperature, rng).clone(), example))
            .collect();
        let jobs: Vec<(&Program, &Example)> = sources.iter().map(|(p, e)| (p, *e)).collect();
        let trajectories = self.executor.run_batch(&jobs).await;

        report.trajectories = trajectories.len();
        report.trajectories_failed = trajectories.iter().filter(|t| !t.is_success()).count();
        report.baseline = mean_score(&trajectories);

        if report.trajectories_failed == report.trajectories {
            return self.degraded(report, pool, DegradedReason::AllTrajectoriesFailed);
        }

        // Fold each source's mini-batch average into its running score.
        let mut per_source: HashMap<&str, (f64, usize)> = HashMap::new();
        for t in &trajectories {
            let entry = per_source.entry(t.program_id.as_str()).or_insert((0.0, 0));
            entry.0 += t.score;
            entry.1 += 1;
        }
        let mut registered: Vec<&str> = Vec::new();
        for (program, _) in &sources {
            if registered.contains(&program.id.as_str()) {
                continue;
            }
            if let Some(&(sum, n)) = per_source.get(program.id.as_str()) {
                pool.register(program.clone(), sum / n as f64);
                registered.push(program.id.as_str());
            }
        }

        let buckets = bucket_trajectories(trajectories);
        let top: Vec<_> = buckets
            .iter()
            .filter(|b| b.is_informative())
            .take(self.config.informative_buckets)
            .collect();
        report.informative_buckets = buckets.iter().filter(|b| b.is_informative()).count();
        if top.is_empty() {
            return self.degraded(report, pool, DegradedReason::NoInformativeBuckets);
        }

        // Plan every slot up front so sampling stays sequential.
        let slots: Vec<(Program, usize, MutatorKind)> = (0..self.config.candidates_per_step)
            .map(|_| {
                let source = pool.sample(self.config.candidate_temperature, rng).clone();
                let bucket = rng.gen_range(0..top.len());
                (source, bucket, self.choose_mutator(rng))
            })
            .collect();

        let attempts: Vec<BoxFuture<'_, Result<Program, MutatorError>>> = slots
            .iter()
            .map(|(source, bucket, kind)| {
                Box::pin(self.mutators.apply_with_fallback(*kind, source, top[*bucket]))
                    as BoxFuture<'_, Result<Program, MutatorError>>
            })
            .collect();
        let results: Vec<Result<Program, MutatorError>> = stream::iter(attempts)
            .buffered(self.config.max_concurrency)
            .collect()
            .await;

        let mut candidates: Vec<Program> = Vec::with_capacity(results.len());
        for ((source, bucket, kind), result) in slots.iter().zip(results) {
            match result {
                Ok(candidate) => candidates.push(candidate),
                Err(error) => {
                    report.candidates_failed += 1;
                    warn!(
                        step,
                        source = %source.id,
                        example = %top[*bucket].example_id,
                        mutator = %kind,
                        error = %error,
                        "candidate slot produced nothing"
                    );
                }
            }
        }
        report.candidates_generated = candidates.len();
        if candidates.is_empty() {
            return self.degraded(report, pool, DegradedReason::NoCandidates);
        }

        // Score candidates on the same mini-batch.
        let refs: Vec<&Program> = candidates.iter().collect();
        let scores = self.executor.evaluate_many(&refs, &batch).await;
        for (candidate, &score) in candidates.iter().zip(&scores) {
            debug!(step, candidate = %candidate.id, score, "candidate evaluated");
            pool.register(candidate.clone(), score);
        }

        let best = pick_winner(&candidates, &scores, self.config.winner_tie_break);
        report.best_candidate_score = best.map(|i| scores[i]);
        let winner = best
            .filter(|&i| scores[i] > report.baseline)
            .map(|i| candidates[i].clone());
        report.winner = winner.as_ref().map(|w| w.id.clone());

        info!(
            step,
            baseline = report.baseline,
            best_candidate = ?report.best_candidate_score,
            candidates = report.candidates_generated,
            failed_trajectories = report.trajectories_failed,
            winner = ?report.winner,
            "ascent step complete"
        );

        StepResult {
            report,
            pool,
            winner,
        }
    }

    fn degraded(&self, mut report: StepReport, pool: ProgramPool, reason: DegradedReason) -> StepResult {
        warn!(
            step = report.step,
            degraded = %reason,
            baseline = report.baseline,
            failed_trajectories = report.trajectories_failed,
            "ascent step degraded"
        );
        report.degraded = Some(reason);
        StepResult {
            report,
            pool,
            winner: None,
        }
    }

    fn choose_mutator(&self, rng: &mut StdRng) -> MutatorKind {
        let weights = &self.config.mutator_weights;
        let demo = weights.weight(MutatorKind::DemoAppend);
        let total = demo + weights.weight(MutatorKind::RuleAppend);
        if rng.gen::<f64>() * total < demo {
            MutatorKind::DemoAppend
        } else {
            MutatorKind::RuleAppend
        }
    }
}

/// Index of the best-scoring candidate, resolving ties per `tie_break`.
fn pick_winner(candidates: &[Program], scores: &[f64], tie_break: WinnerTieBreak) -> Option<usize> {
    let max = scores.iter().copied().map(OrderedFloat).max()?.0;
    let mut tied = (0..candidates.len()).filter(|&i| scores[i] == max);
    match tie_break {
        WinnerTieBreak::FirstGenerated => tied.next(),
        WinnerTieBreak::Simplest => tied.min_by_key(|&i| {
            let c = &candidates[i];
            (c.demonstrations.len(), c.instructions.len(), i)
        }),
    }
}

/// Index of the final program: the first strictly best score, so index 0
/// (the seed) keeps every tie.
fn select_final(scores: &[f64]) -> usize {
    let mut chosen = 0;
    for (i, &score) in scores.iter().enumerate().skip(1) {
        if score > scores[chosen] {
            chosen = i;
        }
    }
    chosen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MutatorWeights;
    use crate::testing::{
        answer_metric, examples, seed_program, true_quality, ScriptedCritic, ScriptedRunner,
        BROKEN_RULE,
    };

    fn config() -> AscentConfig {
        AscentConfig {
            rng_seed: Some(7),
            call_timeout_ms: 1_000,
            ..AscentConfig::default()
        }
    }

    fn ascent(
        config: AscentConfig,
        runner: Arc<ScriptedRunner>,
        critic: Option<ScriptedCritic>,
        trainset: Vec<Example>,
    ) -> MiniBatchAscent {
        MiniBatchAscent::new(
            config,
            runner,
            Some(Arc::new(answer_metric)),
            critic.map(|c| Arc::new(c) as Arc<dyn Critic>),
            Arc::new(trainset),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn configuration_failures_make_no_calls() {
        let runner = Arc::new(ScriptedRunner::correct());
        let metric: Option<Arc<dyn Metric>> = Some(Arc::new(answer_metric));
        let critic: Option<Arc<dyn Critic>> = Some(Arc::new(ScriptedCritic::tips()));

        let empty = MiniBatchAscent::new(config(), runner.clone(), metric.clone(), critic.clone(), Arc::new(vec![]));
        assert!(matches!(empty, Err(ConfigError::EmptyTrainset)));

        let no_metric = MiniBatchAscent::new(config(), runner.clone(), None, critic, Arc::new(examples(3)));
        assert!(matches!(no_metric, Err(ConfigError::MissingMetric)));

        let no_teacher = MiniBatchAscent::new(config(), runner.clone(), metric.clone(), None, Arc::new(examples(3)));
        assert!(matches!(no_teacher, Err(ConfigError::MissingTeacher)));

        // Demo-only runs don't need a teacher.
        let demo_only = AscentConfig {
            mutator_weights: MutatorWeights {
                demo_append: 1.0,
                rule_append: 0.0,
            },
            ..config()
        };
        assert!(MiniBatchAscent::new(demo_only, runner.clone(), metric, None, Arc::new(examples(3))).is_ok());

        assert_eq!(runner.calls(), 0);
    }

    #[tokio::test]
    async fn step_tolerates_partial_failure() {
        let runner = Arc::new(ScriptedRunner::correct().failing_on(["1"]));
        let cfg = AscentConfig {
            batch_size: 5,
            trajectories_per_example: 1,
            ..config()
        };
        let ascent = ascent(cfg, runner, Some(ScriptedCritic::tips()), examples(5));
        let pool = ProgramPool::new(seed_program());
        let mut rng = StdRng::seed_from_u64(1);

        let result = ascent.step(1, &pool, &mut rng).await;
        assert_eq!(result.report.trajectories, 5);
        assert_eq!(result.report.trajectories_failed, 1);
        assert!((result.report.baseline - 0.8).abs() < 1e-9);
        // The seed's mini-batch average was registered.
        let entry = result.pool.best_entry();
        assert_eq!(entry.times_evaluated, 1);
        assert!((entry.running_score - 0.8).abs() < 1e-9);
        // Single-trajectory buckets carry no contrast.
        assert_eq!(result.report.degraded, Some(DegradedReason::NoInformativeBuckets));
    }

    #[tokio::test]
    async fn all_failed_trajectories_degrade_the_step() {
        let runner = Arc::new(ScriptedRunner::correct().failing_on(["0", "1", "2"]));
        let ascent = ascent(config(), runner, Some(ScriptedCritic::tips()), examples(3));
        let pool = ProgramPool::new(seed_program());
        let mut rng = StdRng::seed_from_u64(1);

        let result = ascent.step(1, &pool, &mut rng).await;
        assert_eq!(result.report.degraded, Some(DegradedReason::AllTrajectoriesFailed));
        assert_eq!(result.pool.best_entry().times_evaluated, 0);
    }

    #[tokio::test]
    async fn run_fails_when_every_step_degrades() {
        // Every program is perfect, so no bucket ever has a gap.
        let runner = Arc::new(ScriptedRunner::correct());
        let cfg = AscentConfig {
            steps: 3,
            ..config()
        };
        let err = ascent(cfg, runner, Some(ScriptedCritic::tips()), examples(6))
            .run(seed_program())
            .await
            .unwrap_err();
        assert!(matches!(err, AscentError::NoProgress { steps: 3 }));
    }

    #[tokio::test]
    async fn harmful_candidates_never_replace_the_seed() {
        let runner = Arc::new(ScriptedRunner::partial(4, 3));
        let cfg = AscentConfig {
            steps: 4,
            mutator_weights: MutatorWeights {
                demo_append: 0.0,
                rule_append: 1.0,
            },
            max_demos: 0,
            ..config()
        };
        let seed = seed_program();
        let outcome = ascent(cfg, runner, Some(ScriptedCritic::fixed(BROKEN_RULE)), examples(10))
            .run(seed.clone())
            .await
            .unwrap();

        assert_eq!(outcome.program.id, seed.id);
        assert!(!outcome.improved);
        assert!(outcome.winners.is_empty());
        assert!(outcome.score >= outcome.seed_score);
        assert!(outcome.pool_size > 1);
    }

    #[tokio::test]
    async fn end_to_end_run_improves_or_keeps_seed() {
        let runner = Arc::new(ScriptedRunner::partial(4, 3));
        let critic = ScriptedCritic::tips();
        let trainset = examples(10);
        let seed = seed_program();

        let outcome = ascent(config(), runner.clone(), Some(critic), trainset.clone())
            .run(seed.clone())
            .await
            .unwrap();

        assert_eq!(outcome.steps.len(), 8);
        assert!(outcome.pool_size > 1);
        assert!(outcome.score >= outcome.seed_score);
        assert!(true_quality(&outcome.program, 4, &trainset) >= 0.4);
        for winner in &outcome.winners {
            assert!(winner.is_derived());
        }
        assert_eq!(outcome.improved, outcome.program.id != seed.id);
        assert!(runner.calls() > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_before_first_step_is_a_timeout() {
        let runner = ScriptedRunner::correct().slow_on(["0", "1", "2"], Duration::from_secs(3));
        let cfg = AscentConfig {
            run_timeout_secs: 1,
            call_timeout_ms: 5_000,
            ..config()
        };
        let err = ascent(cfg, Arc::new(runner), Some(ScriptedCritic::tips()), examples(3))
            .run(seed_program())
            .await
            .unwrap_err();
        assert!(matches!(err, AscentError::TimedOut { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_after_first_step_keeps_completed_steps() {
        // Every phase of a step waits 20s on example 9, so step 1 ends at
        // 40s and step 2 is cut off by the 50s deadline.
        let runner = ScriptedRunner::partial(4, 3).slow_on(["9"], Duration::from_secs(20));
        let cfg = AscentConfig {
            batch_size: 10,
            max_concurrency: 64,
            run_timeout_secs: 50,
            call_timeout_ms: 30_000,
            ..config()
        };
        let seed = seed_program();
        let outcome = ascent(cfg, Arc::new(runner), Some(ScriptedCritic::tips()), examples(10))
            .run(seed.clone())
            .await
            .unwrap();

        assert_eq!(outcome.steps.len(), 1);
        assert!(outcome.steps[0].degraded.is_none());
        assert!(outcome.elapsed >= Duration::from_secs(50));
        assert!(outcome.score >= outcome.seed_score);
        assert_eq!(outcome.improved, outcome.program.id != seed.id);
    }

    #[tokio::test]
    async fn run_can_be_spawned() {
        let runner = Arc::new(ScriptedRunner::partial(4, 3));
        let cfg = AscentConfig {
            steps: 2,
            ..config()
        };
        let ascent = ascent(cfg, runner, Some(ScriptedCritic::tips()), examples(10));
        let outcome = tokio::spawn(async move { ascent.run(seed_program()).await })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.steps.len(), 2);
    }

    #[test]
    fn final_selection_prefers_seed_on_ties() {
        assert_eq!(select_final(&[0.6, 0.6, 0.5]), 0);
        assert_eq!(select_final(&[0.6, 0.7, 0.7]), 1);
        assert_eq!(select_final(&[0.6]), 0);
    }

    #[test]
    fn winner_tie_break_modes() {
        let plain = seed_program().with_rule("Tip: a long and detailed rule.", "\n");
        let short = seed_program().with_rule("Tip: short.", "\n");
        let candidates = vec![plain, short];
        let scores = [0.8, 0.8];

        assert_eq!(pick_winner(&candidates, &scores, WinnerTieBreak::FirstGenerated), Some(0));
        assert_eq!(pick_winner(&candidates, &scores, WinnerTieBreak::Simplest), Some(1));
        assert_eq!(pick_winner(&[], &[], WinnerTieBreak::FirstGenerated), None);
    }

    #[test]
    fn degraded_reason_labels() {
        assert_eq!(DegradedReason::NoCandidates.to_string(), "no_candidates");
    }
}
