//! The continuous optimization controller.
//!
//! One Tokio task owns all controller state. Callers talk to it through a
//! [`ControllerHandle`]: commands go over an mpsc channel and are
//! acknowledged on a oneshot, while status snapshots are published on a
//! `watch` channel so reading them never waits on the actor.
//!
//! Ascent runs and validation checks are spawned as their own tasks and
//! joined from the actor's select loop, so the actor stays responsive while
//! language-model calls are in flight.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::history::{QualityEntry, QualityHistory, QualitySource, QualityTrend};
use super::policy::{adapt_ascent_config, optimization_due, TriggerReason};
use crate::config::{AscentConfig, ControllerConfig, ControllerConfigUpdate};
use crate::error::{AscentError, ControllerError};
use crate::metric::Metric;
use crate::optimizer::{AscentOutcome, Critic, MiniBatchAscent};
use crate::program::{Example, Program};
use crate::trajectory::{ProgramRunner, TrajectoryExecutor};

// ---------------------------------------------------------------------------
// Public surface
// ---------------------------------------------------------------------------

/// Collaborators and data an optimization needs.
///
/// Only `runner` is mandatory up front. A missing metric, critic or training
/// set is reported when an optimization is attempted.
#[derive(Clone)]
pub struct OptimizationResources {
    pub runner: Arc<dyn ProgramRunner>,
    pub metric: Option<Arc<dyn Metric>>,
    pub critic: Option<Arc<dyn Critic>>,
    pub trainset: Arc<Vec<Example>>,
    /// Sampled by quality checks; may be empty.
    pub valset: Arc<Vec<Example>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    Running,
    /// An ascent run is in flight.
    Busy,
    Stopped,
}

/// Read-only snapshot of a controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerStatus {
    pub controller_id: String,
    pub state: ControllerState,
    pub optimization_count: u64,
    pub last_optimization_time: Option<DateTime<Utc>>,
    pub last_quality_check_time: Option<DateTime<Utc>>,
    pub current_quality: Option<f64>,
    pub quality_trend: QualityTrend,
    pub quality_history: Vec<QualityEntry>,
    /// Most recent optimization failure; kept after later successes.
    pub last_error: Option<String>,
    pub current_program: Program,
    pub original_program_id: String,
}

enum Command {
    Trigger {
        reply: oneshot::Sender<Result<(), ControllerError>>,
    },
    UpdateConfig {
        update: ControllerConfigUpdate,
        reply: oneshot::Sender<Result<ControllerConfig, ControllerError>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running controller. Dropping it stops the controller.
pub struct ControllerHandle {
    id: String,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ControllerStatus>,
    task: JoinHandle<()>,
}

/// Start a controller deploying `program`.
///
/// Must be called from within a Tokio runtime. Returns once both timers are
/// armed; the first quality check fires one `quality_check_interval` later.
pub fn start(
    program: Program,
    resources: OptimizationResources,
    ascent: AscentConfig,
    config: ControllerConfig,
) -> Result<ControllerHandle, ControllerError> {
    ascent.validate()?;
    config.validate()?;

    let id = Uuid::new_v4().to_string();
    let (commands_tx, commands_rx) = mpsc::channel(32);

    let actor = Actor::new(id.clone(), program, resources, ascent, config, commands_rx);
    let status = actor.status_tx.subscribe();

    info!(
        controller = %id,
        program = %actor.current.id,
        quality_check_secs = actor.config.quality_check_interval_secs,
        optimization_secs = actor.config.optimization_interval_secs,
        "controller started"
    );
    let task = tokio::spawn(actor.run());

    Ok(ControllerHandle {
        id,
        commands: commands_tx,
        status,
        task,
    })
}

impl ControllerHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Latest status snapshot.
    pub fn status(&self) -> ControllerStatus {
        self.status.borrow().clone()
    }

    /// A receiver that observes every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<ControllerStatus> {
        self.status.clone()
    }

    /// Start an optimization now.
    ///
    /// Resolves as soon as the run has been started (or refused); it does
    /// not wait for the run to finish.
    pub async fn trigger_optimization(&self) -> Result<(), ControllerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Trigger { reply }).await?;
        rx.await.map_err(|_| ControllerError::Stopped)?
    }

    /// Merge `update` into the configuration and re-arm both timers.
    /// An in-flight run is not interrupted.
    pub async fn update_config(
        &self,
        update: ControllerConfigUpdate,
    ) -> Result<ControllerConfig, ControllerError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::UpdateConfig { update, reply }).await?;
        rx.await.map_err(|_| ControllerError::Stopped)?
    }

    /// Cancel timers, abandon any in-flight run, and wait for the actor to exit.
    pub async fn stop(self) -> Result<(), ControllerError> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Stop { reply }).await.is_ok() {
            let _ = rx.await;
        }
        if let Err(error) = self.task.await {
            warn!(controller = %self.id, %error, "controller task ended abnormally");
        }
        Ok(())
    }

    async fn send(&self, command: Command) -> Result<(), ControllerError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ControllerError::Stopped)
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct InFlight {
    seed_id: String,
    reason: TriggerReason,
    task: JoinHandle<Result<AscentOutcome, AscentError>>,
}

struct Actor {
    id: String,
    config: ControllerConfig,
    ascent: AscentConfig,
    resources: OptimizationResources,

    current: Program,
    original: Program,
    /// Full training-set score of `original`, once a run has measured it.
    original_score: Option<f64>,

    history: QualityHistory,
    optimization_count: u64,
    last_optimization_time: Option<DateTime<Utc>>,
    last_quality_check_time: Option<DateTime<Utc>>,
    /// When the last successful optimization finished.
    last_optimized: Option<Instant>,
    started: Instant,
    last_error: Option<String>,

    in_flight: Option<InFlight>,
    checking: Option<JoinHandle<QualityEntry>>,

    quality_timer: Interval,
    optimization_timer: Interval,
    commands: mpsc::Receiver<Command>,
    status_tx: watch::Sender<ControllerStatus>,
    rng: StdRng,
}

fn timer(period: std::time::Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}

async fn join_slot<T>(slot: &mut Option<JoinHandle<T>>) -> Result<T, JoinError> {
    match slot {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

async fn join_run(
    slot: &mut Option<InFlight>,
) -> Result<Result<AscentOutcome, AscentError>, JoinError> {
    match slot {
        Some(run) => (&mut run.task).await,
        None => std::future::pending().await,
    }
}

impl Actor {
    fn new(
        id: String,
        program: Program,
        resources: OptimizationResources,
        ascent: AscentConfig,
        config: ControllerConfig,
        commands: mpsc::Receiver<Command>,
    ) -> Self {
        let history = QualityHistory::new(config.history_capacity);
        let initial = ControllerStatus {
            controller_id: id.clone(),
            state: ControllerState::Running,
            optimization_count: 0,
            last_optimization_time: None,
            last_quality_check_time: None,
            current_quality: None,
            quality_trend: QualityTrend::InsufficientData,
            quality_history: Vec::new(),
            last_error: None,
            current_program: program.clone(),
            original_program_id: program.id.clone(),
        };
        let (status_tx, _) = watch::channel(initial);
        let rng = match ascent.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            id,
            quality_timer: timer(config.quality_check_interval()),
            optimization_timer: timer(config.optimization_interval()),
            config,
            ascent,
            resources,
            current: program.clone(),
            original: program,
            original_score: None,
            history,
            optimization_count: 0,
            last_optimization_time: None,
            last_quality_check_time: None,
            last_optimized: None,
            started: Instant::now(),
            last_error: None,
            in_flight: None,
            checking: None,
            commands,
            status_tx,
            rng,
        }
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Stop { reply }) => {
                            self.shutdown();
                            let _ = reply.send(());
                            return;
                        }
                        Some(command) => self.handle_command(command),
                        None => {
                            debug!(controller = %self.id, "all handles dropped");
                            self.shutdown();
                            return;
                        }
                    }
                }
                _ = self.quality_timer.tick() => {
                    self.start_quality_check();
                }
                _ = self.optimization_timer.tick() => {
                    if let Err(error) = self.begin_optimization(TriggerReason::Scheduled) {
                        debug!(controller = %self.id, %error, "scheduled optimization skipped");
                    }
                }
                result = join_slot(&mut self.checking) => {
                    self.checking = None;
                    match result {
                        Ok(entry) => self.record_quality(entry),
                        Err(error) => warn!(controller = %self.id, %error, "quality check task failed"),
                    }
                }
                result = join_run(&mut self.in_flight) => {
                    if let Some(run) = self.in_flight.take() {
                        self.finish_optimization(run, result);
                    }
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Trigger { reply } => {
                let _ = reply.send(self.begin_optimization(TriggerReason::Manual));
            }
            Command::UpdateConfig { update, reply } => {
                let _ = reply.send(self.update_config(update));
            }
            // Handled by the select loop.
            Command::Stop { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn update_config(
        &mut self,
        update: ControllerConfigUpdate,
    ) -> Result<ControllerConfig, ControllerError> {
        let merged = update.apply(&self.config)?;
        self.history.set_capacity(merged.history_capacity);
        self.quality_timer = timer(merged.quality_check_interval());
        self.optimization_timer = timer(merged.optimization_interval());
        self.config = merged.clone();
        info!(
            controller = %self.id,
            quality_threshold = merged.quality_threshold,
            quality_check_secs = merged.quality_check_interval_secs,
            optimization_secs = merged.optimization_interval_secs,
            "controller config updated"
        );
        self.publish();
        Ok(merged)
    }

    // -- quality checks ----------------------------------------------------

    fn start_quality_check(&mut self) {
        if self.checking.is_some() {
            debug!(controller = %self.id, "previous quality check still running");
            return;
        }

        let program = self.current.clone();
        let metric = match &self.resources.metric {
            Some(metric) if !self.resources.valset.is_empty() => metric.clone(),
            _ => {
                let entry = self.fallback_quality(program.id);
                self.record_quality(entry);
                return;
            }
        };

        let sample: Vec<Example> = self
            .resources
            .valset
            .choose_multiple(&mut self.rng, self.config.validation_sample_size)
            .cloned()
            .collect();
        let executor = TrajectoryExecutor::new(
            self.resources.runner.clone(),
            metric,
            self.ascent.call_timeout(),
            self.ascent.max_concurrency,
        );
        self.checking = Some(tokio::spawn(async move {
            let quality = executor.evaluate(&program, &sample).await;
            QualityEntry {
                timestamp: Utc::now(),
                quality,
                program_id: program.id,
                source: QualitySource::Validation,
            }
        }));
    }

    fn fallback_quality(&self, program_id: String) -> QualityEntry {
        let (quality, source) = match self.original_score {
            Some(score) => (score, QualitySource::LastKnownScore),
            None => (self.config.neutral_quality, QualitySource::Neutral),
        };
        QualityEntry {
            timestamp: Utc::now(),
            quality,
            program_id,
            source,
        }
    }

    fn record_quality(&mut self, entry: QualityEntry) {
        self.last_quality_check_time = Some(entry.timestamp);
        self.history.push(entry);

        let current = self.history.current_quality();
        let trend = self.history.trend(self.config.trend_window);
        info!(
            controller = %self.id,
            quality = ?current,
            trend = %trend,
            "quality check recorded"
        );
        self.publish();

        let since_last = self.last_optimized.unwrap_or(self.started).elapsed();
        if let Some(reason) = optimization_due(&self.config, current, trend, since_last) {
            match self.begin_optimization(reason) {
                Ok(()) => {}
                Err(ControllerError::AlreadyOptimizing) => {
                    debug!(controller = %self.id, %reason, "optimization due but one is running");
                }
                Err(error) => {
                    debug!(controller = %self.id, %reason, %error, "optimization due but not started");
                }
            }
        }
    }

    // -- optimization ------------------------------------------------------

    fn begin_optimization(&mut self, reason: TriggerReason) -> Result<(), ControllerError> {
        if self.in_flight.is_some() {
            return Err(ControllerError::AlreadyOptimizing);
        }

        let config = adapt_ascent_config(&self.ascent, &self.history);
        let ascent = match MiniBatchAscent::new(
            config.clone(),
            self.resources.runner.clone(),
            self.resources.metric.clone(),
            self.resources.critic.clone(),
            self.resources.trainset.clone(),
        ) {
            Ok(ascent) => ascent,
            Err(error) => {
                warn!(controller = %self.id, %reason, %error, "optimization not started");
                self.last_error = Some(error.to_string());
                self.publish();
                return Err(error.into());
            }
        };

        let seed = self.current.clone();
        info!(
            controller = %self.id,
            %reason,
            seed = %seed.id,
            steps = config.steps,
            candidates_per_step = config.candidates_per_step,
            "optimization started"
        );
        self.in_flight = Some(InFlight {
            seed_id: seed.id.clone(),
            reason,
            task: tokio::spawn(async move { ascent.run(seed).await }),
        });
        self.publish();
        Ok(())
    }

    fn finish_optimization(
        &mut self,
        run: InFlight,
        result: Result<Result<AscentOutcome, AscentError>, JoinError>,
    ) {
        match result {
            Ok(Ok(outcome)) => {
                if run.seed_id == self.original.id {
                    self.original_score = Some(outcome.seed_score);
                }
                info!(
                    controller = %self.id,
                    reason = %run.reason,
                    program = %outcome.program.id,
                    score = outcome.score,
                    seed_score = outcome.seed_score,
                    improved = outcome.improved,
                    "optimization finished"
                );
                self.current = outcome.program;
                self.optimization_count += 1;
                self.last_optimization_time = Some(Utc::now());
                self.last_optimized = Some(Instant::now());
            }
            Ok(Err(error)) => {
                warn!(controller = %self.id, reason = %run.reason, %error, "optimization failed");
                self.last_error = Some(error.to_string());
            }
            Err(error) => {
                warn!(controller = %self.id, reason = %run.reason, %error, "optimization task failed");
                self.last_error = Some(format!("optimization task failed: {error}"));
            }
        }
        self.publish();
    }

    fn shutdown(&mut self) {
        if let Some(run) = self.in_flight.take() {
            info!(controller = %self.id, seed = %run.seed_id, "abandoning in-flight optimization");
            run.task.abort();
        }
        if let Some(check) = self.checking.take() {
            check.abort();
        }
        info!(controller = %self.id, "controller stopped");
        self.publish_state(ControllerState::Stopped);
    }

    // -- status ------------------------------------------------------------

    fn publish(&self) {
        let state = if self.in_flight.is_some() {
            ControllerState::Busy
        } else {
            ControllerState::Running
        };
        self.publish_state(state);
    }

    fn publish_state(&self, state: ControllerState) {
        let status = ControllerStatus {
            controller_id: self.id.clone(),
            state,
            optimization_count: self.optimization_count,
            last_optimization_time: self.last_optimization_time,
            last_quality_check_time: self.last_quality_check_time,
            current_quality: self.history.current_quality(),
            quality_trend: self.history.trend(self.config.trend_window),
            quality_history: self.history.entries(),
            last_error: self.last_error.clone(),
            current_program: self.current.clone(),
            original_program_id: self.original.id.clone(),
        };
        self.status_tx.send_replace(status);
    }
}
