//! promptascent: optimize LLM programs against a labeled dataset.
//!
//! Subcommands:
//!
//! - `optimize` -- Run one mini-batch ascent and save the best program
//! - `watch`    -- Keep a program deployed under the continuous controller
//! - `inspect`  -- Print a saved program

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use promptascent::config::OptimizerConfig;
use promptascent::controller::{self, OptimizationResources};
use promptascent::metric::{ExactMatch, Metric};
use promptascent::model::{LlmClient, LlmRunner};
use promptascent::optimizer::{Critic, MiniBatchAscent, ProgramCritic};
use promptascent::program::{load_examples, Program};
use promptascent::trajectory::ProgramRunner;

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// Mini-batch ascent optimizer for LLM programs.
#[derive(Parser)]
#[command(name = "promptascent", version, about)]
struct Cli {
    /// Path to a JSON configuration file (uses defaults if not provided).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one optimization and save the selected program.
    Optimize {
        /// Seed program (JSON).
        #[arg(long)]
        program: PathBuf,

        /// Training examples (JSON array or JSON Lines).
        #[arg(long)]
        trainset: PathBuf,

        /// Teacher program used for critiques (defaults to the built-in one).
        #[arg(long)]
        teacher: Option<PathBuf>,

        /// Only compare these output fields when scoring.
        #[arg(long, value_delimiter = ',')]
        fields: Vec<String>,

        /// Where to write the selected program.
        #[arg(long, default_value = "data/optimized_program.json")]
        output: PathBuf,
    },

    /// Deploy a program under the continuous controller until Ctrl-C.
    Watch {
        /// Program to deploy (JSON).
        #[arg(long)]
        program: PathBuf,

        /// Training examples used by optimization runs.
        #[arg(long)]
        trainset: PathBuf,

        /// Validation examples sampled by quality checks.
        #[arg(long)]
        valset: Option<PathBuf>,

        /// Teacher program used for critiques (defaults to the built-in one).
        #[arg(long)]
        teacher: Option<PathBuf>,

        /// Only compare these output fields when scoring.
        #[arg(long, value_delimiter = ',')]
        fields: Vec<String>,

        /// Seconds between status log lines.
        #[arg(long, default_value_t = 60)]
        status_every: u64,

        /// Where to write the deployed program on exit.
        #[arg(long, default_value = "data/deployed_program.json")]
        output: PathBuf,
    },

    /// Print a saved program.
    Inspect {
        /// Path to the program JSON file.
        path: PathBuf,
    },
}

// ---------------------------------------------------------------------------
// Entrypoint
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // Reads RUST_LOG, defaults to info.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            serde_json::from_str::<OptimizerConfig>(&text)
                .with_context(|| format!("Failed to parse config from {}", path.display()))?
        }
        None => OptimizerConfig::default(),
    };
    config.validate().context("Invalid configuration")?;

    // Fill in API keys from the environment when not set in the config file.
    if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        if config.model.api_key.is_empty() {
            config.model.api_key = key.clone();
        }
        if config.model.teacher_api_key.is_empty() {
            config.model.teacher_api_key = key;
        }
    }

    match cli.command {
        Commands::Optimize {
            program,
            trainset,
            teacher,
            fields,
            output,
        } => cmd_optimize(&config, &program, &trainset, teacher.as_deref(), fields, &output).await,
        Commands::Watch {
            program,
            trainset,
            valset,
            teacher,
            fields,
            status_every,
            output,
        } => {
            cmd_watch(
                &config,
                &program,
                &trainset,
                valset.as_deref(),
                teacher.as_deref(),
                fields,
                status_every,
                &output,
            )
            .await
        }
        Commands::Inspect { path } => cmd_inspect(&path),
    }
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

struct Collaborators {
    runner: Arc<dyn ProgramRunner>,
    critic: Arc<dyn Critic>,
    metric: Arc<dyn Metric>,
}

fn collaborators(
    config: &OptimizerConfig,
    teacher: Option<&Path>,
    fields: Vec<String>,
) -> Result<Collaborators> {
    let model = &config.model;
    let client = LlmClient::new(&model.api_base, &model.api_key)?;
    let runner = LlmRunner::new(client, &model.model_id, model.temperature, model.max_tokens);

    let teacher_client = LlmClient::new(&model.teacher_api_base, &model.teacher_api_key)?;
    let teacher_runner = LlmRunner::new(
        teacher_client,
        &model.teacher_model_id,
        model.temperature,
        model.max_tokens,
    );
    let teacher_program = match teacher {
        Some(path) => Program::load_from_file(path)?,
        None => ProgramCritic::default_teacher(),
    };

    let metric = if fields.is_empty() {
        ExactMatch::new()
    } else {
        ExactMatch::on_fields(fields)
    };

    Ok(Collaborators {
        runner: Arc::new(runner),
        critic: Arc::new(ProgramCritic::new(Arc::new(teacher_runner), teacher_program)),
        metric: Arc::new(metric),
    })
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_optimize(
    config: &OptimizerConfig,
    program_path: &Path,
    trainset_path: &Path,
    teacher: Option<&Path>,
    fields: Vec<String>,
    output: &Path,
) -> Result<()> {
    let seed = Program::load_from_file(program_path)?;
    let trainset = load_examples(trainset_path)?;
    tracing::info!(
        program = %seed.id,
        examples = trainset.len(),
        model = %config.model.model_id,
        "Starting optimization"
    );

    let collab = collaborators(config, teacher, fields)?;
    let ascent = MiniBatchAscent::new(
        config.ascent.clone(),
        collab.runner,
        Some(collab.metric),
        Some(collab.critic),
        Arc::new(trainset),
    )?;

    let outcome = ascent.run(seed).await?;
    outcome.program.save_to_file(output)?;

    tracing::info!(
        path = %output.display(),
        score = format!("{:.3}", outcome.score),
        seed_score = format!("{:.3}", outcome.seed_score),
        improved = outcome.improved,
        "Saved optimized program"
    );

    println!("Steps:");
    for step in &outcome.steps {
        let status = match step.degraded {
            Some(reason) => format!("degraded ({reason})"),
            None if step.winner.is_some() => "winner".to_string(),
            None => "no winner".to_string(),
        };
        println!(
            "  {:>3}: baseline {:.3}, best candidate {}, {}",
            step.step,
            step.baseline,
            step.best_candidate_score
                .map(|s| format!("{s:.3}"))
                .unwrap_or_else(|| "-".into()),
            status
        );
    }
    println!(
        "Score: {:.3} (seed {:.3}), {} winner(s), pool of {}, {:.1}s",
        outcome.score,
        outcome.seed_score,
        outcome.winners.len(),
        outcome.pool_size,
        outcome.elapsed.as_secs_f64()
    );
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn cmd_watch(
    config: &OptimizerConfig,
    program_path: &Path,
    trainset_path: &Path,
    valset_path: Option<&Path>,
    teacher: Option<&Path>,
    fields: Vec<String>,
    status_every: u64,
    output: &Path,
) -> Result<()> {
    let program = Program::load_from_file(program_path)?;
    let trainset = load_examples(trainset_path)?;
    let valset = match valset_path {
        Some(path) => load_examples(path)?,
        None => Vec::new(),
    };

    let collab = collaborators(config, teacher, fields)?;
    let resources = OptimizationResources {
        runner: collab.runner,
        metric: Some(collab.metric),
        critic: Some(collab.critic),
        trainset: Arc::new(trainset),
        valset: Arc::new(valset),
    };
    let handle = controller::start(
        program,
        resources,
        config.ascent.clone(),
        config.controller.clone(),
    )?;
    tracing::info!(controller = handle.id(), "Watching deployed program (Ctrl-C to stop)");

    let mut ticker = tokio::time::interval(Duration::from_secs(status_every.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let status = handle.status();
                tracing::info!(
                    state = ?status.state,
                    program = %status.current_program.id,
                    quality = ?status.current_quality,
                    trend = %status.quality_trend,
                    optimizations = status.optimization_count,
                    last_error = ?status.last_error,
                    "Controller status"
                );
            }
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                break;
            }
        }
    }

    let status = handle.status();
    handle.stop().await?;
    status.current_program.save_to_file(output)?;
    tracing::info!(
        path = %output.display(),
        optimizations = status.optimization_count,
        "Saved deployed program"
    );
    Ok(())
}

fn cmd_inspect(path: &Path) -> Result<()> {
    let program = Program::load_from_file(path)?;

    println!("Program: {}", path.display());
    println!("  Id: {}", program.id);
    println!("  Signature: {}", program.signature.describe());
    match &program.lineage {
        Some(lineage) => println!("  Derived from {} by {}", lineage.parent_id, lineage.mutator),
        None => println!("  Original program"),
    }
    println!();

    println!("Instructions:");
    for line in program.instructions.lines() {
        println!("  {line}");
    }
    println!();

    println!("Demonstrations ({}):", program.demonstrations.len());
    for (i, demo) in program.demonstrations.iter().enumerate() {
        println!(
            "  {}. {} -> {}",
            i + 1,
            serde_json::to_string(&demo.inputs)?,
            serde_json::to_string(&demo.outputs)?
        );
    }

    Ok(())
}
