use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::program::MutatorKind;

/// Complete configuration for the optimizer and its CLI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub ascent: AscentConfig,
    pub controller: ControllerConfig,
    pub model: ModelConfig,
}

impl OptimizerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ascent.validate()?;
        self.controller.validate()
    }
}

// ---------------------------------------------------------------------------
// Ascent
// ---------------------------------------------------------------------------

/// Probability mass for each mutator. Need not sum to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MutatorWeights {
    pub demo_append: f64,
    pub rule_append: f64,
}

impl Default for MutatorWeights {
    fn default() -> Self {
        Self {
            demo_append: 0.5,
            rule_append: 0.5,
        }
    }
}

impl MutatorWeights {
    pub fn weight(&self, kind: MutatorKind) -> f64 {
        match kind {
            MutatorKind::DemoAppend => self.demo_append,
            MutatorKind::RuleAppend => self.rule_append,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let valid = |w: f64| w.is_finite() && w >= 0.0;
        if !valid(self.demo_append) || !valid(self.rule_append) {
            return Err(ConfigError::Invalid(
                "mutator weights must be finite and non-negative".into(),
            ));
        }
        if self.demo_append + self.rule_append <= 0.0 {
            return Err(ConfigError::Invalid(
                "at least one mutator weight must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// How to pick a step winner among candidates with equal mini-batch scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WinnerTieBreak {
    /// The candidate generated first in the step.
    #[default]
    FirstGenerated,
    /// Fewer demonstrations, then shorter instructions.
    Simplest,
}

/// Parameters of one mini-batch ascent run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AscentConfig {
    /// Number of ascent steps (default: 8).
    pub steps: usize,
    /// Examples per mini-batch (default: 8).
    pub batch_size: usize,
    /// Source programs sampled per example in a step (default: 3).
    pub trajectories_per_example: usize,
    /// Candidate slots per step (default: 4).
    pub candidates_per_step: usize,
    /// How many of the highest-gap buckets candidates draw from (default: 1).
    pub informative_buckets: usize,
    /// Pool temperature when sampling trajectory sources (default: 0.2).
    pub sampling_temperature: f64,
    /// Pool temperature when sampling mutation sources (default: 0.05).
    pub candidate_temperature: f64,
    /// Demonstration cap per program (default: 4).
    pub max_demos: usize,
    /// A trajectory must score strictly above this to become a demo (default: 0.0).
    pub demo_score_floor: f64,
    pub mutator_weights: MutatorWeights,
    /// Runner calls in flight at once (default: 8).
    pub max_concurrency: usize,
    /// Per-call timeout in milliseconds (default: 30000).
    pub call_timeout_ms: u64,
    /// Whole-run timeout in seconds (default: 1800).
    pub run_timeout_secs: u64,
    /// Joins appended rules to existing instructions (default: blank line).
    pub instruction_separator: String,
    pub winner_tie_break: WinnerTieBreak,
    /// Fixed seed for reproducible runs.
    pub rng_seed: Option<u64>,
}

impl Default for AscentConfig {
    fn default() -> Self {
        Self {
            steps: 8,
            batch_size: 8,
            trajectories_per_example: 3,
            candidates_per_step: 4,
            informative_buckets: 1,
            sampling_temperature: 0.2,
            candidate_temperature: 0.05,
            max_demos: 4,
            demo_score_floor: 0.0,
            mutator_weights: MutatorWeights::default(),
            max_concurrency: 8,
            call_timeout_ms: 30_000,
            run_timeout_secs: 1_800,
            instruction_separator: "\n\n".into(),
            winner_tie_break: WinnerTieBreak::default(),
            rng_seed: None,
        }
    }
}

impl AscentConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("steps", self.steps as u64),
            ("batch_size", self.batch_size as u64),
            ("trajectories_per_example", self.trajectories_per_example as u64),
            ("candidates_per_step", self.candidates_per_step as u64),
            ("informative_buckets", self.informative_buckets as u64),
            ("max_concurrency", self.max_concurrency as u64),
            ("call_timeout_ms", self.call_timeout_ms),
            ("run_timeout_secs", self.run_timeout_secs),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than 0")));
        }
        for (name, t) in [
            ("sampling_temperature", self.sampling_temperature),
            ("candidate_temperature", self.candidate_temperature),
        ] {
            if !t.is_finite() || t < 0.0 {
                return Err(ConfigError::Invalid(format!("{name} must be >= 0")));
            }
        }
        if !self.demo_score_floor.is_finite() {
            return Err(ConfigError::Invalid("demo_score_floor must be finite".into()));
        }
        self.mutator_weights.validate()
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Scheduling and trigger policy of the continuous controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Quality below this triggers an optimization (default: 0.7).
    pub quality_threshold: f64,
    /// Seconds between scheduled optimization checks (default: 86400).
    pub optimization_interval_secs: u64,
    /// Seconds between quality checks (default: 3600).
    pub quality_check_interval_secs: u64,
    /// Validation examples scored per quality check (default: 10).
    pub validation_sample_size: usize,
    /// Quality entries retained (default: 50).
    pub history_capacity: usize,
    /// Entries used for trend detection, at most 5 (default: 5).
    pub trend_window: usize,
    /// Minimum seconds between optimizations on a declining trend (default: 43200).
    pub min_optimization_gap_secs: u64,
    /// Optimize anyway once this long has passed without one (default: 172800).
    pub overdue_after_secs: u64,
    /// Quality recorded when nothing better is known (default: 0.5).
    pub neutral_quality: f64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            quality_threshold: 0.7,
            optimization_interval_secs: 86_400,
            quality_check_interval_secs: 3_600,
            validation_sample_size: 10,
            history_capacity: 50,
            trend_window: 5,
            min_optimization_gap_secs: 43_200,
            overdue_after_secs: 172_800,
            neutral_quality: 0.5,
        }
    }
}

impl ControllerConfig {
    pub fn optimization_interval(&self) -> Duration {
        Duration::from_secs(self.optimization_interval_secs)
    }

    pub fn quality_check_interval(&self) -> Duration {
        Duration::from_secs(self.quality_check_interval_secs)
    }

    pub fn min_optimization_gap(&self) -> Duration {
        Duration::from_secs(self.min_optimization_gap_secs)
    }

    pub fn overdue_after(&self) -> Duration {
        Duration::from_secs(self.overdue_after_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let unit = |v: f64| v.is_finite() && (0.0..=1.0).contains(&v);
        if !unit(self.quality_threshold) {
            return Err(ConfigError::Invalid("quality_threshold must be in [0, 1]".into()));
        }
        if !unit(self.neutral_quality) {
            return Err(ConfigError::Invalid("neutral_quality must be in [0, 1]".into()));
        }
        if self.optimization_interval_secs == 0 || self.quality_check_interval_secs == 0 {
            return Err(ConfigError::Invalid("timer intervals must be greater than 0".into()));
        }
        if self.validation_sample_size == 0 {
            return Err(ConfigError::Invalid(
                "validation_sample_size must be greater than 0".into(),
            ));
        }
        if self.history_capacity == 0 {
            return Err(ConfigError::Invalid("history_capacity must be greater than 0".into()));
        }
        if !(2..=5).contains(&self.trend_window) {
            return Err(ConfigError::Invalid("trend_window must be between 2 and 5".into()));
        }
        Ok(())
    }
}

/// A partial [`ControllerConfig`]; present fields replace the current ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfigUpdate {
    pub quality_threshold: Option<f64>,
    pub optimization_interval_secs: Option<u64>,
    pub quality_check_interval_secs: Option<u64>,
    pub validation_sample_size: Option<usize>,
    pub history_capacity: Option<usize>,
    pub trend_window: Option<usize>,
    pub min_optimization_gap_secs: Option<u64>,
    pub overdue_after_secs: Option<u64>,
    pub neutral_quality: Option<f64>,
}

impl ControllerConfigUpdate {
    /// Merge into a copy of `base` and validate the result.
    pub fn apply(&self, base: &ControllerConfig) -> Result<ControllerConfig, ConfigError> {
        let mut merged = base.clone();
        if let Some(v) = self.quality_threshold {
            merged.quality_threshold = v;
        }
        if let Some(v) = self.optimization_interval_secs {
            merged.optimization_interval_secs = v;
        }
        if let Some(v) = self.quality_check_interval_secs {
            merged.quality_check_interval_secs = v;
        }
        if let Some(v) = self.validation_sample_size {
            merged.validation_sample_size = v;
        }
        if let Some(v) = self.history_capacity {
            merged.history_capacity = v;
        }
        if let Some(v) = self.trend_window {
            merged.trend_window = v;
        }
        if let Some(v) = self.min_optimization_gap_secs {
            merged.min_optimization_gap_secs = v;
        }
        if let Some(v) = self.overdue_after_secs {
            merged.overdue_after_secs = v;
        }
        if let Some(v) = self.neutral_quality {
            merged.neutral_quality = v;
        }
        merged.validate()?;
        Ok(merged)
    }
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// Endpoints used by the CLI's language-model runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Base URL for the program model API.
    pub api_base: String,
    /// Model that executes programs (e.g., "gpt-4o-mini").
    pub model_id: String,
    pub api_key: String,
    /// Base URL for the teacher (critic) model API.
    pub teacher_api_base: String,
    /// Model that critiques trajectories (e.g., "gpt-4o").
    pub teacher_model_id: String,
    pub teacher_api_key: String,
    /// Sampling temperature for program execution (default: 0.7).
    pub temperature: f64,
    /// Completion token cap (default: 1024).
    pub max_tokens: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".into(),
            model_id: "gpt-4o-mini".into(),
            api_key: String::new(),
            teacher_api_base: "https://api.openai.com/v1".into(),
            teacher_model_id: "gpt-4o".into(),
            teacher_api_key: String::new(),
            temperature: 0.7,
            max_tokens: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = OptimizerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.ascent.candidates_per_step, 4);
        assert_eq!(config.controller.min_optimization_gap(), Duration::from_secs(12 * 3600));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: OptimizerConfig =
            serde_json::from_str(r#"{"ascent": {"steps": 3, "winner_tie_break": "simplest"}}"#)
                .unwrap();
        assert_eq!(config.ascent.steps, 3);
        assert_eq!(config.ascent.batch_size, 8);
        assert_eq!(config.ascent.winner_tie_break, WinnerTieBreak::Simplest);
        assert_eq!(config.controller, ControllerConfig::default());
    }

    #[test]
    fn rejects_zero_steps_and_bad_weights() {
        let config = AscentConfig {
            steps: 0,
            ..AscentConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(msg)) if msg.contains("steps")));

        let config = AscentConfig {
            mutator_weights: MutatorWeights {
                demo_append: 0.0,
                rule_append: 0.0,
            },
            ..AscentConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn update_merges_present_fields_only() {
        let base = ControllerConfig::default();
        let update = ControllerConfigUpdate {
            quality_threshold: Some(0.9),
            quality_check_interval_secs: Some(60),
            ..Default::default()
        };
        let merged = update.apply(&base).unwrap();
        assert_eq!(merged.quality_threshold, 0.9);
        assert_eq!(merged.quality_check_interval_secs, 60);
        assert_eq!(merged.optimization_interval_secs, base.optimization_interval_secs);
    }

    #[test]
    fn invalid_update_is_rejected() {
        let update = ControllerConfigUpdate {
            quality_threshold: Some(1.5),
            ..Default::default()
        };
        assert!(update.apply(&ControllerConfig::default()).is_err());
    }
}
