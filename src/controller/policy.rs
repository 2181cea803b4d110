//! When to optimize, and how hard.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::history::{QualityHistory, QualityTrend};
use crate::config::{AscentConfig, ControllerConfig};

const LOW_QUALITY: f64 = 0.5;
const HIGH_QUALITY: f64 = 0.8;
const STRUGGLING_QUALITY: f64 = 0.6;
const STRUGGLING_WINDOW: usize = 5;
const STRUGGLING_COUNT: usize = 3;

/// What started an optimization run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    Manual,
    Scheduled,
    LowQuality,
    DecliningTrend,
    Overdue,
}

impl std::fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Manual => "manual",
            Self::Scheduled => "scheduled",
            Self::LowQuality => "low_quality",
            Self::DecliningTrend => "declining_trend",
            Self::Overdue => "overdue",
        };
        f.write_str(label)
    }
}

/// Decide after a quality check whether to optimize right away.
///
/// `since_last` is the time since the last successful optimization, or since
/// the controller started if there has been none. Failed runs do not reset it.
pub fn optimization_due(
    config: &ControllerConfig,
    current_quality: Option<f64>,
    trend: QualityTrend,
    since_last: Duration,
) -> Option<TriggerReason> {
    if current_quality.is_some_and(|q| q < config.quality_threshold) {
        return Some(TriggerReason::LowQuality);
    }
    if trend == QualityTrend::Declining && since_last >= config.min_optimization_gap() {
        return Some(TriggerReason::DecliningTrend);
    }
    if since_last >= config.overdue_after() {
        return Some(TriggerReason::Overdue);
    }
    None
}

/// Scale the ascent budget to recent quality.
///
/// Poor current quality widens each step, good quality narrows it, and a run
/// of poor checks buys extra steps.
pub fn adapt_ascent_config(base: &AscentConfig, history: &QualityHistory) -> AscentConfig {
    let mut adapted = base.clone();

    if let Some(current) = history.current_quality() {
        if current < LOW_QUALITY {
            adapted.candidates_per_step = (base.candidates_per_step as f64 * 1.5).ceil() as usize;
        } else if current > HIGH_QUALITY {
            adapted.candidates_per_step =
                ((base.candidates_per_step as f64 * 0.8).floor() as usize).max(1);
        }
    }

    let struggling = history
        .recent(STRUGGLING_WINDOW)
        .iter()
        .filter(|&&q| q < STRUGGLING_QUALITY)
        .count();
    if struggling >= STRUGGLING_COUNT {
        adapted.steps = (base.steps as f64 * 1.5).ceil() as usize;
    }

    adapted
}
