//! Quality history and trend detection.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Trend detection never looks at more than this many entries.
pub const MAX_TREND_WINDOW: usize = 5;

/// Mean differences within this band count as stable.
const TREND_TOLERANCE: f64 = 0.05;

/// Where a recorded quality value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualitySource {
    /// Scored on a validation sample.
    Validation,
    /// The original program's last full training-set score.
    LastKnownScore,
    /// Nothing was known; the configured neutral value.
    Neutral,
}

/// One quality check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityEntry {
    pub timestamp: DateTime<Utc>,
    pub quality: f64,
    pub program_id: String,
    pub source: QualitySource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTrend {
    Improving,
    Declining,
    Stable,
    InsufficientData,
}

impl std::fmt::Display for QualityTrend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Improving => write!(f, "improving"),
            Self::Declining => write!(f, "declining"),
            Self::Stable => write!(f, "stable"),
            Self::InsufficientData => write!(f, "insufficient_data"),
        }
    }
}

/// Bounded, chronological record of quality checks; the oldest entry is
/// dropped once `capacity` is reached.
#[derive(Debug, Clone)]
pub struct QualityHistory {
    entries: VecDeque<QualityEntry>,
    capacity: usize,
}

impl QualityHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, entry: QualityEntry) {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Shrinking drops the oldest entries.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    pub fn latest(&self) -> Option<&QualityEntry> {
        self.entries.back()
    }

    pub fn current_quality(&self) -> Option<f64> {
        self.latest().map(|e| e.quality)
    }

    /// The last `n` qualities, oldest first.
    pub fn recent(&self, n: usize) -> Vec<f64> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).map(|e| e.quality).collect()
    }

    /// Trend over the last `window` entries (capped at [`MAX_TREND_WINDOW`]).
    ///
    /// The window is listed most recent first and split in half; the trend is
    /// the mean of the second half minus the mean of the first. With an odd
    /// count the extra entry goes to the second half.
    pub fn trend(&self, window: usize) -> QualityTrend {
        let mut listed = self.recent(window.min(MAX_TREND_WINDOW));
        if listed.len() < 2 {
            return QualityTrend::InsufficientData;
        }
        listed.reverse();
        let (first, second) = listed.split_at(listed.len() / 2);
        let diff = mean(second) - mean(first);
        if diff > TREND_TOLERANCE {
            QualityTrend::Improving
        } else if diff < -TREND_TOLERANCE {
            QualityTrend::Declining
        } else {
            QualityTrend::Stable
        }
    }

    pub fn entries(&self) -> Vec<QualityEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}
