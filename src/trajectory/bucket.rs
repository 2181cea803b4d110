//! Per-example bucketing and informativeness ranking.
//!
//! After a step's trajectories return, they are grouped by example. An
//! example where some program did well and another did badly (a large
//! `gap`) says the most about what separates good programs from bad ones, so
//! buckets are ranked by gap.

use std::collections::HashMap;

use ordered_float::OrderedFloat;

use super::types::Trajectory;

/// All trajectories for one example within a step.
#[derive(Debug, Clone)]
pub struct Bucket {
    pub example_id: String,
    /// Sorted by score, best first.
    trajectories: Vec<Trajectory>,
    /// `max score - min score`.
    pub gap: f64,
}

impl Bucket {
    /// Build a bucket from trajectories that all share `example_id`.
    ///
    /// Returns `None` if `trajectories` is empty or mixes examples.
    pub fn new(example_id: impl Into<String>, mut trajectories: Vec<Trajectory>) -> Option<Self> {
        let example_id = example_id.into();
        if trajectories.is_empty() || trajectories.iter().any(|t| t.example_id != example_id) {
            return None;
        }

        // Stable sort keeps execution order among equal scores.
        trajectories.sort_by_key(|t| std::cmp::Reverse(OrderedFloat(t.score)));
        let best = trajectories[0].score;
        let worst = trajectories[trajectories.len() - 1].score;

        Some(Self {
            example_id,
            trajectories,
            gap: best - worst,
        })
    }

    pub fn trajectories(&self) -> &[Trajectory] {
        &self.trajectories
    }

    pub fn len(&self) -> usize {
        self.trajectories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trajectories.is_empty()
    }

    pub fn best(&self) -> &Trajectory {
        &self.trajectories[0]
    }

    pub fn worst(&self) -> &Trajectory {
        &self.trajectories[self.trajectories.len() - 1]
    }

    pub fn best_score(&self) -> f64 {
        self.best().score
    }

    /// Whether the bucket separates a better trajectory from a worse one.
    pub fn is_informative(&self) -> bool {
        self.gap > 0.0
    }
}

/// Group trajectories by example and rank buckets most informative first.
///
/// Ordering: `gap` descending, then best score descending, then first
/// appearance of the example in `trajectories`.
pub fn bucket_trajectories(trajectories: Vec<Trajectory>) -> Vec<Bucket> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<Trajectory>> = HashMap::new();
    for t in trajectories {
        if !groups.contains_key(&t.example_id) {
            order.push(t.example_id.clone());
        }
        groups.entry(t.example_id.clone()).or_default().push(t);
    }

    let mut buckets: Vec<Bucket> = order
        .into_iter()
        .filter_map(|id| {
            let group = groups.remove(&id)?;
            Bucket::new(id, group)
        })
        .collect();

    buckets.sort_by(|a, b| {
        OrderedFloat(b.gap)
            .cmp(&OrderedFloat(a.gap))
            .then_with(|| OrderedFloat(b.best_score()).cmp(&OrderedFloat(a.best_score())))
    });
    buckets
}
