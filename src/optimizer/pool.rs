//! The candidate program pool.
//!
//! Holds every program produced during one ascent run together with a
//! running estimate of its quality. The pool only grows: entries are never
//! removed mid-run, and re-registering a known program blends the new score
//! into its running mean instead of replacing it.

use std::collections::HashMap;

use rand::distributions::WeightedIndex;
use rand::prelude::Distribution;
use rand::Rng;

use crate::program::Program;

/// Temperatures at or below this are treated as "pick the best".
const MIN_TEMPERATURE: f64 = 1e-9;

/// One program and its score estimate.
#[derive(Debug, Clone)]
pub struct PoolEntry {
    pub program: Program,
    /// Simple running mean of every mini-batch score registered for the program.
    pub running_score: f64,
    pub times_evaluated: usize,
    /// Insertion order; breaks ties in [`ProgramPool::best`].
    pub seq: usize,
}

/// Every candidate program of one run.
#[derive(Debug, Clone)]
pub struct ProgramPool {
    entries: Vec<PoolEntry>,
    index: HashMap<String, usize>,
}

impl ProgramPool {
    /// Create a pool holding only `seed`, not yet evaluated.
    pub fn new(seed: Program) -> Self {
        let mut pool = Self {
            entries: Vec::new(),
            index: HashMap::new(),
        };
        pool.insert(seed, 0.0, 0);
        pool
    }

    fn insert(&mut self, program: Program, running_score: f64, times_evaluated: usize) {
        let seq = self.entries.len();
        self.index.insert(program.id.clone(), seq);
        self.entries.push(PoolEntry {
            program,
            running_score,
            times_evaluated,
            seq,
        });
    }

    /// Add `program` with `score`, or fold `score` into its running mean if
    /// the id is already present.
    pub fn register(&mut self, program: Program, score: f64) {
        match self.index.get(&program.id) {
            Some(&i) => {
                let entry = &mut self.entries[i];
                let n = entry.times_evaluated as f64;
                entry.running_score = (entry.running_score * n + score) / (n + 1.0);
                entry.times_evaluated += 1;
            }
            None => self.insert(program, score, 1),
        }
    }

    /// Draw one program with probability proportional to
    /// `exp(running_score / temperature)`.
    ///
    /// A single-entry pool always returns its entry, and a temperature of
    /// (effectively) zero returns [`best`](Self::best).
    pub fn sample<R: Rng + ?Sized>(&self, temperature: f64, rng: &mut R) -> &Program {
        if self.entries.len() == 1 || temperature <= MIN_TEMPERATURE {
            return self.best();
        }

        // Shift by the max so the largest weight is exactly 1.
        let max = self
            .entries
            .iter()
            .map(|e| e.running_score)
            .fold(f64::NEG_INFINITY, f64::max);
        let weights = self
            .entries
            .iter()
            .map(|e| ((e.running_score - max) / temperature).exp());

        match WeightedIndex::new(weights) {
            Ok(dist) => &self.entries[dist.sample(rng)].program,
            Err(_) => self.best(),
        }
    }

    /// The program with the highest running score; ties go to the earliest
    /// registered.
    pub fn best(&self) -> &Program {
        &self.best_entry().program
    }

    pub fn best_entry(&self) -> &PoolEntry {
        // `new` always inserts the seed, so the pool is never empty.
        let mut best = &self.entries[0];
        for entry in &self.entries[1..] {
            if entry.running_score > best.running_score {
                best = entry;
            }
        }
        best
    }

    pub fn get(&self, id: &str) -> Option<&PoolEntry> {
        self.index.get(id).map(|&i| &self.entries[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn entries(&self) -> &[PoolEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
