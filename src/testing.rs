//! Scripted collaborators shared by unit tests.
//!
//! Examples are `{"q": n}` with expected `{"answer": 2n}`. A
//! [`ScriptedRunner`] answers correctly when the program "knows" `n`:
//! a demonstration covers `n`, or `n` is below the program's coverage (a
//! base coverage plus one per `Tip:` rule in its instructions). Unknown
//! examples can still be answered correctly on every k-th call, which gives
//! buckets the spread a real sampled model would.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::json;
use tokio::sync::Semaphore;

use crate::error::{ExecutionError, ExecutionErrorKind};
use crate::optimizer::mutator::{Critic, Critique, CritiqueRequest};
use crate::program::{Example, Fields, Program, Signature};
use crate::trajectory::ProgramRunner;

/// Instructions containing this make every answer wrong.
pub(crate) const BROKEN_RULE: &str = "Always answer -1.";

pub(crate) fn seed_program() -> Program {
    Program::new(Signature::new(["q"], ["answer"]), "Double q.")
}

pub(crate) fn examples(n: usize) -> Vec<Example> {
    (0..n)
        .map(|i| {
            Example::new(
                i.to_string(),
                Fields::from([("q".to_string(), json!(i))]),
                Fields::from([("answer".to_string(), json!(i * 2))]),
            )
        })
        .collect()
}

pub(crate) fn answer_metric(example: &Example, prediction: &Fields) -> f64 {
    match (example.outputs.get("answer"), prediction.get("answer")) {
        (Some(expected), Some(actual)) if expected == actual => 1.0,
        _ => 0.0,
    }
}

fn query(inputs: &Fields) -> Option<u64> {
    inputs.get("q").and_then(|v| v.as_u64())
}

/// Deterministic coverage of `n` by `program` (ignores lucky calls).
pub(crate) fn knows(program: &Program, base_coverage: u64, n: u64) -> bool {
    if program.instructions.contains(BROKEN_RULE) {
        return false;
    }
    if program
        .demonstrations
        .iter()
        .any(|d| query(&d.inputs) == Some(n))
    {
        return true;
    }
    let tips = program.instructions.matches("Tip:").count() as u64;
    n < base_coverage.saturating_add(tips)
}

/// Fraction of `set` that `program` covers deterministically.
pub(crate) fn true_quality(program: &Program, base_coverage: u64, set: &[Example]) -> f64 {
    let covered = set
        .iter()
        .filter(|e| query(&e.inputs).is_some_and(|n| knows(program, base_coverage, n)))
        .count();
    covered as f64 / set.len() as f64
}

pub(crate) struct ScriptedRunner {
    base_coverage: u64,
    lucky_every: usize,
    failing: HashSet<u64>,
    slow: HashMap<u64, Duration>,
    gate: Option<Arc<Semaphore>>,
    calls: AtomicUsize,
}

impl ScriptedRunner {
    /// Every program answers every example correctly.
    pub(crate) fn correct() -> Self {
        Self::partial(u64::MAX, 0)
    }

    /// Programs cover `q < base_coverage`; unknown examples are answered
    /// correctly on every `lucky_every`-th call (never if 0).
    pub(crate) fn partial(base_coverage: u64, lucky_every: usize) -> Self {
        Self {
            base_coverage,
            lucky_every,
            failing: HashSet::new(),
            slow: HashMap::new(),
            gate: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn failing_on<const N: usize>(mut self, qs: [&str; N]) -> Self {
        self.failing
            .extend(qs.iter().filter_map(|q| q.parse::<u64>().ok()));
        self
    }

    pub(crate) fn slow_on<const N: usize>(mut self, qs: [&str; N], delay: Duration) -> Self {
        for q in qs.iter().filter_map(|q| q.parse::<u64>().ok()) {
            self.slow.insert(q, delay);
        }
        self
    }

    /// Every call waits for (and consumes) a permit from `gate`.
    pub(crate) fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ProgramRunner for ScriptedRunner {
    fn execute<'a>(
        &'a self,
        program: &'a Program,
        inputs: &'a Fields,
    ) -> BoxFuture<'a, Result<Fields, ExecutionError>> {
        Box::pin(async move {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;

            if let Some(gate) = &self.gate {
                let permit = gate.acquire().await.map_err(|_| {
                    ExecutionError::new(ExecutionErrorKind::CircuitOpen, "gate closed")
                })?;
                permit.forget();
            }

            let n = query(inputs).ok_or_else(|| {
                ExecutionError::new(ExecutionErrorKind::InvalidResponse, "missing q")
            })?;

            if let Some(delay) = self.slow.get(&n) {
                tokio::time::sleep(*delay).await;
            }
            if self.failing.contains(&n) {
                return Err(ExecutionError::new(
                    ExecutionErrorKind::ProviderError,
                    format!("scripted failure for q={n}"),
                ));
            }

            let lucky = self.lucky_every > 0 && call % self.lucky_every == 0;
            let answer = if !program.instructions.contains(BROKEN_RULE)
                && (knows(program, self.base_coverage, n) || lucky)
            {
                json!(n * 2)
            } else {
                json!(-1)
            };
            Ok(Fields::from([("answer".to_string(), answer)]))
        })
    }
}

/// Critic that hands out numbered `Tip:` rules (or a fixed piece of advice).
pub(crate) struct ScriptedCritic {
    advice: Option<String>,
    fail: bool,
    requests: AtomicUsize,
}

impl ScriptedCritic {
    pub(crate) fn tips() -> Self {
        Self {
            advice: None,
            fail: false,
            requests: AtomicUsize::new(0),
        }
    }

    pub(crate) fn fixed(advice: &str) -> Self {
        Self {
            advice: Some(advice.to_string()),
            ..Self::tips()
        }
    }

    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Self::tips()
        }
    }

    pub(crate) fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Critic for ScriptedCritic {
    fn critique<'a>(
        &'a self,
        request: &'a CritiqueRequest,
    ) -> BoxFuture<'a, Result<Critique, ExecutionError>> {
        Box::pin(async move {
            let n = self.requests.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                return Err(ExecutionError::new(
                    ExecutionErrorKind::RateLimited,
                    "scripted critic failure",
                ));
            }
            let advice = self
                .advice
                .clone()
                .unwrap_or_else(|| format!("Tip: lesson {n}."));
            Ok(Critique {
                discussion: format!(
                    "better scored {:.2}, worse scored {:.2}",
                    request.better_score, request.worse_score
                ),
                advice,
            })
        })
    }
}
