//! Quality metrics.
//!
//! A metric maps an example and a prediction to a score in `[0, 1]`. It must
//! be pure and deterministic; the optimizer calls it once per successful
//! trajectory and never for failed ones.

use crate::program::{Example, Fields};

/// Scores a prediction against an example's expected outputs.
pub trait Metric: Send + Sync {
    fn score(&self, example: &Example, prediction: &Fields) -> f64;
}

impl<F> Metric for F
where
    F: Fn(&Example, &Fields) -> f64 + Send + Sync,
{
    fn score(&self, example: &Example, prediction: &Fields) -> f64 {
        self(example, prediction)
    }
}

/// Force a raw metric value into `[0, 1]`. NaN becomes 0.
pub fn clamp_score(raw: f64) -> f64 {
    if raw.is_nan() {
        0.0
    } else {
        raw.clamp(0.0, 1.0)
    }
}

/// Fraction of expected output fields whose predicted value matches.
///
/// Strings are compared trimmed and case-insensitively; other JSON values
/// must be equal. Examples without expected outputs score 0.
#[derive(Debug, Clone, Default)]
pub struct ExactMatch {
    /// Restrict the comparison to these fields (all expected fields if `None`).
    pub fields: Option<Vec<String>>,
}

impl ExactMatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_fields<I>(fields: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            fields: Some(fields.into_iter().map(Into::into).collect()),
        }
    }
}

impl Metric for ExactMatch {
    fn score(&self, example: &Example, prediction: &Fields) -> f64 {
        let keys: Vec<&String> = match &self.fields {
            Some(fields) => fields
                .iter()
                .filter(|f| example.outputs.contains_key(*f))
                .collect(),
            None => example.outputs.keys().collect(),
        };
        if keys.is_empty() {
            return 0.0;
        }

        let matched = keys
            .iter()
            .filter(|key| {
                match (example.outputs.get(**key), prediction.get(**key)) {
                    (Some(expected), Some(actual)) => values_match(expected, actual),
                    _ => false,
                }
            })
            .count();

        matched as f64 / keys.len() as f64
    }
}

fn values_match(expected: &serde_json::Value, actual: &serde_json::Value) -> bool {
    match (expected.as_str(), actual.as_str()) {
        (Some(a), Some(b)) => a.trim().eq_ignore_ascii_case(b.trim()),
        _ => expected == actual,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn example() -> Example {
        Example::new(
            "e1",
            Fields::from([("q".into(), json!("capital of France?"))]),
            Fields::from([
                ("answer".into(), json!("Paris")),
                ("year".into(), json!(1789)),
            ]),
        )
    }

    #[test]
    fn exact_match_partial_credit() {
        let prediction = Fields::from([
            ("answer".into(), json!("  paris ")),
            ("year".into(), json!(1790)),
        ]);
        let score = ExactMatch::new().score(&example(), &prediction);
        assert!((score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn exact_match_restricted_fields() {
        let prediction = Fields::from([("answer".into(), json!("Paris"))]);
        let score = ExactMatch::on_fields(["answer"]).score(&example(), &prediction);
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn exact_match_without_labels_scores_zero() {
        let unlabeled = Example::new("e2", Fields::new(), Fields::new());
        assert_eq!(ExactMatch::new().score(&unlabeled, &Fields::new()), 0.0);
    }

    #[test]
    fn closures_are_metrics() {
        let always_half = |_: &Example, _: &Fields| 0.5;
        assert_eq!(always_half.score(&example(), &Fields::new()), 0.5);
    }

    #[test]
    fn clamp_score_bounds() {
        assert_eq!(clamp_score(f64::NAN), 0.0);
        assert_eq!(clamp_score(-0.2), 0.0);
        assert_eq!(clamp_score(1.7), 1.0);
        assert_eq!(clamp_score(0.3), 0.3);
    }
}
