//! Core program data types.
//!
//! A **program** is the unit being optimized: a signature (which input and
//! output fields it works with), free-text instructions, and an ordered list
//! of few-shot demonstrations. Programs are immutable values. Every mutation
//! produces a new program with a fresh id and a [`Lineage`] pointing back at
//! its parent.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Named field values flowing into or out of a program.
///
/// Field names are data rather than struct shape, so one `Program` type can
/// describe any signature.
pub type Fields = BTreeMap<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// Signature
// ---------------------------------------------------------------------------

/// The input/output contract of a program.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    /// Names of the input fields, in presentation order.
    pub inputs: Vec<String>,
    /// Names of the output fields, in presentation order.
    pub outputs: Vec<String>,
    /// Optional one-line description of what the program does.
    #[serde(default)]
    pub description: String,
}

impl Signature {
    pub fn new<I, O>(inputs: I, outputs: O) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
        O: IntoIterator,
        O::Item: Into<String>,
    {
        Self {
            inputs: inputs.into_iter().map(Into::into).collect(),
            outputs: outputs.into_iter().map(Into::into).collect(),
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Render as `question, context -> answer` followed by the description.
    pub fn describe(&self) -> String {
        let arrow = format!("{} -> {}", self.inputs.join(", "), self.outputs.join(", "));
        if self.description.is_empty() {
            arrow
        } else {
            format!("{arrow}: {}", self.description)
        }
    }
}

// ---------------------------------------------------------------------------
// Examples and demonstrations
// ---------------------------------------------------------------------------

/// One labeled training example.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    /// Stable identifier used to bucket trajectories.
    pub id: String,
    pub inputs: Fields,
    /// Expected outputs, consumed only by the metric.
    #[serde(default)]
    pub outputs: Fields,
}

impl Example {
    pub fn new(id: impl Into<String>, inputs: Fields, outputs: Fields) -> Self {
        Self {
            id: id.into(),
            inputs,
            outputs,
        }
    }
}

/// A few-shot input/output pair attached to a program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Demonstration {
    /// Input field values shown to the model.
    pub inputs: Fields,
    /// The outputs presented as the correct answer.
    pub outputs: Fields,
}

// ---------------------------------------------------------------------------
// Lineage
// ---------------------------------------------------------------------------

/// Which strategy derived a program from its parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutatorKind {
    DemoAppend,
    RuleAppend,
}

impl MutatorKind {
    /// The strategy to try when this one fails for a slot.
    pub fn other(self) -> Self {
        match self {
            Self::DemoAppend => Self::RuleAppend,
            Self::RuleAppend => Self::DemoAppend,
        }
    }
}

impl std::fmt::Display for MutatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DemoAppend => write!(f, "demo_append"),
            Self::RuleAppend => write!(f, "rule_append"),
        }
    }
}

/// Where a program came from. `None` on a [`Program`] marks the original seed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lineage {
    /// Id of the program this one was derived from.
    pub parent_id: String,
    /// The mutator that produced it.
    pub mutator: MutatorKind,
}

// ---------------------------------------------------------------------------
// Program
// ---------------------------------------------------------------------------

/// An immutable instruction + demonstration configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    /// Unique identifier (UUID v4).
    pub id: String,
    pub signature: Signature,
    pub instructions: String,
    /// Oldest first.
    #[serde(default)]
    pub demonstrations: Vec<Demonstration>,
    #[serde(default)]
    pub lineage: Option<Lineage>,
}

impl Program {
    /// Create a seed program with a fresh id and no demonstrations.
    pub fn new(signature: Signature, instructions: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            signature,
            instructions: instructions.into(),
            demonstrations: Vec::new(),
            lineage: None,
        }
    }

    /// Whether this program was derived by a mutator (as opposed to seeded).
    pub fn is_derived(&self) -> bool {
        self.lineage.is_some()
    }

    /// Derive a child with `demo` appended.
    ///
    /// When the program already holds `max_demos` demonstrations, the oldest
    /// ones are evicted first so the child holds exactly `max_demos`. Returns
    /// `None` if `max_demos` is zero.
    pub fn with_demonstration(&self, demo: Demonstration, max_demos: usize) -> Option<Self> {
        if max_demos == 0 {
            return None;
        }

        let mut demonstrations = self.demonstrations.clone();
        let overflow = (demonstrations.len() + 1).saturating_sub(max_demos);
        demonstrations.drain(..overflow.min(demonstrations.len()));
        demonstrations.push(demo);

        Some(self.derive(
            MutatorKind::DemoAppend,
            self.instructions.clone(),
            demonstrations,
        ))
    }

    /// Derive a child whose instructions have `rule` appended after `separator`.
    ///
    /// Prior instructions are preserved verbatim.
    pub fn with_rule(&self, rule: &str, separator: &str) -> Self {
        let instructions = if self.instructions.trim().is_empty() {
            rule.to_string()
        } else {
            format!("{}{separator}{rule}", self.instructions)
        };
        self.derive(
            MutatorKind::RuleAppend,
            instructions,
            self.demonstrations.clone(),
        )
    }

    fn derive(
        &self,
        mutator: MutatorKind,
        instructions: String,
        demonstrations: Vec<Demonstration>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            signature: self.signature.clone(),
            instructions,
            demonstrations,
            lineage: Some(Lineage {
                parent_id: self.id.clone(),
                mutator,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn demo(n: i64) -> Demonstration {
        Demonstration {
            inputs: Fields::from([("q".to_string(), json!(n))]),
            outputs: Fields::from([("a".to_string(), json!(n * 2))]),
        }
    }

    fn seed() -> Program {
        Program::new(Signature::new(["q"], ["a"]), "Double the number.")
    }

    #[test]
    fn demo_append_below_cap_keeps_existing() {
        let parent = seed().with_demonstration(demo(1), 3).unwrap();
        let child = parent.with_demonstration(demo(2), 3).unwrap();

        assert_eq!(child.demonstrations, vec![demo(1), demo(2)]);
        assert_ne!(child.id, parent.id);
        assert_eq!(
            child.lineage,
            Some(Lineage {
                parent_id: parent.id.clone(),
                mutator: MutatorKind::DemoAppend,
            })
        );
    }

    #[test]
    fn demo_append_at_cap_evicts_oldest() {
        let mut program = seed();
        for n in 0..3 {
            program = program.with_demonstration(demo(n), 3).unwrap();
        }
        assert_eq!(program.demonstrations.len(), 3);

        let child = program.with_demonstration(demo(9), 3).unwrap();
        assert_eq!(child.demonstrations.len(), 3);
        assert_eq!(child.demonstrations, vec![demo(1), demo(2), demo(9)]);
        // The parent is untouched.
        assert_eq!(program.demonstrations, vec![demo(0), demo(1), demo(2)]);
    }

    #[test]
    fn demo_append_with_zero_capacity_is_refused() {
        assert!(seed().with_demonstration(demo(1), 0).is_none());
    }

    #[test]
    fn rule_append_preserves_prior_instructions() {
        let parent = seed();
        let child = parent.with_rule("Show your work.", "\n\n");
        assert_eq!(child.instructions, "Double the number.\n\nShow your work.");
        assert_eq!(child.lineage.unwrap().mutator, MutatorKind::RuleAppend);

        let blank = Program::new(Signature::new(["q"], ["a"]), "  ");
        assert_eq!(blank.with_rule("Be brief.", "\n").instructions, "Be brief.");
    }

    #[test]
    fn signature_describe() {
        let sig = Signature::new(["question", "context"], ["answer"]);
        assert_eq!(sig.describe(), "question, context -> answer");
        let sig = sig.with_description("answer from context");
        assert_eq!(sig.describe(), "question, context -> answer: answer from context");
    }
}
