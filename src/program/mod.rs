//! Programs, examples, and their on-disk form.
//!
//! - [`types`] -- [`Program`], [`Signature`], [`Example`], [`Demonstration`],
//!   and the [`Lineage`] recording which mutator produced a program.
//! - [`dataset`] -- JSON load/save helpers used by the CLI.

pub mod dataset;
pub mod types;

pub use dataset::{load_examples, parse_examples};
pub use types::{Demonstration, Example, Fields, Lineage, MutatorKind, Program, Signature};
