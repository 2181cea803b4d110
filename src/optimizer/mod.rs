//! Program search.
//!
//! - [`pool::ProgramPool`] -- every candidate of a run with running scores and
//!   temperature sampling.
//! - [`mutator`] -- demonstration-append and rule-append, plus the [`Critic`]
//!   contract rule-append depends on.
//! - [`ascent::MiniBatchAscent`] -- the step loop and final selection.

pub mod ascent;
pub mod mutator;
pub mod pool;

pub use ascent::{AscentOutcome, DegradedReason, MiniBatchAscent, StepReport};
pub use mutator::{
    Critic, Critique, CritiqueRequest, DemoAppend, Mutators, ProgramCritic, RuleAppend,
    TrajectorySummary,
};
pub use pool::{PoolEntry, ProgramPool};
