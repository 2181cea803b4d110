//! Language-model plumbing for the CLI.
//!
//! This module provides:
//! - [`api::LlmClient`] -- OpenAI-compatible chat completion client whose
//!   failures are classified as [`ExecutionError`](crate::error::ExecutionError)s.
//! - [`prompt`] -- renders a program and its inputs as chat messages and
//!   parses the JSON reply.
//! - [`runner::LlmRunner`] -- the [`ProgramRunner`](crate::trajectory::ProgramRunner)
//!   built from the two.

pub mod api;
pub mod prompt;
pub mod runner;

pub use api::{ChatMessage, ChatResponse, Choice, LlmClient, Usage};
pub use runner::LlmRunner;
