//! promptascent: adaptive optimization of language-model programs.
//!
//! A program is a set of instructions plus few-shot demonstrations. The
//! [`optimizer`] searches for better programs by mini-batch ascent over a
//! labeled training set, and the [`controller`] keeps a deployed program
//! healthy by monitoring its quality and re-running the search when needed.

pub mod config;
pub mod controller;
pub mod error;
pub mod metric;
pub mod model;
pub mod optimizer;
pub mod program;
pub mod trajectory;

#[cfg(test)]
mod testing;
