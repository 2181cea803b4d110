//! A [`ProgramRunner`] that executes programs on a chat model.

use futures::future::BoxFuture;

use super::api::LlmClient;
use super::prompt::{parse_outputs, program_prompt};
use crate::error::ExecutionError;
use crate::program::{Fields, Program};
use crate::trajectory::ProgramRunner;

/// Runs each program as one chat completion and parses the JSON reply.
#[derive(Debug, Clone)]
pub struct LlmRunner {
    client: LlmClient,
    model: String,
    temperature: f64,
    max_tokens: usize,
}

impl LlmRunner {
    pub fn new(client: LlmClient, model: impl Into<String>, temperature: f64, max_tokens: usize) -> Self {
        Self {
            client,
            model: model.into(),
            temperature,
            max_tokens,
        }
    }
}

impl ProgramRunner for LlmRunner {
    fn execute<'a>(
        &'a self,
        program: &'a Program,
        inputs: &'a Fields,
    ) -> BoxFuture<'a, Result<Fields, ExecutionError>> {
        Box::pin(async move {
            let messages = program_prompt(program, inputs);
            let reply = self
                .client
                .complete(&self.model, &messages, self.temperature, self.max_tokens)
                .await?;
            parse_outputs(&program.signature, &reply)
        })
    }
}
