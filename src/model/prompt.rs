//! Rendering programs as chat prompts and reading their answers back.
//!
//! A program becomes:
//!
//! - a **system** message with its instructions and the field contract,
//! - one **user**/**assistant** pair per demonstration,
//! - a final **user** message carrying the inputs.
//!
//! Every message body is JSON so the model sees demonstrations in exactly the
//! shape it is asked to produce.

use serde_json::Value;

use crate::error::{ExecutionError, ExecutionErrorKind};
use crate::model::api::ChatMessage;
use crate::program::{Fields, Program, Signature};

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

/// Build the chat messages that execute `program` on `inputs`.
pub fn program_prompt(program: &Program, inputs: &Fields) -> Vec<ChatMessage> {
    let signature = &program.signature;
    let instructions = if program.instructions.trim().is_empty() {
        "(none)".to_string()
    } else {
        program.instructions.clone()
    };
    let task = if signature.description.is_empty() {
        String::new()
    } else {
        format!("\n## Task\n{}\n", signature.description)
    };

    let system = format!(
        r#"You are a component of a larger program. You receive a JSON object with the input fields and reply with a JSON object containing the output fields.
{task}
## Instructions
{instructions}

## Fields
Inputs: {inputs}
Outputs: {outputs}

Reply with a single JSON object whose keys are exactly the output fields. Do NOT include any text outside the JSON object."#,
        inputs = field_list(&signature.inputs),
        outputs = field_list(&signature.outputs),
    );

    let mut messages = Vec::with_capacity(2 + program.demonstrations.len() * 2);
    messages.push(ChatMessage::system(system));
    for demo in &program.demonstrations {
        messages.push(ChatMessage::user(render_fields(
            &demo.inputs,
            &signature.inputs,
        )));
        messages.push(ChatMessage::assistant(render_fields(
            &demo.outputs,
            &signature.outputs,
        )));
    }
    messages.push(ChatMessage::user(render_fields(inputs, &signature.inputs)));
    messages
}

fn field_list(names: &[String]) -> String {
    if names.is_empty() {
        "(none)".to_string()
    } else {
        names.join(", ")
    }
}

/// JSON object holding `names` from `fields` (all of `fields` if `names` is empty).
fn render_fields(fields: &Fields, names: &[String]) -> String {
    let selected: serde_json::Map<String, Value> = if names.is_empty() {
        fields.clone().into_iter().collect()
    } else {
        names
            .iter()
            .filter_map(|n| fields.get(n).map(|v| (n.clone(), v.clone())))
            .collect()
    };
    Value::Object(selected).to_string()
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Read the output fields of `signature` from a model reply.
///
/// Accepts code fences and surrounding chatter; the outermost JSON object is
/// used. Every declared output field must be present.
pub fn parse_outputs(signature: &Signature, response: &str) -> Result<Fields, ExecutionError> {
    let invalid = |message: String| ExecutionError::new(ExecutionErrorKind::InvalidResponse, message);

    let body = strip_code_fences(response);
    let json = match (body.find('{'), body.rfind('}')) {
        (Some(start), Some(end)) if start < end => &body[start..=end],
        _ => return Err(invalid(format!("no JSON object in response: {response}"))),
    };
    let parsed: Fields = serde_json::from_str(json)
        .map_err(|e| invalid(format!("response is not a JSON object ({e}): {response}")))?;

    let missing: Vec<&str> = signature
        .outputs
        .iter()
        .filter(|name| !parsed.contains_key(*name))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(invalid(format!("response is missing output fields: {}", missing.join(", "))));
    }

    if signature.outputs.is_empty() {
        return Ok(parsed);
    }
    Ok(parsed
        .into_iter()
        .filter(|(k, _)| signature.outputs.contains(k))
        .collect())
}

/// Strip optional markdown code fences (```json ... ``` or ``` ... ```).
fn strip_code_fences(s: &str) -> &str {
    let trimmed = s.trim();
    let stripped = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    stripped.strip_suffix("```").unwrap_or(stripped).trim()
}
