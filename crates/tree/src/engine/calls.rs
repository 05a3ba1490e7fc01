//! The engine's language-model calls: selection, input building, end-goal
//! evaluation, synthesis, and titling.
//!
//! Structured calls go through `chat_structured`, which re-asks with the
//! parser's complaint on a malformed answer. Selection validates the chosen
//! id against the candidate set inside the parser, so an unrecognised
//! choice gets exactly one feedback retry before the caller falls back.

use arbor_domain::error::{Error, Result};
use arbor_domain::schema::InputSchema;
use arbor_lm::retry::{chat_structured, chat_with_backoff, parse_json_block};
use arbor_lm::traits::{ChatMessage, ChatRequest};
use arbor_lm::LmHandle;
use serde_json::Value;

use crate::engine::prompts;
use crate::graph::Node;
use crate::history::ConversationHistory;
use crate::tasks::TasksCompleted;

const SELECT_TRIES: u32 = 2;
const INPUT_TRIES: u32 = 2;

#[derive(Debug, Clone)]
pub struct Selection {
    pub choice: String,
    pub reasoning: String,
}

fn request(system: String, user: String, json_mode: bool) -> ChatRequest {
    ChatRequest {
        messages: vec![ChatMessage::system(system), ChatMessage::user(user)],
        temperature: Some(0.2),
        json_mode,
        ..Default::default()
    }
}

/// Ask the base model to pick one of `candidates`.
pub async fn select_option(
    base_lm: &LmHandle,
    agent_description: &str,
    instruction: &str,
    candidates: &[Node],
    history: &ConversationHistory,
    environment_summary: &str,
    tasks: &TasksCompleted,
    collection_names: &[String],
) -> Result<Selection> {
    let (system, user) = prompts::selector(
        agent_description,
        instruction,
        candidates,
        history,
        environment_summary,
        tasks,
        collection_names,
    );

    chat_structured(base_lm, request(system, user, true), SELECT_TRIES, |content| {
        let value = parse_json_block(content)?;
        let choice = value["choice"]
            .as_str()
            .ok_or_else(|| Error::Config("missing `choice` field".into()))?
            .to_owned();
        if !candidates.iter().any(|c| c.id == choice) {
            return Err(Error::Config(format!(
                "`{choice}` is not one of the listed ids"
            )));
        }
        Ok(Selection {
            choice,
            reasoning: value["reasoning"].as_str().unwrap_or_default().to_owned(),
        })
    })
    .await
}

/// Derive a tool's input record from its schema. Schema validation runs
/// inside the parser so a bad value triggers the feedback retry.
pub async fn build_tool_inputs(
    base_lm: &LmHandle,
    tool_name: &str,
    tool_description: &str,
    schema: &InputSchema,
    prompt: &str,
    environment_summary: &str,
    tasks: &TasksCompleted,
    collection_names: &[String],
) -> Result<Value> {
    if schema.is_empty() {
        return Ok(Value::Object(Default::default()));
    }

    let (system, user) = prompts::tool_inputs(
        tool_name,
        tool_description,
        &schema.describe(),
        prompt,
        environment_summary,
        tasks,
        collection_names,
    );

    chat_structured(base_lm, request(system, user, true), INPUT_TRIES, |content| {
        let raw = parse_json_block(content)?;
        schema.resolve(&raw)
    })
    .await
}

/// Ask the base model whether the end goal is met.
pub async fn end_goal_satisfied(
    base_lm: &LmHandle,
    end_goal: &str,
    history: &ConversationHistory,
    tasks: &TasksCompleted,
) -> Result<bool> {
    let (system, user) = prompts::end_goal(end_goal, history, tasks);
    chat_structured(base_lm, request(system, user, true), 2, |content| {
        let value = parse_json_block(content)?;
        value["satisfied"]
            .as_bool()
            .ok_or_else(|| Error::Config("missing `satisfied` field".into()))
    })
    .await
}

/// Compose the final assistant message.
pub async fn synthesise(
    complex_lm: &LmHandle,
    style: &str,
    agent_description: &str,
    history: &ConversationHistory,
    environment: &crate::environment::Environment,
) -> Result<String> {
    let (system, user) = prompts::synthesiser(
        style,
        agent_description,
        history,
        &environment.render_objects(),
    );
    let resp = chat_with_backoff(complex_lm, request(system, user, false)).await?;
    Ok(resp.content.trim().to_owned())
}

/// Generate the conversation title after the first run.
pub async fn make_title(complex_lm: &LmHandle, prompt: &str, response: &str) -> Result<String> {
    let (system, user) = prompts::title(prompt, response);
    let resp = chat_with_backoff(complex_lm, request(system, user, false)).await?;
    Ok(resp.content.trim().trim_matches('"').to_owned())
}
