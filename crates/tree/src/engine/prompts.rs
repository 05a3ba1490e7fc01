//! Prompt builders for the engine's language-model calls.
//!
//! Each function returns `(system, user)` message text. The prompts demand
//! bare JSON where the caller parses JSON; the retry wrapper feeds parse
//! complaints back on failure.

use crate::graph::Node;
use crate::history::ConversationHistory;
use crate::tasks::TasksCompleted;

fn render_collections(collection_names: &[String]) -> String {
    if collection_names.is_empty() {
        "(none connected)".into()
    } else {
        collection_names.join(", ")
    }
}

pub fn selector(
    agent_description: &str,
    instruction: &str,
    candidates: &[Node],
    history: &ConversationHistory,
    environment_summary: &str,
    tasks: &TasksCompleted,
    collection_names: &[String],
) -> (String, String) {
    let options = candidates
        .iter()
        .map(|n| {
            let kind = if n.is_branch() { "branch" } else { "tool" };
            format!("- `{}` ({kind}): {}", n.id, n.description)
        })
        .collect::<Vec<_>>()
        .join("\n");

    let system = format!(
        "{agent_description}\n\n\
         You are choosing the next node in a decision tree. {instruction}\n\
         Respond with bare JSON: {{\"choice\": \"<node id>\", \"reasoning\": \
         \"<one short sentence>\"}}. The choice must be exactly one of the \
         listed ids."
    );
    let user = format!(
        "Conversation so far:\n{}\n\n\
         Available collections: {}\n\n\
         Gathered so far:\n{}\n\n\
         Actions taken:\n{}\n\n\
         Options:\n{options}",
        history.render(),
        render_collections(collection_names),
        environment_summary,
        tasks.render(),
    );
    (system, user)
}

pub fn tool_inputs(
    tool_name: &str,
    tool_description: &str,
    schema_description: &str,
    prompt: &str,
    environment_summary: &str,
    tasks: &TasksCompleted,
    collection_names: &[String],
) -> (String, String) {
    let system = format!(
        "You are preparing the inputs for the `{tool_name}` tool: \
         {tool_description}\n\
         Respond with bare JSON mapping input names to values. Omit \
         optional inputs you have no value for. No prose."
    );
    let user = format!(
        "The user asked: {prompt}\n\n\
         Available collections: {}\n\n\
         Gathered so far:\n{}\n\n\
         Actions taken:\n{}\n\n\
         Inputs to provide:\n{schema_description}",
        render_collections(collection_names),
        environment_summary,
        tasks.render(),
    );
    (system, user)
}

pub fn end_goal(
    end_goal: &str,
    history: &ConversationHistory,
    tasks: &TasksCompleted,
) -> (String, String) {
    let system = "You judge whether an agent has reached its end goal. \
                  Respond with bare JSON: {\"satisfied\": true|false, \
                  \"reasoning\": \"<one short sentence>\"}."
        .to_owned();
    let user = format!(
        "End goal:\n{end_goal}\n\n\
         Conversation so far:\n{}\n\n\
         Actions taken:\n{}",
        history.render(),
        tasks.render(),
    );
    (system, user)
}

pub fn synthesiser(
    style: &str,
    agent_description: &str,
    history: &ConversationHistory,
    environment_objects: &str,
) -> (String, String) {
    let system = format!(
        "{agent_description}\n\n\
         Write the final reply to the user. Writing style: {style}\n\
         Ground every claim in the gathered results; say so plainly when \
         nothing relevant was found. Respond with the message only."
    );
    let user = format!(
        "Conversation so far:\n{}\n\n\
         Gathered results:\n{}",
        history.render(),
        if environment_objects.is_empty() {
            "(nothing gathered)"
        } else {
            environment_objects
        },
    );
    (system, user)
}

pub fn title(prompt: &str, response: &str) -> (String, String) {
    let system = "Produce a short title (at most six words) for this \
                  conversation. Respond with the title only: no quotes, \
                  no trailing punctuation."
        .to_owned();
    let user = format!("user: {prompt}\nassistant: {response}");
    (system, user)
}
