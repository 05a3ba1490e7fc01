//! The decision engine.
//!
//! [`run`] spawns the per-prompt driver and returns a bounded channel of
//! envelopes. The driver acquires the tree's completion latch (bounded
//! wait), walks the graph (selector at each branch, tool invocation at
//! each leaf) and streams every yield to the caller as it is produced.
//!
//! Cancellation: when the consumer drops the receiver, sends start failing
//! and the driver aborts between yields. A tool that is already running is
//! driven to completion and its outputs are committed, so the environment
//! never holds a half-finished invocation.

pub mod calls;
pub mod prompts;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use arbor_client::ClientPool;
use arbor_domain::envelope::{Envelope, EnvelopeKind};
use arbor_domain::error::{Error, Result};
use arbor_lm::{resolve_handles, LmHandle};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::environment::Invocation;
use crate::graph::{Node, NodeKind, TEXT_RESPONSE};
use crate::tasks::TaskStep;
use crate::tool::{ToolContext, ToolYield};
use crate::tree::{Tree, TreeHandle};

/// Tool invocations allowed per run before a response is forced.
pub const MAX_STEPS: usize = 10;

/// Bounded wait for the completion latch when another run is in flight.
pub const RUN_WAIT: Duration = Duration::from_secs(30);

const ENVELOPE_CHANNEL: usize = 64;
const TOOL_CHANNEL: usize = 16;

/// One prompt submission.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub user_id: String,
    pub conversation_id: String,
    pub query_id: String,
    pub prompt: String,
    pub collection_names: Vec<String>,
    /// `/`-joined node ids that bypass the selector until exhausted.
    pub training_route: Option<String>,
}

/// Start a run, resolving the model handles from the tree's settings. The
/// returned receiver yields envelopes in emission order; dropping it
/// cancels the run between yields.
pub fn run(
    handle: Arc<TreeHandle>,
    pool: Arc<ClientPool>,
    req: RunRequest,
) -> mpsc::Receiver<Envelope> {
    run_with_handles(handle, pool, req, None)
}

/// Start a run with pre-resolved model handles (tests and callers that
/// already hold them).
pub fn run_with_handles(
    handle: Arc<TreeHandle>,
    pool: Arc<ClientPool>,
    req: RunRequest,
    handles: Option<(LmHandle, LmHandle)>,
) -> mpsc::Receiver<Envelope> {
    let (tx, rx) = mpsc::channel(ENVELOPE_CHANNEL);
    tokio::spawn(run_task(handle, pool, req, tx, handles));
    rx
}

async fn run_task(
    handle: Arc<TreeHandle>,
    pool: Arc<ClientPool>,
    req: RunRequest,
    tx: mpsc::Sender<Envelope>,
    handles: Option<(LmHandle, LmHandle)>,
) {
    let permit = match handle.acquire_latch(RUN_WAIT).await {
        Ok(permit) => permit,
        Err(e) => {
            tracing::warn!(
                conversation_id = %req.conversation_id,
                error = %e,
                "run rejected"
            );
            let _ = tx
                .send(Envelope::error(
                    &req.user_id,
                    &req.conversation_id,
                    &req.query_id,
                    e.to_string(),
                ))
                .await;
            return;
        }
    };

    handle.touch();
    let mut tree = handle.tree.lock().await;
    let mut emitter = Emitter {
        tx,
        user_id: req.user_id.clone(),
        conversation_id: req.conversation_id.clone(),
        query_id: req.query_id.clone(),
        cancelled: false,
    };

    if let Err(e) = run_inner(&mut tree, &pool, &req, &mut emitter, handles).await {
        tracing::error!(
            conversation_id = %req.conversation_id,
            error = %e,
            "run failed"
        );
        let envelope = Envelope::error(
            &req.user_id,
            &req.conversation_id,
            &req.query_id,
            e.to_string(),
        );
        emitter.dispatch(&mut tree, envelope).await;
    }

    handle.touch();
    drop(tree);
    drop(permit);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Emitter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Builds, records, and sends envelopes for one run. A failed send marks
/// the run cancelled; envelopes are still recorded so the tree's log stays
/// complete for snapshotting.
struct Emitter {
    tx: mpsc::Sender<Envelope>,
    user_id: String,
    conversation_id: String,
    query_id: String,
    cancelled: bool,
}

impl Emitter {
    fn make(&self, kind: EnvelopeKind, payload: Value) -> Envelope {
        Envelope::new(
            kind,
            &self.user_id,
            &self.conversation_id,
            &self.query_id,
            payload,
        )
    }

    fn make_error(&self, text: impl Into<String>) -> Envelope {
        Envelope::error(&self.user_id, &self.conversation_id, &self.query_id, text)
    }

    async fn dispatch(&mut self, tree: &mut Tree, envelope: Envelope) {
        tree.record_envelope(&envelope);
        if !self.cancelled && self.tx.send(envelope).await.is_err() {
            self.cancelled = true;
        }
    }

    async fn emit(&mut self, tree: &mut Tree, kind: EnvelopeKind, payload: Value) {
        let envelope = self.make(kind, payload);
        self.dispatch(tree, envelope).await;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// The decision loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn run_inner(
    tree: &mut Tree,
    pool: &ClientPool,
    req: &RunRequest,
    emitter: &mut Emitter,
    handles: Option<(LmHandle, LmHandle)>,
) -> Result<()> {
    let (base_lm, complex_lm) = match handles {
        Some(pair) => pair,
        None => resolve_handles(&tree.settings)?,
    };

    tree.history.push_user(&req.prompt);
    tree.tasks_completed.begin_prompt(&req.prompt, &req.query_id);

    let mut route: VecDeque<String> = req
        .training_route
        .as_deref()
        .filter(|r| !r.is_empty())
        .map(|r| r.split('/').map(str::to_owned).collect())
        .unwrap_or_default();

    let mut steps = 0usize;
    let mut final_response: Option<String> = None;
    let mut done = false;

    'run: while !done {
        let mut current_id = tree.graph.root().id.clone();

        'walk: loop {
            if emitter.cancelled {
                break 'run;
            }

            let current = tree
                .graph
                .find(&current_id)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("node `{current_id}`")))?;
            let candidates =
                available_candidates(tree, &current, &req.collection_names).await;

            let (chosen, reasoning) =
                choose_next(tree, &current, &candidates, &mut route, &base_lm, req).await?;

            if chosen.is_branch() {
                current_id = chosen.id;
                continue 'walk;
            }

            steps += 1;
            let outcome = invoke_tool(
                tree, &chosen, reasoning, &base_lm, &complex_lm, pool, req, emitter,
            )
            .await?;

            if emitter.cancelled {
                break 'run;
            }

            match outcome {
                ToolRun::Failed(error) => {
                    tracing::debug!(tool = %chosen.id, error = %error, "tool failed, re-entering decision");
                    if steps >= MAX_STEPS {
                        force_step_limit(
                            tree, &base_lm, &complex_lm, pool, req, emitter,
                            &mut final_response,
                        )
                        .await?;
                        done = true;
                        break 'walk;
                    }
                    // Re-enter the decision at the same branch; the failed
                    // step is in the ledger for the selector to see.
                    continue 'walk;
                }
                ToolRun::Success { response } => {
                    if response.is_some() {
                        final_response = response;
                    }

                    if chosen.is_terminal() {
                        done = true;
                        break 'walk;
                    }

                    if calls::end_goal_satisfied(
                        &base_lm,
                        &tree.end_goal,
                        &tree.history,
                        &tree.tasks_completed,
                    )
                    .await?
                    {
                        done = true;
                        break 'walk;
                    }

                    if steps >= MAX_STEPS {
                        force_step_limit(
                            tree, &base_lm, &complex_lm, pool, req, emitter,
                            &mut final_response,
                        )
                        .await?;
                        done = true;
                        break 'walk;
                    }

                    if !chosen.options.is_empty() {
                        // The invoked tool opens follow-up options; keep
                        // walking from its node.
                        current_id = chosen.id;
                        continue 'walk;
                    }

                    // Restart the walk from the root.
                    break 'walk;
                }
            }
        }
    }

    if emitter.cancelled {
        tracing::info!(
            conversation_id = %req.conversation_id,
            "run aborted by consumer; committed outputs kept"
        );
        return Ok(());
    }

    // ── synthesis ────────────────────────────────────────────────────
    let response = match final_response {
        Some(response) => response,
        None => {
            let response = calls::synthesise(
                &complex_lm,
                &tree.style,
                &tree.agent_description,
                &tree.history,
                &tree.environment,
            )
            .await?;
            emitter
                .emit(tree, EnvelopeKind::Response, json!({ "text": response }))
                .await;
            response
        }
    };
    tree.history.push_assistant(&response);

    // ── title (first run only) ───────────────────────────────────────
    if tree.runs_completed == 0 {
        match calls::make_title(&complex_lm, &req.prompt, &response).await {
            Ok(title) => {
                tree.title = Some(title.clone());
                emitter
                    .emit(
                        tree,
                        EnvelopeKind::Title,
                        json!({ "title": title, "error": "" }),
                    )
                    .await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "title generation failed");
                emitter
                    .emit(
                        tree,
                        EnvelopeKind::Title,
                        json!({ "title": "", "error": e.to_string() }),
                    )
                    .await;
            }
        }
    }

    emitter
        .emit(tree, EnvelopeKind::Completed, Value::Object(Default::default()))
        .await;
    tree.runs_completed += 1;
    Ok(())
}

/// Handle the step limit being reached: warn the client, then force the
/// fallback response.
async fn force_step_limit(
    tree: &mut Tree,
    base_lm: &LmHandle,
    complex_lm: &LmHandle,
    pool: &ClientPool,
    req: &RunRequest,
    emitter: &mut Emitter,
    final_response: &mut Option<String>,
) -> Result<()> {
    emitter
        .emit(
            tree,
            EnvelopeKind::Warning,
            json!({
                "text": format!(
                    "Reached the limit of {MAX_STEPS} actions for one \
                     prompt; responding with what has been gathered."
                )
            }),
        )
        .await;
    force_response(tree, base_lm, complex_lm, pool, req, emitter, final_response).await
}

/// Invoke the fallback `text_response` after the step limit was hit.
async fn force_response(
    tree: &mut Tree,
    base_lm: &LmHandle,
    complex_lm: &LmHandle,
    pool: &ClientPool,
    req: &RunRequest,
    emitter: &mut Emitter,
    final_response: &mut Option<String>,
) -> Result<()> {
    let fallback = fallback_node(tree)?;
    let outcome = invoke_tool(
        tree,
        &fallback,
        "the action limit was reached".into(),
        base_lm,
        complex_lm,
        pool,
        req,
        emitter,
    )
    .await?;
    if let ToolRun::Success { response: Some(response) } = outcome {
        *final_response = Some(response);
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Selection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The node's options filtered by each tool's availability predicate.
/// Branches are always offered; unregistered tool ids are skipped.
async fn available_candidates(
    tree: &Tree,
    node: &Node,
    collection_names: &[String],
) -> Vec<Node> {
    let view = crate::tool::TreeView {
        environment: &tree.environment,
        history: &tree.history,
        collection_names,
    };
    let mut out = Vec::with_capacity(node.options.len());
    for child in &node.options {
        if child.is_branch() {
            out.push(child.clone());
            continue;
        }
        match tree.registry.get(&child.id) {
            Some(tool) => {
                if tool.is_available(view).await {
                    out.push(child.clone());
                }
            }
            None => {
                tracing::warn!(tool = %child.id, "tool node has no registered implementation");
            }
        }
    }
    out
}

/// The `text_response` descriptor, used whenever selection cannot proceed.
fn fallback_node(tree: &Tree) -> Result<Node> {
    tree.registry
        .get(TEXT_RESPONSE)
        .map(|t| t.node())
        .ok_or_else(|| Error::Config("`text_response` is not registered".into()))
}

/// Decide the next node: training route first, then the selector, with
/// `text_response` as the fallback for empty or failed selections. A
/// single candidate is taken without a model call.
async fn choose_next(
    tree: &Tree,
    current: &Node,
    candidates: &[Node],
    route: &mut VecDeque<String>,
    base_lm: &LmHandle,
    req: &RunRequest,
) -> Result<(Node, String)> {
    if candidates.is_empty() {
        return Ok((
            fallback_node(tree)?,
            "no options were available; responding directly".into(),
        ));
    }

    if let Some(next) = route.front().cloned() {
        if let Some(node) = candidates.iter().find(|c| c.id == next) {
            let node = node.clone();
            route.pop_front();
            return Ok((node, "following the training route".into()));
        }
        tracing::warn!(next = %next, "training route node unavailable; resuming model selection");
        route.clear();
    }

    if candidates.len() == 1 {
        return Ok((candidates[0].clone(), "the only available option".into()));
    }

    let instruction = match &current.kind {
        NodeKind::Branch { instruction } => instruction.as_str(),
        NodeKind::Tool { .. } => "Choose the follow-up action for the tool that just ran.",
    };

    match calls::select_option(
        base_lm,
        &tree.agent_description,
        instruction,
        candidates,
        &tree.history,
        &tree.environment.summary(),
        &tree.tasks_completed,
        &req.collection_names,
    )
    .await
    {
        Ok(selection) => match candidates.iter().find(|c| c.id == selection.choice) {
            Some(node) => Ok((node.clone(), selection.reasoning)),
            None => Ok((
                fallback_node(tree)?,
                "selection returned an unknown option; responding directly".into(),
            )),
        },
        Err(Error::Config(e)) => {
            tracing::warn!(error = %e, "selector failed twice; falling back to text_response");
            Ok((
                fallback_node(tree)?,
                "selection failed; responding directly".into(),
            ))
        }
        Err(e) => Err(e),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool invocation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum ToolRun {
    Success { response: Option<String> },
    Failed(String),
}

/// Run one tool: build inputs, stream its yields, then commit outputs and
/// the ledger step. An `Error` yield (or an `Err` from the call future)
/// records a failed step and discards the invocation's results.
#[allow(clippy::too_many_arguments)]
async fn invoke_tool(
    tree: &mut Tree,
    node: &Node,
    reasoning: String,
    base_lm: &LmHandle,
    complex_lm: &LmHandle,
    pool: &ClientPool,
    req: &RunRequest,
    emitter: &mut Emitter,
) -> Result<ToolRun> {
    let tool = tree
        .registry
        .get(&node.id)
        .cloned()
        .ok_or_else(|| Error::NotFound(format!("tool `{}` is not registered", node.id)))?;

    emitter
        .emit(tree, EnvelopeKind::Status, json!({ "text": tool.status() }))
        .await;
    if emitter.cancelled {
        return Ok(ToolRun::Failed("cancelled before invocation".into()));
    }

    // ── inputs ───────────────────────────────────────────────────────
    let schema = tool.inputs();
    let inputs = match calls::build_tool_inputs(
        base_lm,
        tool.name(),
        tool.description(),
        &schema,
        &req.prompt,
        &tree.environment.summary(),
        &tree.tasks_completed,
        &req.collection_names,
    )
    .await
    {
        Ok(inputs) => inputs,
        Err(e @ Error::Config(_)) => {
            let message = format!("could not prepare inputs for `{}`: {e}", tool.name());
            let envelope = emitter.make_error(&message);
            emitter.dispatch(tree, envelope).await;
            tree.tasks_completed.record_step(TaskStep {
                name: tool.name().into(),
                reasoning,
                inputs: Value::Object(Default::default()),
                output_summary: None,
                error: Some(message.clone()),
            });
            return Ok(ToolRun::Failed(message));
        }
        Err(e) => return Err(e),
    };

    // ── streamed execution ───────────────────────────────────────────
    let (ytx, mut yrx) = mpsc::channel::<ToolYield>(TOOL_CHANNEL);
    let tx = emitter.tx.clone();

    let mut streamed: Vec<Envelope> = Vec::new();
    let mut commits: Vec<(String, String, Invocation, bool)> = Vec::new();
    let mut llm_messages: Vec<String> = Vec::new();
    let mut response: Option<String> = None;
    let mut tool_error: Option<String> = None;
    let mut send_failed = emitter.cancelled;

    let call_result: Result<()> = {
        let ctx = ToolContext {
            prompt: &req.prompt,
            collection_names: &req.collection_names,
            style: &tree.style,
            agent_description: &tree.agent_description,
            end_goal: &tree.end_goal,
            environment: &tree.environment,
            history: &tree.history,
            tasks: &tree.tasks_completed,
            base_lm,
            complex_lm,
            pool,
        };
        let call_fut = tool.call(&ctx, inputs.clone(), ytx);
        tokio::pin!(call_fut);

        let mut call_done: Option<Result<()>> = None;
        let mut channel_open = true;

        while call_done.is_none() || channel_open {
            tokio::select! {
                result = &mut call_fut, if call_done.is_none() => {
                    call_done = Some(result);
                }
                maybe = yrx.recv(), if channel_open => {
                    match maybe {
                        Some(yield_) => {
                            if let ToolYield::Error(ref message) = yield_ {
                                tool_error.get_or_insert_with(|| message.clone());
                            }
                            if let Some(envelope) =
                                yield_to_envelope(emitter, yield_, &mut commits, &mut llm_messages, &mut response, tool.name())
                            {
                                streamed.push(envelope.clone());
                                if !send_failed && tx.send(envelope).await.is_err() {
                                    send_failed = true;
                                }
                            }
                        }
                        None => channel_open = false,
                    }
                }
                else => break,
            }
        }

        call_done.unwrap_or(Ok(()))
    };

    emitter.cancelled = emitter.cancelled || send_failed;
    for envelope in &streamed {
        tree.record_envelope(envelope);
    }

    if let Err(e) = call_result {
        tool_error.get_or_insert_with(|| e.to_string());
        let envelope = emitter.make_error(e.to_string());
        emitter.dispatch(tree, envelope).await;
    }

    // ── commit ───────────────────────────────────────────────────────
    if let Some(error) = tool_error {
        tree.tasks_completed.record_step(TaskStep {
            name: tool.name().into(),
            reasoning,
            inputs,
            output_summary: None,
            error: Some(error.clone()),
        });
        return Ok(ToolRun::Failed(error));
    }

    for (name, variant, invocation, replace) in commits {
        if replace {
            tree.environment.replace(&name, &variant, invocation);
        } else {
            tree.environment.append(&name, &variant, invocation);
        }
    }

    let output_summary = if llm_messages.is_empty() {
        None
    } else {
        Some(llm_messages.join("; "))
    };
    tree.tasks_completed.record_step(TaskStep {
        name: tool.name().into(),
        reasoning,
        inputs,
        output_summary,
        error: None,
    });

    Ok(ToolRun::Success { response })
}

/// Translate a tool yield into its envelope (if it has one) and collect
/// the bookkeeping it carries.
fn yield_to_envelope(
    emitter: &Emitter,
    yield_: ToolYield,
    commits: &mut Vec<(String, String, Invocation, bool)>,
    llm_messages: &mut Vec<String>,
    response: &mut Option<String>,
    tool_name: &str,
) -> Option<Envelope> {
    match yield_ {
        ToolYield::Status(text) => {
            Some(emitter.make(EnvelopeKind::Status, json!({ "text": text })))
        }
        ToolYield::Update { kind, payload } => Some(emitter.make(
            EnvelopeKind::Update,
            json!({ "kind": kind, "data": payload }),
        )),
        ToolYield::Result {
            objects,
            metadata,
            llm_message,
            name,
            variant,
            replace,
        } => {
            let name = name.unwrap_or_else(|| tool_name.to_owned());
            let variant = variant.unwrap_or_else(|| "default".to_owned());
            if let Some(message) = llm_message {
                llm_messages.push(message);
            }
            let envelope = emitter.make(
                EnvelopeKind::Result,
                json!({
                    "objects": objects.clone(),
                    "metadata": metadata.clone(),
                    "name": name.clone(),
                    "variant": variant.clone(),
                }),
            );
            commits.push((
                name,
                variant,
                Invocation { metadata, objects },
                replace,
            ));
            Some(envelope)
        }
        ToolYield::Text(text) => Some(emitter.make(EnvelopeKind::Text, json!({ "text": text }))),
        ToolYield::Response(text) => {
            *response = Some(text.clone());
            Some(emitter.make(EnvelopeKind::Response, json!({ "text": text })))
        }
        ToolYield::Warning(text) => {
            Some(emitter.make(EnvelopeKind::Warning, json!({ "text": text })))
        }
        ToolYield::Error(text) => Some(emitter.make_error(text)),
        ToolYield::Completed => None,
    }
}
