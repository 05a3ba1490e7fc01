//! End-to-end engine runs against the scripted model and the in-memory
//! store: no network, deterministic selection.

use std::sync::Arc;
use std::time::Duration;

use arbor_client::{ClientPool, MemoryStore, VectorStore};
use arbor_domain::config::Config;
use arbor_domain::envelope::{Envelope, EnvelopeKind};
use arbor_domain::error::Result;
use arbor_domain::schema::InputSchema;
use arbor_lm::dummy::ScriptedLm;
use arbor_lm::LmHandle;
use arbor_tree::history::Role;
use arbor_tree::tool::{Tool, ToolContext, ToolOutput, ToolYield};
use arbor_tree::{run_with_handles, RunRequest, Tree, TreeHandle};
use serde_json::{json, Value};

fn handles(lm: &Arc<ScriptedLm>) -> (LmHandle, LmHandle) {
    (
        LmHandle::new(lm.clone(), "scripted-base"),
        LmHandle::new(lm.clone(), "scripted-complex"),
    )
}

fn request(prompt: &str, collections: &[&str], route: Option<&str>) -> RunRequest {
    RunRequest {
        user_id: "u1".into(),
        conversation_id: "c1".into(),
        query_id: "q1".into(),
        prompt: prompt.into(),
        collection_names: collections.iter().map(|s| s.to_string()).collect(),
        training_route: route.map(str::to_owned),
    }
}

fn new_handle() -> Arc<TreeHandle> {
    let tree = Tree::from_config("c1", "u1", &Config::default(), false).unwrap();
    Arc::new(TreeHandle::new(tree))
}

async fn seeded_pool() -> Arc<ClientPool> {
    let store = MemoryStore::new();
    store.ensure_collection("products").await.unwrap();
    store
        .insert(
            "products",
            uuid::Uuid::new_v4(),
            json!({ "name": "cat tree", "description": "a tower for cats" }),
        )
        .await
        .unwrap();
    Arc::new(ClientPool::with_store(Arc::new(store), 3))
}

async fn collect(mut rx: tokio::sync::mpsc::Receiver<Envelope>) -> Vec<Envelope> {
    let mut out = Vec::new();
    while let Some(envelope) = rx.recv().await {
        out.push(envelope);
    }
    out
}

fn kinds(envelopes: &[Envelope]) -> Vec<EnvelopeKind> {
    envelopes.iter().map(|e| e.kind).collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Basic runs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn greeting_run_completes_with_title() {
    // No collections: query/aggregate are unavailable, text_response is the
    // only candidate and is taken without a selector call.
    let lm = Arc::new(ScriptedLm::new(vec![
        "Hello! How can I help?".into(), // synthesiser (via text_response)
        "Greeting".into(),               // title
    ]));
    let handle = new_handle();
    let pool = seeded_pool().await;

    let rx = run_with_handles(
        handle.clone(),
        pool,
        request("hi", &[], None),
        Some(handles(&lm)),
    );
    let envelopes = collect(rx).await;

    assert_eq!(
        kinds(&envelopes),
        vec![
            EnvelopeKind::Status,
            EnvelopeKind::Response,
            EnvelopeKind::Title,
            EnvelopeKind::Completed,
        ]
    );
    assert_eq!(envelopes[1].payload["text"], "Hello! How can I help?");

    let titles: Vec<_> = envelopes
        .iter()
        .filter(|e| e.kind == EnvelopeKind::Title)
        .collect();
    assert_eq!(titles.len(), 1);
    assert_eq!(titles[0].payload["title"], "Greeting");

    let tree = handle.tree.lock().await;
    assert_eq!(tree.history.entries()[0].role, Role::User);
    assert_eq!(tree.history.entries()[0].content, "hi");
    assert_eq!(tree.history.entries()[1].role, Role::Assistant);
    assert_eq!(tree.runs_completed, 1);
    assert_eq!(tree.title.as_deref(), Some("Greeting"));
    assert_eq!(tree.envelope_log.len(), envelopes.len());
    assert_eq!(tree.tasks_completed.entries().len(), 1);
    assert_eq!(tree.tasks_completed.entries()[0].task.len(), 1);
}

#[tokio::test]
async fn second_run_emits_no_title() {
    let lm = Arc::new(ScriptedLm::new(vec![
        "First answer.".into(),
        "A title".into(),
        "Second answer.".into(),
    ]));
    let handle = new_handle();
    let pool = seeded_pool().await;

    let first = collect(run_with_handles(
        handle.clone(),
        pool.clone(),
        request("one", &[], None),
        Some(handles(&lm)),
    ))
    .await;
    assert!(first.iter().any(|e| e.kind == EnvelopeKind::Title));

    let second = collect(run_with_handles(
        handle.clone(),
        pool,
        request("two", &[], None),
        Some(handles(&lm)),
    ))
    .await;
    assert!(second.iter().all(|e| e.kind != EnvelopeKind::Title));
    assert!(second.iter().any(|e| e.kind == EnvelopeKind::Completed));
}

#[tokio::test]
async fn query_run_commits_results_to_environment() {
    let lm = Arc::new(ScriptedLm::new(vec![
        r#"{"choice": "query", "reasoning": "the user asks about their data"}"#.into(),
        r#"{"search_term": "cats", "limit": 5}"#.into(),
        r#"{"satisfied": true, "reasoning": "results gathered"}"#.into(),
        "I found a cat tree.".into(), // synthesiser
        "Cat search".into(),          // title
    ]));
    let handle = new_handle();
    let pool = seeded_pool().await;

    let envelopes = collect(run_with_handles(
        handle.clone(),
        pool,
        request("what cat products are there?", &["products"], None),
        Some(handles(&lm)),
    ))
    .await;

    let result = envelopes
        .iter()
        .find(|e| e.kind == EnvelopeKind::Result)
        .expect("query emits a result envelope");
    assert_eq!(result.payload["name"], "query");
    assert_eq!(result.payload["variant"], "products");
    assert_eq!(result.payload["objects"].as_array().unwrap().len(), 1);
    assert_eq!(envelopes.last().unwrap().kind, EnvelopeKind::Completed);

    let tree = handle.tree.lock().await;
    let slot = tree.environment.find("query", "products").unwrap();
    assert_eq!(slot.len(), 1);
    assert_eq!(slot[0].objects.len(), 1);

    let steps = &tree.tasks_completed.entries()[0].task;
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].name, "query");
    assert!(steps[0].error.is_none());
    assert!(steps[0].output_summary.as_deref().unwrap().contains("1 object"));
}

#[tokio::test]
async fn training_route_bypasses_the_selector() {
    let lm = Arc::new(ScriptedLm::new(vec![
        r#"{"search_term": "cats", "limit": 5}"#.into(), // inputs for query
        r#"{"satisfied": true, "reasoning": "done"}"#.into(),
        "Routed answer.".into(),
        "Routed".into(),
    ]));
    let handle = new_handle();
    let pool = seeded_pool().await;

    let envelopes = collect(run_with_handles(
        handle.clone(),
        pool,
        request("find cats", &["products"], Some("query")),
        Some(handles(&lm)),
    ))
    .await;

    assert!(envelopes.iter().any(|e| e.kind == EnvelopeKind::Result));

    // No selector call was made: the first scripted response went to the
    // input builder.
    let first = &lm.requests()[0];
    assert!(first
        .messages
        .iter()
        .any(|m| m.content.contains("preparing the inputs")));
}

#[tokio::test]
async fn summarize_tool_replaces_the_environment_slot() {
    let lm = Arc::new(ScriptedLm::new(vec![
        r#"{"tool_name": "query", "variant": "products"}"#.into(), // inputs
        "two results about cat products".into(),                  // summary
        r#"{"satisfied": true, "reasoning": "condensed"}"#.into(),
        "All tidied up.".into(), // synthesiser
        "Cleanup".into(),        // title
    ]));
    let handle = new_handle();
    {
        let mut tree = handle.tree.lock().await;
        tree.add_tool_by_name("summarize", "base", None).unwrap();
        for n in 0..2 {
            tree.environment.append(
                "query",
                "products",
                arbor_tree::Invocation {
                    metadata: json!({ "n": n }),
                    objects: vec![json!({ "value": n })],
                },
            );
        }
    }
    let pool = seeded_pool().await;

    let envelopes = collect(run_with_handles(
        handle.clone(),
        pool,
        request("tidy up the gathered results", &[], Some("summarize")),
        Some(handles(&lm)),
    ))
    .await;
    assert_eq!(envelopes.last().unwrap().kind, EnvelopeKind::Completed);

    let tree = handle.tree.lock().await;
    let slot = tree.environment.find("query", "products").unwrap();
    assert_eq!(slot.len(), 1);
    assert_eq!(slot[0].metadata["summary"], true);
    assert_eq!(slot[0].objects[0], "two results about cat products");

    let steps = &tree.tasks_completed.entries()[0].task;
    assert_eq!(steps[0].name, "summarize");
    assert!(steps[0]
        .output_summary
        .as_deref()
        .unwrap()
        .contains("condensed 2 invocation(s)"));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Failure handling
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct FailingTool;

#[async_trait::async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        "broken"
    }
    fn description(&self) -> &str {
        "Always fails."
    }
    fn status(&self) -> &str {
        "Failing..."
    }
    fn inputs(&self) -> InputSchema {
        InputSchema::new()
    }
    async fn call(&self, _ctx: &ToolContext<'_>, _inputs: Value, out: ToolOutput) -> Result<()> {
        let _ = out
            .send(ToolYield::Error("deliberate failure".into()))
            .await;
        Ok(())
    }
}

#[tokio::test]
async fn error_yield_is_recorded_and_the_run_recovers() {
    let lm = Arc::new(ScriptedLm::new(vec![
        // After the failure the selector runs over [text_response, broken].
        r#"{"choice": "text_response", "reasoning": "give up and answer"}"#.into(),
        "Sorry, that failed.".into(), // synthesiser
        "Failure".into(),             // title
    ]));
    let handle = new_handle();
    {
        let mut tree = handle.tree.lock().await;
        tree.add_tool(Arc::new(FailingTool), "base", None).unwrap();
    }
    let pool = seeded_pool().await;

    let envelopes = collect(run_with_handles(
        handle.clone(),
        pool,
        request("do the broken thing", &[], Some("broken")),
        Some(handles(&lm)),
    ))
    .await;

    assert!(envelopes
        .iter()
        .any(|e| e.kind == EnvelopeKind::Error
            && e.payload["text"] == "deliberate failure"
            && e.id.starts_with("err-")));
    assert_eq!(envelopes.last().unwrap().kind, EnvelopeKind::Completed);

    let tree = handle.tree.lock().await;
    let steps = &tree.tasks_completed.entries()[0].task;
    // Two invocations observed on the stream, two ledger steps.
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].name, "broken");
    assert_eq!(steps[0].error.as_deref(), Some("deliberate failure"));
    assert!(steps[1].error.is_none());
    // The failed invocation committed nothing.
    assert!(tree.environment.is_empty());
}

struct NoopTool;

#[async_trait::async_trait]
impl Tool for NoopTool {
    fn name(&self) -> &str {
        "noop"
    }
    fn description(&self) -> &str {
        "Does nothing useful."
    }
    fn status(&self) -> &str {
        "Spinning..."
    }
    fn inputs(&self) -> InputSchema {
        InputSchema::new()
    }
    async fn call(&self, _ctx: &ToolContext<'_>, _inputs: Value, out: ToolOutput) -> Result<()> {
        let _ = out
            .send(ToolYield::Result {
                objects: vec![json!({ "spun": true })],
                metadata: json!({}),
                llm_message: Some("spun once".into()),
                name: None,
                variant: None,
                replace: false,
            })
            .await;
        Ok(())
    }
}

#[tokio::test]
async fn step_limit_forces_a_response() {
    // Ten routed noop invocations, each followed by an unsatisfied
    // end-goal check; then the warning and the forced response.
    let mut responses: Vec<String> = Vec::new();
    for _ in 0..10 {
        responses.push(r#"{"satisfied": false, "reasoning": "keep going"}"#.into());
    }
    responses.push("Ran out of steps.".into()); // forced synthesiser
    responses.push("Spinning".into());          // title
    let lm = Arc::new(ScriptedLm::new(responses));

    let handle = new_handle();
    {
        let mut tree = handle.tree.lock().await;
        tree.add_tool(Arc::new(NoopTool), "base", None).unwrap();
    }
    let pool = seeded_pool().await;

    let route = vec!["noop"; 10].join("/");
    let envelopes = collect(run_with_handles(
        handle.clone(),
        pool,
        request("spin forever", &[], Some(&route)),
        Some(handles(&lm)),
    ))
    .await;

    assert!(envelopes.iter().any(|e| e.kind == EnvelopeKind::Warning));
    assert!(envelopes
        .iter()
        .any(|e| e.kind == EnvelopeKind::Response
            && e.payload["text"] == "Ran out of steps."));
    assert_eq!(envelopes.last().unwrap().kind, EnvelopeKind::Completed);

    let tree = handle.tree.lock().await;
    // 10 noop invocations + the forced text_response.
    assert_eq!(tree.tasks_completed.entries()[0].task.len(), 11);
    let slot = tree.environment.find("noop", "default").unwrap();
    assert_eq!(slot.len(), 10);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Concurrency & cancellation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test(start_paused = true)]
async fn concurrent_run_on_same_tree_is_rejected_as_busy() {
    let handle = new_handle();
    let pool = seeded_pool().await;

    // Hold the latch as if a run were in flight.
    let permit = handle
        .acquire_latch(Duration::from_secs(1))
        .await
        .unwrap();

    let lm = Arc::new(ScriptedLm::new(vec![]));
    let envelopes = collect(run_with_handles(
        handle.clone(),
        pool,
        request("second prompt", &[], None),
        Some(handles(&lm)),
    ))
    .await;

    assert_eq!(envelopes.len(), 1);
    assert_eq!(envelopes[0].kind, EnvelopeKind::Error);
    assert!(envelopes[0].payload["text"]
        .as_str()
        .unwrap()
        .contains("busy"));

    drop(permit);
    assert!(handle.is_idle());
}

#[tokio::test]
async fn dropping_the_receiver_cancels_between_yields() {
    let lm = Arc::new(ScriptedLm::new(vec![
        r#"{"choice": "query", "reasoning": "search"}"#.into(),
        r#"{"search_term": "cats", "limit": 5}"#.into(),
        // Nothing further: the run is cancelled before the end-goal check
        // would consume a response.
        "unused".into(),
        "unused".into(),
        "unused".into(),
    ]));
    let handle = new_handle();
    let pool = seeded_pool().await;

    let mut rx = run_with_handles(
        handle.clone(),
        pool.clone(),
        request("find cats", &["products"], None),
        Some(handles(&lm)),
    );

    // Read the first envelope (the query status), then hang up.
    let first = rx.recv().await.unwrap();
    assert_eq!(first.kind, EnvelopeKind::Status);
    drop(rx);

    // The engine finishes the in-flight tool, commits it, and releases the
    // latch.
    let mut released = false;
    for _ in 0..100 {
        if handle.is_idle() {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(released, "completion latch was not released after cancel");

    {
        let tree = handle.tree.lock().await;
        // Only the fully-committed query invocation is present.
        let slot = tree.environment.find("query", "products").unwrap();
        assert_eq!(slot.len(), 1);
    }

    // A subsequent run on the same tree succeeds.
    let lm2 = Arc::new(ScriptedLm::new(vec![
        "Back again.".into(),
        "Recovered".into(),
    ]));
    let envelopes = collect(run_with_handles(
        handle.clone(),
        pool,
        request("hello again", &[], None),
        Some(handles(&lm2)),
    ))
    .await;
    assert_eq!(envelopes.last().unwrap().kind, EnvelopeKind::Completed);
}
