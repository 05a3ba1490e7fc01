//! The tool contract.
//!
//! A tool is a leaf capability the engine invokes: it receives the tree's
//! read view, its resolved inputs, and a bounded channel to write yields
//! into. The engine forwards yields verbatim (wrapped in the frontend
//! envelope) while the call future runs, so a slow consumer backpressures
//! the tool through the channel bound.
//!
//! An `Error` yield is a value, not an exception: the engine records the
//! step as failed and re-enters the decision loop. An `Err` return from
//! `call` is converted into the same failed step at the engine boundary.

use std::collections::HashMap;
use std::sync::Arc;

use arbor_client::ClientPool;
use arbor_domain::error::Result;
use arbor_domain::schema::InputSchema;
use arbor_lm::LmHandle;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::environment::Environment;
use crate::graph::Node;
use crate::history::ConversationHistory;
use crate::tasks::TasksCompleted;

/// Everything a tool may yield while running.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolYield {
    /// Progress text shown to the user.
    Status(String),
    /// A typed update frame (`kind` becomes the envelope payload type).
    Update { kind: String, payload: Value },
    /// Tool output to commit to the environment and show to the user.
    Result {
        objects: Vec<Value>,
        metadata: Value,
        /// What the language model should be told about this output.
        llm_message: Option<String>,
        /// Environment slot overrides; default to the tool's own name.
        name: Option<String>,
        variant: Option<String>,
        /// When true the slot is overwritten instead of appended: the
        /// compaction path.
        replace: bool,
    },
    /// Incremental display text.
    Text(String),
    /// A final user-facing answer. Ends the synthesis obligation: the
    /// engine will not run its own synthesiser after one of these.
    Response(String),
    Warning(String),
    /// A recoverable failure: recorded as a failed step, the loop continues.
    Error(String),
    /// The tool is done. Optional; the engine also treats the call future
    /// resolving as completion.
    Completed,
}

impl ToolYield {
    pub fn result(objects: Vec<Value>, metadata: Value) -> Self {
        ToolYield::Result {
            objects,
            metadata,
            llm_message: None,
            name: None,
            variant: None,
            replace: false,
        }
    }
}

/// The sender half handed to a running tool.
pub type ToolOutput = mpsc::Sender<ToolYield>;

/// Read-only view of the tree state used by availability predicates.
#[derive(Clone, Copy)]
pub struct TreeView<'a> {
    pub environment: &'a Environment,
    pub history: &'a ConversationHistory,
    pub collection_names: &'a [String],
}

/// Everything a tool can reach while running.
pub struct ToolContext<'a> {
    pub prompt: &'a str,
    pub collection_names: &'a [String],
    pub style: &'a str,
    pub agent_description: &'a str,
    pub end_goal: &'a str,
    pub environment: &'a Environment,
    pub history: &'a ConversationHistory,
    pub tasks: &'a TasksCompleted,
    pub base_lm: &'a LmHandle,
    pub complex_lm: &'a LmHandle,
    pub pool: &'a ClientPool,
}

impl<'a> ToolContext<'a> {
    pub fn view(&self) -> TreeView<'a> {
        TreeView {
            environment: self.environment,
            history: self.history,
            collection_names: self.collection_names,
        }
    }
}

/// The capability set every tool implements.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// Progress line emitted when the tool starts.
    fn status(&self) -> &str;

    fn inputs(&self) -> InputSchema;

    /// Terminal tools end the decision loop after a successful run.
    fn terminal(&self) -> bool {
        false
    }

    /// Whether the selector may offer this tool right now.
    async fn is_available(&self, _view: TreeView<'_>) -> bool {
        true
    }

    /// Run the tool, writing yields as they are produced. Resolving the
    /// future marks the invocation complete.
    async fn call(&self, ctx: &ToolContext<'_>, inputs: Value, out: ToolOutput) -> Result<()>;

    /// The graph node descriptor for this tool.
    fn node(&self) -> Node {
        Node::tool(
            self.name(),
            self.description(),
            self.status(),
            self.inputs(),
            self.terminal(),
        )
    }
}

pub type SharedTool = Arc<dyn Tool>;

/// The per-tree tool registry: name → implementation.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, SharedTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: SharedTool) {
        self.tools.insert(tool.name().to_owned(), tool);
    }

    pub fn unregister(&mut self, name: &str) {
        self.tools.remove(name);
    }

    pub fn get(&self, name: &str) -> Option<&SharedTool> {
        self.tools.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    /// Graph node descriptors for every registered tool.
    pub fn descriptors(&self) -> Vec<Node> {
        self.tools.values().map(|t| t.node()).collect()
    }
}
