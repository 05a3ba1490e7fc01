//! The decision-tree core: graph, environment, history, tool contract,
//! built-in tools, the per-prompt engine, and tree snapshots.

pub mod engine;
pub mod environment;
pub mod graph;
pub mod history;
pub mod snapshot;
pub mod tasks;
pub mod tool;
pub mod tools;
pub mod tree;

pub use engine::{run, run_with_handles, RunRequest, MAX_STEPS, RUN_WAIT};
pub use environment::{Environment, Invocation};
pub use graph::{Node, NodeKind, TreeGraph, ROOT_BRANCH, TEXT_RESPONSE};
pub use history::ConversationHistory;
pub use tasks::TasksCompleted;
pub use tool::{SharedTool, Tool, ToolContext, ToolRegistry, ToolYield, TreeView};
pub use tree::{Tree, TreeHandle};
