//! Built-in tools registered on every tree.

mod aggregate;
mod query;
mod summarize;
mod text_response;

pub use aggregate::AggregateTool;
pub use query::QueryTool;
pub use summarize::SummarizeTool;
pub use text_response::TextResponseTool;

use std::sync::Arc;

use crate::tool::{SharedTool, ToolRegistry};

/// The built-in tool set, in the order templates reference them.
pub fn builtin_tools() -> Vec<SharedTool> {
    vec![
        Arc::new(QueryTool),
        Arc::new(AggregateTool),
        Arc::new(TextResponseTool),
        Arc::new(SummarizeTool),
    ]
}

/// A registry pre-loaded with the built-ins.
pub fn builtin_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    for tool in builtin_tools() {
        registry.register(tool);
    }
    registry
}
