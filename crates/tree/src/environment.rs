//! The accumulated tool outputs of a conversation.
//!
//! Two-level mapping: tool name → variant name → ordered invocations.
//! Within a run the environment is append-only; a reduce tool may replace a
//! whole (tool, variant) slot to compact it, which is a deliberate policy
//! driven through the same yield protocol as any other output.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One recorded tool invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    /// Free-form metadata the tool attached (inputs used, counts, …).
    pub metadata: Value,
    /// The ordered records the tool emitted.
    pub objects: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    data: BTreeMap<String, BTreeMap<String, Vec<Invocation>>>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    /// True iff no tool has ever emitted.
    pub fn is_empty(&self) -> bool {
        self.data.values().all(|variants| {
            variants.values().all(|invocations| invocations.is_empty())
        })
    }

    /// The invocation list for a (tool, variant) slot.
    pub fn find(&self, tool: &str, variant: &str) -> Option<&Vec<Invocation>> {
        self.data.get(tool)?.get(variant)
    }

    /// Append an invocation; returns its position in the slot.
    pub fn append(&mut self, tool: &str, variant: &str, invocation: Invocation) -> usize {
        let slot = self
            .data
            .entry(tool.to_owned())
            .or_default()
            .entry(variant.to_owned())
            .or_default();
        slot.push(invocation);
        slot.len() - 1
    }

    /// Append at a known position. A no-op when the slot already holds an
    /// entry at `position`, which makes replayed appends idempotent.
    pub fn append_at(
        &mut self,
        tool: &str,
        variant: &str,
        position: usize,
        invocation: Invocation,
    ) {
        let slot = self
            .data
            .entry(tool.to_owned())
            .or_default()
            .entry(variant.to_owned())
            .or_default();
        if position < slot.len() {
            return;
        }
        slot.push(invocation);
    }

    /// Overwrite a (tool, variant) slot with a single invocation: the
    /// compaction path.
    pub fn replace(&mut self, tool: &str, variant: &str, invocation: Invocation) {
        self.data
            .entry(tool.to_owned())
            .or_default()
            .insert(variant.to_owned(), vec![invocation]);
    }

    /// Tools that have emitted at least once.
    pub fn tool_names(&self) -> Vec<&str> {
        self.data.keys().map(String::as_str).collect()
    }

    /// A compact textual summary for the selector and synthesiser prompts:
    /// per slot, the invocation count, object count, and latest metadata.
    pub fn summary(&self) -> String {
        if self.is_empty() {
            return "(no tool outputs yet)".into();
        }
        let mut lines = Vec::new();
        for (tool, variants) in &self.data {
            for (variant, invocations) in variants {
                if invocations.is_empty() {
                    continue;
                }
                let objects: usize = invocations.iter().map(|i| i.objects.len()).sum();
                let latest = invocations
                    .last()
                    .map(|i| i.metadata.to_string())
                    .unwrap_or_default();
                lines.push(format!(
                    "- {tool}/{variant}: {} invocation(s), {objects} object(s), latest metadata {latest}",
                    invocations.len()
                ));
            }
        }
        lines.join("\n")
    }

    /// Everything a synthesiser needs: the raw objects per slot.
    pub fn render_objects(&self) -> String {
        let mut out = Vec::new();
        for (tool, variants) in &self.data {
            for (variant, invocations) in variants {
                for invocation in invocations {
                    for object in &invocation.objects {
                        out.push(format!("[{tool}/{variant}] {object}"));
                    }
                }
            }
        }
        out.join("\n")
    }
}
