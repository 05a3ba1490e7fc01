//! The tasks-completed ledger.
//!
//! One entry per prompt; the entry's `task` list grows as tools complete
//! (or fail). The ledger feeds the selector and the end-goal evaluator, so
//! a failed step, with its error text, is visible to the very next
//! decision.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStep {
    pub name: String,
    pub reasoning: String,
    pub inputs: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEntry {
    pub prompt: String,
    pub query_id: String,
    pub task: Vec<TaskStep>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TasksCompleted {
    entries: Vec<TaskEntry>,
}

impl TasksCompleted {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the ledger entry for a new prompt.
    pub fn begin_prompt(&mut self, prompt: impl Into<String>, query_id: impl Into<String>) {
        self.entries.push(TaskEntry {
            prompt: prompt.into(),
            query_id: query_id.into(),
            task: Vec::new(),
        });
    }

    /// Record a step against the current (latest) prompt entry.
    pub fn record_step(&mut self, step: TaskStep) {
        if let Some(entry) = self.entries.last_mut() {
            entry.task.push(step);
        }
    }

    pub fn entries(&self) -> &[TaskEntry] {
        &self.entries
    }

    /// Steps recorded for the current prompt.
    pub fn current_steps(&self) -> &[TaskStep] {
        self.entries
            .last()
            .map(|e| e.task.as_slice())
            .unwrap_or_default()
    }

    /// Render the ledger for a language-model prompt, most recent last.
    pub fn render(&self) -> String {
        if self.entries.is_empty() {
            return "(no tasks completed yet)".into();
        }
        let mut out = Vec::new();
        for entry in &self.entries {
            out.push(format!("prompt: {}", entry.prompt));
            for step in &entry.task {
                let outcome = match (&step.error, &step.output_summary) {
                    (Some(err), _) => format!("FAILED: {err}"),
                    (None, Some(summary)) => format!("ok: {summary}"),
                    (None, None) => "ok".into(),
                };
                out.push(format!(
                    "  - {} (inputs {}): {} [{}]",
                    step.name, step.inputs, step.reasoning, outcome
                ));
            }
        }
        out.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn steps_land_on_the_latest_prompt() {
        let mut tasks = TasksCompleted::new();
        tasks.begin_prompt("first", "q1");
        tasks.record_step(TaskStep {
            name: "query".into(),
            reasoning: "look things up".into(),
            inputs: json!({ "search_term": "x" }),
            output_summary: Some("3 results".into()),
            error: None,
        });
        tasks.begin_prompt("second", "q2");
        tasks.record_step(TaskStep {
            name: "aggregate".into(),
            reasoning: "count".into(),
            inputs: json!({}),
            output_summary: None,
            error: Some("collection missing".into()),
        });

        assert_eq!(tasks.entries().len(), 2);
        assert_eq!(tasks.entries()[0].task.len(), 1);
        assert_eq!(tasks.current_steps().len(), 1);
        assert_eq!(tasks.current_steps()[0].name, "aggregate");
    }

    #[test]
    fn render_marks_failures() {
        let mut tasks = TasksCompleted::new();
        tasks.begin_prompt("p", "q");
        tasks.record_step(TaskStep {
            name: "query".into(),
            reasoning: "r".into(),
            inputs: json!({}),
            output_summary: None,
            error: Some("boom".into()),
        });
        assert!(tasks.render().contains("FAILED: boom"));
    }
}
