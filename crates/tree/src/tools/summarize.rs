//! Environment compaction.
//!
//! Reads one (tool, variant) slot, asks the base model for a summary, and
//! overwrites the slot with a single summarised invocation through the
//! ordinary `replace` yield; no engine privilege involved.

use arbor_domain::error::Result;
use arbor_domain::schema::{FieldKind, InputField, InputSchema};
use arbor_lm::traits::{ChatMessage, ChatRequest};
use arbor_lm::retry::chat_with_backoff;
use serde_json::Value;

use crate::tool::{Tool, ToolContext, ToolOutput, ToolYield, TreeView};

pub struct SummarizeTool;

#[async_trait::async_trait]
impl Tool for SummarizeTool {
    fn name(&self) -> &str {
        "summarize"
    }

    fn description(&self) -> &str {
        "Condense the accumulated outputs of one earlier tool into a short \
         summary, freeing room for further work. Use when the gathered \
         results have grown large or repetitive."
    }

    fn status(&self) -> &str {
        "Summarizing earlier results..."
    }

    fn inputs(&self) -> InputSchema {
        InputSchema::new()
            .field(
                "tool_name",
                InputField::new(FieldKind::String, "the tool whose outputs to condense")
                    .required(),
            )
            .field(
                "variant",
                InputField::new(FieldKind::String, "the variant (slot) to condense")
                    .required(),
            )
    }

    async fn is_available(&self, view: TreeView<'_>) -> bool {
        !view.environment.is_empty()
    }

    async fn call(&self, ctx: &ToolContext<'_>, inputs: Value, out: ToolOutput) -> Result<()> {
        let tool_name = inputs["tool_name"].as_str().unwrap_or_default().to_owned();
        let variant = inputs["variant"].as_str().unwrap_or_default().to_owned();

        let Some(invocations) = ctx.environment.find(&tool_name, &variant) else {
            let _ = out
                .send(ToolYield::Error(format!(
                    "nothing recorded under {tool_name}/{variant}"
                )))
                .await;
            return Ok(());
        };

        let rendered = invocations
            .iter()
            .flat_map(|i| i.objects.iter())
            .map(|o| o.to_string())
            .collect::<Vec<_>>()
            .join("\n");

        let req = ChatRequest {
            messages: vec![
                ChatMessage::system(
                    "Condense the following tool outputs into a short factual \
                     summary. Keep every number and name that could matter \
                     later. Respond with the summary only.",
                ),
                ChatMessage::user(rendered),
            ],
            ..Default::default()
        };

        match chat_with_backoff(ctx.base_lm, req).await {
            Ok(resp) => {
                let original = invocations.len();
                let _ = out
                    .send(ToolYield::Result {
                        objects: vec![Value::String(resp.content)],
                        metadata: serde_json::json!({
                            "summary": true,
                            "condensed_invocations": original,
                        }),
                        llm_message: Some(format!(
                            "condensed {original} invocation(s) of {tool_name}/{variant}"
                        )),
                        name: Some(tool_name),
                        variant: Some(variant),
                        replace: true,
                    })
                    .await;
                let _ = out.send(ToolYield::Completed).await;
            }
            Err(e) => {
                let _ = out.send(ToolYield::Error(e.to_string())).await;
            }
        }
        Ok(())
    }
}
