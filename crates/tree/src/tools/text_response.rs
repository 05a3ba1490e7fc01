//! The terminal fallback: answer the user directly.
//!
//! Runs the same synthesiser the engine would run after the loop, so a
//! selected `text_response` and an end-of-run synthesis produce identical
//! messages. Yielding `Response` discharges the engine's obligation to
//! synthesise afterwards.

use arbor_domain::error::Result;
use arbor_domain::schema::InputSchema;
use serde_json::Value;

use crate::engine::calls::synthesise;
use crate::tool::{Tool, ToolContext, ToolOutput, ToolYield};

pub struct TextResponseTool;

#[async_trait::async_trait]
impl Tool for TextResponseTool {
    fn name(&self) -> &str {
        "text_response"
    }

    fn description(&self) -> &str {
        "Respond to the user directly with everything gathered so far. \
         Choose this when the request is satisfied, when no other action \
         can help, or to ask the user for clarification."
    }

    fn status(&self) -> &str {
        "Writing a response..."
    }

    fn inputs(&self) -> InputSchema {
        InputSchema::new()
    }

    fn terminal(&self) -> bool {
        true
    }

    async fn call(&self, ctx: &ToolContext<'_>, _inputs: Value, out: ToolOutput) -> Result<()> {
        match synthesise(
            ctx.complex_lm,
            ctx.style,
            ctx.agent_description,
            ctx.history,
            ctx.environment,
        )
        .await
        {
            Ok(text) => {
                let _ = out.send(ToolYield::Response(text)).await;
                let _ = out.send(ToolYield::Completed).await;
            }
            Err(e) => {
                let _ = out.send(ToolYield::Error(e.to_string())).await;
            }
        }
        Ok(())
    }
}
