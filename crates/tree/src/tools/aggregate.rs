//! Statistics over a collection.

use arbor_domain::error::Result;
use arbor_domain::schema::{FieldKind, InputField, InputSchema};
use serde_json::Value;

use crate::tool::{Tool, ToolContext, ToolOutput, ToolYield, TreeView};

pub struct AggregateTool;

#[async_trait::async_trait]
impl Tool for AggregateTool {
    fn name(&self) -> &str {
        "aggregate"
    }

    fn description(&self) -> &str {
        "Compute statistics over a collection: total object count, \
         optionally grouped by one property. Use this for questions about \
         how many, or about the distribution of a field."
    }

    fn status(&self) -> &str {
        "Aggregating the collection..."
    }

    fn inputs(&self) -> InputSchema {
        InputSchema::new()
            .field(
                "collection_name",
                InputField::new(FieldKind::String, "the collection to aggregate over")
                    .required(),
            )
            .field(
                "group_by",
                InputField::new(
                    FieldKind::String,
                    "optional property name to group counts by",
                ),
            )
    }

    async fn is_available(&self, view: TreeView<'_>) -> bool {
        !view.collection_names.is_empty()
    }

    async fn call(&self, ctx: &ToolContext<'_>, inputs: Value, out: ToolOutput) -> Result<()> {
        let collection = inputs["collection_name"]
            .as_str()
            .unwrap_or_default()
            .to_owned();
        let group_by = inputs["group_by"].as_str().map(str::to_owned);

        let store = match ctx.pool.acquire().await {
            Ok(store) => store,
            Err(e) => {
                let _ = out.send(ToolYield::Error(e.to_string())).await;
                return Ok(());
            }
        };

        match store.aggregate(&collection, group_by.as_deref()).await {
            Ok(aggregation) => {
                let count = aggregation["count"].as_u64().unwrap_or(0);
                let _ = out
                    .send(ToolYield::Result {
                        objects: vec![aggregation],
                        metadata: serde_json::json!({
                            "collection": collection,
                            "group_by": group_by,
                        }),
                        llm_message: Some(format!(
                            "aggregate over `{collection}`: {count} object(s) total"
                        )),
                        name: None,
                        variant: Some(collection.clone()),
                        replace: false,
                    })
                    .await;
                let _ = out.send(ToolYield::Completed).await;
            }
            Err(e) => {
                let _ = out
                    .send(ToolYield::Error(format!(
                        "aggregating `{collection}` failed: {e}"
                    )))
                    .await;
            }
        }
        Ok(())
    }
}
