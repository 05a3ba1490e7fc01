//! Relevance search over the connected collections.

use arbor_domain::error::Result;
use arbor_domain::schema::{FieldKind, InputField, InputSchema};
use serde_json::Value;

use crate::tool::{Tool, ToolContext, ToolOutput, ToolYield, TreeView};

pub struct QueryTool;

#[async_trait::async_trait]
impl Tool for QueryTool {
    fn name(&self) -> &str {
        "query"
    }

    fn description(&self) -> &str {
        "Search the connected collections for objects relevant to a search \
         term. Use this whenever the user asks about the contents of their \
         data."
    }

    fn status(&self) -> &str {
        "Searching the collections..."
    }

    fn inputs(&self) -> InputSchema {
        InputSchema::new()
            .field(
                "search_term",
                InputField::new(
                    FieldKind::String,
                    "what to search for, phrased as a few keywords",
                )
                .required(),
            )
            .field(
                "limit",
                InputField::new(FieldKind::Integer, "maximum results per collection")
                    .with_default(Value::from(20)),
            )
            .field(
                "collection_names",
                InputField::new(
                    FieldKind::list_of(FieldKind::String),
                    "which collections to search; defaults to every available collection",
                ),
            )
    }

    async fn is_available(&self, view: TreeView<'_>) -> bool {
        !view.collection_names.is_empty()
    }

    async fn call(&self, ctx: &ToolContext<'_>, inputs: Value, out: ToolOutput) -> Result<()> {
        let search_term = inputs["search_term"].as_str().unwrap_or_default().to_owned();
        let limit = inputs["limit"].as_u64().unwrap_or(20) as usize;
        let targets: Vec<String> = match inputs["collection_names"].as_array() {
            Some(names) if !names.is_empty() => names
                .iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect(),
            _ => ctx.collection_names.to_vec(),
        };

        if targets.is_empty() {
            let _ = out
                .send(ToolYield::Error("no collections available to search".into()))
                .await;
            return Ok(());
        }

        let store = match ctx.pool.acquire().await {
            Ok(store) => store,
            Err(e) => {
                let _ = out.send(ToolYield::Error(e.to_string())).await;
                return Ok(());
            }
        };

        for collection in targets {
            let _ = out
                .send(ToolYield::Status(format!("Searching {collection}...")))
                .await;

            match store.query(&collection, &search_term, limit).await {
                Ok(objects) => {
                    let found = objects.len();
                    let objects: Vec<Value> =
                        objects.into_iter().map(|o| o.properties).collect();
                    let _ = out
                        .send(ToolYield::Result {
                            objects,
                            metadata: serde_json::json!({
                                "collection": collection,
                                "search_term": search_term,
                                "count": found,
                            }),
                            llm_message: Some(format!(
                                "query found {found} object(s) in `{collection}` \
                                 for `{search_term}`"
                            )),
                            name: None,
                            variant: Some(collection.clone()),
                            replace: false,
                        })
                        .await;
                }
                Err(e) => {
                    let _ = out
                        .send(ToolYield::Error(format!(
                            "searching `{collection}` failed: {e}"
                        )))
                        .await;
                    return Ok(());
                }
            }
        }

        let _ = out.send(ToolYield::Completed).await;
        Ok(())
    }
}
