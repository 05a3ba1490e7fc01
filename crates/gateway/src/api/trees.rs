//! Saved-tree endpoints: snapshot, restore, list, delete.

use axum::extract::{Path, State};
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use crate::api::{api_error, api_ok};
use crate::state::AppState;

/// Optional destination override carried by save/load/delete bodies.
#[derive(Debug, Deserialize, Default)]
pub struct DestinationBody {
    #[serde(default)]
    pub wcd_url: Option<String>,
    #[serde(default)]
    pub wcd_api_key: Option<String>,
}

/// POST /tree/:user_id/:conversation_id/save: snapshot a live tree.
pub async fn save_tree(
    State(state): State<AppState>,
    Path((user_id, conversation_id)): Path<(String, String)>,
    body: Option<Json<DestinationBody>>,
) -> Response {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    match state
        .users
        .save_tree(
            &user_id,
            &conversation_id,
            body.wcd_url.as_deref(),
            body.wcd_api_key.as_deref(),
        )
        .await
    {
        Ok(()) => api_ok(json!({})),
        Err(e) => api_error(e, json!({})),
    }
}

/// POST /tree/:user_id/:conversation_id/load: restore a saved tree and
/// return its envelope list for the client to replay.
pub async fn load_tree(
    State(state): State<AppState>,
    Path((user_id, conversation_id)): Path<(String, String)>,
    body: Option<Json<DestinationBody>>,
) -> Response {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    match state
        .users
        .load_tree(
            &user_id,
            &conversation_id,
            body.wcd_url.as_deref(),
            body.wcd_api_key.as_deref(),
        )
        .await
    {
        Ok(envelopes) => match serde_json::to_value(&envelopes) {
            Ok(payloads) => api_ok(json!({ "frontend_payloads": payloads })),
            Err(e) => api_error(e, json!({ "frontend_payloads": [] })),
        },
        Err(e) => api_error(e, json!({ "frontend_payloads": [] })),
    }
}

/// GET /tree/:user_id/saved: saved conversations with titles.
pub async fn get_saved_trees(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Response {
    match state.users.get_saved_trees(&user_id).await {
        Ok(trees) => api_ok(json!({ "trees": trees })),
        Err(e) => api_error(e, json!({ "trees": {} })),
    }
}

/// DELETE /tree/:user_id/:conversation_id: remove the saved snapshot and
/// the in-memory tree.
pub async fn delete_tree(
    State(state): State<AppState>,
    Path((user_id, conversation_id)): Path<(String, String)>,
    body: Option<Json<DestinationBody>>,
) -> Response {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    match state
        .users
        .delete_tree(
            &user_id,
            &conversation_id,
            body.wcd_url.as_deref(),
            body.wcd_api_key.as_deref(),
        )
        .await
    {
        Ok(()) => api_ok(json!({})),
        Err(e) => api_error(e, json!({})),
    }
}
