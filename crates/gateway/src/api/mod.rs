//! The HTTP control surface and the streaming websocket.
//!
//! Every JSON handler responds with an `error` field: empty on success,
//! the human-readable message (alongside zeroed payload fields) on
//! failure. Non-fatal problems ride in a `warnings` array next to the
//! main result.

pub mod feedback;
pub mod init;
pub mod query;
pub mod tools;
pub mod tree_config;
pub mod trees;
pub mod user_config;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, patch, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use crate::state::AppState;

/// Build the gateway router.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health
        .route("/api/health", get(health))
        // Init
        .route("/init/user/:user_id", post(init::init_user))
        .route(
            "/init/tree/:user_id/:conversation_id",
            post(init::init_tree),
        )
        // Streaming protocol
        .route("/ws/query", get(query::query_websocket))
        // User config
        .route(
            "/user/config/:user_id",
            get(user_config::get_user_config).patch(user_config::change_config_user),
        )
        .route("/user/config/:user_id/save", post(user_config::save_config))
        .route(
            "/user/config/:user_id/load/:config_id",
            post(user_config::load_config_user),
        )
        .route("/user/config/:user_id/list", get(user_config::list_configs))
        .route(
            "/user/config/:user_id/new",
            post(user_config::new_user_config),
        )
        .route(
            "/user/config/:user_id/:config_id",
            delete(user_config::delete_config),
        )
        // Tree config
        .route(
            "/tree/config/:user_id/:conversation_id",
            patch(tree_config::change_config_tree),
        )
        .route(
            "/tree/config/:user_id/:conversation_id/load/:config_id",
            post(tree_config::load_config_tree),
        )
        // Saved trees
        .route(
            "/tree/:user_id/:conversation_id/save",
            post(trees::save_tree),
        )
        .route(
            "/tree/:user_id/:conversation_id/load",
            post(trees::load_tree),
        )
        .route("/tree/:user_id/saved", get(trees::get_saved_trees))
        .route(
            "/tree/:user_id/:conversation_id",
            delete(trees::delete_tree),
        )
        // Graph mutation
        .route(
            "/tree/:user_id/:conversation_id/tool/add",
            post(tools::add_tool_to_tree),
        )
        .route(
            "/tree/:user_id/:conversation_id/tool/remove",
            post(tools::remove_tool_from_tree),
        )
        .route(
            "/tree/:user_id/:conversation_id/branch/add",
            post(tools::add_branch_to_tree),
        )
        .route(
            "/tree/:user_id/:conversation_id/branch/remove",
            post(tools::remove_branch_from_tree),
        )
        // Feedback
        .route("/feedback/add", post(feedback::add_feedback))
        .route("/feedback/remove", post(feedback::remove_feedback))
        .route(
            "/feedback/metadata/:user_id",
            get(feedback::feedback_metadata),
        )
        .layer(cors)
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "healthy" }))
}

/// A failure response: `error` populated, the given payload fields zeroed.
pub(crate) fn api_error(message: impl std::fmt::Display, mut zeroed: serde_json::Value) -> Response {
    if let Some(map) = zeroed.as_object_mut() {
        map.insert("error".into(), serde_json::json!(message.to_string()));
    }
    (StatusCode::INTERNAL_SERVER_ERROR, Json(zeroed)).into_response()
}

/// A success response: `error` is the empty string.
pub(crate) fn api_ok(mut payload: serde_json::Value) -> Response {
    if let Some(map) = payload.as_object_mut() {
        map.insert("error".into(), serde_json::json!(""));
    }
    (StatusCode::OK, Json(payload)).into_response()
}
