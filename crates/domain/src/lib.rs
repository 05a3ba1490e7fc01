//! Shared types for the Arbor gateway: the error taxonomy, the streaming
//! envelope, tool input schemas, per-user settings and configs, and the
//! secret-encryption helpers.

pub mod config;
pub mod envelope;
pub mod error;
pub mod feedback;
pub mod models;
pub mod schema;
pub mod secrets;
pub mod settings;

pub use error::{Error, Result};

/// Collection names in the external database. Everything Arbor persists
/// lives under the `ELYSIA_` namespace prefix.
pub mod collections {
    pub const CONFIGS: &str = "ELYSIA_CONFIG__";
    pub const TREES: &str = "ELYSIA_TREES__";
    pub const FEEDBACK: &str = "ELYSIA_FEEDBACK__";
}
