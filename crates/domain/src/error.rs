/// Shared error type used across all Arbor crates.
///
/// The first six variants are the user-facing taxonomy: they decide whether a
/// failure is recovered inside the decision loop, surfaced on the stream, or
/// returned on the HTTP control surface. The remaining variants are
/// infrastructure plumbing.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Invalid or incomplete settings/config input.
    #[error("config: {0}")]
    Config(String),

    /// A user, tree, collection, or persisted object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A user or tree was evicted for inactivity.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Transient failure in the vector database or a language model.
    #[error("upstream: {0}")]
    Upstream(String),

    /// A tool surfaced a failure through its `Error` yield.
    #[error("tool {tool}: {message}")]
    Tool { tool: String, message: String },

    /// Malformed frontend message.
    #[error("protocol: {0}")]
    Protocol(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True when a single retry with backoff is worth attempting.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Upstream(_) | Error::Http(_))
    }
}
