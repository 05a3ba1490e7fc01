//! Access to the external vector database.
//!
//! The wire protocol is an external concern; everything in Arbor talks to
//! the [`VectorStore`] trait. `HttpStore` is the production implementation,
//! `MemoryStore` backs tests, and [`ClientPool`] owns the long-lived,
//! lazily-opened handle per user with idle restart and key rotation.

pub mod http;
pub mod memory;
pub mod pool;
pub mod store;

pub use http::HttpStore;
pub use memory::MemoryStore;
pub use pool::ClientPool;
pub use store::{filter, Filters, SharedStore, StoredObject, VectorStore};
