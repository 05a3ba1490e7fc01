//! User and tree lifecycle management.

pub mod trees;
pub mod users;

pub use trees::TreeManager;
pub use users::{User, UserManager};
