//! User feedback on individual responses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One feedback record. Unique per `(user_id, conversation_id, query_id)`;
/// submitting feedback again for the same query overwrites the old value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub user_id: String,
    pub conversation_id: String,
    pub query_id: String,
    /// -1 (negative) or +1 (positive).
    pub value: i8,
    pub timestamp: DateTime<Utc>,
}

impl Feedback {
    pub fn new(
        user_id: impl Into<String>,
        conversation_id: impl Into<String>,
        query_id: impl Into<String>,
        value: i8,
    ) -> Result<Self> {
        if value != -1 && value != 1 {
            return Err(Error::Config(format!(
                "feedback value must be -1 or 1, got {value}"
            )));
        }
        Ok(Self {
            user_id: user_id.into(),
            conversation_id: conversation_id.into(),
            query_id: query_id.into(),
            value,
            timestamp: Utc::now(),
        })
    }

    /// Deterministic persisted-object id for the uniqueness key.
    pub fn object_id(&self) -> uuid::Uuid {
        feedback_object_id(&self.user_id, &self.conversation_id, &self.query_id)
    }
}

/// uuid-v5 of the `(user_id, conversation_id, query_id)` key, so repeat
/// submissions land on the same persisted object.
pub fn feedback_object_id(user_id: &str, conversation_id: &str, query_id: &str) -> uuid::Uuid {
    let name = format!("{user_id}/{conversation_id}/{query_id}");
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, name.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_values() {
        assert!(Feedback::new("u", "c", "q", 0).is_err());
        assert!(Feedback::new("u", "c", "q", 2).is_err());
        assert!(Feedback::new("u", "c", "q", -1).is_ok());
        assert!(Feedback::new("u", "c", "q", 1).is_ok());
    }

    #[test]
    fn object_id_is_stable_for_the_key() {
        let a = Feedback::new("u", "c", "q", 1).unwrap();
        let b = Feedback::new("u", "c", "q", -1).unwrap();
        assert_eq!(a.object_id(), b.object_id());

        let other = Feedback::new("u", "c", "q2", 1).unwrap();
        assert_ne!(a.object_id(), other.object_id());
    }
}
