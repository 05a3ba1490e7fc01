//! The visible conversation record.
//!
//! Written at run boundaries only: the user's prompt before the run, the
//! final synthesised message at its end. Tool chatter never lands here.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationHistory {
    entries: Vec<HistoryMessage>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.entries.push(HistoryMessage {
            role: Role::User,
            content: content.into(),
        });
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.entries.push(HistoryMessage {
            role: Role::Assistant,
            content: content.into(),
        });
    }

    pub fn entries(&self) -> &[HistoryMessage] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Render for a language-model prompt.
    pub fn render(&self) -> String {
        if self.entries.is_empty() {
            return "(no previous messages)".into();
        }
        self.entries
            .iter()
            .map(|m| {
                let who = match m.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                format!("{who}: {}", m.content)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_in_order() {
        let mut history = ConversationHistory::new();
        history.push_user("hi");
        history.push_assistant("hello!");

        assert_eq!(history.len(), 2);
        assert_eq!(history.entries()[0].role, Role::User);
        assert_eq!(history.entries()[0].content, "hi");
        assert_eq!(history.entries()[1].role, Role::Assistant);
    }

    #[test]
    fn render_tags_roles() {
        let mut history = ConversationHistory::new();
        history.push_user("a");
        history.push_assistant("b");
        assert_eq!(history.render(), "user: a\nassistant: b");
    }
}
