//! Conversation history entries.

use serde::{Deserialize, Serialize};

use crate::ids::MessageId;
use crate::part::ContentPart;

/// Which side of the exchange produced an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Model,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
        }
    }
}

/// One exchange turn: a role-tagged ordered list of content parts.
///
/// Owned by the conversation store. The payload governor reads entries and
/// returns fresh copies; it never mutates them in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: MessageId,
    pub role: Role,
    pub parts: Vec<ContentPart>,
}

impl HistoryEntry {
    #[must_use]
    pub fn new(id: MessageId, role: Role, parts: Vec<ContentPart>) -> Self {
        Self { id, role, parts }
    }

    /// Total raw media bytes across this entry's parts.
    #[must_use]
    pub fn raw_media_bytes(&self) -> u64 {
        self.parts
            .iter()
            .filter_map(ContentPart::as_media)
            .map(|media| media.data.raw_size())
            .sum()
    }
}
