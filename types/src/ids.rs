use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a conversation message, assigned by the conversation store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(u64);

impl MessageId {
    #[must_use]
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque reference into the media store.
///
/// Derived deterministically from the owning message and part index so the
/// same part always maps to the same record across re-renders, and so all
/// records for one message share a common prefix (enabling prefix deletes).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(String);

impl ImageId {
    /// Derive the id for the `part_index`-th part of message `owner`.
    #[must_use]
    pub fn derive(owner: MessageId, part_index: usize) -> Self {
        Self(format!("msg-{owner}/p{part_index}"))
    }

    /// Prefix shared by every id derived from `owner`.
    #[must_use]
    pub fn owner_prefix(owner: MessageId) -> String {
        format!("msg-{owner}/")
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::{ImageId, MessageId};

    #[test]
    fn image_id_is_deterministic() {
        let owner = MessageId::new(42);
        assert_eq!(ImageId::derive(owner, 0), ImageId::derive(owner, 0));
        assert_ne!(ImageId::derive(owner, 0), ImageId::derive(owner, 1));
    }

    #[test]
    fn image_id_starts_with_owner_prefix() {
        let owner = MessageId::new(7);
        let id = ImageId::derive(owner, 3);
        assert!(id.as_str().starts_with(&ImageId::owner_prefix(owner)));
    }

    #[test]
    fn different_owners_have_disjoint_prefixes() {
        let a = ImageId::derive(MessageId::new(1), 0);
        let prefix_b = ImageId::owner_prefix(MessageId::new(11));
        assert!(!a.as_str().starts_with(&prefix_b));
    }
}
