//! Surfaces the orchestrator drives but does not own.
//!
//! The pipeline runner talks to the conversation, the user's account, and
//! the notification surface exclusively through these traits, so the engine
//! stays testable without a UI or a remote account service.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use async_trait::async_trait;

use atelier_types::{ContentPart, GenerationSettings, HistoryEntry, MessageId, Role};

/// The conversation the pipeline appends into.
///
/// Implementations are synchronous and cheap; remote persistence happens
/// behind [`ConversationStore::sync_message`], fire-and-forget.
pub trait ConversationStore: Send + Sync {
    /// Append a message and return its id.
    fn append_message(&self, role: Role, parts: Vec<ContentPart>) -> MessageId;

    /// Replace the parts of the most recent message.
    fn replace_last_message_parts(&self, parts: Vec<ContentPart>);

    /// Remove the most recent message (used to clean up empty placeholders).
    fn remove_last_message(&self);

    /// Current history, oldest first.
    fn history_snapshot(&self) -> Vec<HistoryEntry>;

    /// The conversation's active generation settings.
    fn active_settings(&self) -> GenerationSettings;

    fn set_active_settings(&self, settings: GenerationSettings);

    /// Kick off remote persistence for a message. Must not block.
    fn sync_message(&self, id: MessageId);
}

/// Account-side operations.
#[async_trait]
pub trait AccountClient: Send + Sync {
    /// Refresh the remaining-quota display after a run. Failures here are
    /// informational only; the pipeline never fails because of them.
    async fn refresh_remaining_quota(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// User-facing notification surface. Implementations must not block.
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str, severity: Severity);

    /// Progress update for an in-flight run.
    fn progress(&self, progress: atelier_types::RunProgress) {
        let _ = progress;
    }
}

/// In-memory [`ConversationStore`].
///
/// The default store for tests and for embedders that keep conversations in
/// process memory.
pub struct InMemoryConversation {
    history: Mutex<Vec<HistoryEntry>>,
    settings: Mutex<GenerationSettings>,
    next_id: AtomicU64,
}

impl InMemoryConversation {
    #[must_use]
    pub fn new(settings: GenerationSettings) -> Self {
        Self {
            history: Mutex::new(Vec::new()),
            settings: Mutex::new(settings),
            next_id: AtomicU64::new(1),
        }
    }

    fn history_lock(&self) -> std::sync::MutexGuard<'_, Vec<HistoryEntry>> {
        self.history
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn settings_lock(&self) -> std::sync::MutexGuard<'_, GenerationSettings> {
        self.settings
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl ConversationStore for InMemoryConversation {
    fn append_message(&self, role: Role, parts: Vec<ContentPart>) -> MessageId {
        let id = MessageId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.history_lock().push(HistoryEntry::new(id, role, parts));
        id
    }

    fn replace_last_message_parts(&self, parts: Vec<ContentPart>) {
        if let Some(last) = self.history_lock().last_mut() {
            last.parts = parts;
        }
    }

    fn remove_last_message(&self) {
        self.history_lock().pop();
    }

    fn history_snapshot(&self) -> Vec<HistoryEntry> {
        self.history_lock().clone()
    }

    fn active_settings(&self) -> GenerationSettings {
        self.settings_lock().clone()
    }

    fn set_active_settings(&self, settings: GenerationSettings) {
        *self.settings_lock() = settings;
    }

    fn sync_message(&self, _id: MessageId) {}
}
