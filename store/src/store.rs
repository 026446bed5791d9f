//! SQLite-backed content store for full-resolution media.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};

use atelier_types::{ImageId, MessageId};

/// One stored media item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaRecord {
    pub id: ImageId,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

/// Persistent store for offloaded media bytes.
///
/// Keys are deterministic [`ImageId`]s, so re-running offload for the same
/// message overwrites rather than duplicates, and everything belonging to a
/// message can be deleted by prefix.
pub struct MediaStore {
    db: Mutex<Connection>,
}

impl MediaStore {
    const SCHEMA: &'static str = r"
        CREATE TABLE IF NOT EXISTS media_records (
            id TEXT PRIMARY KEY,
            mime_type TEXT NOT NULL,
            bytes BLOB NOT NULL
        );
    ";

    /// Open or create the media store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let db = Connection::open(path)
            .with_context(|| format!("Failed to open media store at {}", path.display()))?;
        Self::initialize(db)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let db = Connection::open_in_memory().context("Failed to open in-memory media store")?;
        Self::initialize(db)
    }

    fn initialize(db: Connection) -> Result<Self> {
        db.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .context("Failed to set media store pragmas")?;
        db.execute_batch(Self::SCHEMA)
            .context("Failed to create media store schema")?;
        Ok(Self { db: Mutex::new(db) })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned lock means a panic mid-statement; the connection itself
        // is still usable for independent statements.
        self.db.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Insert or replace a media record.
    pub fn put(&self, record: &MediaRecord) -> Result<()> {
        self.lock()
            .execute(
                "INSERT OR REPLACE INTO media_records (id, mime_type, bytes) VALUES (?1, ?2, ?3)",
                params![record.id.as_str(), record.mime_type, record.bytes],
            )
            .with_context(|| format!("Failed to store media {}", record.id))?;
        Ok(())
    }

    /// Fetch a record by id, `None` if absent.
    pub fn get(&self, id: &ImageId) -> Result<Option<MediaRecord>> {
        let db = self.lock();
        db.query_row(
            "SELECT mime_type, bytes FROM media_records WHERE id = ?1",
            params![id.as_str()],
            |row| {
                Ok(MediaRecord {
                    id: id.clone(),
                    mime_type: row.get(0)?,
                    bytes: row.get(1)?,
                })
            },
        )
        .optional()
        .with_context(|| format!("Failed to read media {id}"))
    }

    /// Delete a single record. Deleting an absent id is not an error.
    pub fn delete(&self, id: &ImageId) -> Result<()> {
        self.lock()
            .execute(
                "DELETE FROM media_records WHERE id = ?1",
                params![id.as_str()],
            )
            .with_context(|| format!("Failed to delete media {id}"))?;
        Ok(())
    }

    /// Delete every record belonging to one message.
    ///
    /// Relies on the deterministic id scheme: the `/` in the prefix keeps
    /// `msg-1/` from matching `msg-11/...`.
    pub fn delete_owner(&self, owner: MessageId) -> Result<usize> {
        let pattern = format!("{}%", ImageId::owner_prefix(owner));
        let deleted = self
            .lock()
            .execute(
                "DELETE FROM media_records WHERE id LIKE ?1",
                params![pattern],
            )
            .with_context(|| format!("Failed to delete media for message {owner}"))?;
        Ok(deleted)
    }

    /// Drop all records.
    pub fn clear(&self) -> Result<()> {
        self.lock()
            .execute("DELETE FROM media_records", [])
            .context("Failed to clear media store")?;
        Ok(())
    }

    /// Number of stored records.
    pub fn len(&self) -> Result<usize> {
        let count: i64 = self
            .lock()
            .query_row("SELECT COUNT(*) FROM media_records", [], |row| row.get(0))
            .context("Failed to count media records")?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}
