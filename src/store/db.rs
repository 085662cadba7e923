//! `SQLite`-backed durable store for conversations, messages and memory.
//!
//! One long-lived connection sits behind a re-entrant guard. Read paths wait a
//! bounded time for the guard; write paths wait indefinitely. Composite
//! read-then-write operations hold the guard for their whole duration.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::thread::sleep;

use chrono::{DateTime, Utc};
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info, warn};

use crate::config::StorageConfig;
use crate::store::backup::BackupRotation;
use crate::store::error::{StoreError, StoreResult};
use crate::store::types::{
    Conversation, ConversationId, DEFAULT_MEMORY_CATEGORY, IntegrityReport, MemoryEntry, Message,
    Role,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS conversations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        conversation_id INTEGER NOT NULL
            REFERENCES conversations(id) ON DELETE CASCADE,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        timestamp INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_messages_conversation
        ON messages (conversation_id, id);
    CREATE TABLE IF NOT EXISTS memory (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        content TEXT NOT NULL,
        category TEXT NOT NULL DEFAULT 'general',
        created_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_memory_category
        ON memory (category);";

type SharedConnection = ReentrantMutex<RefCell<Option<Connection>>>;

/// The durable store.
pub struct Database {
    path: PathBuf,
    conn: SharedConnection,
    backups: BackupRotation,
    config: StorageConfig,
}

impl Database {
    /// Open (or create) the database file and ensure the schema exists.
    ///
    /// # Errors
    /// Returns an error if the directory or database cannot be opened.
    pub fn open(config: &StorageConfig) -> StoreResult<Self> {
        let path = config.db_path.clone();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;
        conn.busy_timeout(std::time::Duration::from_millis(config.busy_timeout_ms))?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        conn.execute_batch(SCHEMA)?;
        restrict_permissions(&path);

        info!(path = %path.display(), "store opened");
        Ok(Self {
            backups: BackupRotation::for_database(&path, config.max_backups),
            path,
            conn: ReentrantMutex::new(RefCell::new(Some(conn))),
            config: config.clone(),
        })
    }

    /// Path of the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Backup rotation used before destructive operations.
    #[must_use]
    pub const fn backups(&self) -> &BackupRotation {
        &self.backups
    }

    /// Acquire the guard for a composite operation. Calls made on this thread
    /// while the returned guard is alive re-enter it without waiting.
    pub(crate) fn hold(&self) -> ReentrantMutexGuard<'_, RefCell<Option<Connection>>> {
        self.conn.lock()
    }

    fn write<T>(&self, op: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let guard = self.conn.lock();
        let slot = guard.borrow();
        let conn = slot.as_ref().ok_or(StoreError::Closed)?;
        op(conn)
    }

    fn read<T>(&self, op: impl FnOnce(&Connection) -> StoreResult<T>) -> StoreResult<T> {
        let guard = self
            .conn
            .try_lock_for(self.config.lock_timeout())
            .ok_or(StoreError::LockTimeout(self.config.lock_timeout_ms))?;
        let slot = guard.borrow();
        let conn = slot.as_ref().ok_or(StoreError::Closed)?;
        op(conn)
    }

    fn with_busy_retry<T>(&self, what: &str, mut op: impl FnMut() -> StoreResult<T>) -> StoreResult<T> {
        let attempts = self.config.busy_retries.max(1);
        let mut attempt = 1;
        loop {
            match op() {
                Err(err) if err.is_busy() && attempt < attempts => {
                    warn!(attempt, attempts, op = what, "store busy, retrying");
                    sleep(self.config.busy_retry_delay());
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    // ------------------------------------------------------------------
    // Conversations
    // ------------------------------------------------------------------

    /// Create a conversation, or return the id of the existing one with this name.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    pub fn create_conversation(&self, name: &str) -> StoreResult<ConversationId> {
        self.with_busy_retry("create_conversation", || self.write(|conn| {
            let now = Utc::now().timestamp_millis();
            let inserted = conn
                .execute(
                    "INSERT INTO conversations (name, created_at, updated_at) VALUES (?1, ?2, ?2)",
                    params![name, now],
                )
                .map_err(StoreError::from);

            match inserted {
                Ok(_) => {
                    debug!(conversation = name, "conversation created");
                    Ok(conn.last_insert_rowid())
                }
                Err(err) if err.is_constraint_violation() => conn
                    .query_row(
                        "SELECT id FROM conversations WHERE name = ?1",
                        params![name],
                        |row| row.get(0),
                    )
                    .map_err(StoreError::from),
                Err(err) => Err(err),
            }
        }))
    }

    /// Look up a conversation id by name.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    pub fn get_conversation_id(&self, name: &str) -> StoreResult<Option<ConversationId>> {
        self.read(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id FROM conversations WHERE name = ?1",
                    params![name],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    /// All conversations ordered by id.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    pub fn list_conversations(&self) -> StoreResult<Vec<Conversation>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, created_at, updated_at FROM conversations ORDER BY id ASC",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(Conversation {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        created_at: from_millis(row.get(2)?),
                        updated_at: from_millis(row.get(3)?),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Rename a conversation, keeping its messages.
    ///
    /// # Errors
    /// Returns [`StoreError::ConversationNotFound`] if `old_name` does not exist,
    /// [`StoreError::ConversationExists`] if `new_name` is taken, or a storage error.
    pub fn rename_conversation(&self, old_name: &str, new_name: &str) -> StoreResult<()> {
        let changed = self.write(|conn| {
            let now = Utc::now().timestamp_millis();
            conn.execute(
                "UPDATE conversations SET name = ?1, updated_at = ?2 WHERE name = ?3",
                params![new_name, now, old_name],
            )
            .map_err(StoreError::from)
        });
        match changed {
            Ok(0) => Err(StoreError::ConversationNotFound(old_name.to_string())),
            Ok(_) => Ok(()),
            Err(err) if err.is_constraint_violation() => {
                Err(StoreError::ConversationExists(new_name.to_string()))
            }
            Err(err) => Err(err),
        }
    }

    /// Delete a conversation and its messages. A backup is taken first.
    ///
    /// # Errors
    /// Returns [`StoreError::ConversationNotFound`] if there is no such
    /// conversation, or a storage error.
    pub fn delete_conversation(&self, name: &str) -> StoreResult<()> {
        let _guard = self.hold();
        let id = self
            .get_conversation_id(name)?
            .ok_or_else(|| StoreError::ConversationNotFound(name.to_string()))?;
        self.backup();
        self.with_busy_retry("delete_conversation", || {
            self.write(|conn| {
                conn.execute("DELETE FROM conversations WHERE id = ?1", params![id])?;
                Ok(())
            })
        })
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    /// Append a message and refresh the conversation's `updated_at`.
    ///
    /// Busy conditions are retried a fixed number of times before the error surfaces.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    pub fn append_message(
        &self,
        conversation_id: ConversationId,
        role: Role,
        content: &str,
    ) -> StoreResult<i64> {
        self.with_busy_retry("append_message", || {
            self.write(|conn| {
                let tx = conn.unchecked_transaction()?;
                let now = Utc::now().timestamp_millis();
                tx.execute(
                    "INSERT INTO messages (conversation_id, role, content, timestamp)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![conversation_id, role.as_str(), content, now],
                )?;
                let message_id = tx.last_insert_rowid();
                tx.execute(
                    "UPDATE conversations SET updated_at = ?1 WHERE id = ?2",
                    params![now, conversation_id],
                )?;
                tx.commit()?;
                Ok(message_id)
            })
        })
    }

    /// Find-or-create the conversation by name, then append. Holds the guard throughout.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    pub fn append_to_conversation(&self, name: &str, role: Role, content: &str) -> StoreResult<i64> {
        let _guard = self.hold();
        let conversation_id = self.create_conversation(name)?;
        self.append_message(conversation_id, role, content)
    }

    /// Messages of a conversation in insertion order.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    pub fn list_messages(&self, conversation_id: ConversationId) -> StoreResult<Vec<Message>> {
        let raw = self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, role, content, timestamp
                 FROM messages WHERE conversation_id = ?1 ORDER BY id ASC",
            )?;
            let rows = stmt
                .query_map(params![conversation_id], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        raw.into_iter()
            .map(|(id, conversation_id, role, content, ts)| {
                let role = role.parse::<Role>().map_err(StoreError::InvalidValue)?;
                Ok(Message {
                    id,
                    conversation_id,
                    role,
                    content,
                    timestamp: from_millis(ts),
                })
            })
            .collect()
    }

    /// Messages of a conversation by name; empty if it does not exist.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    pub fn messages_for(&self, name: &str) -> StoreResult<Vec<Message>> {
        match self.get_conversation_id(name)? {
            Some(id) => self.list_messages(id),
            None => Ok(Vec::new()),
        }
    }

    // ------------------------------------------------------------------
    // Memory
    // ------------------------------------------------------------------

    /// Store a memory entry.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    pub fn add_memory(&self, content: &str, category: Option<&str>) -> StoreResult<i64> {
        let category = category.unwrap_or(DEFAULT_MEMORY_CATEGORY);
        self.with_busy_retry("add_memory", || {
            self.write(|conn| {
                conn.execute(
                    "INSERT INTO memory (content, category, created_at) VALUES (?1, ?2, ?3)",
                    params![content, category, Utc::now().timestamp_millis()],
                )?;
                Ok(conn.last_insert_rowid())
            })
        })
    }

    /// All memory entries in insertion order.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    pub fn list_memory(&self) -> StoreResult<Vec<MemoryEntry>> {
        self.read(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, content, category, created_at FROM memory ORDER BY id ASC")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(MemoryEntry {
                        id: row.get(0)?,
                        content: row.get(1)?,
                        category: row.get(2)?,
                        created_at: from_millis(row.get(3)?),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    /// Number of memory entries.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    pub fn memory_count(&self) -> StoreResult<usize> {
        self.read(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM memory", [], |row| row.get(0))?;
            Ok(usize::try_from(count).unwrap_or(0))
        })
    }

    /// Delete one memory entry. A backup is taken first.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    pub fn delete_memory(&self, id: i64) -> StoreResult<bool> {
        let _guard = self.hold();
        self.backup();
        self.write(|conn| Ok(conn.execute("DELETE FROM memory WHERE id = ?1", params![id])? > 0))
    }

    /// Delete all memory entries. A backup is taken first.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    pub fn clear_memory(&self) -> StoreResult<usize> {
        let _guard = self.hold();
        self.backup();
        self.write(|conn| Ok(conn.execute("DELETE FROM memory", [])?))
    }

    /// Delete the oldest entries so that at most `max_entries` remain.
    /// A backup is taken only when something will be deleted.
    ///
    /// # Errors
    /// Returns an error if storage access fails.
    pub fn trim_oldest(&self, max_entries: usize) -> StoreResult<usize> {
        let _guard = self.hold();
        let surplus = self.memory_count()?.saturating_sub(max_entries);
        if surplus == 0 {
            return Ok(0);
        }
        self.backup();
        let limit = i64::try_from(surplus).unwrap_or(i64::MAX);
        let deleted = self.write(|conn| {
            Ok(conn.execute(
                "DELETE FROM memory WHERE id IN (SELECT id FROM memory ORDER BY id ASC LIMIT ?1)",
                params![limit],
            )?)
        })?;
        info!(deleted, max_entries, "trimmed oldest memory entries");
        Ok(deleted)
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Copy the database file into the backup directory, keeping the newest few.
    /// Failures are logged and reported as `None`.
    pub fn backup(&self) -> Option<PathBuf> {
        let _guard = self.hold();
        // Flush the WAL so the copied main file is complete.
        if let Err(err) = self.write(|conn| {
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
            Ok(())
        }) {
            warn!(%err, "wal checkpoint before backup failed");
        }

        match self.backups.create(&self.path) {
            Ok(path) => {
                info!(backup = %path.display(), "store backup written");
                Some(path)
            }
            Err(err) => {
                warn!(%err, "store backup failed");
                None
            }
        }
    }

    /// Run `PRAGMA integrity_check`. Problems are reported, not repaired.
    ///
    /// # Errors
    /// Returns an error if the check itself cannot run.
    pub fn integrity_check(&self) -> StoreResult<IntegrityReport> {
        let lines = self.read(|conn| {
            let mut stmt = conn.prepare("PRAGMA integrity_check")?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        if lines.len() == 1 && lines[0] == "ok" {
            Ok(IntegrityReport::Ok)
        } else {
            warn!(problems = lines.len(), "integrity check reported problems");
            Ok(IntegrityReport::Problems(lines))
        }
    }

    /// Release the connection. Later calls fail with [`StoreError::Closed`].
    pub fn close_connection(&self) {
        let guard = self.conn.lock();
        let taken = guard.borrow_mut().take();
        if let Some(conn) = taken {
            match conn.close() {
                Ok(()) => info!("store connection closed"),
                Err((_, err)) => warn!(%err, "store connection close failed"),
            }
        }
    }

    /// Whether the connection has been released.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.conn.lock().borrow().is_none()
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Err(err) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
        warn!(%err, "could not restrict database file permissions");
    }
}

#[cfg(not(unix))]
const fn restrict_permissions(_path: &Path) {}
