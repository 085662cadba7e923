//! Durable storage: the `SQLite` database and the write queue in front of it.
//!
//! - `db`: conversations, messages, memory, backups, integrity probe
//! - `writer`: the single-worker FIFO applying every mutation
//! - `backup`: timestamped copies with rotation

pub mod backup;
pub mod db;
pub mod error;
pub mod types;
pub mod writer;

pub use backup::BackupRotation;
pub use db::Database;
pub use error::{StoreError, StoreResult};
pub use types::{Conversation, ConversationId, IntegrityReport, MemoryEntry, Message, Role};
pub use writer::{WriteJob, WriteSerializer, WriterStats};

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::StorageConfig;

/// Database plus its write queue. Reads go straight to [`Store::db`];
/// mutations are queued with [`Store::enqueue`].
pub struct Store {
    db: Arc<Database>,
    writer: WriteSerializer,
    close_timeout: Duration,
}

impl Store {
    /// Open the database and start the write worker.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or the worker cannot start.
    pub fn open(config: &StorageConfig) -> StoreResult<Self> {
        let db = Arc::new(Database::open(config)?);
        let writer = WriteSerializer::spawn(Arc::clone(&db))?;
        Ok(Self {
            db,
            writer,
            close_timeout: config.close_timeout(),
        })
    }

    /// Read access to the database.
    #[must_use]
    pub const fn db(&self) -> &Arc<Database> {
        &self.db
    }

    /// Write worker counters.
    #[must_use]
    pub fn writer_stats(&self) -> &WriterStats {
        self.writer.stats()
    }

    /// Queue a mutation; never blocks on I/O.
    pub fn enqueue(&self, job: WriteJob) -> bool {
        self.writer.enqueue(job)
    }

    /// Queue a message append.
    pub fn save_message(&self, conversation: &str, role: Role, content: &str) -> bool {
        self.enqueue(WriteJob::message(conversation, role, content))
    }

    /// Queue a memory entry, trimmed to `max_entries`.
    pub fn remember(&self, content: &str, category: Option<&str>, max_entries: usize) -> bool {
        self.enqueue(WriteJob::Remember {
            content: content.to_string(),
            category: category.map(str::to_string),
            max_entries,
        })
    }

    /// Wait until every job queued so far has been applied.
    pub fn flush(&self) -> bool {
        self.writer.flush(self.close_timeout)
    }

    /// Drain the write queue, then release the connection. If the queue does
    /// not drain in time the connection stays open for the worker and `false`
    /// is returned; calling again resumes the wait.
    pub fn close(&self) -> bool {
        if self.db.is_closed() {
            return true;
        }
        if !self.writer.close(self.close_timeout) {
            warn!(
                pending = self.writer.stats().pending(),
                "store left open, write queue still draining"
            );
            return false;
        }
        self.db.close_connection();
        info!(applied = self.writer.stats().applied(), "store closed");
        true
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
