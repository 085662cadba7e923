//! Single-worker write queue.
//!
//! Every store mutation goes through here so callers never block on disk I/O
//! and at most one mutation is in flight. Jobs run strictly in submission order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::store::db::Database;
use crate::store::types::Role;

/// A mutation waiting to be applied.
#[derive(Debug)]
pub enum WriteJob {
    /// Append a message to a conversation, creating the conversation if needed.
    AppendMessage {
        /// Target conversation name.
        conversation: String,
        /// Author.
        role: Role,
        /// Message text.
        content: String,
    },
    /// Store a memory entry, then trim the table to `max_entries`.
    Remember {
        /// The fact.
        content: String,
        /// Optional category; `general` when absent.
        category: Option<String>,
        /// Upper bound on stored entries.
        max_entries: usize,
    },
    /// Create a conversation if it does not exist yet.
    CreateConversation(String),
    /// Rename a conversation, keeping its messages.
    RenameConversation {
        /// Current name.
        from: String,
        /// New name; must not be taken.
        to: String,
    },
    /// Delete a conversation and its messages (backup first).
    DeleteConversation(String),
    /// Delete one memory entry (backup first).
    ForgetMemory(i64),
    /// Delete every memory entry (backup first).
    ForgetAll,
    /// Signals the sender once every earlier job has been applied.
    Barrier(mpsc::Sender<()>),
}

impl WriteJob {
    /// Convenience constructor for a message append.
    pub fn message(conversation: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self::AppendMessage {
            conversation: conversation.into(),
            role,
            content: content.into(),
        }
    }

    const fn kind(&self) -> &'static str {
        match self {
            Self::AppendMessage { .. } => "append_message",
            Self::Remember { .. } => "remember",
            Self::CreateConversation(_) => "create_conversation",
            Self::RenameConversation { .. } => "rename_conversation",
            Self::DeleteConversation(_) => "delete_conversation",
            Self::ForgetMemory(_) => "forget_memory",
            Self::ForgetAll => "forget_all",
            Self::Barrier(_) => "barrier",
        }
    }
}

enum Envelope {
    Job(WriteJob),
    Shutdown,
}

/// Counters maintained by the worker.
#[derive(Debug, Default)]
pub struct WriterStats {
    applied: AtomicU64,
    failed: AtomicU64,
    pending: AtomicU64,
}

impl WriterStats {
    /// Jobs applied successfully (barriers excluded).
    #[must_use]
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Acquire)
    }

    /// Jobs that failed and were skipped.
    #[must_use]
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Acquire)
    }

    /// Jobs queued but not yet taken by the worker (barriers included).
    #[must_use]
    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }
}

/// Background worker applying [`WriteJob`]s against a [`Database`].
pub struct WriteSerializer {
    tx: Mutex<Option<mpsc::Sender<Envelope>>>,
    drained: Mutex<Option<mpsc::Receiver<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<WriterStats>,
}

impl WriteSerializer {
    /// Spawn the worker thread.
    ///
    /// # Errors
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn(db: Arc<Database>) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel::<Envelope>();
        let (drained_tx, drained_rx) = mpsc::channel::<()>();
        let stats = Arc::new(WriterStats::default());
        let worker_stats = Arc::clone(&stats);

        let handle = std::thread::Builder::new()
            .name("ember-writer".to_owned())
            .spawn(move || {
                debug!("write serializer started");
                while let Ok(envelope) = rx.recv() {
                    match envelope {
                        Envelope::Job(job) => {
                            worker_stats.pending.fetch_sub(1, Ordering::AcqRel);
                            apply(&db, job, &worker_stats);
                        }
                        Envelope::Shutdown => break,
                    }
                }
                let _ = drained_tx.send(());
                info!(
                    applied = worker_stats.applied(),
                    failed = worker_stats.failed(),
                    "write serializer stopped"
                );
            })?;

        Ok(Self {
            tx: Mutex::new(Some(tx)),
            drained: Mutex::new(Some(drained_rx)),
            handle: Mutex::new(Some(handle)),
            stats,
        })
    }

    /// Queue a job and return immediately. Returns `false` once the queue is closed.
    pub fn enqueue(&self, job: WriteJob) -> bool {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            warn!(job = job.kind(), "write queue closed, job dropped");
            return false;
        };
        self.stats.pending.fetch_add(1, Ordering::AcqRel);
        if tx.send(Envelope::Job(job)).is_err() {
            self.stats.pending.fetch_sub(1, Ordering::AcqRel);
            error!("write serializer is gone, job dropped");
            return false;
        }
        true
    }

    /// Block until every job queued before this call has been applied, or `timeout` elapses.
    pub fn flush(&self, timeout: Duration) -> bool {
        let (reply_tx, reply_rx) = mpsc::channel();
        if !self.enqueue(WriteJob::Barrier(reply_tx)) {
            return false;
        }
        reply_rx.recv_timeout(timeout).is_ok()
    }

    /// Worker counters.
    #[must_use]
    pub fn stats(&self) -> &WriterStats {
        &self.stats
    }

    /// Stop accepting jobs, then wait up to `timeout` for the queue to drain.
    /// Returns `true` once every queued job has been processed. Calling again
    /// after a timeout waits again; after a successful drain it returns at once.
    pub fn close(&self, timeout: Duration) -> bool {
        if let Some(tx) = self.tx.lock().take() {
            // Shutdown sits behind every job already queued.
            let _ = tx.send(Envelope::Shutdown);
        }

        let mut drained_rx = self.drained.lock();
        let Some(rx) = drained_rx.as_ref() else {
            return true;
        };
        if rx.recv_timeout(timeout).is_err() {
            warn!(?timeout, pending = self.stats.pending(), "write queue did not drain before timeout");
            return false;
        }
        *drained_rx = None;
        drop(drained_rx);

        if let Some(handle) = self.handle.lock().take()
            && handle.join().is_err()
        {
            error!("write serializer panicked");
        }
        true
    }
}

fn apply(db: &Database, job: WriteJob, stats: &WriterStats) {
    let kind = job.kind();
    let result = match job {
        WriteJob::AppendMessage {
            conversation,
            role,
            content,
        } => db
            .append_to_conversation(&conversation, role, &content)
            .map(|id| debug!(conversation = %conversation, %role, message_id = id, "message saved")),
        WriteJob::Remember {
            content,
            category,
            max_entries,
        } => db
            .add_memory(&content, category.as_deref())
            .and_then(|_| db.trim_oldest(max_entries))
            .map(|_| ()),
        WriteJob::CreateConversation(name) => db
            .create_conversation(&name)
            .map(|id| debug!(conversation = %name, id, "conversation ready")),
        WriteJob::RenameConversation { from, to } => db
            .rename_conversation(&from, &to)
            .map(|()| info!(from = %from, to = %to, "conversation renamed")),
        WriteJob::DeleteConversation(name) => db
            .delete_conversation(&name)
            .map(|()| info!(conversation = %name, "conversation deleted")),
        WriteJob::ForgetMemory(id) => db
            .delete_memory(id)
            .map(|deleted| debug!(id, deleted, "memory entry forgotten")),
        WriteJob::ForgetAll => db
            .clear_memory()
            .map(|removed| info!(removed, "memory cleared")),
        WriteJob::Barrier(reply) => {
            let _ = reply.send(());
            return;
        }
    };

    match result {
        Ok(()) => {
            stats.applied.fetch_add(1, Ordering::AcqRel);
        }
        Err(err) => {
            stats.failed.fetch_add(1, Ordering::AcqRel);
            error!(job = kind, %err, "write job failed, skipped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;

    fn spawn_temp() -> (tempfile::TempDir, Arc<Database>, WriteSerializer) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open(&StorageConfig::at(dir.path().join("w.db"))).unwrap());
        let writer = WriteSerializer::spawn(Arc::clone(&db)).unwrap();
        (dir, db, writer)
    }

    #[test]
    fn test_close_drains_all_jobs() {
        let (_dir, db, writer) = spawn_temp();
        for i in 0..50 {
            assert!(writer.enqueue(WriteJob::message("bulk", Role::User, format!("m{i}"))));
        }

        assert!(writer.close(Duration::from_secs(10)));
        assert_eq!(writer.stats().applied(), 50);
        assert_eq!(db.messages_for("bulk").unwrap().len(), 50);
    }

    #[test]
    fn test_concurrent_producers_keep_per_thread_order_and_count() {
        let (_dir, db, writer) = spawn_temp();
        let writer = Arc::new(writer);

        let producers: Vec<_> = (0..4)
            .map(|t| {
                let writer = Arc::clone(&writer);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        writer.enqueue(WriteJob::message("shared", Role::User, format!("{t}:{i}")));
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }
        assert!(writer.flush(Duration::from_secs(10)));

        let messages = db.messages_for("shared").unwrap();
        assert_eq!(messages.len(), 100);
        for t in 0..4 {
            let seen: Vec<usize> = messages
                .iter()
                .filter_map(|m| m.content.strip_prefix(&format!("{t}:")))
                .map(|i| i.parse().unwrap())
                .collect();
            assert_eq!(seen, (0..25).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_duplicates_are_not_coalesced() {
        let (_dir, db, writer) = spawn_temp();
        writer.enqueue(WriteJob::message("dup", Role::User, "same"));
        writer.enqueue(WriteJob::message("dup", Role::User, "same"));
        assert!(writer.flush(Duration::from_secs(5)));
        assert_eq!(db.messages_for("dup").unwrap().len(), 2);
    }

    #[test]
    fn test_failed_job_does_not_stop_worker() {
        let (_dir, db, writer) = spawn_temp();
        db.close_connection();
        writer.enqueue(WriteJob::message("lost", Role::User, "x"));
        assert!(writer.flush(Duration::from_secs(5)));
        assert_eq!(writer.stats().failed(), 1);
        assert!(writer.close(Duration::from_secs(5)));
    }

    #[test]
    fn test_remember_trims_to_limit() {
        let (_dir, db, writer) = spawn_temp();
        for i in 0..4 {
            writer.enqueue(WriteJob::Remember {
                content: format!("fact {i}"),
                category: None,
                max_entries: 2,
            });
        }
        assert!(writer.flush(Duration::from_secs(5)));
        let facts: Vec<_> = db.list_memory().unwrap().into_iter().map(|m| m.content).collect();
        assert_eq!(facts, ["fact 2", "fact 3"]);
    }

    #[test]
    fn test_conversation_and_forget_jobs() {
        let (_dir, db, writer) = spawn_temp();
        writer.enqueue(WriteJob::CreateConversation("Ideas".to_string()));
        writer.enqueue(WriteJob::CreateConversation("Ideas".to_string()));
        for fact in ["a", "b", "c"] {
            writer.enqueue(WriteJob::Remember {
                content: fact.to_string(),
                category: None,
                max_entries: 10,
            });
        }
        assert!(writer.flush(Duration::from_secs(5)));
        let first = db.list_memory().unwrap()[0].id;

        writer.enqueue(WriteJob::ForgetMemory(first));
        assert!(writer.flush(Duration::from_secs(5)));
        assert_eq!(db.memory_count().unwrap(), 2);

        writer.enqueue(WriteJob::ForgetAll);
        assert!(writer.flush(Duration::from_secs(5)));
        assert_eq!(db.memory_count().unwrap(), 0);
        assert_eq!(db.list_conversations().unwrap().len(), 1);
    }

    #[test]
    fn test_rename_and_delete_conversation_jobs() {
        let (_dir, db, writer) = spawn_temp();
        writer.enqueue(WriteJob::message("Draft", Role::User, "hello"));
        writer.enqueue(WriteJob::RenameConversation {
            from: "Draft".to_string(),
            to: "Final".to_string(),
        });
        writer.enqueue(WriteJob::message("Scratch", Role::User, "tmp"));
        writer.enqueue(WriteJob::DeleteConversation("Scratch".to_string()));
        writer.enqueue(WriteJob::DeleteConversation("Missing".to_string()));
        assert!(writer.flush(Duration::from_secs(5)));

        let names: Vec<_> = db.list_conversations().unwrap().into_iter().map(|c| c.name).collect();
        assert_eq!(names, ["Final"]);
        assert_eq!(db.messages_for("Final").unwrap()[0].content, "hello");
        assert_eq!(writer.stats().failed(), 1);
    }

    #[test]
    fn test_busy_store_counts_dropped_job() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = StorageConfig::at(dir.path().join("busy.db"));
        config.busy_timeout_ms = 0;
        config.busy_retries = 3;
        config.busy_retry_delay_ms = 10;
        let db = Arc::new(Database::open(&config).unwrap());
        db.create_conversation("c").unwrap();
        let writer = WriteSerializer::spawn(Arc::clone(&db)).unwrap();

        let blocker = rusqlite::Connection::open(&config.db_path).unwrap();
        blocker.execute_batch("BEGIN EXCLUSIVE;").unwrap();
        writer.enqueue(WriteJob::message("c", Role::User, "blocked"));
        assert!(writer.flush(Duration::from_secs(5)));
        assert_eq!(writer.stats().failed(), 1);
        assert_eq!(writer.stats().applied(), 0);

        blocker.execute_batch("ROLLBACK;").unwrap();
        writer.enqueue(WriteJob::message("c", Role::User, "through"));
        assert!(writer.close(Duration::from_secs(5)));
        let contents: Vec<_> = db.messages_for("c").unwrap().into_iter().map(|m| m.content).collect();
        assert_eq!(contents, ["through"]);
    }

    #[test]
    fn test_close_after_timeout_waits_again() {
        let (_dir, db, writer) = spawn_temp();
        let guard = db.hold();
        writer.enqueue(WriteJob::message("slow", Role::User, "a"));
        writer.enqueue(WriteJob::message("slow", Role::User, "b"));

        assert!(!writer.close(Duration::from_millis(30)));
        assert!(!writer.close(Duration::from_millis(30)));
        assert!(writer.stats().pending() >= 1);
        drop(guard);

        assert!(writer.close(Duration::from_secs(5)));
        assert!(writer.close(Duration::from_millis(1)));
        assert_eq!(writer.stats().applied(), 2);
        assert_eq!(writer.stats().pending(), 0);
    }

    #[test]
    fn test_enqueue_after_close_is_rejected() {
        let (_dir, _db, writer) = spawn_temp();
        assert!(writer.close(Duration::from_secs(5)));
        assert!(writer.close(Duration::from_secs(5)));
        assert!(!writer.enqueue(WriteJob::message("late", Role::User, "x")));
    }
}
