//! Per-turn state: generation ids, cancellation and accumulated text.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::llm::CancelCheck;

/// Monotonic id distinguishing the current generation from superseded ones.
pub type Generation = u64;

/// Source of generation ids. Starts at 1; never resets.
#[derive(Debug, Default)]
pub struct GenerationCounter(AtomicU64);

impl GenerationCounter {
    /// Mint the next id and make it current.
    pub fn next(&self) -> Generation {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Most recently minted id (0 before the first).
    #[must_use]
    pub fn current(&self) -> Generation {
        self.0.load(Ordering::Acquire)
    }
}

/// Shared cooperative cancellation flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Raise the flag.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether the flag is raised.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Predicate form for the inference stream.
    #[must_use]
    pub fn as_check(&self) -> CancelCheck {
        let token = self.clone();
        Box::new(move || token.is_cancelled())
    }
}

#[derive(Debug, Default)]
struct Accumulated {
    text: String,
    finished: bool,
}

/// One in-flight turn. The response target is frozen at creation.
#[derive(Debug)]
pub struct StreamingSession {
    target: String,
    generation: AtomicU64,
    cancel: CancelToken,
    inner: Mutex<Accumulated>,
}

impl StreamingSession {
    /// New session answering into `target`.
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            generation: AtomicU64::new(0),
            cancel: CancelToken::default(),
            inner: Mutex::new(Accumulated::default()),
        }
    }

    /// Conversation this turn's result is committed to.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Stamp the generation minted when streaming begins.
    pub fn begin_streaming(&self, generation: Generation) {
        self.generation.store(generation, Ordering::Release);
    }

    /// Generation stamped on this session (0 before streaming).
    #[must_use]
    pub fn generation(&self) -> Generation {
        self.generation.load(Ordering::Acquire)
    }

    /// Cancellation flag.
    #[must_use]
    pub const fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Whether the session was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Append `text` if the session is live and `current` is still its generation.
    /// `on_accept` runs under the session lock, so nothing is delivered after
    /// [`StreamingSession::finish`] returns.
    pub fn accept(&self, current: Generation, text: &str, on_accept: impl FnOnce(&str)) -> bool {
        let mut inner = self.inner.lock();
        if inner.finished || self.is_cancelled() || self.generation() != current {
            return false;
        }
        inner.text.push_str(text);
        on_accept(text);
        true
    }

    /// Close the session and take its text. Only the first call gets `Some`.
    pub fn finish(&self) -> Option<String> {
        let mut inner = self.inner.lock();
        if inner.finished {
            return None;
        }
        inner.finished = true;
        Some(std::mem::take(&mut inner.text))
    }
}
