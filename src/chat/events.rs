//! Events the coordinator publishes to its consumer.

use std::fmt;
use std::sync::mpsc;

use crate::chat::session::Generation;

/// Where a piece of displayed content came from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ContentSource {
    /// Web search step.
    Search,
    /// The language model.
    Llm,
    /// Long-term memory.
    Memory,
}

impl ContentSource {
    /// Stable lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Llm => "llm",
            Self::Memory => "memory",
        }
    }
}

impl fmt::Display for ContentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome notifications for one turn.
#[derive(Clone, Debug, PartialEq)]
pub enum CoordinatorEvent {
    /// A fragment was accepted into the current generation.
    ChunkReceived {
        /// Generation the fragment belongs to.
        generation: Generation,
        /// Fragment text.
        text: String,
    },
    /// The stream ended normally; `full_text` is what was saved.
    Completed {
        /// Finished generation.
        generation: Generation,
        /// Final assistant text.
        full_text: String,
    },
    /// The turn failed after retries; `partial` was saved if non-empty.
    Failed {
        /// Failed generation (0 if the turn never reached streaming).
        generation: Generation,
        /// Human-readable cause.
        reason: String,
        /// Text accumulated before the failure.
        partial: String,
    },
    /// The turn was cancelled; `partial` was saved if non-empty.
    Cancelled {
        /// Cancelled generation (0 if the turn never reached streaming).
        generation: Generation,
        /// Text accumulated before cancellation.
        partial: String,
    },
    /// Side information for the consumer.
    Notice {
        /// Origin of the notice.
        source: ContentSource,
        /// Notice text.
        text: String,
    },
}

/// Receiver of coordinator events. Implementations must not block.
pub trait EventSink: Send + Sync {
    /// Deliver one event.
    fn emit(&self, event: CoordinatorEvent);
}

impl EventSink for mpsc::Sender<CoordinatorEvent> {
    fn emit(&self, event: CoordinatorEvent) {
        // A gone consumer is not the coordinator's problem.
        let _ = self.send(event);
    }
}
