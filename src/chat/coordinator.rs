//! Turn orchestration.
//!
//! A turn moves `Idle -> SavingUserMessage -> (Searching) -> Streaming ->
//! SavingAssistantMessage -> Idle`. `cancel` jumps to `Cancelled` and then
//! `Idle` without waiting for the network. Each turn runs on its own thread and
//! answers into the conversation that was active when it was submitted.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::chat::backend::ChatBackend;
use crate::chat::collaborators::{MemoryExtractor, NoSearch, SearchProvider};
use crate::chat::events::{ContentSource, CoordinatorEvent, EventSink};
use crate::chat::prompt;
use crate::chat::session::{Generation, GenerationCounter, StreamingSession};
use crate::config::ChatConfig;
use crate::llm::{ChatMessage, InferenceError};
use crate::store::{Role, Store, WriteJob};

/// Appended to partial replies saved after cancellation.
pub const ABORTED_MARKER: &str = " [aborted]";
/// Appended to partial replies saved after an inference failure.
pub const INTERRUPTED_MARKER: &str = " [interrupted]";

/// Coordinator state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TurnState {
    /// No turn in flight.
    Idle,
    /// The user message is being queued and flushed.
    SavingUserMessage,
    /// Waiting on the search collaborator.
    Searching,
    /// Receiving fragments.
    Streaming,
    /// Queuing the final reply.
    SavingAssistantMessage,
    /// Transient state between a cancel and `Idle`.
    Cancelled,
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::SavingUserMessage => "saving_user_message",
            Self::Searching => "searching",
            Self::Streaming => "streaming",
            Self::SavingAssistantMessage => "saving_assistant_message",
            Self::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

struct Active {
    session: Option<Arc<StreamingSession>>,
    state: TurnState,
}

impl Active {
    fn transition(&mut self, to: TurnState) {
        debug!(from = %self.state, to = %to, "turn state");
        self.state = to;
    }

    fn holds(&self, session: &Arc<StreamingSession>) -> bool {
        self.session
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, session))
    }
}

struct Shared {
    store: Arc<Store>,
    backend: Arc<dyn ChatBackend>,
    events: Arc<dyn EventSink>,
    search: Arc<dyn SearchProvider>,
    memory: Arc<dyn MemoryExtractor>,
    config: ChatConfig,
    temperature: f64,
    model: Mutex<String>,
    conversation: Mutex<String>,
    generations: GenerationCounter,
    active: Mutex<Active>,
}

/// Builder for [`RequestCoordinator`].
pub struct CoordinatorBuilder {
    store: Arc<Store>,
    backend: Arc<dyn ChatBackend>,
    events: Arc<dyn EventSink>,
    memory: Arc<dyn MemoryExtractor>,
    search: Arc<dyn SearchProvider>,
    config: ChatConfig,
    model: String,
    temperature: f64,
}

impl CoordinatorBuilder {
    /// Search collaborator (default: never searches).
    #[must_use]
    pub fn search(mut self, search: Arc<dyn SearchProvider>) -> Self {
        self.search = search;
        self
    }

    /// Turn settings.
    #[must_use]
    pub fn chat_config(mut self, config: ChatConfig) -> Self {
        self.config = config;
        self
    }

    /// Model used for new turns.
    #[must_use]
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Sampling temperature.
    #[must_use]
    pub const fn temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    /// Finish construction.
    #[must_use]
    pub fn build(self) -> RequestCoordinator {
        let conversation = self.config.default_conversation.clone();
        RequestCoordinator {
            shared: Arc::new(Shared {
                store: self.store,
                backend: self.backend,
                events: self.events,
                search: self.search,
                memory: self.memory,
                config: self.config,
                temperature: self.temperature,
                model: Mutex::new(self.model),
                conversation: Mutex::new(conversation),
                generations: GenerationCounter::default(),
                active: Mutex::new(Active {
                    session: None,
                    state: TurnState::Idle,
                }),
            }),
        }
    }
}

/// Turns user input into a persisted exchange and a stream of events.
pub struct RequestCoordinator {
    shared: Arc<Shared>,
}

impl RequestCoordinator {
    /// Start building a coordinator.
    pub fn builder(
        store: Arc<Store>,
        backend: Arc<dyn ChatBackend>,
        events: Arc<dyn EventSink>,
        memory: Arc<dyn MemoryExtractor>,
    ) -> CoordinatorBuilder {
        let config = ChatConfig::default();
        CoordinatorBuilder {
            store,
            backend,
            events,
            memory,
            search: Arc::new(NoSearch),
            config,
            model: String::new(),
            temperature: crate::config::PerformanceConfig::default().temperature,
        }
    }

    /// Begin a turn. A turn already in flight is cancelled first and its
    /// partial reply saved to its own conversation.
    ///
    /// # Errors
    /// Returns an error if the turn thread cannot be spawned.
    pub fn submit(&self, text: &str) -> std::io::Result<()> {
        let text = text.trim();
        if text.is_empty() {
            debug!("ignoring empty submission");
            return Ok(());
        }
        self.shared.cancel_active("superseded");

        let target = self.active_conversation();
        let session = Arc::new(StreamingSession::new(target.as_str()));
        {
            let mut active = self.shared.active.lock();
            active.session = Some(Arc::clone(&session));
            active.transition(TurnState::SavingUserMessage);
        }
        self.shared.store.save_message(&target, Role::User, text);

        let shared = Arc::clone(&self.shared);
        let turn_session = Arc::clone(&session);
        let user_text = text.to_string();
        let model = self.model();
        let spawned = std::thread::Builder::new()
            .name("ember-turn".to_owned())
            .spawn(move || shared.run_turn(&turn_session, &user_text, &model));

        if let Err(err) = spawned {
            error!(%err, "could not start turn thread");
            self.shared.fail(&session, &format!("could not start turn: {err}"));
            return Err(err);
        }
        info!(conversation = %target, "turn submitted");
        Ok(())
    }

    /// Cancel the turn in flight, if any. Returns `false` when idle.
    pub fn cancel(&self) -> bool {
        self.shared.cancel_active("user")
    }

    /// Make `name` the target of the next turn, creating it if needed.
    /// A turn in flight keeps answering into its own conversation.
    pub fn switch_conversation(&self, name: &str) {
        let name = name.trim();
        if name.is_empty() {
            return;
        }
        self.shared
            .store
            .enqueue(WriteJob::CreateConversation(name.to_string()));
        let previous = std::mem::replace(&mut *self.shared.conversation.lock(), name.to_string());
        info!(from = %previous, to = %name, "conversation switched");
    }

    /// Rename the active conversation. A turn answering into it is cancelled
    /// first so its partial reply lands before the rename.
    pub fn rename_active(&self, to: &str) {
        let to = to.trim();
        let from = self.active_conversation();
        if to.is_empty() || to == from {
            return;
        }
        self.shared.cancel_targeting(&from, "conversation renamed");
        let store = &self.shared.store;
        store.enqueue(WriteJob::CreateConversation(from.clone()));
        store.enqueue(WriteJob::RenameConversation {
            from: from.clone(),
            to: to.to_string(),
        });
        to.clone_into(&mut self.shared.conversation.lock());
        info!(from = %from, to = %to, "conversation renamed");
    }

    /// Delete `name` and its messages. A turn answering into it is cancelled
    /// first. Deleting the active conversation makes the default one active.
    pub fn delete_conversation(&self, name: &str) {
        let name = name.trim();
        if name.is_empty() {
            return;
        }
        self.shared.cancel_targeting(name, "conversation deleted");
        self.shared
            .store
            .enqueue(WriteJob::DeleteConversation(name.to_string()));
        if self.active_conversation() == name {
            let fallback = self.shared.config.default_conversation.clone();
            self.switch_conversation(&fallback);
        }
        info!(conversation = %name, "conversation deleted");
    }

    /// Conversation new turns answer into.
    #[must_use]
    pub fn active_conversation(&self) -> String {
        self.shared.conversation.lock().clone()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TurnState {
        self.shared.active.lock().state
    }

    /// Model used for new turns.
    #[must_use]
    pub fn model(&self) -> String {
        self.shared.model.lock().clone()
    }

    /// Change the model for subsequent turns.
    pub fn set_model(&self, model: &str) {
        model.clone_into(&mut self.shared.model.lock());
    }

    /// Cancel any turn in flight. Call before closing the store.
    pub fn shutdown(&self) {
        if self.shared.cancel_active("shutdown") {
            info!("turn in flight cancelled for shutdown");
        }
    }
}

impl Shared {
    fn run_turn(&self, session: &Arc<StreamingSession>, user_text: &str, model: &str) {
        // History must include this turn's own user message.
        if !self.store.flush() {
            warn!("write queue did not flush before prompt assembly");
        }
        if session.is_cancelled() {
            return;
        }

        let mut user_content = user_text.to_string();
        if self.search.needs_search(user_text) {
            if !self.advance(session, TurnState::Searching) {
                return;
            }
            self.events.emit(CoordinatorEvent::Notice {
                source: ContentSource::Search,
                text: format!("searching: {user_text}"),
            });
            let outcome = self.search.search(user_text);
            if session.is_cancelled() {
                return;
            }
            let notice = if outcome.success {
                format!("{} search results", outcome.results.len())
            } else {
                warn!(reason = %outcome.summary, "search failed, answering without results");
                format!("search failed: {}", outcome.summary)
            };
            self.events.emit(CoordinatorEvent::Notice {
                source: ContentSource::Search,
                text: notice,
            });
            user_content.push_str(&prompt::search_context(user_text, &outcome));
        }

        let messages = self.assemble_prompt(session.target(), user_text, &user_content);
        let Some(generation) = self.begin_streaming(session) else {
            debug!(conversation = %session.target(), "turn superseded before streaming");
            return;
        };
        info!(generation, model, conversation = %session.target(), "streaming started");

        let stream = match self.backend.open_stream(
            model,
            &messages,
            self.temperature,
            session.cancel_token().as_check(),
        ) {
            Ok(stream) => stream,
            Err(InferenceError::Cancelled) => return,
            Err(err) => {
                self.fail(session, &err.to_string());
                return;
            }
        };

        for item in stream {
            match item {
                Ok(text) => {
                    let accepted = session.accept(self.generations.current(), &text, |fragment| {
                        self.events.emit(CoordinatorEvent::ChunkReceived {
                            generation,
                            text: fragment.to_string(),
                        });
                    });
                    if !accepted {
                        debug!(generation, "fragment dropped, generation no longer current");
                        self.abandon(session);
                        return;
                    }
                }
                Err(err) => {
                    self.fail(session, &err.to_string());
                    return;
                }
            }
        }

        if session.is_cancelled() {
            return;
        }
        if self.generations.current() != generation {
            self.abandon(session);
            return;
        }
        self.complete(session, generation);
    }

    fn assemble_prompt(&self, target: &str, user_text: &str, user_content: &str) -> Vec<ChatMessage> {
        let db = self.store.db();
        let history = db.messages_for(target).unwrap_or_else(|err| {
            warn!(%err, conversation = %target, "history unavailable, sending turn alone");
            Vec::new()
        });
        let memory_block = if self.config.memory_enabled {
            match db.list_memory() {
                Ok(entries) => self.memory.format_for_prompt(&entries),
                Err(err) => {
                    warn!(%err, "memory unavailable");
                    String::new()
                }
            }
        } else {
            String::new()
        };
        let system = prompt::render_system_prompt(&self.config.system_prompt, &memory_block);
        prompt::build_messages(
            &system,
            &history,
            self.config.max_history_messages,
            user_text,
            user_content,
        )
    }

    fn complete(&self, session: &Arc<StreamingSession>, generation: Generation) {
        if !self.advance(session, TurnState::SavingAssistantMessage) {
            return;
        }
        let Some(raw) = session.finish() else {
            return;
        };

        let full_text = if self.config.memory_enabled {
            for fact in self.memory.extract(&raw) {
                self.store
                    .remember(&fact, None, self.config.max_memory_entries);
                self.events.emit(CoordinatorEvent::Notice {
                    source: ContentSource::Memory,
                    text: fact,
                });
            }
            self.memory.clean_response(&raw)
        } else {
            raw
        };

        if !full_text.is_empty() {
            self.store
                .save_message(session.target(), Role::Assistant, &full_text);
        }
        info!(generation, conversation = %session.target(), chars = full_text.len(), "turn completed");
        self.release(session);
        self.events.emit(CoordinatorEvent::Completed {
            generation,
            full_text,
        });
    }

    fn fail(&self, session: &Arc<StreamingSession>, reason: &str) {
        let generation = session.generation();
        let Some(raw) = session.finish() else {
            return;
        };
        let partial = self.tidy_partial(&raw);
        if !partial.is_empty() {
            self.store.save_message(
                session.target(),
                Role::Assistant,
                &format!("{partial}{INTERRUPTED_MARKER}"),
            );
        }
        error!(generation, conversation = %session.target(), reason, "turn failed");
        self.release(session);
        self.events.emit(CoordinatorEvent::Failed {
            generation,
            reason: reason.to_string(),
            partial,
        });
    }

    fn cancel_active(&self, reason: &'static str) -> bool {
        self.cancel_matching(reason, |_| true)
    }

    fn cancel_targeting(&self, conversation: &str, reason: &'static str) -> bool {
        self.cancel_matching(reason, |session| session.target() == conversation)
    }

    fn cancel_matching(
        &self,
        reason: &'static str,
        matches: impl Fn(&StreamingSession) -> bool,
    ) -> bool {
        let session = {
            let mut active = self.active.lock();
            if !active.session.as_deref().is_some_and(&matches) {
                return false;
            }
            let session = active.session.take();
            active.transition(TurnState::Cancelled);
            active.transition(TurnState::Idle);
            session
        };
        let Some(session) = session else {
            return false;
        };

        session.cancel_token().cancel();
        let generation = session.generation();
        if let Some(raw) = session.finish() {
            let partial = self.tidy_partial(&raw);
            if !partial.is_empty() {
                self.store.save_message(
                    session.target(),
                    Role::Assistant,
                    &format!("{partial}{ABORTED_MARKER}"),
                );
            }
            info!(generation, conversation = %session.target(), reason, chars = partial.len(), "turn cancelled");
            self.events
                .emit(CoordinatorEvent::Cancelled { generation, partial });
        }
        true
    }

    /// Partial reply with memory tags removed, otherwise byte-for-byte.
    fn tidy_partial(&self, raw: &str) -> String {
        if self.config.memory_enabled {
            self.memory.strip_tags(raw)
        } else {
            raw.to_string()
        }
    }

    /// Mint a generation and enter `Streaming` in one step, only while
    /// `session` is still the active turn.
    fn begin_streaming(&self, session: &Arc<StreamingSession>) -> Option<Generation> {
        let mut active = self.active.lock();
        if !active.holds(session) {
            return None;
        }
        let generation = self.generations.next();
        session.begin_streaming(generation);
        active.transition(TurnState::Streaming);
        Some(generation)
    }

    /// Close a live session whose generation was overtaken.
    fn abandon(&self, session: &Arc<StreamingSession>) {
        if !session.is_cancelled() {
            self.fail(session, "superseded by a newer generation");
        }
    }

    /// Move to `to` if `session` is still the active turn.
    fn advance(&self, session: &Arc<StreamingSession>, to: TurnState) -> bool {
        let mut active = self.active.lock();
        if !active.holds(session) {
            return false;
        }
        active.transition(to);
        true
    }

    fn release(&self, session: &Arc<StreamingSession>) {
        let mut active = self.active.lock();
        if active.holds(session) {
            active.session = None;
            active.transition(TurnState::Idle);
        }
    }
}
