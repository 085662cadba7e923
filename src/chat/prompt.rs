//! Prompt assembly for one turn.

use crate::chat::collaborators::SearchOutcome;
use crate::llm::ChatMessage;
use crate::store::Message;

/// Placeholder in the system prompt replaced by the memory block.
pub const MEMORY_PLACEHOLDER: &str = "{memory}";

/// Search hits quoted in the prompt.
const MAX_QUOTED_RESULTS: usize = 3;

/// Fill the `{memory}` placeholder.
#[must_use]
pub fn render_system_prompt(template: &str, memory_block: &str) -> String {
    template.replace(MEMORY_PLACEHOLDER, memory_block)
}

/// Context block appended to the user turn. Failures become a note so the
/// model knows it answers without fresh results.
#[must_use]
pub fn search_context(query: &str, outcome: &SearchOutcome) -> String {
    if !outcome.success {
        return format!(
            "\n[SEARCH ERROR: {} - PROCEEDING WITHOUT SEARCH RESULTS]\n",
            outcome.summary
        );
    }
    let mut block = format!("\n\n[SEARCH RESULTS FOR: {query}]\n{}\n", outcome.summary);
    for hit in outcome.results.iter().take(MAX_QUOTED_RESULTS) {
        block.push_str(&format!("- {} ({}): {}\n", hit.title, hit.url, hit.snippet));
    }
    block.push_str("[END SEARCH RESULTS]\n\n");
    block
}

/// System prompt, then the last `max_history` stored messages, then the user turn.
///
/// If the stored history already ends with this turn's own user message it is
/// replaced by `user_content`, which may carry search context.
#[must_use]
pub fn build_messages(
    system_prompt: &str,
    history: &[Message],
    max_history: usize,
    user_text: &str,
    user_content: &str,
) -> Vec<ChatMessage> {
    let mut history = history;
    if let Some((last, rest)) = history.split_last()
        && last.role == crate::store::Role::User
        && last.content == user_text
    {
        history = rest;
    }
    let skip = history.len().saturating_sub(max_history);

    let mut messages = Vec::with_capacity(history.len() - skip + 2);
    messages.push(ChatMessage::system(system_prompt));
    messages.extend(history[skip..].iter().map(|message| ChatMessage {
        role: message.role.into(),
        content: message.content.clone(),
    }));
    messages.push(ChatMessage::user(user_content));
    messages
}
