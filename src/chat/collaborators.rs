//! Collaborator seams consumed by the coordinator: web search and memory extraction.

use regex::Regex;

use crate::store::MemoryEntry;

/// One search hit.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SearchResult {
    /// Page title.
    pub title: String,
    /// Page URL.
    pub url: String,
    /// Short excerpt.
    pub snippet: String,
}

/// Result of one search call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SearchOutcome {
    /// Whether the search ran.
    pub success: bool,
    /// Summary on success, error description otherwise.
    pub summary: String,
    /// Individual hits.
    pub results: Vec<SearchResult>,
}

/// Web search collaborator.
pub trait SearchProvider: Send + Sync {
    /// Whether `text` warrants a search before answering.
    fn needs_search(&self, text: &str) -> bool;

    /// Run the search. Failures are reported through `success`, not panics.
    fn search(&self, query: &str) -> SearchOutcome;
}

/// Search provider that never searches.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoSearch;

impl SearchProvider for NoSearch {
    fn needs_search(&self, _text: &str) -> bool {
        false
    }

    fn search(&self, _query: &str) -> SearchOutcome {
        SearchOutcome::default()
    }
}

/// Memory extraction collaborator.
pub trait MemoryExtractor: Send + Sync {
    /// Facts worth remembering found in an assistant reply.
    fn extract(&self, response_text: &str) -> Vec<String>;

    /// Render stored entries for the system prompt.
    fn format_for_prompt(&self, entries: &[MemoryEntry]) -> String;

    /// The reply as it should be stored and shown.
    fn clean_response(&self, response_text: &str) -> String {
        self.strip_tags(response_text).trim().to_string()
    }

    /// `text` without memory tags, surrounding whitespace untouched.
    fn strip_tags(&self, text: &str) -> String {
        text.to_string()
    }
}

/// Extracts `[REMEMBER: fact]` tags and strips them from the reply.
#[derive(Debug)]
pub struct TagMemoryExtractor {
    tag: Regex,
}

impl TagMemoryExtractor {
    /// Build the extractor.
    ///
    /// # Errors
    /// Returns an error if the tag pattern does not compile.
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            tag: Regex::new(r"(?i)\[REMEMBER:\s*([^\]]*)\]")?,
        })
    }
}

impl MemoryExtractor for TagMemoryExtractor {
    fn extract(&self, response_text: &str) -> Vec<String> {
        self.tag
            .captures_iter(response_text)
            .filter_map(|caps| caps.get(1))
            .map(|fact| fact.as_str().trim().to_string())
            .filter(|fact| !fact.is_empty())
            .collect()
    }

    fn format_for_prompt(&self, entries: &[MemoryEntry]) -> String {
        if entries.is_empty() {
            return "(nothing saved yet)".to_string();
        }
        let mut seen = std::collections::HashSet::new();
        entries
            .iter()
            .filter(|entry| seen.insert(entry.content.to_lowercase()))
            .map(|entry| format!("- {}", entry.content))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn strip_tags(&self, text: &str) -> String {
        self.tag.replace_all(text, "").into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(id: i64, content: &str) -> MemoryEntry {
        MemoryEntry {
            id,
            content: content.to_string(),
            category: "general".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_extracts_every_tag() {
        let extractor = TagMemoryExtractor::new().unwrap();
        let text = "Nice! [REMEMBER: likes tea] and [remember:lives in Oslo] [REMEMBER: ]";
        assert_eq!(extractor.extract(text), ["likes tea", "lives in Oslo"]);
    }

    #[test]
    fn test_clean_strips_tags() {
        let extractor = TagMemoryExtractor::new().unwrap();
        assert_eq!(
            extractor.clean_response("Got it. [REMEMBER: likes tea]\n"),
            "Got it."
        );
        assert_eq!(extractor.clean_response("plain"), "plain");
        assert_eq!(extractor.strip_tags("Sure [REMEMBER: x] thing "), "Sure  thing ");
    }

    #[test]
    fn test_format_deduplicates() {
        let extractor = TagMemoryExtractor::new().unwrap();
        let entries = [entry(1, "Likes tea"), entry(2, "likes tea"), entry(3, "Has a cat")];
        assert_eq!(extractor.format_for_prompt(&entries), "- Likes tea\n- Has a cat");
        assert_eq!(extractor.format_for_prompt(&[]), "(nothing saved yet)");
    }

    #[test]
    fn test_no_search_never_searches() {
        assert!(!NoSearch.needs_search("weather today?"));
        assert!(!NoSearch.search("q").success);
    }
}
