//! Per-model read timeouts.

use std::time::Duration;

use crate::config::InferenceConfig;

/// Read timeout table keyed by model identity fragment.
#[derive(Clone, Debug)]
pub struct ModelTimeouts {
    entries: Vec<(String, Duration)>,
    default: Duration,
}

impl ModelTimeouts {
    /// Build from explicit entries.
    #[must_use]
    pub fn new(entries: Vec<(String, Duration)>, default: Duration) -> Self {
        let entries = entries
            .into_iter()
            .map(|(fragment, timeout)| (fragment.to_ascii_lowercase(), timeout))
            .collect();
        Self { entries, default }
    }

    /// Build from the inference config.
    #[must_use]
    pub fn from_config(config: &InferenceConfig) -> Self {
        Self::new(
            config
                .model_timeouts
                .iter()
                .map(|(fragment, secs)| (fragment.clone(), Duration::from_secs(*secs)))
                .collect(),
            Duration::from_secs(config.default_timeout_secs),
        )
    }

    /// Timeout for `model`. The longest fragment contained in the model name wins,
    /// so `qwen2.5:14b-instruct` resolves through `qwen2.5:14b`.
    #[must_use]
    pub fn resolve(&self, model: &str) -> Duration {
        let model = model.to_ascii_lowercase();
        self.entries
            .iter()
            .filter(|(fragment, _)| model.contains(fragment.as_str()))
            .max_by_key(|(fragment, _)| fragment.len())
            .map_or(self.default, |(_, timeout)| *timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> ModelTimeouts {
        ModelTimeouts::from_config(&InferenceConfig::default())
    }

    #[test]
    fn test_known_model_uses_its_entry() {
        assert_eq!(table().resolve("qwen2.5:7b"), Duration::from_secs(90));
        assert_eq!(table().resolve("qwen2.5:32b"), Duration::from_secs(180));
        assert_eq!(table().resolve("phi:7b"), Duration::from_secs(60));
    }

    #[test]
    fn test_unknown_model_uses_default() {
        assert_eq!(table().resolve("gemma:2b"), Duration::from_secs(120));
    }

    #[test]
    fn test_fragment_match_on_tagged_names() {
        assert_eq!(table().resolve("llama3.2:latest"), Duration::from_secs(90));
        assert_eq!(table().resolve("Qwen2.5:7B-instruct-q4"), Duration::from_secs(90));
    }

    #[test]
    fn test_longest_fragment_wins() {
        let timeouts = ModelTimeouts::new(
            vec![
                ("llama".to_string(), Duration::from_secs(30)),
                ("llama2:13b".to_string(), Duration::from_secs(200)),
            ],
            Duration::from_secs(5),
        );
        assert_eq!(timeouts.resolve("llama2:13b"), Duration::from_secs(200));
        assert_eq!(timeouts.resolve("llama2:7b"), Duration::from_secs(30));
    }
}
