//! Seam between the coordinator and the inference client.

use crate::llm::{CancelCheck, ChatMessage, InferenceClient, InferenceResult};

/// Fragments of one reply, in arrival order.
pub type FragmentStream = Box<dyn Iterator<Item = InferenceResult<String>> + Send>;

/// Opens streamed replies.
pub trait ChatBackend: Send + Sync {
    /// Start a streamed reply. `cancel` is polled before every read.
    ///
    /// # Errors
    /// Returns an error if the stream cannot be opened.
    fn open_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: f64,
        cancel: CancelCheck,
    ) -> InferenceResult<FragmentStream>;
}

impl ChatBackend for InferenceClient {
    fn open_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: f64,
        cancel: CancelCheck,
    ) -> InferenceResult<FragmentStream> {
        Ok(Box::new(self.stream(model, messages, temperature, cancel)?))
    }
}
