//! Inference peer access (Ollama over HTTP).
//!
//! - `ollama_client`: probe, retries with backoff, streamed and single-shot chat
//! - `stream`: NDJSON fragment iterator with cancellation
//! - `timeouts`: per-model read timeouts
//! - `health`: background liveness polling

pub mod error;
pub mod health;
pub mod ollama_client;
pub mod stream;
pub mod timeouts;
pub mod types;

#[cfg(test)]
pub(crate) mod test_peer;

pub use error::{InferenceError, InferenceResult};
pub use health::{HealthMonitor, LivenessProbe, StatusCallback};
pub use ollama_client::InferenceClient;
pub use stream::{CancelCheck, ChatStream};
pub use timeouts::ModelTimeouts;
pub use types::{ChatMessage, ChatRole};
