//! Blocking Ollama client: liveness probe, retries with backoff and streamed chat.

use std::collections::HashMap;
use std::io::BufReader;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use reqwest::blocking::{Client, Response};
use tracing::{debug, info, warn};

use crate::config::{InferenceConfig, PerformanceConfig};
use crate::llm::error::{InferenceError, InferenceResult};
use crate::llm::stream::{CancelCheck, ChatStream};
use crate::llm::timeouts::ModelTimeouts;
use crate::llm::types::{ChatMessage, ChatRequestBody, ChatResponseLine, PreloadBody, TagsResponse};

/// Granularity of cancellation checks while waiting between attempts.
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Client for the local inference peer.
pub struct InferenceClient {
    config: InferenceConfig,
    performance: PerformanceConfig,
    timeouts: ModelTimeouts,
    probe: Client,
    clients: Mutex<HashMap<Duration, Client>>,
}

impl InferenceClient {
    /// Build a client for the configured peer.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: InferenceConfig, performance: PerformanceConfig) -> InferenceResult<Self> {
        let probe = Client::builder()
            .connect_timeout(config.probe_timeout())
            .timeout(config.probe_timeout())
            .build()?;
        Ok(Self {
            timeouts: ModelTimeouts::from_config(&config),
            config,
            performance,
            probe,
            clients: Mutex::new(HashMap::new()),
        })
    }

    /// Model used when the caller does not pick one.
    #[must_use]
    pub fn default_model(&self) -> &str {
        &self.config.default_model
    }

    /// Read timeout that applies to `model`.
    #[must_use]
    pub fn resolve_timeout(&self, model: &str) -> Duration {
        self.timeouts.resolve(model)
    }

    /// Short probe of the peer. Any failure counts as not alive.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        let alive = self
            .probe
            .get(self.endpoint("api/tags"))
            .send()
            .is_ok_and(|response| response.status().is_success());
        debug!(alive, "liveness probe");
        alive
    }

    /// Names of the models installed on the peer.
    ///
    /// # Errors
    /// Returns an error if the peer cannot be reached or answers malformed JSON.
    pub fn list_models(&self) -> InferenceResult<Vec<String>> {
        let response = self
            .probe
            .get(self.endpoint("api/tags"))
            .send()
            .map_err(InferenceError::from_reqwest)?;
        let response = ensure_success(response)?;
        let tags: TagsResponse = serde_json::from_reader(response)?;
        Ok(tags.models.into_iter().map(|tag| tag.name).collect())
    }

    /// Ask the peer to load `model` and keep it resident.
    ///
    /// # Errors
    /// Returns an error if the request fails after retries.
    pub fn preload(&self, model: &str) -> InferenceResult<()> {
        let body = PreloadBody {
            model,
            messages: [],
            keep_alive: &self.performance.keep_alive,
        };
        let client = self.client_for(self.resolve_timeout(model))?;
        self.with_retry("preload", model, &|| false, || {
            let response = client
                .post(self.endpoint("api/chat"))
                .json(&body)
                .send()
                .map_err(InferenceError::from_reqwest)?;
            ensure_success(response).map(drop)
        })?;
        info!(model, keep_alive = %self.performance.keep_alive, "model preloaded");
        Ok(())
    }

    /// Single-shot completion.
    ///
    /// # Errors
    /// Returns an error if every attempt fails or the reply lacks content.
    pub fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: f64,
    ) -> InferenceResult<String> {
        let body = ChatRequestBody::new(model, messages, temperature, false, &self.performance);
        let client = self.client_for(self.resolve_timeout(model))?;
        let response = self.with_retry("complete", model, &|| false, || {
            post_json(&client, &self.endpoint("api/chat"), &body)
        })?;
        let line: ChatResponseLine = serde_json::from_reader(response)?;
        if let Some(message) = line.error {
            return Err(InferenceError::Peer(message));
        }
        line.message
            .map(|message| message.content)
            .ok_or(InferenceError::MalformedResponse)
    }

    /// Open a streamed chat request. Opening retries with backoff; once the
    /// stream is open, failures surface through the iterator.
    ///
    /// # Errors
    /// Returns [`InferenceError::Cancelled`] if `cancel` fires before the
    /// connection is established, or the last error once retries run out.
    pub fn stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: f64,
        cancel: CancelCheck,
    ) -> InferenceResult<ChatStream> {
        let read_timeout = self.resolve_timeout(model);
        let body = ChatRequestBody::new(model, messages, temperature, true, &self.performance);
        let client = self.client_for(read_timeout)?;
        let response = self.with_retry("stream", model, &*cancel, || {
            post_json(&client, &self.endpoint("api/chat"), &body)
        })?;
        debug!(model, ?read_timeout, messages = messages.len(), "stream opened");
        Ok(ChatStream::new(Box::new(BufReader::new(response)), model, cancel))
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.config.base_url.trim_end_matches('/'))
    }

    /// One client per read timeout; `Client` clones share a connection pool.
    fn client_for(&self, read_timeout: Duration) -> InferenceResult<Client> {
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(&read_timeout) {
            return Ok(client.clone());
        }
        let client = Client::builder()
            .connect_timeout(self.config.connect_timeout())
            .timeout(read_timeout)
            .build()?;
        clients.insert(read_timeout, client.clone());
        Ok(client)
    }

    fn with_retry<T>(
        &self,
        operation: &'static str,
        model: &str,
        cancel: &dyn Fn() -> bool,
        mut attempt: impl FnMut() -> InferenceResult<T>,
    ) -> InferenceResult<T> {
        let attempts = self.config.retry_attempts.max(1);
        let mut delay = self.config.initial_retry_delay();
        let mut made = 0;
        loop {
            if cancel() {
                return Err(InferenceError::Cancelled);
            }
            made += 1;
            let err = match attempt() {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !err.is_retryable() {
                warn!(operation, model, kind = err.kind(), %err, "inference request failed");
                return Err(err);
            }
            if made >= attempts {
                warn!(operation, model, attempts = made, kind = err.kind(), %err, "inference retries exhausted");
                return Err(InferenceError::RetriesExhausted {
                    attempts: made,
                    last: Box::new(err),
                });
            }
            match &err {
                InferenceError::ConnectTimeout(_) => {
                    warn!(operation, model, attempt = made, ?delay, "connect timeout, retrying");
                }
                InferenceError::ReadTimeout(_) => {
                    warn!(operation, model, attempt = made, ?delay, "read timeout, retrying");
                }
                _ => warn!(operation, model, attempt = made, ?delay, kind = err.kind(), %err, "retrying"),
            }
            if !sleep_unless_cancelled(delay, cancel) {
                return Err(InferenceError::Cancelled);
            }
            delay = delay.mul_f64(self.config.backoff_factor);
        }
    }
}

fn post_json(client: &Client, url: &str, body: &ChatRequestBody<'_>) -> InferenceResult<Response> {
    let response = client
        .post(url)
        .json(body)
        .send()
        .map_err(InferenceError::from_reqwest)?;
    ensure_success(response)
}

fn ensure_success(response: Response) -> InferenceResult<Response> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(InferenceError::HttpStatus(status.as_u16()))
    }
}

/// Returns `false` if `cancel` fired before `delay` elapsed.
fn sleep_unless_cancelled(delay: Duration, cancel: &dyn Fn() -> bool) -> bool {
    let deadline = Instant::now() + delay;
    while !cancel() {
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(CANCEL_POLL));
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::test_peer::PacedPeer;
    use httpmock::prelude::*;
    use serde_json::json;

    fn client_for_peer(base_url: &str) -> InferenceClient {
        let config = InferenceConfig {
            base_url: base_url.to_string(),
            initial_retry_delay_ms: 10,
            ..InferenceConfig::default()
        };
        InferenceClient::new(config, PerformanceConfig::default()).unwrap()
    }

    fn chunk(text: &str) -> String {
        format!(r#"{{"message":{{"role":"assistant","content":"{text}"}},"done":false}}"#)
    }

    #[test]
    fn test_stream_yields_three_chunks() {
        let server = MockServer::start();
        let chat = server.mock(|when, then| {
            when.method(POST)
                .path("/api/chat")
                .body_contains(r#""stream":true"#)
                .body_contains(r#""keep_alive":"30m""#)
                .body_contains(r#""model":"qwen2.5:7b""#);
            then.status(200)
                .header("content-type", "application/x-ndjson")
                .body([chunk("Hello"), "garbage".to_string(), chunk(", "), chunk("world")].join("\n"));
        });
        let client = client_for_peer(&server.base_url());

        let stream = client
            .stream("qwen2.5:7b", &[ChatMessage::user("hi")], 0.7, Box::new(|| false))
            .unwrap();
        let parts: Vec<_> = stream.map(Result::unwrap).collect();
        assert_eq!(parts, ["Hello", ", ", "world"]);
        chat.assert_hits(1);
    }

    #[test]
    fn test_server_error_is_retried_until_exhausted() {
        let server = MockServer::start();
        let chat = server.mock(|when, then| {
            when.method(POST).path("/api/chat");
            then.status(500).body("boom");
        });
        let client = client_for_peer(&server.base_url());

        match client.stream("phi:7b", &[ChatMessage::user("hi")], 0.7, Box::new(|| false)) {
            Err(InferenceError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, InferenceError::HttpStatus(500)));
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("stream opened against a failing peer"),
        }
        chat.assert_hits(3);
    }

    #[test]
    fn test_client_error_is_not_retried() {
        let server = MockServer::start();
        let chat = server.mock(|when, then| {
            when.method(POST).path("/api/chat");
            then.status(404).body("no model");
        });
        let client = client_for_peer(&server.base_url());

        let result = client.complete("nope", &[ChatMessage::user("hi")], 0.7);
        assert!(matches!(result, Err(InferenceError::HttpStatus(404))));
        chat.assert_hits(1);
    }

    #[test]
    fn test_refused_connection_exhausts_retries() {
        let client = client_for_peer(&PacedPeer::unused_base_url());
        let result = client.stream("qwen2.5:7b", &[], 0.7, Box::new(|| false));
        match result {
            Err(InferenceError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(last.is_retryable());
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("stream opened against a closed port"),
        }
    }

    #[test]
    fn test_cancel_during_backoff_aborts() {
        let config = InferenceConfig {
            base_url: PacedPeer::unused_base_url(),
            initial_retry_delay_ms: 5_000,
            ..InferenceConfig::default()
        };
        let client = InferenceClient::new(config, PerformanceConfig::default()).unwrap();
        let started = Instant::now();
        let cancel_at = started + Duration::from_millis(200);

        let result = client.stream("m", &[], 0.7, Box::new(move || Instant::now() >= cancel_at));
        assert!(matches!(result, Err(InferenceError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_complete_and_list_models() {
        let server = MockServer::start();
        let chat = server.mock(|when, then| {
            when.method(POST)
                .path("/api/chat")
                .body_contains(r#""stream":false"#);
            then.status(200).json_body(json!({
                "message": { "role": "assistant", "content": "pong" },
                "done": true
            }));
        });
        let tags = server.mock(|when, then| {
            when.method(GET).path("/api/tags");
            then.status(200)
                .json_body(json!({ "models": [{ "name": "qwen2.5:7b" }, { "name": "phi:7b" }] }));
        });
        let client = client_for_peer(&server.base_url());

        assert_eq!(client.complete("qwen2.5:7b", &[ChatMessage::user("ping")], 0.1).unwrap(), "pong");
        assert_eq!(client.list_models().unwrap(), ["qwen2.5:7b", "phi:7b"]);
        chat.assert();
        tags.assert();
    }

    #[test]
    fn test_peer_error_field_is_surfaced() {
        let server = MockServer::start();
        let chat = server.mock(|when, then| {
            when.method(POST).path("/api/chat");
            then.status(200).json_body(json!({ "error": "model not loaded" }));
        });
        let client = client_for_peer(&server.base_url());

        let result = client.complete("qwen2.5:7b", &[ChatMessage::user("ping")], 0.1);
        assert!(matches!(result, Err(InferenceError::Peer(message)) if message == "model not loaded"));
        chat.assert_hits(1);
    }

    #[test]
    fn test_preload_sends_empty_chat() {
        let server = MockServer::start();
        let preload = server.mock(|when, then| {
            when.method(POST)
                .path("/api/chat")
                .body_contains(r#""messages":[]"#)
                .body_contains(r#""keep_alive":"30m""#);
            then.status(200).json_body(json!({ "done": true }));
        });
        let client = client_for_peer(&server.base_url());

        client.preload("qwen2.5:7b").unwrap();
        preload.assert();
    }

    #[test]
    fn test_liveness_probe() {
        let server = MockServer::start();
        let tags = server.mock(|when, then| {
            when.method(GET).path("/api/tags");
            then.status(200).json_body(json!({ "models": [] }));
        });
        assert!(client_for_peer(&server.base_url()).is_alive());
        tags.assert();

        let failing = MockServer::start();
        let unavailable = failing.mock(|when, then| {
            when.method(GET).path("/api/tags");
            then.status(503);
        });
        assert!(!client_for_peer(&failing.base_url()).is_alive());
        unavailable.assert();
        assert!(!client_for_peer(&PacedPeer::unused_base_url()).is_alive());
    }

    #[test]
    fn test_stream_delivers_fragments_as_they_arrive() {
        let peer = PacedPeer::serve(
            vec![chunk("slow"), chunk(" and"), chunk(" steady")],
            Duration::from_millis(150),
        );
        let client = client_for_peer(&peer.base_url());

        let mut stream = client
            .stream("qwen2.5:7b", &[ChatMessage::user("hi")], 0.7, Box::new(|| false))
            .unwrap();
        let started = Instant::now();
        assert_eq!(stream.next().unwrap().unwrap(), "slow");
        assert!(started.elapsed() < Duration::from_millis(250));
        let rest: Vec<_> = stream.map(Result::unwrap).collect();
        assert_eq!(rest, [" and", " steady"]);
    }

    #[test]
    fn test_timeout_resolution_delegates_to_table() {
        let client = client_for_peer("http://127.0.0.1:1");
        assert_eq!(client.resolve_timeout("qwen2.5:7b"), Duration::from_secs(90));
        assert_eq!(client.resolve_timeout("unknown"), Duration::from_secs(120));
    }
}
