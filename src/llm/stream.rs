//! Incremental reader over an NDJSON chat response.

use std::io::BufRead;

use tracing::{debug, info, warn};

use crate::llm::error::{InferenceError, InferenceResult};
use crate::llm::types::ChatResponseLine;

/// Polled before every read; returning `true` ends the stream.
pub type CancelCheck = Box<dyn Fn() -> bool + Send>;

enum Line {
    Text(String),
    Skip,
    Done,
    PeerError(String),
}

fn parse_line(raw: &[u8]) -> Line {
    let text = String::from_utf8_lossy(raw);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Line::Skip;
    }
    match serde_json::from_str::<ChatResponseLine>(trimmed) {
        Ok(ChatResponseLine {
            error: Some(message),
            ..
        }) => Line::PeerError(message),
        Ok(line) => match line.message {
            Some(message) if !message.content.is_empty() => Line::Text(message.content),
            _ if line.done => Line::Done,
            _ => Line::Skip,
        },
        Err(err) => {
            debug!(%err, "skipping malformed stream line");
            Line::Skip
        }
    }
}

/// Fragments of one streamed reply, in arrival order.
///
/// Ends on connection close, the peer's `done` line, a read error or
/// cancellation. The connection is released when the stream ends or is dropped.
pub struct ChatStream {
    reader: Option<Box<dyn BufRead + Send>>,
    cancel: CancelCheck,
    model: String,
    chunks: usize,
}

impl ChatStream {
    pub(crate) fn new(reader: Box<dyn BufRead + Send>, model: &str, cancel: CancelCheck) -> Self {
        Self {
            reader: Some(reader),
            cancel,
            model: model.to_string(),
            chunks: 0,
        }
    }

    fn release(&mut self, reason: &'static str) {
        if self.reader.take().is_some() {
            debug!(model = %self.model, chunks = self.chunks, reason, "stream released");
        }
    }
}

impl Iterator for ChatStream {
    type Item = InferenceResult<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.reader.as_ref()?;
            if (self.cancel)() {
                info!(model = %self.model, chunks = self.chunks, "stream cancelled");
                self.release("cancelled");
                return None;
            }

            let mut raw = Vec::new();
            let read = self.reader.as_mut()?.read_until(b'\n', &mut raw);
            match read {
                Ok(0) => {
                    self.release("closed");
                    return None;
                }
                Ok(_) => match parse_line(&raw) {
                    Line::Text(text) => {
                        self.chunks += 1;
                        return Some(Ok(text));
                    }
                    Line::Skip => {}
                    Line::Done => {
                        self.release("done");
                        return None;
                    }
                    Line::PeerError(message) => {
                        warn!(model = %self.model, %message, "peer reported an error mid-stream");
                        self.release("peer_error");
                        return Some(Err(InferenceError::Peer(message)));
                    }
                },
                Err(err) => {
                    let err = InferenceError::from_io(&err);
                    warn!(model = %self.model, kind = err.kind(), %err, "stream read failed");
                    self.release("read_error");
                    return Some(Err(err));
                }
            }
        }
    }
}

impl Drop for ChatStream {
    fn drop(&mut self) {
        self.release("dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn stream_over(body: &str, cancel: CancelCheck) -> ChatStream {
        ChatStream::new(Box::new(Cursor::new(body.as_bytes().to_vec())), "test", cancel)
    }

    fn never() -> CancelCheck {
        Box::new(|| false)
    }

    #[test]
    fn test_yields_fragments_in_order() {
        let body = concat!(
            r#"{"message":{"role":"assistant","content":"Hel"},"done":false}"#, "\n",
            r#"{"message":{"role":"assistant","content":"lo"},"done":false}"#, "\n",
            r#"{"message":{"role":"assistant","content":"!"},"done":false}"#, "\n",
            r#"{"message":{"role":"assistant","content":""},"done":true}"#, "\n",
        );
        let parts: Vec<_> = stream_over(body, never()).map(Result::unwrap).collect();
        assert_eq!(parts, ["Hel", "lo", "!"]);
    }

    #[test]
    fn test_skips_malformed_and_empty_lines() {
        let body = concat!(
            "{not json\n",
            "\n",
            r#"{"done":false}"#, "\n",
            r#"{"message":{"content":"ok"}}"#, "\n",
        );
        let parts: Vec<_> = stream_over(body, never()).map(Result::unwrap).collect();
        assert_eq!(parts, ["ok"]);
    }

    #[test]
    fn test_ends_on_close_without_done() {
        let body = concat!(r#"{"message":{"content":"a"}}"#, "\n", r#"{"message":{"content":"b"}}"#);
        let parts: Vec<_> = stream_over(body, never()).map(Result::unwrap).collect();
        assert_eq!(parts, ["a", "b"]);
    }

    #[test]
    fn test_cancel_stops_before_next_read() {
        let flag = Arc::new(AtomicBool::new(false));
        let check = Arc::clone(&flag);
        let body = concat!(
            r#"{"message":{"content":"one"}}"#, "\n",
            r#"{"message":{"content":"two"}}"#, "\n",
        );
        let mut stream = stream_over(body, Box::new(move || check.load(Ordering::Acquire)));

        assert_eq!(stream.next().unwrap().unwrap(), "one");
        flag.store(true, Ordering::Release);
        assert!(stream.next().is_none());
        assert!(stream.next().is_none());
        assert_eq!(stream.chunks, 1);
    }

    #[test]
    fn test_peer_error_line_is_surfaced() {
        let body = concat!(r#"{"error":"model not found"}"#, "\n");
        let mut stream = stream_over(body, never());
        assert!(matches!(stream.next(), Some(Err(InferenceError::Peer(_)))));
        assert!(stream.next().is_none());
    }
}
