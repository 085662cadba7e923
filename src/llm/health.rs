//! Background liveness monitor for the inference peer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::llm::ollama_client::InferenceClient;

/// Something that can be probed for liveness.
pub trait LivenessProbe: Send + Sync {
    /// `true` if the peer answered the probe.
    fn probe(&self) -> bool;
}

impl LivenessProbe for InferenceClient {
    fn probe(&self) -> bool {
        self.is_alive()
    }
}

/// Called with the new state whenever liveness flips.
pub type StatusCallback = Box<dyn Fn(bool) + Send>;

/// Polls a [`LivenessProbe`] on its own thread and caches the result.
pub struct HealthMonitor {
    alive: Arc<AtomicBool>,
    stop: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    /// Start polling every `interval`. The first probe runs immediately.
    ///
    /// # Errors
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn(
        probe: Arc<dyn LivenessProbe>,
        interval: Duration,
        on_change: Option<StatusCallback>,
    ) -> std::io::Result<Self> {
        let alive = Arc::new(AtomicBool::new(false));
        let shared = Arc::clone(&alive);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let handle = std::thread::Builder::new()
            .name("ember-health".to_owned())
            .spawn(move || {
                let mut last = None;
                loop {
                    let now = probe.probe();
                    shared.store(now, Ordering::Release);
                    if last != Some(now) {
                        if now {
                            info!("inference peer is up");
                        } else {
                            warn!("inference peer is down");
                        }
                        if let Some(callback) = on_change.as_ref() {
                            callback(now);
                        }
                        last = Some(now);
                    }
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("health monitor stopped");
            })?;

        Ok(Self {
            alive,
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Result of the latest probe.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Stop polling and join the thread. Idempotent.
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("health monitor panicked");
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
