//! Startup helpers: logging, runtime assembly and orderly shutdown.

use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::chat::{ContentSource, CoordinatorEvent, EventSink, RequestCoordinator, TagMemoryExtractor};
use crate::config::{AppConfig, ConfigError};
use crate::llm::{HealthMonitor, InferenceClient, InferenceError, StatusCallback};
use crate::store::{IntegrityReport, Store, StoreError};

/// Errors that prevent the runtime from starting.
#[derive(Debug, Error)]
pub enum StartError {
    /// Configuration is unusable.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The store could not be opened.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// The inference client could not be built.
    #[error(transparent)]
    Inference(#[from] InferenceError),
    /// A background thread could not be spawned.
    #[error("thread spawn failed: {0}")]
    Io(#[from] std::io::Error),
    /// The memory tag pattern did not compile.
    #[error("memory pattern error: {0}")]
    Pattern(#[from] regex::Error),
}

/// Install the fmt subscriber, filtered by `RUST_LOG` (default `info`).
/// Safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

/// Everything a front-end needs, wired together.
pub struct Runtime {
    /// Effective configuration.
    pub config: AppConfig,
    /// Store and write queue.
    pub store: Arc<Store>,
    /// Inference client.
    pub client: Arc<InferenceClient>,
    /// Liveness poller.
    pub health: HealthMonitor,
    /// Turn coordinator.
    pub coordinator: RequestCoordinator,
}

/// Validate `config`, open the store, probe integrity and start the background threads.
///
/// # Errors
/// Returns an error if the configuration is invalid, the store cannot be
/// opened or a thread cannot be spawned. An unreachable inference peer is not
/// an error; the health monitor reports it.
pub fn start(config: AppConfig, events: Arc<dyn EventSink>) -> Result<Runtime, StartError> {
    config.validate()?;
    info!("Starting Ember v{}", env!("CARGO_PKG_VERSION"));
    info!(endpoint = %config.inference.base_url, model = %config.inference.default_model, "inference peer");

    let store = Arc::new(Store::open(&config.storage)?);
    match store.db().integrity_check()? {
        IntegrityReport::Ok => info!(path = %store.db().path().display(), "store integrity ok"),
        IntegrityReport::Problems(problems) => {
            error!(count = problems.len(), first = ?problems.first(), "store integrity check reported problems");
            events.emit(CoordinatorEvent::Notice {
                source: ContentSource::Memory,
                text: format!("store integrity check failed: {}", problems.join("; ")),
            });
        }
    }

    let client = Arc::new(InferenceClient::new(
        config.inference.clone(),
        config.performance.clone(),
    )?);

    let status_events = Arc::clone(&events);
    let on_change: StatusCallback = Box::new(move |alive| {
        let text = if alive {
            "inference peer reachable"
        } else {
            "inference peer unreachable"
        };
        status_events.emit(CoordinatorEvent::Notice {
            source: ContentSource::Llm,
            text: text.to_string(),
        });
    });
    let health = HealthMonitor::spawn(
        client.clone(),
        config.inference.health_interval(),
        Some(on_change),
    )?;

    let preload_client = Arc::clone(&client);
    let model = client.default_model().to_string();
    std::thread::Builder::new()
        .name("ember-preload".to_owned())
        .spawn(move || {
            if let Err(err) = preload_client.preload(&model) {
                warn!(%model, %err, "model preload failed");
            }
        })?;

    let coordinator = RequestCoordinator::builder(
        Arc::clone(&store),
        client.clone(),
        events,
        Arc::new(TagMemoryExtractor::new()?),
    )
    .chat_config(config.chat.clone())
    .model(client.default_model())
    .temperature(config.performance.temperature)
    .build();

    Ok(Runtime {
        config,
        store,
        client,
        health,
        coordinator,
    })
}

impl Runtime {
    /// Cancel any turn in flight, stop polling and drain the store.
    pub fn shutdown(mut self) {
        self.coordinator.shutdown();
        self.health.stop();
        self.store.close();
        info!("Ember stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::test_peer::PacedPeer;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_start_and_shutdown_without_peer() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::default()
            .with_db_path(dir.path().join("ember.db"))
            .with_base_url(PacedPeer::unused_base_url());
        let (tx, rx) = mpsc::channel();

        let runtime = start(config, Arc::new(tx)).unwrap();
        let notice = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(
            notice,
            CoordinatorEvent::Notice {
                source: ContentSource::Llm,
                text: "inference peer unreachable".to_string()
            }
        );
        assert!(!runtime.health.is_alive());
        assert_eq!(runtime.coordinator.active_conversation(), "Chat 1");

        let store = Arc::clone(&runtime.store);
        runtime.shutdown();
        assert!(store.db().is_closed());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = AppConfig::default().with_base_url("::nope::");
        let (tx, _rx) = mpsc::channel();
        assert!(matches!(start(config, Arc::new(tx)), Err(StartError::Config(_))));
    }
}
