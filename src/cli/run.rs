use crate::config::{load_config, Config, ConfigError};
use crate::dispatch::EventHandler;
use crate::source::op::Operation;
use crate::storage::JsonLinesStore;
use crate::tail::error::TailError;
use crate::tail::session::TailSession;
use async_trait::async_trait;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("tail error: {0}")]
    Tail(#[from] TailError),
}

/// Writes every event to stdout as one JSON line.
struct StdoutHandler;

impl StdoutHandler {
    fn emit(&self, op: &Operation) {
        match serde_json::to_string(op) {
            Ok(json) => {
                let mut stdout = std::io::stdout().lock();
                if let Err(e) = writeln!(stdout, "{}", json) {
                    warn!(error = %e, "Failed to write event");
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode event"),
        }
    }
}

#[async_trait]
impl EventHandler for StdoutHandler {
    async fn on_insert(&self, op: &Operation) {
        self.emit(op);
    }

    async fn on_update(&self, op: &Operation) {
        self.emit(op);
    }

    async fn on_delete(&self, op: &Operation) {
        self.emit(op);
    }

    async fn on_drop(&self, op: &Operation) {
        self.emit(op);
    }

    async fn on_error(&self, error: &TailError) {
        error!(error = %error, "Tail error");
    }
}

pub async fn run(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    run_tail(config_path.as_deref()).await.map_err(|e| e.into())
}

async fn run_tail(config_path: Option<&Path>) -> Result<(), RunError> {
    let config = match config_path {
        Some(path) => {
            info!(config_path = %path.display(), "Loading configuration");
            load_config(path)?
        }
        None => {
            warn!("No config file found, using defaults. Run 'optail config init' to create one.");
            Config::default()
        }
    };

    info!(path = %config.store.path.display(), "Opening JSON-lines store");
    let store = Arc::new(JsonLinesStore::new(config.store.path.clone()));

    let handle = TailSession::builder(store)
        .handler(Arc::new(StdoutHandler))
        .start(config)
        .await?;
    info!(session = %handle.session_id(), "Tailing; press Ctrl+C to stop");

    tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for Ctrl+C");
            }
            info!("Received Ctrl+C, shutting down gracefully");
            handle.stop().await;
        }
        result = handle.wait() => {
            result?;
        }
    }

    let result = handle.wait().await;
    if let Some(position) = handle.position() {
        info!(position = %position, "Last acknowledged position");
    }
    Ok(result?)
}
