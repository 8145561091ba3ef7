//! Operation handlers shared by the CLI and the bus.
//!
//! Every handler takes the application state plus a [`Reporter`] bound to
//! the request's transaction, performs the work through the engines, and
//! returns the uniform response envelope.

pub mod distrobox;
pub mod image;
pub mod system;

use crate::catalog::CatalogStore;
use crate::config::AppConfig;
use crate::events::Reporter;
use crate::image::history::HistoryStore;
use crate::response::Envelope;
use crate::runner::{CommandRunner, RealCommandRunner};
use anyhow::Result;
use serde_json::Value;
use std::sync::Arc;

/// Long-lived state handed into every handler.
pub struct AppState {
    pub config: AppConfig,
    pub runner: Arc<dyn CommandRunner>,
    pub store: CatalogStore,
    pub history: HistoryStore,
}

impl AppState {
    /// Initialize against the real system tools.
    pub fn init(config: AppConfig) -> Result<Self> {
        Self::with_runner(config, Arc::new(RealCommandRunner))
    }

    /// Initialize with an injected runner (tests, daemons).
    pub fn with_runner(config: AppConfig, runner: Arc<dyn CommandRunner>) -> Result<Self> {
        let store = CatalogStore::open(&config.database_path)?;
        let history = HistoryStore::open(&config.database_path)?;
        Ok(Self {
            config,
            runner,
            store,
            history,
        })
    }
}

/// Fold a handler result into the response envelope.
pub(crate) fn envelope(reporter: &Reporter, result: Result<Value>) -> Envelope {
    match result {
        Ok(data) => Envelope::success(data, reporter.transaction()),
        Err(err) => Envelope::failure(err.to_string(), reporter.transaction()),
    }
}
