//! AppState construction shared by `serve` and `run`.

use std::sync::Arc;

use anyhow::Context;

use tg_domain::config::{Config, ConfigSeverity, StorageKind};
use tg_providers::build_backend;
use tg_sessions::{FileStorage, MemoryStorage, TurnStorage};

use crate::runtime::{EngineSettings, TurnEngine};
use crate::state::AppState;

/// Validate config, build the collaborators and start the turn engine.
pub async fn build_app_state(config: Arc<Config>) -> anyhow::Result<AppState> {
    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    let errors = issues
        .iter()
        .filter(|i| i.severity == ConfigSeverity::Error)
        .count();
    if errors > 0 {
        anyhow::bail!("config validation failed with {errors} error(s)");
    }

    // ── Storage ──────────────────────────────────────────────────────
    let storage = build_storage(&config)?;

    // ── Backend ──────────────────────────────────────────────────────
    let backend = build_backend(&config.backend).context("initializing backend")?;

    // ── Engine ───────────────────────────────────────────────────────
    let settings = EngineSettings::from_config(&config.runtime);
    tracing::info!(
        workers = settings.worker_count,
        queue_max_size = settings.queue_max_size,
        stream_timeout_secs = settings.stream_timeout.as_secs(),
        "turn engine starting"
    );
    let engine = TurnEngine::start(settings, backend, storage);

    Ok(AppState { config, engine })
}

fn build_storage(config: &Config) -> anyhow::Result<Arc<dyn TurnStorage>> {
    match config.storage.kind {
        StorageKind::File => {
            let state_path = &config.storage.path;
            let storage = FileStorage::open(state_path)
                .with_context(|| format!("opening session storage at {}", state_path.display()))?;
            tracing::info!(path = %config.storage.path.display(), "file session storage ready");
            Ok(Arc::new(storage))
        }
        StorageKind::Memory => {
            tracing::warn!("in-memory session storage, history is lost on exit");
            Ok(Arc::new(MemoryStorage::new()))
        }
    }
}
