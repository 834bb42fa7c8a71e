//! Backend construction from configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::echo::EchoBackend;
use crate::guard::GuardedBackend;
use crate::openai_compat::OpenAiCompatBackend;
use crate::timeout::TimeoutBackend;
use crate::traits::Backend;
use tg_domain::config::{BackendConfig, BackendKind};
use tg_domain::error::Result;

/// Build the configured backend, wrapped innermost-first in the timeout
/// and then the content guard when those are configured.
pub fn build_backend(cfg: &BackendConfig) -> Result<Arc<dyn Backend>> {
    let mut backend: Arc<dyn Backend> = match cfg.kind {
        BackendKind::Echo => Arc::new(EchoBackend::new()),
        BackendKind::OpenaiCompat => Arc::new(OpenAiCompatBackend::from_config(cfg)?),
    };

    if let Some(ms) = cfg.timeout_ms.filter(|ms| *ms > 0) {
        backend = Arc::new(TimeoutBackend::new(backend, Duration::from_millis(ms)));
    }

    if !cfg.blocked_terms.is_empty() {
        backend = Arc::new(GuardedBackend::new(
            backend,
            &cfg.blocked_terms,
            cfg.blocked_reply.clone(),
        ));
    }

    tracing::info!(
        backend = %backend.backend_id(),
        kind = ?cfg.kind,
        timeout_ms = ?cfg.timeout_ms,
        blocked_terms = cfg.blocked_terms.len(),
        "backend ready"
    );

    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_builds_echo() {
        let backend = build_backend(&BackendConfig::default()).unwrap();
        assert_eq!(backend.backend_id(), "echo");
    }

    #[test]
    fn wrappers_keep_inner_id() {
        let cfg = BackendConfig {
            timeout_ms: Some(1000),
            blocked_terms: vec!["x".into()],
            ..BackendConfig::default()
        };
        let backend = build_backend(&cfg).unwrap();
        assert_eq!(backend.backend_id(), "echo");
    }

    #[test]
    fn openai_compat_without_url_fails() {
        let cfg = BackendConfig {
            kind: BackendKind::OpenaiCompat,
            ..BackendConfig::default()
        };
        assert!(build_backend(&cfg).is_err());
    }
}
