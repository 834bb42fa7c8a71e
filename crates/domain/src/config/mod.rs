mod backend;
mod observability;
mod runtime;
mod server;
mod storage;

pub use backend::*;
pub use observability::*;
pub use runtime::*;
pub use server::*;
pub use storage::*;

use serde::{Deserialize, Serialize};
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl ConfigError {
    fn error(field: &str, message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Error,
            field: field.into(),
            message: message.into(),
        }
    }

    fn warning(field: &str, message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Warning,
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues.
    ///
    /// Returns an empty vec when everything looks good.  Values that are
    /// merely out of range are reported as warnings because the runtime
    /// clamps them.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push(ConfigError::error("server.port", "port must be greater than 0"));
        }
        if self.server.host.is_empty() {
            errors.push(ConfigError::error("server.host", "host must not be empty"));
        }
        if self.server.max_concurrent_requests == 0 {
            errors.push(ConfigError::error(
                "server.max_concurrent_requests",
                "must be greater than 0",
            ));
        }
        if self.server.cors.allowed_origins.len() == 1
            && self.server.cors.allowed_origins[0] == "*"
        {
            errors.push(ConfigError::warning(
                "server.cors.allowed_origins",
                "wildcard \"*\" allows all origins (not recommended for production)",
            ));
        }

        // ── Backend ──────────────────────────────────────────────────
        if self.backend.kind == BackendKind::OpenaiCompat
            && self.backend.base_url.as_deref().map_or(true, str::is_empty)
        {
            errors.push(ConfigError::error(
                "backend.base_url",
                "openai_compat backend requires a base_url",
            ));
        }
        if self.backend.timeout_ms == Some(0) {
            errors.push(ConfigError::error(
                "backend.timeout_ms",
                "timeout must be greater than 0 (omit it to disable)",
            ));
        }

        // ── Runtime ──────────────────────────────────────────────────
        let rt = &self.runtime;
        if rt.stream.timeout_secs < 1 {
            errors.push(ConfigError::warning(
                "runtime.stream.timeout_secs",
                "below 1s; clamped to 1",
            ));
        }
        if rt.tasks.result_ttl_secs < 60 {
            errors.push(ConfigError::warning(
                "runtime.tasks.result_ttl_secs",
                "below 60s; clamped to 60",
            ));
        }
        if rt.tasks.max_stored < 100 {
            errors.push(ConfigError::warning(
                "runtime.tasks.max_stored",
                "below 100; clamped to 100",
            ));
        }
        if let Some(backend_ms) = self.backend.timeout_ms {
            if backend_ms / 1000 >= rt.stream.timeout_secs.max(1) {
                errors.push(ConfigError::warning(
                    "backend.timeout_ms",
                    "not shorter than runtime.stream.timeout_secs; streams will time out first",
                ));
            }
        }
        if rt.queue.max_size == 0 {
            errors.push(ConfigError::warning(
                "runtime.queue.max_size",
                "0 means unbounded; submissions are never rejected for capacity",
            ));
        }

        // ── Observability ────────────────────────────────────────────
        let obs = &self.observability;
        if !(0.0..=1.0).contains(&obs.sample_rate) {
            errors.push(ConfigError::error(
                "observability.sample_rate",
                "must be between 0.0 and 1.0",
            ));
        }
        if obs.log_filter.trim().is_empty() {
            errors.push(ConfigError::warning(
                "observability.log_filter",
                "empty; falling back to \"info\"",
            ));
        }
        if let Some(endpoint) = obs.otlp_endpoint() {
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                errors.push(ConfigError::error(
                    "observability.otlp_endpoint",
                    "must be an http:// or https:// URL",
                ));
            }
            if obs.service_name.trim().is_empty() {
                errors.push(ConfigError::error(
                    "observability.service_name",
                    "required when otlp_endpoint is set",
                ));
            }
            if obs.sample_rate == 0.0 {
                errors.push(ConfigError::warning(
                    "observability.sample_rate",
                    "0.0 exports no traces although otlp_endpoint is set",
                ));
            }
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn has_error(errors: &[ConfigError], field: &str) -> bool {
        errors
            .iter()
            .any(|e| e.field == field && e.severity == ConfigSeverity::Error)
    }

    #[test]
    fn default_config_has_no_errors() {
        let errors = Config::default().validate();
        assert!(errors.iter().all(|e| e.severity != ConfigSeverity::Error));
    }

    #[test]
    fn openai_compat_without_base_url_is_an_error() {
        let mut cfg = Config::default();
        cfg.backend.kind = BackendKind::OpenaiCompat;
        assert!(has_error(&cfg.validate(), "backend.base_url"));

        cfg.backend.base_url = Some("http://localhost:8000/v1".into());
        assert!(!has_error(&cfg.validate(), "backend.base_url"));
    }

    #[test]
    fn zero_port_is_an_error() {
        let mut cfg = Config::default();
        cfg.server.port = 0;
        assert!(has_error(&cfg.validate(), "server.port"));
    }

    #[test]
    fn small_ttl_is_only_a_warning() {
        let mut cfg = Config::default();
        cfg.runtime.tasks.result_ttl_secs = 5;
        let errors = cfg.validate();
        let issue = errors
            .iter()
            .find(|e| e.field == "runtime.tasks.result_ttl_secs")
            .unwrap();
        assert_eq!(issue.severity, ConfigSeverity::Warning);
    }

    #[test]
    fn otlp_settings_are_checked_only_when_export_is_on() {
        let mut cfg = Config::default();
        cfg.observability.service_name = String::new();
        cfg.observability.otlp_endpoint = Some("  ".into());
        assert!(!has_error(&cfg.validate(), "observability.service_name"));

        cfg.observability.otlp_endpoint = Some("collector:4317".into());
        let errors = cfg.validate();
        assert!(has_error(&errors, "observability.otlp_endpoint"));
        assert!(has_error(&errors, "observability.service_name"));

        cfg.observability.otlp_endpoint = Some("http://collector:4317".into());
        cfg.observability.service_name = "turngate-edge".into();
        assert!(!has_error(&cfg.validate(), "observability.otlp_endpoint"));
    }

    #[test]
    fn sample_rate_out_of_range_is_an_error() {
        let mut cfg = Config::default();
        cfg.observability.sample_rate = 1.5;
        assert!(has_error(&cfg.validate(), "observability.sample_rate"));
    }

    #[test]
    fn display_includes_severity_tag() {
        let e = ConfigError::error("server.port", "bad");
        assert_eq!(e.to_string(), "[ERROR] server.port: bad");
    }
}
