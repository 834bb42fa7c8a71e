//! Content guard that can short-circuit generation.

use std::sync::Arc;

use crate::traits::{Backend, ChunkStream, TurnContext};
use crate::util::done_only;
use tg_domain::error::Result;

/// Refuses turns whose user message contains a blocked term.
///
/// A blocked turn never reaches the inner backend; it finishes with the
/// configured reply and `{"blocked": true, "node": "blocked"}` metadata.
pub struct GuardedBackend {
    inner: Arc<dyn Backend>,
    blocked_terms: Vec<String>,
    reply: String,
}

impl GuardedBackend {
    pub fn new(inner: Arc<dyn Backend>, blocked_terms: &[String], reply: impl Into<String>) -> Self {
        Self {
            inner,
            blocked_terms: blocked_terms
                .iter()
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect(),
            reply: reply.into(),
        }
    }

    fn matched_term(&self, message: &str) -> Option<&str> {
        let lowered = message.to_lowercase();
        self.blocked_terms
            .iter()
            .find(|term| lowered.contains(term.as_str()))
            .map(String::as_str)
    }
}

#[async_trait::async_trait]
impl Backend for GuardedBackend {
    async fn generate(&self, ctx: TurnContext) -> Result<ChunkStream> {
        if let Some(term) = self.matched_term(&ctx.user_message) {
            tracing::info!(
                session_id = %ctx.session_id,
                request_id = %ctx.request_id,
                term = %term,
                "turn blocked by content guard"
            );
            return Ok(done_only(
                self.reply.clone(),
                Some(serde_json::json!({ "blocked": true, "node": "blocked" })),
            ));
        }
        self.inner.generate(ctx).await
    }

    fn backend_id(&self) -> &str {
        self.inner.backend_id()
    }
}
