//! Echo backend: answers with the user's own message.
//!
//! Useful for local development and for exercising the streaming path
//! without network access.

use std::time::Duration;

use crate::traits::{Backend, ChunkStream, TurnContext};
use tg_domain::error::Result;
use tg_domain::stream::BackendChunk;

pub struct EchoBackend {
    /// Pause between emitted words.
    token_delay: Duration,
}

impl EchoBackend {
    pub fn new() -> Self {
        Self {
            token_delay: Duration::ZERO,
        }
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }
}

impl Default for EchoBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Backend for EchoBackend {
    async fn generate(&self, ctx: TurnContext) -> Result<ChunkStream> {
        let delay = self.token_delay;
        let message = ctx.user_message;
        let history_len = ctx.history.len();

        let stream = async_stream::stream! {
            for word in message.split_inclusive(char::is_whitespace) {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                yield Ok(BackendChunk::token(word));
            }
            yield Ok(BackendChunk::Done {
                content: message.clone(),
                metadata: Some(serde_json::json!({ "history_messages": history_len })),
            });
        };
        Ok(Box::pin(stream))
    }

    fn backend_id(&self) -> &str {
        "echo"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn streams_words_then_full_message() {
        let backend = EchoBackend::new();
        let stream = backend
            .generate(TurnContext::new("s1", "r1", "hello big world"))
            .await
            .unwrap();
        let chunks: Vec<BackendChunk> = stream.map(|c| c.unwrap()).collect().await;

        let tokens: Vec<String> = chunks
            .iter()
            .filter_map(|c| match c {
                BackendChunk::Token { text } => Some(text.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(tokens, vec!["hello ", "big ", "world"]);
        assert!(matches!(
            chunks.last(),
            Some(BackendChunk::Done { content, .. }) if content == "hello big world"
        ));
    }

    #[tokio::test]
    async fn empty_message_yields_only_done() {
        let backend = EchoBackend::new();
        let stream = backend.generate(TurnContext::new("s1", "r1", "")).await.unwrap();
        let chunks: Vec<BackendChunk> = stream.map(|c| c.unwrap()).collect().await;
        assert_eq!(chunks.len(), 1);
        assert!(matches!(&chunks[0], BackendChunk::Done { content, .. } if content.is_empty()));
    }
}
