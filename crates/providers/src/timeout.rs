//! Wall-clock budget for a whole generation.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::time::{timeout_at, Instant};

use crate::traits::{Backend, ChunkStream, TurnContext};
use tg_domain::error::{Error, Result};
use tg_domain::stream::BackendChunk;

/// Fails a generation that has not produced its final chunk within
/// `limit` of the `generate` call, covering both the initial request and
/// the stream drain.
pub struct TimeoutBackend {
    inner: Arc<dyn Backend>,
    limit: Duration,
}

impl TimeoutBackend {
    pub fn new(inner: Arc<dyn Backend>, limit: Duration) -> Self {
        Self { inner, limit }
    }
}

fn timeout_error(id: &str, limit: Duration) -> Error {
    Error::Timeout(format!("backend {id} exceeded {}ms", limit.as_millis()))
}

#[async_trait::async_trait]
impl Backend for TimeoutBackend {
    async fn generate(&self, ctx: TurnContext) -> Result<ChunkStream> {
        let deadline = Instant::now() + self.limit;
        let limit = self.limit;
        let id = self.inner.backend_id().to_owned();

        let mut inner = timeout_at(deadline, self.inner.generate(ctx))
            .await
            .map_err(|_| timeout_error(&id, limit))??;

        let stream = async_stream::stream! {
            loop {
                match timeout_at(deadline, inner.next()).await {
                    Ok(Some(item)) => {
                        let finished = matches!(item, Ok(BackendChunk::Done { .. }) | Err(_));
                        yield item;
                        if finished {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(_) => {
                        tracing::warn!(backend = %id, limit_ms = limit.as_millis() as u64, "generation timed out");
                        yield Err(timeout_error(&id, limit));
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    fn backend_id(&self) -> &str {
        self.inner.backend_id()
    }
}
