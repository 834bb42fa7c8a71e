use tg_domain::error::Result;
use tg_domain::message::ChatMessage;
use tg_domain::stream::{BackendChunk, BoxStream};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything a backend gets to see for one turn.
///
/// Built by the worker right before the backend call and moved into it;
/// nothing else crosses the worker/backend boundary.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub session_id: String,
    pub request_id: String,
    pub user_message: String,
    /// Recent session history, oldest first.  Does not include
    /// `user_message`.
    pub history: Vec<ChatMessage>,
    /// How many history messages were asked for.
    pub context_window: usize,
}

impl TurnContext {
    pub fn new(
        session_id: impl Into<String>,
        request_id: impl Into<String>,
        user_message: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            request_id: request_id.into(),
            user_message: user_message.into(),
            history: Vec::new(),
            context_window: 0,
        }
    }
}

/// Stream returned by [`Backend::generate`].
pub type ChunkStream = BoxStream<'static, Result<BackendChunk>>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Backend trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A response generator.
///
/// `generate` resolves once the backend has accepted the request and
/// returns a stream of incremental chunks that must end with
/// [`BackendChunk::Done`] carrying the final content.  A backend that
/// cannot stream may return a stream holding only `Done`.
///
/// Errors, whether from `generate` itself or yielded by the stream, are
/// turn failures.  No timeout is implied; wrap with
/// [`TimeoutBackend`](crate::TimeoutBackend) for one.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    async fn generate(&self, ctx: TurnContext) -> Result<ChunkStream>;

    /// Short identifier used in logs and error messages.
    fn backend_id(&self) -> &str;
}
