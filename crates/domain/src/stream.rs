use serde::Serialize;
use std::pin::Pin;

/// A boxed async stream, used for backend generation output.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// One item produced by a response-generation backend.
///
/// A well-formed generation yields zero or more `Token`/`References`
/// items followed by exactly one `Done`.  Anything after `Done` is ignored.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendChunk {
    /// An incremental piece of the answer.
    Token { text: String },

    /// Structured side-payload (retrieved sources, citations).
    References { payload: serde_json::Value },

    /// Generation finished.  `content` is the full final answer.
    Done {
        content: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
    },
}

impl BackendChunk {
    pub fn token(text: impl Into<String>) -> Self {
        Self::Token { text: text.into() }
    }

    pub fn done(content: impl Into<String>) -> Self {
        Self::Done {
            content: content.into(),
            metadata: None,
        }
    }
}
