//! Shared utility functions for backend adapters.

use tg_domain::error::Error;

/// Convert a [`reqwest::Error`] into the domain [`Error`] type.
///
/// Timeout errors map to [`Error::Timeout`]; everything else maps to
/// [`Error::Http`].
pub(crate) fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Http(e.to_string())
    }
}

/// Single-item stream holding just a final answer.
pub(crate) fn done_only(
    content: String,
    metadata: Option<serde_json::Value>,
) -> crate::traits::ChunkStream {
    let item = Ok(tg_domain::stream::BackendChunk::Done { content, metadata });
    Box::pin(futures_util::stream::iter(std::iter::once(item)))
}
