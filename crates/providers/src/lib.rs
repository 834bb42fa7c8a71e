//! Response-generation backends.
//!
//! The turn engine only sees [`Backend`]; everything here adapts a concrete
//! generator (echo, OpenAI-compatible HTTP) to it, plus the wrappers that
//! compose around any backend (content guard, wall-clock timeout).

pub mod echo;
pub mod guard;
pub mod openai_compat;
pub mod registry;
pub(crate) mod sse;
pub mod timeout;
pub mod traits;
pub(crate) mod util;

pub use echo::EchoBackend;
pub use guard::GuardedBackend;
pub use openai_compat::OpenAiCompatBackend;
pub use registry::build_backend;
pub use timeout::TimeoutBackend;
pub use traits::{Backend, ChunkStream, TurnContext};
