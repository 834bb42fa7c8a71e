//! Session storage for TurnGate.
//!
//! Sessions are an index entry plus an append-only history.  A committed
//! turn writes the user message and the assistant answer together, keyed
//! by `request_id` so that a retried commit is a no-op.

pub mod file;
pub mod memory;
pub mod storage;
pub mod store;
pub mod transcript;

pub use file::FileStorage;
pub use memory::MemoryStorage;
pub use storage::{TurnRecord, TurnStorage};
pub use store::{SessionEntry, SessionStore};
pub use transcript::TranscriptWriter;
