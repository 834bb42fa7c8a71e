//! Asynchronous turn execution.
//!
//! A submitted turn becomes a job on the [`queue`].  A [`worker`] takes it,
//! serializes it against other turns of the same session
//! ([`session_lock`]), runs the backend and pushes progress into the
//! [`event_buffer`].  The [`relay`] drains that buffer for the caller and
//! guarantees a terminal frame; the [`persist`] stage commits the result
//! out of band.  [`registry`] tracks every task's status throughout, and
//! [`engine`] ties it together behind one handle.

pub mod engine;
pub mod error;
pub mod event_buffer;
pub mod events;
pub mod persist;
pub mod queue;
pub mod registry;
pub mod relay;
pub mod session_lock;
pub mod worker;

pub use engine::{EngineSettings, EngineStats, SubmitReceipt, SubmitRequest, TurnEngine};
pub use error::EngineError;
pub use events::{EventType, StreamEvent};
pub use registry::{TaskResult, TaskState, TaskStatus};
pub use relay::StreamFrame;
