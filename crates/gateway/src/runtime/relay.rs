//! Turns buffered events into client-facing frames.
//!
//! A relay call drains one `(session_id, request_id)` bucket until it
//! forwards a terminal frame or its overall timeout runs out, whichever
//! comes first.  Every call ends with exactly one `done` or `error` frame.
//! Dropping the stream (client disconnect) releases the bucket; the worker
//! is not told and keeps running with its events discarded.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tg_domain::stream::BoxStream;
use tg_domain::trace::TraceEvent;
use tokio::time::Instant;

use super::error::EngineError;
use super::event_buffer::EventBuffer;
use super::events::{EventType, StreamEvent, NODE_EXECUTOR, NODE_RESPONSE};
use super::registry::{TaskRegistry, TaskState, TaskStatus};

const DEFAULT_ERROR_MESSAGE: &str = "Request failed";

/// One message on the wire.
#[derive(Debug, Clone, Serialize)]
pub struct StreamFrame {
    pub session_id: String,
    pub request_id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub node: String,
    pub content: String,
    /// Only on `done` (`COMPLETED`) and `error` (`FAILED`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl StreamFrame {
    pub fn is_terminal(&self) -> bool {
        self.event_type.is_terminal()
    }

    fn from_event(session_id: &str, event: StreamEvent) -> Self {
        let (content, status, error_message) = match event.event_type {
            EventType::Done => (event.data, Some(TaskStatus::Completed), None),
            EventType::Error => {
                let message = if event.data.is_empty() {
                    DEFAULT_ERROR_MESSAGE.to_owned()
                } else {
                    event.data
                };
                (String::new(), Some(TaskStatus::Failed), Some(message))
            }
            _ => (event.data, None, None),
        };
        Self {
            session_id: session_id.to_owned(),
            request_id: event.request_id,
            event_type: event.event_type,
            node: event.node,
            content,
            status,
            error_message,
            metadata: event.metadata,
        }
    }

    /// Relay-side failure (timeout, protocol violation).
    fn failure(session_id: &str, request_id: &str, err: &EngineError) -> Self {
        Self {
            session_id: session_id.to_owned(),
            request_id: request_id.to_owned(),
            event_type: EventType::Error,
            node: NODE_EXECUTOR.to_owned(),
            content: String::new(),
            status: Some(TaskStatus::Failed),
            error_message: Some(err.to_string()),
            metadata: Some(json!({ "code": err.code() })),
        }
    }

    /// Terminal frame rebuilt from a finished task whose events are gone.
    fn from_task(task: &TaskState) -> Self {
        match task.status {
            TaskStatus::Completed => Self {
                session_id: task.session_id.clone(),
                request_id: task.request_id.clone(),
                event_type: EventType::Done,
                node: NODE_RESPONSE.to_owned(),
                content: task.result.clone().unwrap_or_default(),
                status: Some(TaskStatus::Completed),
                error_message: None,
                metadata: None,
            },
            _ => Self {
                session_id: task.session_id.clone(),
                request_id: task.request_id.clone(),
                event_type: EventType::Error,
                node: NODE_EXECUTOR.to_owned(),
                content: String::new(),
                status: Some(TaskStatus::Failed),
                error_message: Some(
                    task.error
                        .clone()
                        .unwrap_or_else(|| DEFAULT_ERROR_MESSAGE.to_owned()),
                ),
                metadata: task.error_code.as_ref().map(|code| json!({ "code": code })),
            },
        }
    }
}

fn validate(event: &StreamEvent, request_id: &str) -> Result<(), EngineError> {
    if event.node.trim().is_empty() {
        return Err(EngineError::ProtocolViolation {
            reason: format!("{} event without a node", event.event_type.as_str()),
        });
    }
    if event.request_id != request_id {
        return Err(EngineError::ProtocolViolation {
            reason: format!(
                "{} event for request {} in bucket of {request_id}",
                event.event_type.as_str(),
                if event.request_id.is_empty() {
                    "<none>"
                } else {
                    event.request_id.as_str()
                }
            ),
        });
    }
    Ok(())
}

/// Cleans the bucket up when the relay stream is dropped, however it ends.
struct BucketGuard {
    buffer: Arc<EventBuffer>,
    session_id: String,
    request_id: String,
}

impl Drop for BucketGuard {
    fn drop(&mut self) {
        self.buffer.cleanup(&self.session_id, &self.request_id);
    }
}

pub struct StreamRelay {
    buffer: Arc<EventBuffer>,
    registry: Arc<TaskRegistry>,
    timeout: Duration,
    poll: Duration,
}

impl StreamRelay {
    pub fn new(
        buffer: Arc<EventBuffer>,
        registry: Arc<TaskRegistry>,
        timeout: Duration,
        poll: Duration,
    ) -> Self {
        Self {
            buffer,
            registry,
            timeout,
            poll,
        }
    }

    /// Start relaying one request.  The timeout runs from this call.
    pub fn open(&self, session_id: &str, request_id: &str) -> BoxStream<'static, StreamFrame> {
        let buffer = self.buffer.clone();
        let registry = self.registry.clone();
        let timeout = self.timeout;
        let poll = self.poll;
        let sid = session_id.to_owned();
        let rid = request_id.to_owned();
        let opened = Instant::now();
        let deadline = opened + timeout;

        let stream = async_stream::stream! {
            let _guard = BucketGuard {
                buffer: buffer.clone(),
                session_id: sid.clone(),
                request_id: rid.clone(),
            };
            let mut frames = 0usize;

            let terminal: &'static str = loop {
                let now = Instant::now();
                if now >= deadline {
                    let err = EngineError::StreamTimeout { timeout };
                    tracing::warn!(session_id = %sid, request_id = %rid, frames, "stream timed out");
                    frames += 1;
                    yield StreamFrame::failure(&sid, &rid, &err);
                    break "timeout";
                }

                registry.touch(&sid, &rid);
                let event = match buffer.pop(&sid, &rid, poll.min(deadline - now)).await {
                    Some(event) => event,
                    None => match registry.get(&sid, &rid) {
                        // The bucket is empty but the task is done: either a
                        // previous connection consumed the events or they
                        // were dropped.  Take one last look, then rebuild
                        // the terminal frame from the task.
                        Ok(task) if task.status.is_terminal() => {
                            match buffer.pop(&sid, &rid, Duration::ZERO).await {
                                Some(event) => event,
                                None => {
                                    frames += 1;
                                    yield StreamFrame::from_task(&task);
                                    break "replayed";
                                }
                            }
                        }
                        _ => continue,
                    },
                };

                if let Err(err) = validate(&event, &rid) {
                    tracing::error!(
                        session_id = %sid,
                        request_id = %rid,
                        error = %err,
                        "malformed stream event"
                    );
                    frames += 1;
                    yield StreamFrame::failure(&sid, &rid, &err);
                    break "protocol_violation";
                }

                let frame = StreamFrame::from_event(&sid, event);
                let kind = frame.event_type;
                frames += 1;
                yield frame;
                if kind.is_terminal() {
                    break kind.as_str();
                }
            };

            TraceEvent::StreamClosed {
                session_id: sid.clone(),
                request_id: rid.clone(),
                terminal: terminal.to_owned(),
                frames,
                elapsed_ms: opened.elapsed().as_millis() as u64,
            }
            .emit();
        };

        Box::pin(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::registry::TaskUpdate;
    use crate::runtime::session_lock::SessionLockMap;
    use futures_util::StreamExt;

    struct Fixture {
        buffer: Arc<EventBuffer>,
        registry: Arc<TaskRegistry>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                buffer: Arc::new(EventBuffer::new(
                    0,
                    Duration::from_secs(60),
                    Duration::from_millis(100),
                )),
                registry: Arc::new(TaskRegistry::new(
                    Arc::new(SessionLockMap::new()),
                    Duration::from_secs(60),
                    100,
                    Duration::from_secs(60),
                )),
            }
        }

        fn relay(&self, timeout_ms: u64) -> StreamRelay {
            StreamRelay::new(
                self.buffer.clone(),
                self.registry.clone(),
                Duration::from_millis(timeout_ms),
                Duration::from_millis(10),
            )
        }

        async fn push(&self, event: StreamEvent) {
            self.buffer.push("s", "r", event).await.unwrap();
        }
    }

    #[tokio::test]
    async fn forwards_until_done() {
        let fx = Fixture::new();
        fx.registry.create("s", "r");
        fx.push(StreamEvent::start("r")).await;
        fx.push(StreamEvent::token("r", "he")).await;
        fx.push(StreamEvent::token("r", "llo")).await;
        fx.push(StreamEvent::done("r", "response", "hello".into(), None))
            .await;
        fx.push(StreamEvent::token("r", "after")).await;

        let frames: Vec<StreamFrame> = fx.relay(1000).open("s", "r").collect().await;

        let kinds: Vec<&str> = frames.iter().map(|f| f.event_type.as_str()).collect();
        assert_eq!(kinds, vec!["start", "token", "token", "done"]);
        assert_eq!(frames[1].content, "he");
        assert_eq!(frames[3].content, "hello");
        assert_eq!(frames[3].status, Some(TaskStatus::Completed));
        assert!(frames[0].status.is_none());
        assert_eq!(fx.buffer.bucket_count(), 0, "bucket cleaned after return");
    }

    #[tokio::test]
    async fn error_frame_defaults_message() {
        let fx = Fixture::new();
        fx.push(StreamEvent::error("r", "CHAT_BACKEND_FAILED", "")).await;

        let frames: Vec<StreamFrame> = fx.relay(1000).open("s", "r").collect().await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].status, Some(TaskStatus::Failed));
        assert_eq!(frames[0].error_message.as_deref(), Some("Request failed"));
    }

    #[tokio::test]
    async fn times_out_with_single_error_frame() {
        let fx = Fixture::new();
        fx.registry.create("s", "r");
        fx.push(StreamEvent::start("r")).await;

        let started = Instant::now();
        let frames: Vec<StreamFrame> = fx.relay(100).open("s", "r").collect().await;
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(1));
        assert_eq!(frames.len(), 2);
        let last = &frames[1];
        assert_eq!(last.event_type, EventType::Error);
        assert!(last.error_message.as_deref().unwrap().contains("timeout"));
        assert_eq!(last.metadata.as_ref().unwrap()["code"], "CHAT_STREAM_TIMEOUT");
        // The relay timeout is not a task outcome.
        assert_eq!(fx.registry.get("s", "r").unwrap().status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn malformed_event_ends_the_stream() {
        let fx = Fixture::new();
        fx.push(StreamEvent::start("r")).await;
        let mut bad = StreamEvent::token("r", "x");
        bad.node.clear();
        fx.push(bad).await;

        let frames: Vec<StreamFrame> = fx.relay(1000).open("s", "r").collect().await;
        assert_eq!(frames.len(), 2);
        assert_eq!(
            frames[1].metadata.as_ref().unwrap()["code"],
            "CHAT_PROTOCOL_VIOLATION"
        );
    }

    #[tokio::test]
    async fn foreign_request_id_is_a_violation() {
        let fx = Fixture::new();
        fx.push(StreamEvent::token("other", "x")).await;

        let frames: Vec<StreamFrame> = fx.relay(1000).open("s", "r").collect().await;
        assert_eq!(frames.len(), 1);
        assert!(frames[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("protocol violation"));
    }

    #[tokio::test]
    async fn finished_task_with_drained_bucket_replays_terminal() {
        let fx = Fixture::new();
        fx.registry.create("s", "r");
        fx.registry
            .transition("s", "r", TaskStatus::Completed, TaskUpdate::completed("stored"))
            .unwrap();

        let frames: Vec<StreamFrame> = fx.relay(1000).open("s", "r").collect().await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event_type, EventType::Done);
        assert_eq!(frames[0].content, "stored");

        fx.registry.create("s", "r2");
        fx.registry
            .transition("s", "r2", TaskStatus::Failed, TaskUpdate::failed("CHAT_BACKEND_FAILED", "boom"))
            .unwrap();
        let frames: Vec<StreamFrame> = fx.relay(1000).open("s", "r2").collect().await;
        assert_eq!(frames[0].error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn dropping_the_stream_cleans_the_bucket() {
        let fx = Fixture::new();
        fx.push(StreamEvent::start("r")).await;
        fx.push(StreamEvent::token("r", "a")).await;

        let mut stream = fx.relay(1000).open("s", "r");
        let first = stream.next().await.unwrap();
        assert_eq!(first.event_type, EventType::Start);
        assert_eq!(fx.buffer.size("s", "r"), 1);

        drop(stream);
        assert_eq!(fx.buffer.bucket_count(), 0);
    }

    #[test]
    fn frame_wire_shape() {
        let frame = StreamFrame::from_event(
            "s",
            StreamEvent::done("r", "response", "hi".into(), Some(json!({"token_count": 1}))),
        );
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "done");
        assert_eq!(json["status"], "COMPLETED");
        assert_eq!(json["session_id"], "s");
        assert!(json.get("error_message").is_none());
    }
}
