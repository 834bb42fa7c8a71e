//! Worker pool draining the job queue.
//!
//! Each worker takes a job, waits for its session's lock, runs the backend
//! and republishes progress into the event buffer as
//! `start, token*, (references)*, done | error`.  Every job ends with
//! exactly one terminal status in the registry, including when the
//! backend errors, hangs past its own timeout or panics.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{json, Map, Value};
use tg_domain::stream::BackendChunk;
use tg_domain::trace::TraceEvent;
use tg_providers::{Backend, TurnContext};
use tg_sessions::{TurnRecord, TurnStorage};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::error::EngineError;
use super::event_buffer::{EventBuffer, PushError};
use super::events::{StreamEvent, NODE_RESPONSE};
use super::persist::PersistenceHandle;
use super::queue::{JobHandle, JobQueue};
use super::registry::{TaskRegistry, TaskStatus, TaskUpdate};
use super::session_lock::SessionLockMap;

/// What a queued job carries.
#[derive(Debug, Clone)]
pub struct TurnPayload {
    pub session_id: String,
    pub request_id: String,
    pub user_query: String,
    /// History messages to load for the backend.
    pub context_window: usize,
}

/// Shared handles every worker needs.
pub(crate) struct WorkerContext {
    pub queue: Arc<JobQueue<TurnPayload>>,
    pub buffer: Arc<EventBuffer>,
    pub registry: Arc<TaskRegistry>,
    pub locks: Arc<SessionLockMap>,
    pub backend: Arc<dyn Backend>,
    pub storage: Arc<dyn TurnStorage>,
    pub persist: PersistenceHandle,
    pub poll_timeout: Duration,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Pool
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn spawn(size: usize, ctx: Arc<WorkerContext>, cancel: CancellationToken) -> Self {
        let handles = (0..size)
            .map(|worker_id| tokio::spawn(worker_loop(worker_id, ctx.clone(), cancel.clone())))
            .collect();
        tracing::info!(workers = size, "worker pool started");
        Self { handles }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Wait for workers to drain the (already closed) queue, then cancel
    /// whatever is still running once `grace` is up.
    pub async fn shutdown(self, cancel: &CancellationToken, grace: Duration) {
        let deadline = Instant::now() + grace;
        let mut pending = self.handles.into_iter();
        let mut stragglers = Vec::new();
        for mut handle in pending.by_ref() {
            // A handle that completed here must not be polled again.
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                tracing::warn!("worker drain grace elapsed, cancelling workers");
                stragglers.push(handle);
                break;
            }
        }
        stragglers.extend(pending);

        cancel.cancel();
        for handle in stragglers {
            handle.abort();
            if let Err(e) = handle.await {
                if e.is_panic() {
                    tracing::error!(error = %e, "worker panicked during shutdown");
                }
            }
        }
        tracing::info!("worker pool stopped");
    }
}

async fn worker_loop(worker_id: usize, ctx: Arc<WorkerContext>, cancel: CancellationToken) {
    tracing::debug!(worker_id, "worker started");
    loop {
        let job = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            job = ctx.queue.get(ctx.poll_timeout) => job,
        };

        match job {
            Some(job) => run_job(&ctx, job).await,
            None if ctx.queue.is_drained() => break,
            None => {}
        }

        ctx.registry.sweep();
    }
    tracing::debug!(worker_id, "worker stopped");
}

/// Run one job on its own task so a panic fails the turn instead of
/// killing the worker.
///
/// The session permit is held here, outside the turn task, so the next
/// turn of the session cannot start before this one is terminal.
async fn run_job(ctx: &Arc<WorkerContext>, job: JobHandle<TurnPayload>) {
    let span = tracing::info_span!(
        "turn",
        session_id = %job.payload.session_id,
        request_id = %job.payload.request_id,
    );

    let _permit = match ctx.locks.acquire(&job.payload.session_id).await {
        Ok(permit) => permit,
        Err(e) => {
            ActiveTurn::new(ctx, &job.payload)
                .fail(EngineError::backend(e))
                .instrument(span)
                .await;
            return;
        }
    };

    let mut handle = AbortOnDrop(tokio::spawn(
        execute(ctx.clone(), job.clone()).instrument(span.clone()),
    ));

    if let Err(e) = (&mut handle.0).await {
        let cause = if e.is_panic() {
            "worker panicked"
        } else {
            "worker task cancelled"
        };
        async {
            tracing::error!(error = %e, "turn execution aborted");
            let p = &job.payload;
            let already_final = ctx
                .registry
                .get(&p.session_id, &p.request_id)
                .is_ok_and(|t| t.status.is_terminal());
            if !already_final {
                let mut turn = ActiveTurn::new(ctx, p);
                turn.fail(EngineError::backend(cause)).await;
            }
        }
        .instrument(span)
        .await;
    }
}

/// Aborts the turn task when its worker is aborted at shutdown.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn execute(ctx: Arc<WorkerContext>, job: JobHandle<TurnPayload>) {
    let p = &job.payload;
    let mut turn = ActiveTurn::new(&ctx, p);

    match ctx.registry.transition(
        &p.session_id,
        &p.request_id,
        TaskStatus::Running,
        TaskUpdate::default(),
    ) {
        Ok(true) => {}
        Ok(false) => {
            tracing::warn!("task already past QUEUED, skipping job");
            return;
        }
        Err(e) => {
            tracing::warn!(error = %e, "task missing at dequeue, skipping job");
            return;
        }
    }
    turn.started = Instant::now();
    TraceEvent::TaskStarted {
        session_id: p.session_id.clone(),
        request_id: p.request_id.clone(),
        waited_ms: job.waited().as_millis() as u64,
    }
    .emit();

    turn.emit(StreamEvent::start(&p.request_id)).await;

    match turn.generate().await {
        Ok(outcome) => turn.complete(outcome).await,
        Err(err) => turn.fail(err).await,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// One turn
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct TurnOutcome {
    content: String,
    metadata: Option<Value>,
}

struct ActiveTurn<'a> {
    ctx: &'a WorkerContext,
    p: &'a TurnPayload,
    tokens: usize,
    started: Instant,
    /// Set once a push timed out; later non-terminal events are dropped
    /// without waiting.
    consumer_stalled: bool,
}

impl<'a> ActiveTurn<'a> {
    fn new(ctx: &'a WorkerContext, p: &'a TurnPayload) -> Self {
        Self {
            ctx,
            p,
            tokens: 0,
            started: Instant::now(),
            consumer_stalled: false,
        }
    }

    async fn emit(&mut self, event: StreamEvent) {
        let kind = event.event_type.as_str();
        if self.consumer_stalled && !event.is_terminal() {
            return;
        }
        match self
            .ctx
            .buffer
            .push(&self.p.session_id, &self.p.request_id, event)
            .await
        {
            Ok(()) => {}
            Err(PushError::Closed) => {
                tracing::debug!(event = kind, "stream consumer gone, event discarded");
            }
            Err(PushError::Full) => {
                self.consumer_stalled = true;
                tracing::warn!(event = kind, "event bucket still full after push timeout, event dropped");
            }
        }
    }

    fn mark_streaming(&self) {
        if let Err(e) = self.ctx.registry.transition(
            &self.p.session_id,
            &self.p.request_id,
            TaskStatus::Streaming,
            TaskUpdate::default(),
        ) {
            tracing::warn!(error = %e, "could not mark task streaming");
        }
    }

    async fn generate(&mut self) -> Result<TurnOutcome, EngineError> {
        let p = self.p;
        let history = self
            .ctx
            .storage
            .load_recent(&p.session_id, p.context_window)
            .await?;

        let turn_ctx = TurnContext {
            session_id: p.session_id.clone(),
            request_id: p.request_id.clone(),
            user_message: p.user_query.clone(),
            history,
            context_window: p.context_window,
        };

        let mut stream = self
            .ctx
            .backend
            .generate(turn_ctx)
            .await
            .map_err(EngineError::backend)?;

        while let Some(chunk) = stream.next().await {
            match chunk.map_err(EngineError::backend)? {
                BackendChunk::Token { text } => {
                    if text.is_empty() {
                        continue;
                    }
                    if self.tokens == 0 {
                        self.mark_streaming();
                    }
                    self.tokens += 1;
                    self.emit(StreamEvent::token(&p.request_id, text)).await;
                }
                BackendChunk::References { payload } => {
                    self.emit(StreamEvent::references(&p.request_id, payload))
                        .await;
                }
                BackendChunk::Done { content, metadata } => {
                    if content.trim().is_empty() {
                        return Err(EngineError::backend(format!(
                            "backend {} returned empty content",
                            self.ctx.backend.backend_id()
                        )));
                    }
                    if self.tokens == 0 {
                        // Non-streaming result: still one content event before done.
                        self.mark_streaming();
                        self.tokens = 1;
                        self.emit(StreamEvent::token(&p.request_id, content.clone()))
                            .await;
                    }
                    return Ok(TurnOutcome { content, metadata });
                }
            }
        }

        Err(EngineError::backend(format!(
            "backend {} stream ended without a final result",
            self.ctx.backend.backend_id()
        )))
    }

    async fn complete(&mut self, outcome: TurnOutcome) {
        let p = self.p;
        let node = outcome
            .metadata
            .as_ref()
            .and_then(|m| m.get("node"))
            .and_then(Value::as_str)
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(NODE_RESPONSE)
            .to_owned();

        let mut metadata = match outcome.metadata {
            Some(Value::Object(map)) => map,
            Some(other) => {
                let mut map = Map::new();
                map.insert("backend".into(), other);
                map
            }
            None => Map::new(),
        };
        metadata.insert("token_count".into(), json!(self.tokens));

        self.emit(StreamEvent::done(
            &p.request_id,
            &node,
            outcome.content.clone(),
            Some(Value::Object(metadata.clone())),
        ))
        .await;

        if let Err(e) = self.ctx.registry.transition(
            &p.session_id,
            &p.request_id,
            TaskStatus::Completed,
            TaskUpdate::completed(outcome.content.clone()),
        ) {
            tracing::warn!(error = %e, "could not mark task completed");
        }

        metadata.insert("request_id".into(), json!(p.request_id));
        metadata.insert("node".into(), json!(node));
        let record = TurnRecord {
            session_id: p.session_id.clone(),
            request_id: p.request_id.clone(),
            user_message: p.user_query.clone(),
            content: outcome.content,
            metadata: Some(Value::Object(metadata)),
        };
        if record.content.is_empty() {
            tracing::debug!("empty turn content, nothing to persist");
        } else if !self.ctx.persist.enqueue(record) {
            tracing::error!("persistence stage stopped, turn not persisted");
        }

        self.finished(TaskStatus::Completed);
    }

    async fn fail(&mut self, err: EngineError) {
        let p = self.p;
        let code = err.code();
        let message = err.to_string();
        tracing::warn!(code, error = %message, "turn failed");

        self.emit(StreamEvent::error(&p.request_id, code, message.clone()))
            .await;

        if let Err(e) = self.ctx.registry.transition(
            &p.session_id,
            &p.request_id,
            TaskStatus::Failed,
            TaskUpdate::failed(code, message),
        ) {
            tracing::warn!(error = %e, "could not mark task failed");
        }

        self.finished(TaskStatus::Failed);
    }

    fn finished(&self, status: TaskStatus) {
        TraceEvent::TaskFinished {
            session_id: self.p.session_id.clone(),
            request_id: self.p.request_id.clone(),
            status: status.as_str().to_owned(),
            token_count: self.tokens,
            duration_ms: self.started.elapsed().as_millis() as u64,
        }
        .emit();
    }
}
