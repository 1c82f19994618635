//! Scheduler: drives a chunk stream through the parser, dependency graph,
//! hook pipeline, and executor, emitting one ordered real-time event stream.
//!
//! The driver is a single async task; each invocation is its own task on
//! the same runtime. Terminal events flow through a completed-results queue
//! drained after each chunk, between chunks, and on a poll (≤100 ms) while
//! invocations are still in flight, so sub-stream events appear in real
//! time rather than batched at the end.
//!
//! Ordering guarantees:
//! - `InvocationAnnounced` for X precedes every event from X's execution.
//! - Events produced during X's execution keep their internal order.
//! - Independent concurrent invocations are otherwise unordered.
//! - `StreamComplete` is the final event; nothing follows it.

mod shared;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use run_event::{EmittedEvent, ErrorKind, SkipCause, Usage};

use crate::error::SessionError;
use crate::executor::Executor;
use crate::gadget::GadgetRegistry;
use crate::graph::{InsertOutcome, InvocationGraph, SessionSeeds};
use crate::hooks::{HookContext, HookPipeline, Intercepted, LlmErrorAction};
use crate::llm::{ChunkStream, LlmStreamError};
use crate::parser::{Delimiters, InvocationParser, ParsedEvent};

use shared::SessionShared;

/// One item of the session's output stream.
pub type SessionItem = Result<EmittedEvent, SessionError>;

/// Tunables for one scheduler session.
#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// Invocation grammar delimiters.
    pub delimiters: Delimiters,
    /// Session-wide per-gadget concurrency cap; combined with each gadget's
    /// own bound, the minimum wins.
    pub max_concurrency: Option<usize>,
    /// Deadline for invocations whose gadget declares no override.
    pub default_timeout: Duration,
    /// Wake-up interval for queue draining during the final wait.
    pub poll_interval: Duration,
    /// Output channel capacity.
    pub channel_capacity: usize,
    /// Outer agent-loop iteration, surfaced in hook contexts.
    pub iteration: u32,
    /// Previously resolved ids from prior iterations.
    pub seeds: SessionSeeds,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            delimiters: Delimiters::default(),
            max_concurrency: None,
            default_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
            channel_capacity: 256,
            iteration: 0,
            seeds: SessionSeeds::default(),
        }
    }
}

/// The session driver: built once per iteration, consumed by [`run`].
///
/// [`run`]: StreamProcessor::run
pub struct StreamProcessor {
    registry: Arc<GadgetRegistry>,
    hooks: Arc<HookPipeline>,
    options: SessionOptions,
    cancel: CancellationToken,
}

impl StreamProcessor {
    pub fn new(registry: Arc<GadgetRegistry>, hooks: Arc<HookPipeline>) -> Self {
        Self {
            registry,
            hooks,
            options: SessionOptions::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_delimiters(mut self, delimiters: Delimiters) -> Self {
        self.options.delimiters = delimiters;
        self
    }

    pub fn with_max_concurrency(mut self, cap: usize) -> Self {
        self.options.max_concurrency = Some(cap);
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.options.default_timeout = timeout;
        self
    }

    pub fn with_seeds(mut self, seeds: SessionSeeds) -> Self {
        self.options.seeds = seeds;
        self
    }

    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.options.iteration = iteration;
        self
    }

    /// Supplies an external cancellation token. Tokens must not be reused
    /// across sessions; an already-cancelled token fails the run.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Clone of the session token, for cancelling from outside.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Spawns the driver and returns the event stream. Dropping the stream
    /// cancels the session.
    pub fn run(self, chunks: ChunkStream) -> ReceiverStream<SessionItem> {
        let (tx, rx) = mpsc::channel(self.options.channel_capacity);
        let session_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!(
            "heddle_session",
            session = %session_id,
            iteration = self.options.iteration
        );
        tokio::spawn(drive(self, chunks, tx).instrument(span));
        ReceiverStream::new(rx)
    }
}

/// Output side of the driver; a failed send means the consumer dropped the
/// stream, which is cancellation.
struct Emitter {
    tx: mpsc::Sender<SessionItem>,
    cancel: CancellationToken,
}

impl Emitter {
    async fn send(&self, event: EmittedEvent) {
        if self.tx.send(Ok(event)).await.is_err() {
            self.cancel.cancel();
        }
    }

    async fn send_err(&self, error: SessionError) {
        let _ = self.tx.send(Err(error)).await;
    }

    /// Completes when the consumer dropped the stream.
    async fn closed(&self) {
        self.tx.closed().await;
    }
}

async fn drive(processor: StreamProcessor, mut chunks: ChunkStream, tx: mpsc::Sender<SessionItem>) {
    let StreamProcessor {
        registry,
        hooks,
        options,
        cancel,
    } = processor;

    if cancel.is_cancelled() {
        let _ = tx.send(Err(SessionError::TokenAlreadyCancelled)).await;
        return;
    }

    let (completed_tx, mut completed_rx) = mpsc::unbounded_channel();
    let executor = Executor::new(Arc::clone(&registry), options.default_timeout);
    let graph = InvocationGraph::new().with_seeds(options.seeds.clone());
    let shared = Arc::new(SessionShared::new(
        registry,
        hooks,
        executor,
        graph,
        completed_tx,
        cancel.clone(),
        options.iteration,
        options.max_concurrency,
    ));
    let emitter = Emitter {
        tx,
        cancel: cancel.clone(),
    };
    let mut parser = InvocationParser::new(options.delimiters.clone());
    let iteration = options.iteration;

    let mut finish_reason: Option<String> = None;
    let mut usage: Option<Usage> = None;
    let mut stream_error: Option<LlmStreamError> = None;
    let mut cancelled = false;
    let mut dup_seq: u64 = 0;

    shared
        .hooks
        .notify_llm_call_start(&HookContext::stream(iteration, ""))
        .await;

    loop {
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => {
                cancelled = true;
                break;
            }
            // Dropping the output stream is cancellation.
            _ = emitter.closed() => {
                shared.cancel.cancel();
                cancelled = true;
                break;
            }
            maybe = completed_rx.recv() => {
                if let Some(event) = maybe {
                    emitter.send(event).await;
                }
            }
            next = chunks.next() => match next {
                None => break,
                Some(Err(error)) => {
                    stream_error = Some(error);
                    break;
                }
                Some(Ok(chunk)) => {
                    if let Some(reason) = chunk.finish_reason {
                        finish_reason = Some(reason);
                    }
                    if let Some(u) = chunk.usage {
                        usage = Some(u);
                    }
                    if let Some(text) = chunk.text {
                        match shared.hooks.intercept_raw_chunk(text) {
                            Intercepted::Suppress => {}
                            Intercepted::Value(text) => {
                                shared.accumulated.lock().await.push_str(&text);
                                let snapshot = shared.snapshot().await;
                                shared
                                    .hooks
                                    .notify_stream_chunk(
                                        &HookContext::stream(iteration, snapshot),
                                        &text,
                                    )
                                    .await;
                                for parsed in parser.feed(&text) {
                                    dispatch(&shared, &emitter, parsed, &mut dup_seq).await;
                                }
                            }
                        }
                    }
                    // Drain anything that completed during this chunk.
                    while let Ok(event) = completed_rx.try_recv() {
                        emitter.send(event).await;
                    }
                }
            }
        }
    }

    if let Some(error) = stream_error {
        let ctx = HookContext::stream(iteration, shared.snapshot().await);
        shared
            .hooks
            .notify_llm_call_error(&ctx, &error.to_string())
            .await;
        match shared.hooks.run_after_llm_error(&ctx, &error.to_string()).await {
            LlmErrorAction::Recover { fallback_response } => {
                shared
                    .accumulated
                    .lock()
                    .await
                    .push_str(&fallback_response);
                if let Intercepted::Value(content) =
                    shared.hooks.intercept_text_chunk(fallback_response)
                {
                    emitter.send(EmittedEvent::Text { content }).await;
                }
                finish_reason = Some("recovered".to_string());
            }
            LlmErrorAction::Rethrow => {
                shared.cancel.cancel();
                emitter.send_err(SessionError::LlmStream(error)).await;
                return;
            }
        }
    }

    if cancelled {
        finish_reason = Some("cancelled".to_string());
    } else {
        for parsed in parser.finalize() {
            dispatch(&shared, &emitter, parsed, &mut dup_seq).await;
        }
        shared
            .hooks
            .notify_llm_call_complete(&HookContext::stream(iteration, shared.snapshot().await))
            .await;
    }

    // Final wait: everything announced must reach a terminal event before
    // StreamComplete. Poll the queue while invocations are in flight.
    let mut cancel_flushed = false;
    loop {
        while let Ok(event) = completed_rx.try_recv() {
            emitter.send(event).await;
        }
        if shared.cancel.is_cancelled() && !cancel_flushed {
            cancel_flushed = true;
            finish_reason = Some("cancelled".to_string());
            shared::flush_cancelled(&shared).await;
            continue;
        }
        if shared.in_flight.load(Ordering::SeqCst) == 0 {
            break;
        }
        tokio::select! {
            maybe = completed_rx.recv() => {
                if let Some(event) = maybe {
                    emitter.send(event).await;
                }
            }
            _ = shared.idle_notify.notified() => {}
            _ = tokio::time::sleep(options.poll_interval) => {}
            _ = emitter.closed(), if !shared.cancel.is_cancelled() => {
                shared.cancel.cancel();
            }
        }
    }
    while let Ok(event) = completed_rx.try_recv() {
        emitter.send(event).await;
    }

    // Now that in-flights finished, deferred nodes either became ready (and
    // ran above) or sit on cycles / dangling references.
    let diagnostics = { shared.graph.lock().await.unresolved_on_close() };
    for diag in diagnostics {
        let ctx = HookContext::invocation(
            iteration,
            &diag.gadget,
            &diag.id,
            Default::default(),
            shared.snapshot().await,
        );
        shared.hooks.notify_invocation_skipped(&ctx, &diag.cause).await;
        emitter
            .send(EmittedEvent::InvocationSkipped {
                id: diag.id,
                gadget: diag.gadget,
                cause: diag.cause,
            })
            .await;
    }

    let raw_text = shared.snapshot().await;
    let final_message = shared.hooks.intercept_final_message(raw_text.clone());
    emitter
        .send(EmittedEvent::StreamComplete {
            finish_reason,
            usage,
            raw_text,
            final_message,
            loop_break: shared.loop_break.load(Ordering::SeqCst),
        })
        .await;
}

/// Routes one parser event: text through interception, calls through
/// announcement, graph registration, and dispatch.
///
/// `dup_seq` numbers the diagnostic ids minted for duplicate invocation
/// ids; the driver owns it for the session.
async fn dispatch(
    shared: &Arc<SessionShared>,
    emitter: &Emitter,
    parsed: ParsedEvent,
    dup_seq: &mut u64,
) {
    match parsed {
        ParsedEvent::Text(text) => {
            if let Intercepted::Value(content) = shared.hooks.intercept_text_chunk(text) {
                emitter.send(EmittedEvent::Text { content }).await;
            }
        }
        ParsedEvent::Call(mut call) => {
            // A colliding id is a parse-level error. The duplicate is
            // diverted onto a minted diagnostic id before it is announced,
            // so the original id keeps its single announcement and single
            // terminal event.
            let diagnostic_id = {
                let graph = shared.graph.lock().await;
                if graph.node(&call.invocation_id).is_some() {
                    let minted = loop {
                        *dup_seq += 1;
                        let candidate = format!("dup-{}-{}", dup_seq, call.invocation_id);
                        if graph.node(&candidate).is_none() {
                            break candidate;
                        }
                    };
                    Some(minted)
                } else {
                    None
                }
            };
            if let Some(diagnostic_id) = diagnostic_id {
                let note = format!(
                    "duplicate invocation id {:?} within this session",
                    call.invocation_id
                );
                call.invocation_id = diagnostic_id;
                call.parse_error = Some(match call.parse_error.take() {
                    Some(existing) => format!("{existing}; {note}"),
                    None => note,
                });
            }

            // Real-time feedback before any execution.
            emitter
                .send(EmittedEvent::InvocationAnnounced {
                    id: call.invocation_id.clone(),
                    gadget: call.gadget.clone(),
                    dependencies: call.dependencies.clone(),
                    parameters: call.parameters.clone(),
                    parse_error: call.parse_error.clone(),
                })
                .await;

            let inserted = { shared.graph.lock().await.insert(call.clone()) };
            match inserted {
                // Unreachable from this driver (ids are de-duplicated
                // above); terminate the announcement anyway.
                InsertOutcome::DuplicateId => {
                    tracing::warn!(id = %call.invocation_id, "duplicate id reached insert");
                    shared.push_event(EmittedEvent::InvocationFailed {
                        id: call.invocation_id.clone(),
                        gadget: call.gadget.clone(),
                        kind: ErrorKind::Parse,
                        message: format!(
                            "duplicate invocation id {:?} within this session",
                            call.invocation_id
                        ),
                    });
                }
                InsertOutcome::SelfDependency => {
                    let cause = SkipCause::SelfDependency;
                    let ctx = HookContext::invocation(
                        shared.iteration,
                        &call.gadget,
                        &call.invocation_id,
                        call.parameters.clone(),
                        shared.snapshot().await,
                    );
                    shared.hooks.notify_invocation_skipped(&ctx, &cause).await;
                    shared.push_event(EmittedEvent::InvocationSkipped {
                        id: call.invocation_id.clone(),
                        gadget: call.gadget.clone(),
                        cause,
                    });
                }
                InsertOutcome::ParseFailed => {
                    shared.push_event(EmittedEvent::InvocationFailed {
                        id: call.invocation_id.clone(),
                        gadget: call.gadget.clone(),
                        kind: ErrorKind::Parse,
                        message: format!(
                            "{}; raw parameters: {:?}",
                            call.parse_error.unwrap_or_default(),
                            call.raw_parameter_text
                        ),
                    });
                }
                InsertOutcome::Registered => {}
            }
            shared::drain_graph(shared).await;
        }
    }
}
