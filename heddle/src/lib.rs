//! # Heddle
//!
//! The streaming runtime core of an LLM agent: an incremental invocation
//! parser fused with a dependency scheduler, hook pipeline, and
//! fan-out/fan-in concurrency controller. A model's streamed response —
//! interleaved text and embedded gadget invocations — becomes a concurrent,
//! dependency-ordered execution plan and a single ordered event stream for
//! downstream UIs.
//!
//! ## Design principles
//!
//! - **Single-pass streaming**: chunks are parsed incrementally; text and
//!   invocation announcements surface in real time, never batched.
//! - **Dependencies by id**: invocations name the ids they wait on; forward
//!   references are legal, cycles and dangling references are diagnosed at
//!   stream close.
//! - **Fire-and-forget tasks**: each invocation runs as its own async task;
//!   completion wakes dependents. Per-gadget semaphores cap concurrency —
//!   the minimum of the gadget's bound and the session's bound wins.
//! - **Hooks around everything**: observers (read-only, gathered), sync
//!   interceptors (with suppression), and short-circuiting controllers wrap
//!   every chunk and every invocation.
//! - **Failures stay local**: a failed invocation becomes an event and dooms
//!   its dependents; only an unrecovered model-stream error reaches the
//!   caller.
//!
//! ## Main modules
//!
//! - [`parser`]: [`InvocationParser`], [`Delimiters`], [`InvocationCall`] —
//!   incremental grammar over the chunk stream.
//! - [`graph`]: [`InvocationGraph`], [`NodeState`], [`SessionSeeds`] — the
//!   DAG with ready/doomed queries and stream-close diagnostics.
//! - [`gadget`]: [`Gadget`], [`GadgetRegistry`], [`GadgetSpec`],
//!   [`SubStreamWriter`] — handlers and their registry.
//! - [`executor`]: [`Executor`] — lookup, validate, timed run, classify.
//! - [`hooks`]: [`Observer`], [`Interceptor`], [`Controller`],
//!   [`HookPipeline`], [`HookContext`].
//! - [`scheduler`]: [`StreamProcessor`], [`SessionOptions`] — the driver.
//! - [`runner`]: [`run_to_completion`], [`SessionSummary`].
//! - [`llm`]: [`Chunk`], [`ChunkStream`] — the producer contract.
//!
//! Event types ([`EmittedEvent`], [`ErrorKind`], [`SkipCause`], [`Usage`],
//! envelope stamping) live in the `run-event` crate and are re-exported
//! here.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use heddle::{
//!     text_chunks, EchoGadget, EmittedEvent, GadgetRegistry, HookPipeline,
//!     StreamProcessor,
//! };
//! use tokio_stream::StreamExt;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let registry = GadgetRegistry::new();
//! registry.register(Arc::new(EchoGadget::new())).unwrap();
//!
//! let processor = StreamProcessor::new(Arc::new(registry), Arc::new(HookPipeline::empty()));
//! let mut events = processor.run(text_chunks(&[
//!     "Let me check: <gadget>echo:e1\n<arg>m\nhello\n</gadget> done.",
//! ]));
//!
//! while let Some(event) = events.next().await {
//!     match event.unwrap() {
//!         EmittedEvent::Text { content } => print!("{content}"),
//!         EmittedEvent::InvocationSucceeded { id, result, .. } => {
//!             println!("[{id}] -> {result}");
//!         }
//!         EmittedEvent::StreamComplete { .. } => break,
//!         _ => {}
//!     }
//! }
//! # }
//! ```

pub mod error;
pub mod executor;
pub mod gadget;
pub mod graph;
pub mod hooks;
pub mod llm;
pub mod parser;
pub mod runner;
pub mod scheduler;

pub use error::{InvocationError, SessionError};
pub use executor::Executor;
pub use gadget::{
    BreakLoopGadget, EchoGadget, FailGadget, Gadget, GadgetContext, GadgetError, GadgetOutcome,
    GadgetRegistry, GadgetSpec, Media, ParamSpec, RegistryError, SlowGadget, SubStreamWriter,
};
pub use graph::{
    CloseDiagnostic, InsertOutcome, InvocationGraph, InvocationNode, NodeOutcome, NodeState,
    SessionSeeds,
};
pub use hooks::{
    AfterInvocationAction, AfterLlmAction, Controller, DependencySkipAction, HookContext,
    HookPipeline, Intercepted, Interceptor, InvocationAction, LlmCallAction, LlmErrorAction,
    Observer, ObserverError,
};
pub use llm::{chunks, failing_chunks, text_chunks, Chunk, ChunkStream, LlmStreamError};
pub use parser::{
    escape_value, format_invocation, unescape_value, Delimiters, InvocationCall,
    InvocationParser, ParsedEvent,
};
pub use runner::{run_to_completion, SessionSummary};
pub use scheduler::{SessionItem, SessionOptions, StreamProcessor};

pub use run_event::{to_json, EmittedEvent, Envelope, EnvelopeState, ErrorKind, SkipCause, Usage};
