//! Gadget: a registered handler realizing one invocation.
//!
//! Each gadget has a unique name, a declared parameter spec, and the call
//! logic. Gadgets are registered with [`GadgetRegistry`] and dispatched by
//! the executor; a gadget may itself run an inner session and forward its
//! events through [`SubStreamWriter`].

mod mock;
mod registry;

pub use mock::{BreakLoopGadget, EchoGadget, FailGadget, SlowGadget};
pub use registry::{GadgetRegistry, RegistryError};

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use run_event::EmittedEvent;

/// One declared parameter of a gadget.
#[derive(Clone, Debug)]
pub struct ParamSpec {
    pub name: String,
    pub required: bool,
    pub description: String,
}

impl ParamSpec {
    pub fn required(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
            description: description.into(),
        }
    }

    pub fn optional(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
            description: description.into(),
        }
    }
}

/// Declared surface of a gadget: name, description, parameters, and one
/// worked example shown to the model on validation failures.
#[derive(Clone, Debug)]
pub struct GadgetSpec {
    pub name: String,
    pub description: String,
    pub params: Vec<ParamSpec>,
    pub example: String,
}

impl GadgetSpec {
    /// One-line usage summary, e.g. `echo(m, [verbose]) — repeats its input`.
    pub fn usage_summary(&self) -> String {
        let params: Vec<String> = self
            .params
            .iter()
            .map(|p| {
                if p.required {
                    p.name.clone()
                } else {
                    format!("[{}]", p.name)
                }
            })
            .collect();
        format!("{}({}) — {}", self.name, params.join(", "), self.description)
    }
}

/// Attachment returned by a gadget alongside its text result.
#[derive(Clone, Debug)]
pub struct Media {
    pub mime_type: String,
    /// Base64-encoded payload.
    pub data: String,
}

/// Normalized successful result of one gadget execution.
#[derive(Clone, Debug, Default)]
pub struct GadgetOutcome {
    pub text: String,
    pub cost: Option<f64>,
    pub media: Vec<Media>,
    /// Tells the enclosing agent to stop its outer iteration. The scheduler
    /// propagates this flag outward but does not alter its own scheduling.
    pub breaks_loop: bool,
}

impl GadgetOutcome {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = Some(cost);
        self
    }

    pub fn with_breaks_loop(mut self) -> Self {
        self.breaks_loop = true;
        self
    }
}

/// Error from a gadget's own execution.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GadgetError {
    /// Arguments passed validation but turned out unusable at run time.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    /// The gadget's work failed.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
}

/// A writer for re-entering events from a nested session (sub-agent) into
/// the outer session's real-time queue.
///
/// Type-erased so gadgets do not depend on the scheduler; `Clone + Send +
/// Sync`, safe to hand to inner tasks.
#[derive(Clone)]
pub struct SubStreamWriter {
    emit_fn: Arc<dyn Fn(EmittedEvent) -> bool + Send + Sync>,
}

impl SubStreamWriter {
    /// The emit function returns `true` when the event was accepted.
    pub fn new(emit_fn: impl Fn(EmittedEvent) -> bool + Send + Sync + 'static) -> Self {
        Self {
            emit_fn: Arc::new(emit_fn),
        }
    }

    /// A writer that drops everything; for gadgets run outside a session.
    pub fn noop() -> Self {
        Self {
            emit_fn: Arc::new(|_| false),
        }
    }

    /// Pushes one inner event; returns `true` when accepted.
    pub fn emit(&self, event: EmittedEvent) -> bool {
        (self.emit_fn)(event)
    }
}

impl Debug for SubStreamWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubStreamWriter")
            .field("emit_fn", &"<fn>")
            .finish()
    }
}

impl Default for SubStreamWriter {
    fn default() -> Self {
        Self::noop()
    }
}

/// Per-call context handed to a gadget by the executor.
#[derive(Clone, Debug)]
pub struct GadgetContext {
    pub invocation_id: String,
    pub gadget: String,
    /// Outer agent-loop iteration this session belongs to.
    pub iteration: u32,
    /// Child of the session token; gadgets should check it at suspension
    /// points and abort promptly when cancelled.
    pub cancel: CancellationToken,
    /// Re-entry point for events from an inner session.
    pub sub_stream: SubStreamWriter,
}

impl GadgetContext {
    /// A detached context for calling gadgets outside a session (tests).
    pub fn detached(invocation_id: impl Into<String>, gadget: impl Into<String>) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            gadget: gadget.into(),
            iteration: 0,
            cancel: CancellationToken::new(),
            sub_stream: SubStreamWriter::noop(),
        }
    }
}

/// A registered handler realizing invocations of one name.
#[async_trait]
pub trait Gadget: Send + Sync {
    /// Unique name; lookup is case-insensitive.
    fn name(&self) -> &str;

    /// Declared surface, used for prompts and validation diagnostics.
    fn spec(&self) -> GadgetSpec;

    /// Validates parameters against the declared spec.
    ///
    /// Default: every required parameter present, no unknown names. The
    /// returned message is embedded in the Validation failure the model
    /// sees, together with the usage summary and example.
    fn validate(&self, params: &BTreeMap<String, String>) -> Result<(), String> {
        let spec = self.spec();
        for p in &spec.params {
            if p.required && !params.contains_key(&p.name) {
                return Err(format!("missing required parameter {:?}", p.name));
            }
        }
        for name in params.keys() {
            if !spec.params.iter().any(|p| &p.name == name) {
                return Err(format!("unknown parameter {name:?}"));
            }
        }
        Ok(())
    }

    /// Executes the gadget with validated parameters.
    async fn execute(
        &self,
        params: BTreeMap<String, String>,
        ctx: GadgetContext,
    ) -> Result<GadgetOutcome, GadgetError>;

    /// Upper bound on concurrent executions of this gadget; `None` means
    /// unbounded. The scheduler combines this with the session cap and the
    /// minimum wins — configuration can never relax a gadget's bound.
    fn max_concurrency(&self) -> Option<usize> {
        None
    }

    /// Per-invocation deadline override; `None` uses the session default.
    fn timeout(&self) -> Option<Duration> {
        None
    }
}
