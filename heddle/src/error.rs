//! Error types for heddle sessions and invocations.
//!
//! Invocation failures stay local: they become `InvocationFailed` events and
//! never abort the session. Only `SessionError` reaches the stream consumer.

use std::time::Duration;

use run_event::ErrorKind;
use thiserror::Error;

use crate::llm::LlmStreamError;

/// One invocation's failure: classification plus a human-readable message.
///
/// The `kind` is what dependents and UIs branch on; the message is what the
/// model sees when the failure is fed back as diagnostic text.
#[derive(Clone, Debug, Error, PartialEq)]
#[error("{kind}: {message}")]
pub struct InvocationError {
    pub kind: ErrorKind,
    pub message: String,
}

impl InvocationError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Parse, message)
    }

    pub fn unknown(gadget: &str) -> Self {
        Self::new(
            ErrorKind::Unknown,
            format!("no gadget registered under {gadget:?}"),
        )
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Execution, message)
    }

    pub fn timeout(deadline: Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("deadline of {}ms exceeded", deadline.as_millis()),
        )
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "invocation cancelled")
    }
}

/// Errors that propagate to the session consumer.
///
/// Everything else (parse failures, unknown gadgets, timeouts, dependency
/// dooms) is reported as events; see `run_event::EmittedEvent`.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The chunk producer failed and no `after_llm_error` controller recovered.
    #[error("llm stream error: {0}")]
    LlmStream(#[from] LlmStreamError),

    /// The supplied cancellation token was already cancelled when the
    /// session started; tokens must not be reused across sessions.
    #[error("cancellation token was already cancelled at session start")]
    TokenAlreadyCancelled,

    /// The event stream ended without a `StreamComplete`; indicates the
    /// driver task died, which is a bug in the caller's runtime setup.
    #[error("stream ended without StreamComplete")]
    StreamEndedWithoutComplete,
}
