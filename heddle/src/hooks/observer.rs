//! Observers: read-only async hooks around the stream and each invocation.
//!
//! All observers in a slot are awaited together; a failing observer is
//! logged and counted by the pipeline, never propagated.

use async_trait::async_trait;
use thiserror::Error;

use run_event::SkipCause;

use super::HookContext;
use crate::error::InvocationError;

/// Error returned by an observer. Swallowed by the pipeline after logging.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("observer failed: {0}")]
pub struct ObserverError(pub String);

impl ObserverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Read-only async hook family. Every method has a no-op default, so
/// implementors override only the slots they care about.
///
/// Observers must not mutate pipeline state; they receive a fresh
/// [`HookContext`] snapshot per call and cannot retain mutable references.
#[async_trait]
pub trait Observer: Send + Sync {
    /// A raw chunk passed interception and was accumulated.
    async fn on_stream_chunk(
        &self,
        _ctx: &HookContext,
        _chunk: &str,
    ) -> Result<(), ObserverError> {
        Ok(())
    }

    /// The session started consuming the model stream.
    async fn on_llm_call_start(&self, _ctx: &HookContext) -> Result<(), ObserverError> {
        Ok(())
    }

    /// The model stream ended normally.
    async fn on_llm_call_complete(&self, _ctx: &HookContext) -> Result<(), ObserverError> {
        Ok(())
    }

    /// The model stream failed.
    async fn on_llm_call_error(
        &self,
        _ctx: &HookContext,
        _error: &str,
    ) -> Result<(), ObserverError> {
        Ok(())
    }

    /// An invocation is about to execute (after parameter interception).
    async fn on_invocation_start(&self, _ctx: &HookContext) -> Result<(), ObserverError> {
        Ok(())
    }

    /// An invocation reached Succeeded or Failed.
    async fn on_invocation_complete(
        &self,
        _ctx: &HookContext,
        _result: &Result<String, InvocationError>,
    ) -> Result<(), ObserverError> {
        Ok(())
    }

    /// An invocation was skipped without executing.
    async fn on_invocation_skipped(
        &self,
        _ctx: &HookContext,
        _cause: &SkipCause,
    ) -> Result<(), ObserverError> {
        Ok(())
    }
}
