//! Controllers: async hooks that can short-circuit a stage.
//!
//! Each slot returns a tagged action; the sums make structural validation
//! compile-time. Semantic misuse (recovering a success) is ignored with a
//! warning and the conservative default applies.

use async_trait::async_trait;

use run_event::SkipCause;

use super::HookContext;
use crate::error::InvocationError;

/// Action before the enclosing agent issues an LLM call.
#[derive(Clone, Debug, PartialEq)]
pub enum LlmCallAction {
    /// Go ahead, optionally with provider options for this call.
    Proceed { options: Option<serde_json::Value> },
    /// Skip the model call entirely and use this synthetic response.
    Skip { synthetic_response: String },
}

impl LlmCallAction {
    pub fn proceed() -> Self {
        Self::Proceed { options: None }
    }
}

/// Action after a completed LLM call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AfterLlmAction {
    Continue,
    /// Replace the assistant message.
    ModifyAndContinue { message: String },
    /// Append extra messages to the conversation.
    AppendMessages { messages: Vec<String> },
    /// Both replace and append.
    AppendAndModify {
        message: String,
        messages: Vec<String>,
    },
}

/// Action after an LLM stream error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LlmErrorAction {
    /// Treat `fallback_response` as the assistant output and continue.
    Recover { fallback_response: String },
    /// Re-raise to the session consumer.
    Rethrow,
}

/// Action before one invocation executes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InvocationAction {
    Proceed,
    /// Do not execute; report this synthetic result as success.
    Skip { synthetic_result: String },
}

/// Action after one invocation completed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AfterInvocationAction {
    Continue,
    /// Convert a failure into success with this result. Only meaningful
    /// when the outcome was Failed; otherwise ignored with a warning.
    Recover { fallback_result: String },
}

/// Action when a dependency failure would skip an invocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DependencySkipAction {
    /// Skip the invocation (default).
    Skip,
    /// Run it anyway despite the failed dependency.
    ExecuteAnyway,
    /// Do not run it, but report this result as success so its own
    /// dependents still proceed.
    UseFallback { result: String },
}

/// Async short-circuiting hook family. Defaults are the conservative
/// actions, so implementors override only the slots they care about.
#[async_trait]
pub trait Controller: Send + Sync {
    async fn before_llm_call(&self, _ctx: &HookContext) -> LlmCallAction {
        LlmCallAction::proceed()
    }

    async fn after_llm_call(&self, _ctx: &HookContext, _message: &str) -> AfterLlmAction {
        AfterLlmAction::Continue
    }

    async fn after_llm_error(&self, _ctx: &HookContext, _error: &str) -> LlmErrorAction {
        LlmErrorAction::Rethrow
    }

    async fn before_invocation(&self, _ctx: &HookContext) -> InvocationAction {
        InvocationAction::Proceed
    }

    async fn after_invocation(
        &self,
        _ctx: &HookContext,
        _result: &Result<String, InvocationError>,
    ) -> AfterInvocationAction {
        AfterInvocationAction::Continue
    }

    async fn on_dependency_skip(
        &self,
        _ctx: &HookContext,
        _cause: &SkipCause,
    ) -> DependencySkipAction {
        DependencySkipAction::Skip
    }
}
