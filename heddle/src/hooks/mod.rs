//! Hook pipeline: observers, interceptors, and controllers around a session.
//!
//! Three families, applied at fixed stages of every invocation and every
//! streaming chunk:
//!
//! - [`Observer`] — read-only, async; all observers in a slot are awaited
//!   together and failures are logged and counted, never propagated.
//! - [`Interceptor`] — synchronous, total transforms folded in declared
//!   order; chunk slots may suppress.
//! - [`Controller`] — async, short-circuiting; each slot returns a tagged
//!   action and the first non-default action in declared order wins.
//!
//! The bundle is immutable after construction; hooks may be empty in any
//! slot.

mod controller;
mod interceptor;
mod observer;

pub use controller::{
    AfterInvocationAction, AfterLlmAction, Controller, DependencySkipAction, InvocationAction,
    LlmCallAction, LlmErrorAction,
};
pub use interceptor::{Intercepted, Interceptor};
pub use observer::{Observer, ObserverError};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::join_all;

use run_event::SkipCause;

use crate::error::InvocationError;

/// Read-only snapshot handed to every hook call.
///
/// A fresh context is built per call; hooks cannot retain mutable
/// references into the pipeline.
#[derive(Clone, Debug)]
pub struct HookContext {
    /// Outer agent-loop iteration this session belongs to.
    pub iteration: u32,
    /// Gadget name, for invocation-scoped hooks.
    pub gadget: Option<String>,
    /// Invocation id, for invocation-scoped hooks.
    pub invocation_id: Option<String>,
    /// Effective parameters, for invocation-scoped hooks.
    pub parameters: Option<BTreeMap<String, String>>,
    /// Accumulated post-interception text at snapshot time.
    pub accumulated_text: String,
}

impl HookContext {
    /// Context for stream-scoped hooks.
    pub fn stream(iteration: u32, accumulated_text: impl Into<String>) -> Self {
        Self {
            iteration,
            gadget: None,
            invocation_id: None,
            parameters: None,
            accumulated_text: accumulated_text.into(),
        }
    }

    /// Context for invocation-scoped hooks.
    pub fn invocation(
        iteration: u32,
        gadget: impl Into<String>,
        invocation_id: impl Into<String>,
        parameters: BTreeMap<String, String>,
        accumulated_text: impl Into<String>,
    ) -> Self {
        Self {
            iteration,
            gadget: Some(gadget.into()),
            invocation_id: Some(invocation_id.into()),
            parameters: Some(parameters),
            accumulated_text: accumulated_text.into(),
        }
    }
}

/// Immutable hook bundle supplied at scheduler construction.
#[derive(Default)]
pub struct HookPipeline {
    observers: Vec<Arc<dyn Observer>>,
    interceptors: Vec<Arc<dyn Interceptor>>,
    controllers: Vec<Arc<dyn Controller>>,
    observer_failures: AtomicUsize,
}

impl HookPipeline {
    pub fn new(
        observers: Vec<Arc<dyn Observer>>,
        interceptors: Vec<Arc<dyn Interceptor>>,
        controllers: Vec<Arc<dyn Controller>>,
    ) -> Self {
        Self {
            observers,
            interceptors,
            controllers,
            observer_failures: AtomicUsize::new(0),
        }
    }

    /// A pipeline with every slot empty.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Observer failures swallowed so far in this session.
    pub fn observer_failures(&self) -> usize {
        self.observer_failures.load(Ordering::SeqCst)
    }

    fn record_failures(&self, slot: &str, results: Vec<Result<(), ObserverError>>) {
        for (index, result) in results.into_iter().enumerate() {
            if let Err(e) = result {
                self.observer_failures.fetch_add(1, Ordering::SeqCst);
                tracing::warn!(slot, observer = index, error = %e, "observer failed");
            }
        }
    }

    // ----- observer slots (parallel within the slot) -----

    pub async fn notify_stream_chunk(&self, ctx: &HookContext, chunk: &str) {
        let results = join_all(self.observers.iter().map(|o| o.on_stream_chunk(ctx, chunk))).await;
        self.record_failures("on_stream_chunk", results);
    }

    pub async fn notify_llm_call_start(&self, ctx: &HookContext) {
        let results = join_all(self.observers.iter().map(|o| o.on_llm_call_start(ctx))).await;
        self.record_failures("on_llm_call_start", results);
    }

    pub async fn notify_llm_call_complete(&self, ctx: &HookContext) {
        let results = join_all(self.observers.iter().map(|o| o.on_llm_call_complete(ctx))).await;
        self.record_failures("on_llm_call_complete", results);
    }

    pub async fn notify_llm_call_error(&self, ctx: &HookContext, error: &str) {
        let results =
            join_all(self.observers.iter().map(|o| o.on_llm_call_error(ctx, error))).await;
        self.record_failures("on_llm_call_error", results);
    }

    pub async fn notify_invocation_start(&self, ctx: &HookContext) {
        let results = join_all(self.observers.iter().map(|o| o.on_invocation_start(ctx))).await;
        self.record_failures("on_invocation_start", results);
    }

    pub async fn notify_invocation_complete(
        &self,
        ctx: &HookContext,
        result: &Result<String, InvocationError>,
    ) {
        let results = join_all(
            self.observers
                .iter()
                .map(|o| o.on_invocation_complete(ctx, result)),
        )
        .await;
        self.record_failures("on_invocation_complete", results);
    }

    pub async fn notify_invocation_skipped(&self, ctx: &HookContext, cause: &SkipCause) {
        let results = join_all(
            self.observers
                .iter()
                .map(|o| o.on_invocation_skipped(ctx, cause)),
        )
        .await;
        self.record_failures("on_invocation_skipped", results);
    }

    // ----- interceptor folds (declared order; suppress short-circuits) -----

    pub fn intercept_raw_chunk(&self, chunk: String) -> Intercepted {
        let mut current = chunk;
        for interceptor in &self.interceptors {
            match interceptor.intercept_raw_chunk(current) {
                Intercepted::Value(v) => current = v,
                Intercepted::Suppress => return Intercepted::Suppress,
            }
        }
        Intercepted::Value(current)
    }

    pub fn intercept_text_chunk(&self, chunk: String) -> Intercepted {
        let mut current = chunk;
        for interceptor in &self.interceptors {
            match interceptor.intercept_text_chunk(current) {
                Intercepted::Value(v) => current = v,
                Intercepted::Suppress => return Intercepted::Suppress,
            }
        }
        Intercepted::Value(current)
    }

    pub fn intercept_parameters(
        &self,
        params: BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        self.interceptors
            .iter()
            .fold(params, |acc, i| i.intercept_parameters(acc))
    }

    pub fn intercept_result(&self, result: String) -> String {
        self.interceptors
            .iter()
            .fold(result, |acc, i| i.intercept_result(acc))
    }

    pub fn intercept_final_message(&self, accumulated: String) -> String {
        self.interceptors
            .iter()
            .fold(accumulated, |acc, i| i.intercept_final_message(acc))
    }

    // ----- controller slots (declared order; first non-default wins) -----

    pub async fn run_before_llm_call(&self, ctx: &HookContext) -> LlmCallAction {
        for controller in &self.controllers {
            match controller.before_llm_call(ctx).await {
                LlmCallAction::Proceed { options: None } => continue,
                other => return other,
            }
        }
        LlmCallAction::proceed()
    }

    /// Note: interceptors are NOT re-run on messages appended here; callers
    /// that want interception run the slot themselves.
    pub async fn run_after_llm_call(&self, ctx: &HookContext, message: &str) -> AfterLlmAction {
        for controller in &self.controllers {
            match controller.after_llm_call(ctx, message).await {
                AfterLlmAction::Continue => continue,
                other => return other,
            }
        }
        AfterLlmAction::Continue
    }

    pub async fn run_after_llm_error(&self, ctx: &HookContext, error: &str) -> LlmErrorAction {
        for controller in &self.controllers {
            match controller.after_llm_error(ctx, error).await {
                LlmErrorAction::Rethrow => continue,
                recover => return recover,
            }
        }
        LlmErrorAction::Rethrow
    }

    pub async fn run_before_invocation(&self, ctx: &HookContext) -> InvocationAction {
        for controller in &self.controllers {
            match controller.before_invocation(ctx).await {
                InvocationAction::Proceed => continue,
                skip => return skip,
            }
        }
        InvocationAction::Proceed
    }

    pub async fn run_after_invocation(
        &self,
        ctx: &HookContext,
        result: &Result<String, InvocationError>,
    ) -> AfterInvocationAction {
        for controller in &self.controllers {
            match controller.after_invocation(ctx, result).await {
                AfterInvocationAction::Continue => continue,
                AfterInvocationAction::Recover { fallback_result } => {
                    if result.is_ok() {
                        tracing::warn!(
                            invocation = ctx.invocation_id.as_deref().unwrap_or(""),
                            "after_invocation recover ignored: outcome already succeeded"
                        );
                        continue;
                    }
                    return AfterInvocationAction::Recover { fallback_result };
                }
            }
        }
        AfterInvocationAction::Continue
    }

    pub async fn run_on_dependency_skip(
        &self,
        ctx: &HookContext,
        cause: &SkipCause,
    ) -> DependencySkipAction {
        for controller in &self.controllers {
            match controller.on_dependency_skip(ctx, cause).await {
                DependencySkipAction::Skip => continue,
                other => return other,
            }
        }
        DependencySkipAction::Skip
    }
}

impl std::fmt::Debug for HookPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookPipeline")
            .field("observers", &self.observers.len())
            .field("interceptors", &self.interceptors.len())
            .field("controllers", &self.controllers.len())
            .finish()
    }
}
