//! Shared session state and the fire-and-forget execution tasks.
//!
//! One `SessionShared` is owned by the driver and every invocation task.
//! Shared mutable state is exactly one graph mutex, the completed-results
//! queue, and the per-gadget semaphores; tasks never touch the output
//! channel directly.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use run_event::{EmittedEvent, SkipCause};

use crate::error::InvocationError;
use crate::executor::Executor;
use crate::gadget::{Gadget, GadgetContext, GadgetOutcome, GadgetRegistry, SubStreamWriter};
use crate::graph::{InvocationGraph, NodeOutcome, NodeState};
use crate::hooks::{AfterInvocationAction, DependencySkipAction, HookContext, HookPipeline, InvocationAction};
use crate::parser::InvocationCall;

pub(crate) struct SessionShared {
    pub registry: Arc<GadgetRegistry>,
    pub hooks: Arc<HookPipeline>,
    pub executor: Executor,
    pub graph: Mutex<InvocationGraph>,
    /// Completed-results queue; the driver drains it into the output stream.
    pub completed_tx: mpsc::UnboundedSender<EmittedEvent>,
    semaphores: Mutex<HashMap<String, Arc<Semaphore>>>,
    pub in_flight: AtomicUsize,
    pub idle_notify: Notify,
    pub cancel: CancellationToken,
    pub iteration: u32,
    pub max_concurrency: Option<usize>,
    pub loop_break: AtomicBool,
    /// Post-interception accumulated text; snapshotted into hook contexts.
    pub accumulated: Mutex<String>,
}

impl SessionShared {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<GadgetRegistry>,
        hooks: Arc<HookPipeline>,
        executor: Executor,
        graph: InvocationGraph,
        completed_tx: mpsc::UnboundedSender<EmittedEvent>,
        cancel: CancellationToken,
        iteration: u32,
        max_concurrency: Option<usize>,
    ) -> Self {
        Self {
            registry,
            hooks,
            executor,
            graph: Mutex::new(graph),
            completed_tx,
            semaphores: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            idle_notify: Notify::new(),
            cancel,
            iteration,
            max_concurrency,
            loop_break: AtomicBool::new(false),
            accumulated: Mutex::new(String::new()),
        }
    }

    /// Queues an event for the driver to emit. Send failure means the
    /// driver is gone, which only happens after cancellation.
    pub fn push_event(&self, event: EmittedEvent) {
        let _ = self.completed_tx.send(event);
    }

    pub async fn snapshot(&self) -> String {
        self.accumulated.lock().await.clone()
    }

    /// Effective concurrency gate for a gadget: `min(gadget cap, session
    /// cap)`; `None` when both are unbounded.
    async fn semaphore_for(&self, gadget: &Arc<dyn Gadget>) -> Option<Arc<Semaphore>> {
        let cap = match (gadget.max_concurrency(), self.max_concurrency) {
            (None, None) => return None,
            (Some(g), None) => g,
            (None, Some(s)) => s,
            (Some(g), Some(s)) => g.min(s),
        };
        let mut map = self.semaphores.lock().await;
        let sem = map
            .entry(gadget.name().to_lowercase())
            .or_insert_with(|| Arc::new(Semaphore::new(cap)));
        Some(Arc::clone(sem))
    }
}

/// Launches newly ready nodes and resolves newly doomed ones. Called after
/// every graph mutation, by the driver and by execution tasks alike.
pub(crate) async fn drain_graph(shared: &Arc<SessionShared>) {
    let (ready, doomed) = {
        let mut graph = shared.graph.lock().await;
        (graph.poll_ready(), graph.poll_doomed())
    };
    for id in ready {
        launch(shared, id).await;
    }
    resolve_doomed(shared, doomed).await;
}

/// Fire-and-forget: starts the execution task for one ready invocation.
pub(crate) async fn launch(shared: &Arc<SessionShared>, id: String) {
    let call = {
        let graph = shared.graph.lock().await;
        graph.node(&id).map(|n| n.call.clone())
    };
    let Some(call) = call else {
        return;
    };
    shared.in_flight.fetch_add(1, Ordering::SeqCst);
    tokio::spawn(invocation_task(Arc::clone(shared), call));
}

/// Boxed so tasks that launch dependent tasks on completion do not build a
/// recursive future type.
fn invocation_task(
    shared: Arc<SessionShared>,
    call: InvocationCall,
) -> futures::future::BoxFuture<'static, ()> {
    Box::pin(async move {
        run_invocation(&shared, call).await;
        shared.in_flight.fetch_sub(1, Ordering::SeqCst);
        shared.idle_notify.notify_waiters();
    })
}

/// The full hook chain around one invocation, then graph update and wake.
async fn run_invocation(shared: &Arc<SessionShared>, call: InvocationCall) {
    let id = call.invocation_id.clone();
    let gadget_name = call.gadget.clone();

    // Gate Ready → Running on the per-gadget semaphore.
    let gadget = shared.registry.lookup(&gadget_name);
    let _permit = match &gadget {
        Some(g) => match shared.semaphore_for(g).await {
            Some(sem) => {
                tokio::select! {
                    _ = shared.cancel.cancelled() => {
                        skip_if_open(shared, &call, SkipCause::Cancelled).await;
                        return;
                    }
                    permit = sem.acquire_owned() => match permit {
                        Ok(p) => Some(p),
                        Err(_) => {
                            skip_if_open(shared, &call, SkipCause::Cancelled).await;
                            return;
                        }
                    },
                }
            }
            None => None,
        },
        None => None,
    };
    if shared.cancel.is_cancelled() {
        skip_if_open(shared, &call, SkipCause::Cancelled).await;
        return;
    }

    shared.graph.lock().await.mark_running(&id);

    let snapshot = shared.snapshot().await;
    let ctx = HookContext::invocation(
        shared.iteration,
        &gadget_name,
        &id,
        call.parameters.clone(),
        snapshot.clone(),
    );

    let mut result: Result<GadgetOutcome, InvocationError> =
        match shared.hooks.run_before_invocation(&ctx).await {
            InvocationAction::Skip { synthetic_result } => {
                Ok(GadgetOutcome::text(synthetic_result))
            }
            InvocationAction::Proceed => {
                let params = shared.hooks.intercept_parameters(call.parameters.clone());
                let start_ctx = HookContext::invocation(
                    shared.iteration,
                    &gadget_name,
                    &id,
                    params.clone(),
                    snapshot.clone(),
                );
                shared.hooks.notify_invocation_start(&start_ctx).await;
                let gadget_ctx = GadgetContext {
                    invocation_id: id.clone(),
                    gadget: gadget_name.clone(),
                    iteration: shared.iteration,
                    cancel: shared.cancel.child_token(),
                    sub_stream: sub_writer(shared, &id),
                };
                shared.executor.execute(&call, params, gadget_ctx).await
            }
        };

    let view = result_view(&result);
    if let AfterInvocationAction::Recover { fallback_result } =
        shared.hooks.run_after_invocation(&ctx, &view).await
    {
        result = Ok(GadgetOutcome::text(fallback_result));
    }

    if let Ok(outcome) = &mut result {
        let text = std::mem::take(&mut outcome.text);
        outcome.text = shared.hooks.intercept_result(text);
    }

    let view = result_view(&result);
    shared.hooks.notify_invocation_complete(&ctx, &view).await;

    match result {
        Ok(outcome) => {
            if outcome.breaks_loop {
                shared.loop_break.store(true, Ordering::SeqCst);
            }
            finish_terminal(
                shared,
                &id,
                NodeOutcome::Succeeded {
                    result: outcome.text.clone(),
                    cost: outcome.cost,
                },
                EmittedEvent::InvocationSucceeded {
                    id: id.clone(),
                    gadget: gadget_name.clone(),
                    result: outcome.text,
                    cost: outcome.cost,
                    breaks_loop: outcome.breaks_loop,
                },
            )
            .await;
        }
        Err(error) => {
            finish_terminal(
                shared,
                &id,
                NodeOutcome::Failed(error.clone()),
                EmittedEvent::InvocationFailed {
                    id: id.clone(),
                    gadget: gadget_name.clone(),
                    kind: error.kind,
                    message: error.message,
                },
            )
            .await;
        }
    }
}

fn result_view(
    result: &Result<GadgetOutcome, InvocationError>,
) -> Result<String, InvocationError> {
    result
        .as_ref()
        .map(|o| o.text.clone())
        .map_err(Clone::clone)
}

fn sub_writer(shared: &Arc<SessionShared>, id: &str) -> SubStreamWriter {
    let tx = shared.completed_tx.clone();
    let outer = id.to_string();
    SubStreamWriter::new(move |event| {
        tx.send(EmittedEvent::SubStreamEvent {
            id: outer.clone(),
            event: Box::new(event),
        })
        .is_ok()
    })
}

/// Applies a terminal outcome if the node is still open, emits its event,
/// and wakes dependents. A lost race (someone else closed it first) is a
/// no-op, which keeps every invocation at exactly one terminal event.
async fn finish_terminal(
    shared: &Arc<SessionShared>,
    id: &str,
    outcome: NodeOutcome,
    event: EmittedEvent,
) {
    let (applied, ready, doomed) = {
        let mut graph = shared.graph.lock().await;
        let open = graph
            .node(id)
            .map(|n| !n.state.is_terminal())
            .unwrap_or(false);
        if open {
            graph.on_terminal(id, outcome);
            (true, graph.poll_ready(), graph.poll_doomed())
        } else {
            (false, Vec::new(), Vec::new())
        }
    };
    if !applied {
        return;
    }
    shared.push_event(event);
    for rid in ready {
        launch(shared, rid).await;
    }
    resolve_doomed(shared, doomed).await;
}

/// Skips an invocation (with observers and event) unless already closed.
pub(crate) async fn skip_if_open(
    shared: &Arc<SessionShared>,
    call: &InvocationCall,
    cause: SkipCause,
) {
    let open = {
        let graph = shared.graph.lock().await;
        graph
            .node(&call.invocation_id)
            .map(|n| !n.state.is_terminal())
            .unwrap_or(false)
    };
    if !open {
        return;
    }
    let ctx = HookContext::invocation(
        shared.iteration,
        &call.gadget,
        &call.invocation_id,
        call.parameters.clone(),
        shared.snapshot().await,
    );
    shared.hooks.notify_invocation_skipped(&ctx, &cause).await;
    finish_terminal(
        shared,
        &call.invocation_id,
        NodeOutcome::Skipped(cause.clone()),
        EmittedEvent::InvocationSkipped {
            id: call.invocation_id.clone(),
            gadget: call.gadget.clone(),
            cause,
        },
    )
    .await;
}

/// Works through doomed nodes: consults the dependency-skip controller and
/// either skips, executes anyway, or substitutes a fallback success.
/// Iterative so skips that doom further dependents stay in the same pass.
pub(crate) async fn resolve_doomed(shared: &Arc<SessionShared>, initial: Vec<(String, String)>) {
    let mut work: VecDeque<(String, String)> = initial.into();
    while let Some((id, dep)) = work.pop_front() {
        let call = {
            let graph = shared.graph.lock().await;
            match graph.node(&id) {
                Some(n) if !n.state.is_terminal() && n.state != NodeState::Running => {
                    n.call.clone()
                }
                _ => continue,
            }
        };
        let cause = SkipCause::Dependency { cause: dep.clone() };
        let ctx = HookContext::invocation(
            shared.iteration,
            &call.gadget,
            &id,
            call.parameters.clone(),
            shared.snapshot().await,
        );
        match shared.hooks.run_on_dependency_skip(&ctx, &cause).await {
            DependencySkipAction::Skip => {
                shared.hooks.notify_invocation_skipped(&ctx, &cause).await;
                let (ready, doomed) = {
                    let mut graph = shared.graph.lock().await;
                    graph.on_terminal(&id, NodeOutcome::Skipped(cause.clone()));
                    (graph.poll_ready(), graph.poll_doomed())
                };
                shared.push_event(EmittedEvent::InvocationSkipped {
                    id: id.clone(),
                    gadget: call.gadget.clone(),
                    cause,
                });
                for rid in ready {
                    launch(shared, rid).await;
                }
                work.extend(doomed);
            }
            DependencySkipAction::ExecuteAnyway => {
                launch(shared, id).await;
            }
            DependencySkipAction::UseFallback { result } => {
                let (ready, doomed) = {
                    let mut graph = shared.graph.lock().await;
                    graph.on_terminal(
                        &id,
                        NodeOutcome::Succeeded {
                            result: result.clone(),
                            cost: None,
                        },
                    );
                    (graph.poll_ready(), graph.poll_doomed())
                };
                shared.push_event(EmittedEvent::InvocationSucceeded {
                    id: id.clone(),
                    gadget: call.gadget.clone(),
                    result,
                    cost: None,
                    breaks_loop: false,
                });
                for rid in ready {
                    launch(shared, rid).await;
                }
                work.extend(doomed);
            }
        }
    }
}

/// Marks every node still waiting as Skipped(Cancelled). Running nodes are
/// left to their tasks, which observe the token and close themselves.
pub(crate) async fn flush_cancelled(shared: &Arc<SessionShared>) {
    let open = { shared.graph.lock().await.open_ids() };
    for id in open {
        let call = {
            let graph = shared.graph.lock().await;
            match graph.node(&id) {
                Some(n) if n.state != NodeState::Running && !n.state.is_terminal() => {
                    Some(n.call.clone())
                }
                _ => None,
            }
        };
        if let Some(call) = call {
            skip_if_open(shared, &call, SkipCause::Cancelled).await;
        }
    }
    // Whatever dooming those skips queued is moot now; drop it.
    let mut graph = shared.graph.lock().await;
    let _ = graph.poll_ready();
    let _ = graph.poll_doomed();
}
