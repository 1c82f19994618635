//! End-to-end session scenarios: text passthrough, parallel independence,
//! dependency chains, and failure cascades.
//!
//! Delimiters `<S>` / `<A>` / `<E>` throughout; gadgets are mocks.

mod init_logging;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_stream::StreamExt;

use heddle::{
    chunks, text_chunks, Chunk, ChunkStream, Delimiters, EchoGadget, EmittedEvent, ErrorKind,
    FailGadget, Gadget, GadgetContext, GadgetError, GadgetOutcome, GadgetRegistry, GadgetSpec,
    HookPipeline, SkipCause, StreamProcessor,
};

fn delims() -> Delimiters {
    Delimiters::new("<S>", "<A>", "<E>")
}

fn processor(registry: GadgetRegistry) -> StreamProcessor {
    StreamProcessor::new(Arc::new(registry), Arc::new(HookPipeline::empty()))
        .with_delimiters(delims())
}

async fn collect(processor: StreamProcessor, stream: ChunkStream) -> Vec<EmittedEvent> {
    let mut out = Vec::new();
    let mut events = processor.run(stream);
    while let Some(item) = events.next().await {
        out.push(item.expect("no session error expected"));
    }
    out
}

/// Every announced id gets exactly one terminal event, after its
/// announcement and before StreamComplete.
fn assert_session_invariants(events: &[EmittedEvent]) {
    assert!(
        matches!(events.last(), Some(EmittedEvent::StreamComplete { .. })),
        "last event is StreamComplete: {events:?}"
    );
    let mut announced: HashMap<&str, usize> = HashMap::new();
    let mut terminals: HashMap<&str, usize> = HashMap::new();
    for (index, event) in events.iter().enumerate() {
        match event {
            EmittedEvent::InvocationAnnounced { id, .. } => {
                announced.entry(id).or_insert(index);
            }
            e if e.is_terminal() => {
                let id = e.invocation_id().expect("terminal events carry an id");
                *terminals.entry(id).or_insert(0) += 1;
                let announce_index = announced
                    .get(id)
                    .unwrap_or_else(|| panic!("{id} terminal before announcement"));
                assert!(*announce_index < index, "{id} announced after terminal");
            }
            _ => {}
        }
    }
    for (id, _) in announced {
        assert_eq!(
            terminals.get(id),
            Some(&1),
            "{id} must have exactly one terminal event"
        );
    }
}

/// **Scenario**: text-only stream passes through unchanged.
#[tokio::test]
async fn text_only_stream() {
    let events = collect(
        processor(GadgetRegistry::new()),
        chunks(vec![
            Chunk::text("Hello "),
            Chunk::text("world"),
            Chunk::finish("stop"),
        ]),
    )
    .await;

    assert_eq!(events.len(), 3);
    assert!(matches!(&events[0], EmittedEvent::Text { content } if content == "Hello "));
    assert!(matches!(&events[1], EmittedEvent::Text { content } if content == "world"));
    match &events[2] {
        EmittedEvent::StreamComplete {
            finish_reason,
            raw_text,
            final_message,
            ..
        } => {
            assert_eq!(finish_reason.as_deref(), Some("stop"));
            assert_eq!(raw_text, "Hello world");
            assert_eq!(final_message, "Hello world");
        }
        other => panic!("expected StreamComplete, got {other:?}"),
    }
}

/// **Scenario**: two independent invocations announced in one chunk run in
/// parallel — both finish in roughly one delay, not two.
#[tokio::test]
async fn independent_invocations_run_in_parallel() {
    let registry = GadgetRegistry::new();
    registry
        .register(Arc::new(EchoGadget::with_delay(Duration::from_millis(100))))
        .unwrap();

    let started = Instant::now();
    let events = collect(
        processor(registry),
        text_chunks(&["<S>Echo:a<A>m\nhi<E>\n<S>Echo:b<A>m\nho<E>"]),
    )
    .await;
    let elapsed = started.elapsed();

    assert_session_invariants(&events);
    assert!(
        elapsed < Duration::from_millis(190),
        "parallel run took {elapsed:?}, expected well under two delays"
    );

    // Announcements in stream order, before either completion.
    let ids: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            EmittedEvent::InvocationAnnounced { id, .. } => Some(id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(ids, vec!["a", "b"]);

    let results: HashMap<&str, &str> = events
        .iter()
        .filter_map(|e| match e {
            EmittedEvent::InvocationSucceeded { id, result, .. } => {
                Some((id.as_str(), result.as_str()))
            }
            _ => None,
        })
        .collect();
    assert_eq!(results.get("a"), Some(&"hi"));
    assert_eq!(results.get("b"), Some(&"ho"));
}

/// Records start/finish instants per invocation id.
struct RecordingGadget {
    delay: Duration,
    spans: Arc<Mutex<HashMap<String, (Instant, Instant)>>>,
}

impl RecordingGadget {
    fn new(delay: Duration) -> (Self, Arc<Mutex<HashMap<String, (Instant, Instant)>>>) {
        let spans = Arc::new(Mutex::new(HashMap::new()));
        (
            Self {
                delay,
                spans: Arc::clone(&spans),
            },
            spans,
        )
    }
}

#[async_trait]
impl Gadget for RecordingGadget {
    fn name(&self) -> &str {
        "t"
    }

    fn spec(&self) -> GadgetSpec {
        GadgetSpec {
            name: "t".to_string(),
            description: "records its execution span".to_string(),
            params: vec![],
            example: "<S>t:t1<E>".to_string(),
        }
    }

    async fn execute(
        &self,
        _params: BTreeMap<String, String>,
        ctx: GadgetContext,
    ) -> Result<GadgetOutcome, GadgetError> {
        let started = Instant::now();
        tokio::time::sleep(self.delay).await;
        self.spans
            .lock()
            .unwrap()
            .insert(ctx.invocation_id.clone(), (started, Instant::now()));
        Ok(GadgetOutcome::text(ctx.invocation_id))
    }
}

/// **Scenario**: linear dependency — B must not start until A finished.
#[tokio::test]
async fn linear_dependency_orders_execution() {
    let (gadget, spans) = RecordingGadget::new(Duration::from_millis(30));
    let registry = GadgetRegistry::new();
    registry.register(Arc::new(gadget)).unwrap();

    let events = collect(processor(registry), text_chunks(&["<S>t:a<E>\n<S>t:b:a<E>"])).await;
    assert_session_invariants(&events);

    let spans = spans.lock().unwrap();
    let (_, a_end) = spans["a"];
    let (b_start, _) = spans["b"];
    assert!(b_start >= a_end, "b started before a finished");
}

/// **Scenario**: diamond A→B, A→C, B,C→D; B and C overlap, D waits for both.
#[tokio::test]
async fn diamond_dependency_constraints() {
    let (gadget, spans) = RecordingGadget::new(Duration::from_millis(40));
    let registry = GadgetRegistry::new();
    registry.register(Arc::new(gadget)).unwrap();

    let events = collect(
        processor(registry),
        text_chunks(&["<S>t:a<E>\n<S>t:b:a<E>\n<S>t:c:a<E>\n<S>t:d:b,c<E>"]),
    )
    .await;
    assert_session_invariants(&events);

    let spans = spans.lock().unwrap();
    let (_, a_end) = spans["a"];
    let (b_start, b_end) = spans["b"];
    let (c_start, c_end) = spans["c"];
    let (d_start, _) = spans["d"];
    assert!(b_start >= a_end, "b waited for a");
    assert!(c_start >= a_end, "c waited for a");
    assert!(d_start >= b_end, "d waited for b");
    assert!(d_start >= c_end, "d waited for c");
    // B and C genuinely overlapped.
    assert!(
        b_start < c_end && c_start < b_end,
        "b and c should run concurrently"
    );
}

/// **Scenario**: dependency failure cascades through the chain.
#[tokio::test]
async fn dependency_failure_cascades() {
    let registry = GadgetRegistry::new();
    registry.register(Arc::new(FailGadget::new())).unwrap();
    registry.register(Arc::new(EchoGadget::new())).unwrap();

    let events = collect(
        processor(registry),
        text_chunks(&["<S>fail:x<E>\n<S>echo:y:x<A>m\nhi<E>\n<S>echo:z:y<A>m\nho<E>"]),
    )
    .await;
    assert_session_invariants(&events);

    let kinds: Vec<String> = events
        .iter()
        .map(|e| match e {
            EmittedEvent::Text { .. } => "text".to_string(),
            EmittedEvent::InvocationAnnounced { id, .. } => format!("announced:{id}"),
            EmittedEvent::InvocationFailed { id, .. } => format!("failed:{id}"),
            EmittedEvent::InvocationSkipped { id, .. } => format!("skipped:{id}"),
            EmittedEvent::InvocationSucceeded { id, .. } => format!("succeeded:{id}"),
            EmittedEvent::SubStreamEvent { .. } => "sub".to_string(),
            EmittedEvent::StreamComplete { .. } => "complete".to_string(),
        })
        .filter(|k| k != "text")
        .collect();
    assert_eq!(
        kinds,
        vec![
            "announced:x",
            "announced:y",
            "announced:z",
            "failed:x",
            "skipped:y",
            "skipped:z",
            "complete"
        ]
    );

    // Skip causes name the immediate dependency.
    for (id, dep) in [("y", "x"), ("z", "y")] {
        let cause = events
            .iter()
            .find_map(|e| match e {
                EmittedEvent::InvocationSkipped { id: i, cause, .. } if i == id => Some(cause),
                _ => None,
            })
            .expect("skip event present");
        assert_eq!(
            cause,
            &SkipCause::Dependency {
                cause: dep.to_string()
            }
        );
    }

    let failed_kind = events.iter().find_map(|e| match e {
        EmittedEvent::InvocationFailed { id, kind, .. } if id == "x" => Some(*kind),
        _ => None,
    });
    assert_eq!(failed_kind, Some(ErrorKind::Execution));
}

/// A gadget signalling loop termination propagates to StreamComplete.
#[tokio::test]
async fn break_loop_flag_propagates() {
    let registry = GadgetRegistry::new();
    registry
        .register(Arc::new(heddle::BreakLoopGadget))
        .unwrap();

    let events = collect(
        processor(registry),
        text_chunks(&["<S>finish:f<A>summary\nall done<E>"]),
    )
    .await;
    assert_session_invariants(&events);

    assert!(matches!(
        events.iter().find(|e| e.is_terminal()),
        Some(EmittedEvent::InvocationSucceeded { breaks_loop: true, .. })
    ));
    assert!(matches!(
        events.last(),
        Some(EmittedEvent::StreamComplete { loop_break: true, .. })
    ));
}

/// Usage and finish_reason from the last chunk surface on StreamComplete.
#[tokio::test]
async fn usage_carried_to_stream_complete() {
    let usage = heddle::Usage {
        prompt_tokens: 7,
        completion_tokens: 3,
        total_tokens: 10,
    };
    let events = collect(
        processor(GadgetRegistry::new()),
        chunks(vec![
            Chunk::text("done"),
            Chunk::finish_with_usage("stop", usage.clone()),
        ]),
    )
    .await;
    match events.last() {
        Some(EmittedEvent::StreamComplete {
            usage: Some(u),
            finish_reason,
            ..
        }) => {
            assert_eq!(u, &usage);
            assert_eq!(finish_reason.as_deref(), Some("stop"));
        }
        other => panic!("expected StreamComplete with usage, got {other:?}"),
    }
}
