//! Cooperative cancellation: running tasks abort at suspension points,
//! deferred nodes are skipped, and StreamComplete still closes the stream.

mod init_logging;

use std::sync::Arc;
use std::time::Duration;

use futures::stream;
use tokio_stream::StreamExt;

use heddle::{
    Chunk, ChunkStream, Delimiters, EchoGadget, EmittedEvent, ErrorKind, GadgetRegistry,
    HookPipeline, SkipCause, StreamProcessor,
};

fn delims() -> Delimiters {
    Delimiters::new("<S>", "<A>", "<E>")
}

/// A stream that yields the given text and then hangs forever, simulating a
/// stalled provider.
fn stalling_chunks(text: &str) -> ChunkStream {
    let items = vec![Ok(Chunk::text(text.to_string()))];
    Box::pin(stream::iter(items).chain(stream::pending()))
}

#[tokio::test]
async fn cancel_aborts_running_and_skips_pending() {
    let registry = GadgetRegistry::new();
    registry
        .register(Arc::new(EchoGadget::with_delay(Duration::from_secs(60))))
        .unwrap();

    let processor = StreamProcessor::new(Arc::new(registry), Arc::new(HookPipeline::empty()))
        .with_delimiters(delims());
    let cancel = processor.cancellation_token();

    // `a` starts running (60s delay); `b` stays parked behind it.
    let mut events = processor.run(stalling_chunks(
        "<S>echo:a<A>m\nhi<E>\n<S>echo:b:a<A>m\nho<E>",
    ));

    let mut seen = Vec::new();
    // Two announcements arrive while the stream is stalled.
    for _ in 0..2 {
        seen.push(events.next().await.expect("event").expect("ok"));
    }
    assert!(matches!(
        &seen[0],
        EmittedEvent::InvocationAnnounced { id, .. } if id == "a"
    ));
    assert!(matches!(
        &seen[1],
        EmittedEvent::InvocationAnnounced { id, .. } if id == "b"
    ));

    cancel.cancel();
    while let Some(item) = events.next().await {
        seen.push(item.expect("ok"));
    }

    // Cancellation closure: bounded number of events, then StreamComplete.
    let pending = 1; // b
    let in_flight = 1; // a
    let after_cancel = seen.len() - 2;
    assert!(
        after_cancel <= 2 * (pending + in_flight) + 1,
        "{after_cancel} events after cancel exceeds the bound"
    );

    match seen.last() {
        Some(EmittedEvent::StreamComplete { finish_reason, .. }) => {
            assert_eq!(finish_reason.as_deref(), Some("cancelled"));
        }
        other => panic!("expected StreamComplete, got {other:?}"),
    }

    // `a` was running: it aborts and fails Cancelled. `b` never ran: skipped.
    let a_terminal = seen.iter().find_map(|e| match e {
        EmittedEvent::InvocationFailed { id, kind, .. } if id == "a" => Some(*kind),
        _ => None,
    });
    assert_eq!(a_terminal, Some(ErrorKind::Cancelled));

    let b_terminal = seen.iter().find_map(|e| match e {
        EmittedEvent::InvocationSkipped { id, cause, .. } if id == "b" => Some(cause.clone()),
        _ => None,
    });
    assert_eq!(b_terminal, Some(SkipCause::Cancelled));
}

#[tokio::test]
async fn dropping_the_stream_cancels_the_session() {
    let registry = GadgetRegistry::new();
    let gadget = Arc::new(heddle::SlowGadget::new(Duration::from_secs(60)));
    registry
        .register(Arc::clone(&gadget) as Arc<dyn heddle::Gadget>)
        .unwrap();

    let processor = StreamProcessor::new(Arc::new(registry), Arc::new(HookPipeline::empty()))
        .with_delimiters(delims());
    let cancel = processor.cancellation_token();

    let mut events = processor.run(stalling_chunks("<S>slow:a<E>"));
    // Consume the announcement, then walk away.
    let first = events.next().await.expect("event").expect("ok");
    assert!(matches!(first, EmittedEvent::InvocationAnnounced { .. }));
    drop(events);

    // The driver notices the dropped receiver and cancels the session.
    tokio::time::timeout(Duration::from_secs(2), cancel.cancelled())
        .await
        .expect("session cancelled after consumer dropped the stream");
}

#[tokio::test]
async fn cancel_before_any_invocation_just_completes() {
    let processor =
        StreamProcessor::new(Arc::new(GadgetRegistry::new()), Arc::new(HookPipeline::empty()))
            .with_delimiters(delims());
    let cancel = processor.cancellation_token();

    let mut events = processor.run(stalling_chunks("just text, no blocks"));
    let first = events.next().await.expect("event").expect("ok");
    assert!(matches!(first, EmittedEvent::Text { .. }));

    cancel.cancel();
    let mut rest = Vec::new();
    while let Some(item) = events.next().await {
        rest.push(item.expect("ok"));
    }
    assert_eq!(rest.len(), 1);
    assert!(matches!(
        rest.last(),
        Some(EmittedEvent::StreamComplete { finish_reason, .. })
            if finish_reason.as_deref() == Some("cancelled")
    ));
}
