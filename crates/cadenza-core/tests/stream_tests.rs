use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use cadenza_core::classify::{
    StreamErrorKind, classify_stream_error, is_provider_error, is_recoverable,
    stream_error_message,
};
use cadenza_core::error::CadenzaError;
use cadenza_core::stream::{
    ClassifiedStream, StreamEvent, StreamRecoveryOptions, recovering_stream, with_stream_recovery,
};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

fn fast_options() -> StreamRecoveryOptions {
    StreamRecoveryOptions {
        max_retries: 2,
        retry_delay: Duration::from_millis(10),
        on_recovery_failed: None,
    }
}

// ---- classification ----

#[test]
fn classifies_in_fixed_order() {
    assert_eq!(
        classify_stream_error("Unexpected token in JSON at position 12"),
        StreamErrorKind::Parse
    );
    assert_eq!(
        classify_stream_error("ECONNRESET: connection reset by peer"),
        StreamErrorKind::Connection
    );
    assert_eq!(
        classify_stream_error("request timed out after 30000ms"),
        StreamErrorKind::Timeout
    );
    assert_eq!(
        classify_stream_error("unexpected end of stream body"),
        StreamErrorKind::Incomplete
    );
    assert_eq!(
        classify_stream_error("upstream returned 503"),
        StreamErrorKind::Provider
    );
    assert_eq!(
        classify_stream_error("something nobody predicted"),
        StreamErrorKind::Unknown
    );
}

#[test]
fn parse_wins_over_later_categories() {
    // Contains both "json" and "connection"; parse is checked first.
    assert_eq!(
        classify_stream_error("malformed JSON after connection hiccup"),
        StreamErrorKind::Parse
    );
}

#[test]
fn only_transport_faults_are_recoverable() {
    assert!(is_recoverable(StreamErrorKind::Connection));
    assert!(is_recoverable(StreamErrorKind::Timeout));
    assert!(is_recoverable(StreamErrorKind::Incomplete));
    assert!(!is_recoverable(StreamErrorKind::Parse));
    assert!(!is_recoverable(StreamErrorKind::Provider));
    assert!(!is_recoverable(StreamErrorKind::Unknown));
}

#[test]
fn user_messages_never_leak_upstream_text() {
    for kind in [
        StreamErrorKind::Parse,
        StreamErrorKind::Connection,
        StreamErrorKind::Timeout,
        StreamErrorKind::Incomplete,
        StreamErrorKind::Provider,
        StreamErrorKind::Unknown,
    ] {
        let message = stream_error_message(kind);
        assert!(!message.is_empty());
        assert!(!message.contains("ECONN"));
        assert!(!message.contains("503"));
    }
}

#[test]
fn provider_error_table_excludes_client_faults() {
    assert!(is_provider_error("fetch failed: ECONNREFUSED"));
    assert!(is_provider_error("429 Too Many Requests"));
    assert!(is_provider_error("model not found: gpt-nonexistent"));
    assert!(is_provider_error("upstream 502 bad gateway"));

    assert!(!is_provider_error("invalid api key provided"));
    assert!(!is_provider_error("400 bad request: messages required"));
    assert!(!is_provider_error("request blocked by content policy"));
    assert!(!is_provider_error("just a plain failure"));
}

// ---- with_stream_recovery ----

#[tokio::test]
async fn recovers_from_transient_connection_errors() {
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts2 = Arc::clone(&attempts);

    let result = with_stream_recovery(
        move || {
            let attempts = Arc::clone(&attempts2);
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(CadenzaError::provider("openai", "connection reset"))
                } else {
                    Ok("recovered".to_string())
                }
            }
        },
        &fast_options(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(result, "recovered");
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn non_recoverable_errors_propagate_immediately() {
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts2 = Arc::clone(&attempts);

    let err = with_stream_recovery(
        move || {
            let attempts = Arc::clone(&attempts2);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<String, _>(CadenzaError::stream(
                    StreamErrorKind::Parse,
                    "unexpected token",
                ))
            }
        },
        &fast_options(),
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert!(matches!(
        err,
        CadenzaError::Stream {
            kind: StreamErrorKind::Parse,
            ..
        }
    ));
}

#[tokio::test]
async fn exhausted_retries_invoke_the_failure_callback() {
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts2 = Arc::clone(&attempts);
    let failed_kind = Arc::new(std::sync::Mutex::new(None));
    let failed_kind2 = Arc::clone(&failed_kind);

    let options = StreamRecoveryOptions {
        on_recovery_failed: Some(Arc::new(move |kind| {
            *failed_kind2.lock().unwrap() = Some(kind);
        })),
        ..fast_options()
    };

    let err = with_stream_recovery(
        move || {
            let attempts = Arc::clone(&attempts2);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<String, _>(CadenzaError::stream(
                    StreamErrorKind::Timeout,
                    "timed out",
                ))
            }
        },
        &options,
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    // Initial attempt plus two retries.
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(*failed_kind.lock().unwrap(), Some(StreamErrorKind::Timeout));
    assert!(matches!(err, CadenzaError::Stream { .. }));
}

#[tokio::test]
async fn cancellation_stops_retries() {
    let cancel = CancellationToken::new();
    cancel.cancel();

    let attempts = Arc::new(AtomicU32::new(0));
    let attempts2 = Arc::clone(&attempts);

    let err = with_stream_recovery(
        move || {
            let attempts = Arc::clone(&attempts2);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Ok::<_, CadenzaError>("never reached".to_string())
            }
        },
        &fast_options(),
        &cancel,
    )
    .await
    .unwrap_err();

    assert!(matches!(err, CadenzaError::Aborted));
    assert_eq!(attempts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancellation_during_backoff_aborts() {
    let cancel = CancellationToken::new();
    let cancel2 = cancel.clone();

    let options = StreamRecoveryOptions {
        max_retries: 2,
        retry_delay: Duration::from_secs(30),
        on_recovery_failed: None,
    };

    let handle = tokio::spawn(async move {
        with_stream_recovery(
            || async { Err::<String, _>(CadenzaError::provider("openai", "connection reset")) },
            &options,
            &cancel2,
        )
        .await
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(err, CadenzaError::Aborted));
}

// ---- ClassifiedStream ----

#[tokio::test]
async fn passes_events_through_until_done() {
    let inner = tokio_stream::iter(vec![
        Ok(StreamEvent::text("hello ")),
        Ok(StreamEvent::text("world")),
        Ok(StreamEvent::Done),
    ]);
    let events: Vec<_> = ClassifiedStream::new(inner).collect().await;

    assert_eq!(events.len(), 3);
    assert!(events.iter().all(|e| e.is_ok()));
}

#[tokio::test]
async fn end_without_done_is_an_incomplete_fault() {
    let inner = tokio_stream::iter(vec![Ok(StreamEvent::text("partial answ"))]);
    let events: Vec<_> = ClassifiedStream::new(inner).collect().await;

    assert_eq!(events.len(), 2);
    assert!(events[0].is_ok());
    match events[1].as_ref().unwrap_err() {
        CadenzaError::Stream { kind, .. } => assert_eq!(*kind, StreamErrorKind::Incomplete),
        other => panic!("expected stream fault, got {other}"),
    }
}

#[tokio::test]
async fn item_errors_are_classified() {
    let inner = tokio_stream::iter(vec![
        Ok(StreamEvent::text("a")),
        Err(CadenzaError::provider("openai", "socket hang up")),
    ]);
    let events: Vec<_> = ClassifiedStream::new(inner).collect().await;

    assert_eq!(events.len(), 2);
    match events[1].as_ref().unwrap_err() {
        CadenzaError::Stream { kind, .. } => assert_eq!(*kind, StreamErrorKind::Connection),
        other => panic!("expected stream fault, got {other}"),
    }
}

// ---- recovering_stream ----

#[tokio::test]
async fn reestablishes_before_output_was_delivered() {
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts2 = Arc::clone(&attempts);

    let stream = recovering_stream(
        move || {
            let attempts = Arc::clone(&attempts2);
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(CadenzaError::provider("openai", "connection reset"))
                } else {
                    Ok(tokio_stream::iter(vec![
                        Ok(StreamEvent::text("ok")),
                        Ok(StreamEvent::Done),
                    ]))
                }
            }
        },
        fast_options(),
        CancellationToken::new(),
    );

    let events: Vec<_> = stream.collect().await;
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.is_ok()));
}

#[tokio::test]
async fn faults_after_delivery_are_not_retried() {
    let attempts = Arc::new(AtomicU32::new(0));
    let attempts2 = Arc::clone(&attempts);

    let stream = recovering_stream(
        move || {
            let attempts = Arc::clone(&attempts2);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Ok(tokio_stream::iter(vec![
                    Ok(StreamEvent::text("partial")),
                    Err(CadenzaError::provider("openai", "connection reset")),
                ]))
            }
        },
        fast_options(),
        CancellationToken::new(),
    );

    let events: Vec<_> = stream.collect().await;
    // One text delta, then the classified fault; no re-establish.
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    assert_eq!(events.len(), 2);
    assert!(events[0].is_ok());
    assert!(events[1].is_err());
}

#[tokio::test]
async fn cancelled_stream_yields_aborted() {
    let cancel = CancellationToken::new();
    cancel.cancel();

    let stream = recovering_stream(
        || async {
            Ok(tokio_stream::iter(vec![
                Ok(StreamEvent::text("never")),
                Ok(StreamEvent::Done),
            ]))
        },
        fast_options(),
        cancel,
    );

    let events: Vec<_> = stream.collect().await;
    assert_eq!(events.len(), 1);
    assert!(matches!(
        events[0].as_ref().unwrap_err(),
        CadenzaError::Aborted
    ));
}
