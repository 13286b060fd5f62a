//! Stream recovery.
//!
//! Faults that surface mid-stream are classified and selectively retried:
//! connection drops, timeouts, and truncated streams are worth another
//! attempt, while parse and provider faults propagate immediately. Retries
//! stop the moment the caller cancels — continuing past the client's
//! interest wastes provider quota.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::classify::{StreamErrorKind, classify_stream_error, is_recoverable};
use crate::error::{CadenzaError, Result};

/// Events emitted while streaming a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A text delta (partial token).
    TextDelta { text: String },

    /// Generation finished with a reason.
    FinishReason { reason: String },

    /// Stream completed.
    Done,
}

impl StreamEvent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::TextDelta { text: text.into() }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::TextDelta { text } => Some(text),
            _ => None,
        }
    }
}

/// Retry policy for stream operations.
#[derive(Clone)]
pub struct StreamRecoveryOptions {
    pub max_retries: u32,
    /// First backoff delay; doubles per retry.
    pub retry_delay: Duration,
    /// Invoked once when recovery gives up, before the error propagates.
    pub on_recovery_failed: Option<Arc<dyn Fn(StreamErrorKind) + Send + Sync>>,
}

impl Default for StreamRecoveryOptions {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_delay: Duration::from_millis(500),
            on_recovery_failed: None,
        }
    }
}

impl std::fmt::Debug for StreamRecoveryOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRecoveryOptions")
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .field("on_recovery_failed", &self.on_recovery_failed.is_some())
            .finish()
    }
}

fn error_kind(err: &CadenzaError) -> StreamErrorKind {
    match err {
        CadenzaError::Stream { kind, .. } => *kind,
        other => classify_stream_error(&other.to_string()),
    }
}

fn backoff(base: Duration, attempt: u32) -> Duration {
    base * 2u32.pow(attempt.saturating_sub(1))
}

/// Run `operation`, retrying while its classified error is recoverable.
///
/// Cancellation is checked before every attempt and during backoff sleeps;
/// a cancelled caller gets [`CadenzaError::Aborted`] instead of another
/// provider call.
pub async fn with_stream_recovery<T, Op, Fut>(
    mut operation: Op,
    options: &StreamRecoveryOptions,
    cancel: &CancellationToken,
) -> Result<T>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = None;
    for attempt in 0..=options.max_retries {
        if cancel.is_cancelled() {
            return Err(CadenzaError::Aborted);
        }
        if attempt > 0 {
            let delay = backoff(options.retry_delay, attempt);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return Err(CadenzaError::Aborted),
            }
        }
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                let kind = error_kind(&err);
                if is_recoverable(kind) && attempt < options.max_retries {
                    warn!(attempt = attempt + 1, kind = %kind, error = %err, "Recoverable stream error, retrying");
                    last_error = Some(err);
                } else {
                    if let Some(callback) = &options.on_recovery_failed {
                        callback(kind);
                    }
                    return Err(err);
                }
            }
        }
    }
    Err(last_error.unwrap_or_else(|| CadenzaError::internal("Stream recovery retries exhausted")))
}

pin_project_lite::pin_project! {
    /// Wraps a transport stream, classifying item errors and flagging
    /// streams that end without a terminal [`StreamEvent::Done`].
    pub struct ClassifiedStream<S> {
        #[pin]
        inner: S,
        saw_done: bool,
        finished: bool,
    }
}

impl<S> ClassifiedStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            saw_done: false,
            finished: false,
        }
    }
}

impl<S> Stream for ClassifiedStream<S>
where
    S: Stream<Item = Result<StreamEvent>>,
{
    type Item = Result<StreamEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        if *this.finished {
            return Poll::Ready(None);
        }
        match this.inner.poll_next(cx) {
            Poll::Ready(Some(Ok(event))) => {
                if event.is_done() {
                    *this.saw_done = true;
                }
                Poll::Ready(Some(Ok(event)))
            }
            Poll::Ready(Some(Err(err))) => {
                // Transport errors are terminal for the wrapped stream.
                *this.finished = true;
                let kind = error_kind(&err);
                Poll::Ready(Some(Err(CadenzaError::stream(kind, err.to_string()))))
            }
            Poll::Ready(None) => {
                *this.finished = true;
                if *this.saw_done {
                    Poll::Ready(None)
                } else {
                    Poll::Ready(Some(Err(CadenzaError::stream(
                        StreamErrorKind::Incomplete,
                        "stream ended before completion",
                    ))))
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// A stream that re-establishes itself through `make` when a recoverable
/// fault occurs before any event was delivered.
///
/// Once events have reached the consumer the stream cannot be restarted
/// without duplicating output, so later faults propagate classified.
pub fn recovering_stream<S, M, Fut>(
    mut make: M,
    options: StreamRecoveryOptions,
    cancel: CancellationToken,
) -> impl Stream<Item = Result<StreamEvent>>
where
    M: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<S>> + Send,
    S: Stream<Item = Result<StreamEvent>> + Send + Unpin,
{
    async_stream::stream! {
        let mut attempt: u32 = 0;
        'establish: loop {
            if cancel.is_cancelled() {
                yield Err(CadenzaError::Aborted);
                return;
            }
            let mut inner = match make().await {
                Ok(stream) => ClassifiedStream::new(stream),
                Err(err) => {
                    let kind = error_kind(&err);
                    if is_recoverable(kind) && attempt < options.max_retries {
                        attempt += 1;
                        warn!(attempt, kind = %kind, "Stream failed to establish, retrying");
                        tokio::time::sleep(backoff(options.retry_delay, attempt)).await;
                        continue 'establish;
                    }
                    if let Some(callback) = &options.on_recovery_failed {
                        callback(kind);
                    }
                    yield Err(err);
                    return;
                }
            };
            let mut delivered = false;
            while let Some(item) = inner.next().await {
                match item {
                    Ok(event) => {
                        delivered = true;
                        yield Ok(event);
                    }
                    Err(err) => {
                        let kind = error_kind(&err);
                        if !delivered && is_recoverable(kind) && attempt < options.max_retries {
                            attempt += 1;
                            warn!(attempt, kind = %kind, "Stream faulted before output, re-establishing");
                            tokio::time::sleep(backoff(options.retry_delay, attempt)).await;
                            continue 'establish;
                        }
                        if let Some(callback) = &options.on_recovery_failed {
                            callback(kind);
                        }
                        yield Err(err);
                        return;
                    }
                }
            }
            return;
        }
    }
}
