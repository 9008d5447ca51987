//! Bounded-concurrency, bounded-buffer async map.
//!
//! [`BoundedParallelStream`] runs an async work function over a source of
//! inputs with at most `max_concurrency` invocations in flight, and never
//! holds more than `buffer_capacity` completed results the consumer has not
//! read yet. Results arrive in completion order, not input order.
//!
//! ## How the bound holds
//!
//! Before an input is pulled from the source the driver reserves a slot in the
//! bounded result channel, then a worker permit. A reserved slot is only
//! released when the consumer receives the value in it, so
//! `in flight + completed-but-unread <= buffer_capacity` at all times. This is
//! also why `buffer_capacity >= max_concurrency` is required.
//!
//! ## Failure and cancellation
//!
//! - The first failed (or panicked) work item is surfaced on the consumer's
//!   next advance, even if successful results are still buffered. In-flight
//!   work is cancelled and no further inputs are pulled. Only one error is
//!   ever surfaced; the stream ends after it.
//! - Cancelling the token passed at construction aborts in-flight and
//!   not-yet-started work; the consumer's next advance yields
//!   [`StreamError::Cancelled`].
//! - Dropping the stream cancels whatever it started.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::stream::FusedStream;
use futures::{FutureExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use backfill_core::ConfigurationError;

/// Upper bound on `max_concurrency`: the driver drains every worker permit at
/// once, and a single acquisition is counted in `u32`.
pub const MAX_CONCURRENCY: usize = if (u32::MAX as usize) < Semaphore::MAX_PERMITS {
    u32::MAX as usize
} else {
    Semaphore::MAX_PERMITS
};

/// Upper bound on `buffer_capacity`, the most a tokio channel can hold.
pub const MAX_BUFFER: usize = Semaphore::MAX_PERMITS;

/// Concurrency (`D`) and buffer (`B`) bounds.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamOptions {
    pub max_concurrency: usize,
    pub buffer_capacity: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            buffer_capacity: 16,
        }
    }
}

impl StreamOptions {
    pub fn new(max_concurrency: usize, buffer_capacity: usize) -> Result<Self, ConfigurationError> {
        let options = Self {
            max_concurrency,
            buffer_capacity,
        };
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_concurrency < 1 {
            return Err(ConfigurationError::new(
                "stream.max_concurrency",
                "must be at least 1",
            ));
        }
        if self.max_concurrency > MAX_CONCURRENCY {
            return Err(ConfigurationError::new(
                "stream.max_concurrency",
                format!("must not exceed {MAX_CONCURRENCY}"),
            ));
        }
        if self.buffer_capacity > MAX_BUFFER {
            return Err(ConfigurationError::new(
                "stream.buffer_capacity",
                format!("must not exceed {MAX_BUFFER}"),
            ));
        }
        if self.buffer_capacity < self.max_concurrency {
            return Err(ConfigurationError::new(
                "stream.buffer_capacity",
                format!(
                    "{} is smaller than max_concurrency {}",
                    self.buffer_capacity, self.max_concurrency
                ),
            ));
        }
        Ok(())
    }
}

/// Error surfaced by a [`BoundedParallelStream`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamError<E> {
    #[error("work item failed: {0}")]
    Work(E),

    #[error("work item panicked: {0}")]
    Panicked(String),

    #[error("stream cancelled")]
    Cancelled,
}

enum Failure<E> {
    Work(E),
    Panicked(String),
}

impl<E> From<Failure<E>> for StreamError<E> {
    fn from(value: Failure<E>) -> Self {
        match value {
            Failure::Work(e) => StreamError::Work(e),
            Failure::Panicked(msg) => StreamError::Panicked(msg),
        }
    }
}

/// First failure observed by any worker.
struct FirstFailure<E> {
    slot: Mutex<Option<Failure<E>>>,
}

impl<E> FirstFailure<E> {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }

    fn record(&self, failure: Failure<E>) {
        let mut slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_none() {
            *slot = Some(failure);
        }
    }

    fn take(&self) -> Option<Failure<E>> {
        self.slot.lock().unwrap_or_else(|p| p.into_inner()).take()
    }
}

/// Single-use lazy stream of work results. See the module docs.
#[must_use = "streams do nothing unless polled"]
pub struct BoundedParallelStream<U, E> {
    /// Present until the first poll, which spawns it.
    driver: Option<BoxFuture<'static, ()>>,
    results: mpsc::Receiver<U>,
    failure: Arc<FirstFailure<E>>,
    cancel: CancellationToken,
    internal: CancellationToken,
    finished: bool,
}

impl<U, E> BoundedParallelStream<U, E>
where
    U: Send + 'static,
    E: Send + 'static,
{
    /// Validate `options` and prepare the stream. Nothing runs until the
    /// stream is first polled.
    pub fn new<T, S, F, Fut>(
        source: S,
        work: F,
        options: StreamOptions,
        cancel: CancellationToken,
    ) -> Result<Self, ConfigurationError>
    where
        T: Send + 'static,
        S: Stream<Item = T> + Send + 'static,
        F: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<U, E>> + Send + 'static,
    {
        options.validate()?;

        let (tx, rx) = mpsc::channel(options.buffer_capacity);
        let internal = cancel.child_token();
        let failure = Arc::new(FirstFailure::new());
        let driver = drive(
            source,
            Arc::new(work),
            options.max_concurrency,
            tx,
            internal.clone(),
            Arc::clone(&failure),
        )
        .boxed();

        Ok(Self {
            driver: Some(driver),
            results: rx,
            failure,
            cancel,
            internal,
            finished: false,
        })
    }

    /// Convenience constructor over any iterable source.
    pub fn from_iter<I, F, Fut>(
        items: I,
        work: F,
        options: StreamOptions,
        cancel: CancellationToken,
    ) -> Result<Self, ConfigurationError>
    where
        I: IntoIterator,
        I::IntoIter: Send + 'static,
        I::Item: Send + 'static,
        F: Fn(I::Item, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<U, E>> + Send + 'static,
    {
        Self::new(futures::stream::iter(items), work, options, cancel)
    }
}

impl<U, E> BoundedParallelStream<U, E> {
    fn pending_error(&self) -> Option<StreamError<E>> {
        if self.cancel.is_cancelled() {
            return Some(StreamError::Cancelled);
        }
        self.failure.take().map(StreamError::from)
    }

    fn finish(&mut self) {
        self.finished = true;
        self.internal.cancel();
        self.results.close();
    }
}

impl<U, E> Stream for BoundedParallelStream<U, E> {
    type Item = Result<U, StreamError<E>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        if let Some(driver) = this.driver.take() {
            tokio::spawn(driver);
        }

        if let Some(error) = this.pending_error() {
            this.finish();
            return Poll::Ready(Some(Err(error)));
        }

        match this.results.poll_recv(cx) {
            Poll::Ready(Some(value)) => Poll::Ready(Some(Ok(value))),
            Poll::Ready(None) => {
                // Every producer is gone: either the source ran dry or the
                // driver stopped because of a failure or cancellation.
                let error = this.pending_error();
                this.finish();
                Poll::Ready(error.map(Err))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<U, E> FusedStream for BoundedParallelStream<U, E> {
    fn is_terminated(&self) -> bool {
        self.finished
    }
}

impl<U, E> Drop for BoundedParallelStream<U, E> {
    fn drop(&mut self) {
        self.internal.cancel();
    }
}

async fn drive<T, S, F, Fut, U, E>(
    source: S,
    work: Arc<F>,
    max_concurrency: usize,
    results: mpsc::Sender<U>,
    cancel: CancellationToken,
    failure: Arc<FirstFailure<E>>,
) where
    T: Send + 'static,
    S: Stream<Item = T> + Send + 'static,
    F: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<U, E>> + Send + 'static,
    U: Send + 'static,
    E: Send + 'static,
{
    let mut source = std::pin::pin!(source);
    let workers = Arc::new(Semaphore::new(max_concurrency));

    loop {
        let slot = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            slot = results.clone().reserve_owned() => match slot {
                Ok(slot) => slot,
                // Consumer went away.
                Err(_) => break,
            },
        };
        let worker = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = Arc::clone(&workers).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            item = source.next() => match item {
                Some(item) => item,
                None => break,
            },
        };

        let work = Arc::clone(&work);
        let token = cancel.clone();
        let failure = Arc::clone(&failure);
        tokio::spawn(async move {
            let _worker = worker;
            let call = token.clone();
            // The call itself sits inside the guarded future so a panic raised
            // before the work future exists is caught too.
            let run = AssertUnwindSafe(async move { work(item, call).await }).catch_unwind();
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                outcome = run => outcome,
            };
            match outcome {
                Ok(Ok(value)) => {
                    slot.send(value);
                }
                Ok(Err(error)) => {
                    failure.record(Failure::Work(error));
                    token.cancel();
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(error = %message, "bounded stream work item panicked");
                    failure.record(Failure::Panicked(message));
                    token.cancel();
                }
            }
        });
    }

    // Each running item holds a worker permit; taking them all waits for
    // stragglers so the channel only closes once nothing can still send.
    let _ = workers.acquire_many(max_concurrency as u32).await;
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
