//! Buffer jobs until an asynchronous readiness condition resolves.
//!
//! A [`DeferredProcessor`] queues every job added while its readiness future
//! is pending and dispatches them in FIFO order once it resolves. Afterwards
//! jobs are dispatched as soon as they are added, still strictly in the order
//! of [`DeferredProcessor::add_job`] calls, including jobs added from inside
//! another job.
//!
//! If readiness fails, the processor enters a terminal failed state: queued
//! jobs and all later jobs are rejected with the readiness error.

use crate::cancel::CancellationToken;
use crate::{ConduitError, Result};
use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::debug;

/// A deferred job: called once when dispatched, its future supplies the result.
pub type Job<T> = Box<dyn FnOnce() -> BoxFuture<'static, Result<T>> + Send>;

/// Called once if the readiness future fails.
pub type RejectionHandler = Box<dyn FnOnce(ConduitError) + Send>;

/// Observable phase of a [`DeferredProcessor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferredPhase {
    Waiting,
    Ready,
    Failed(ConduitError),
    Disposed,
}

struct QueuedJob<T> {
    job: Job<T>,
    resolver: oneshot::Sender<Result<T>>,
}

struct ProcessorState<T> {
    phase: DeferredPhase,
    queue: VecDeque<QueuedJob<T>>,
    flushing: bool,
    on_rejected: Option<RejectionHandler>,
}

struct ProcessorInner<T> {
    name: String,
    cancel: CancellationToken,
    state: Mutex<ProcessorState<T>>,
}

/// FIFO job buffer gated on a readiness future. Cloning shares the processor.
pub struct DeferredProcessor<T> {
    inner: Arc<ProcessorInner<T>>,
}

impl<T> Clone for DeferredProcessor<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> DeferredProcessor<T> {
    /// Create a processor waiting on `readiness`.
    ///
    /// Must be called from within a tokio runtime: `readiness` is polled on a
    /// spawned task.
    pub fn new<F>(name: impl Into<String>, readiness: F, on_rejected: Option<RejectionHandler>) -> Self
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let inner = Arc::new(ProcessorInner {
            name: name.into(),
            cancel: CancellationToken::new(),
            state: Mutex::new(ProcessorState {
                phase: DeferredPhase::Waiting,
                queue: VecDeque::new(),
                flushing: false,
                on_rejected,
            }),
        });
        tokio::spawn(await_readiness(
            Arc::downgrade(&inner),
            inner.cancel.clone(),
            readiness,
        ));
        Self { inner }
    }

    /// Queue `job`, or dispatch it right away if the processor is ready.
    pub fn add_job(&self, job: Job<T>) -> JobFuture<T> {
        let (resolver, receiver) = oneshot::channel();
        let mut state = self.inner.lock();
        match state.phase.clone() {
            DeferredPhase::Failed(e) => {
                drop(state);
                let _ = resolver.send(Err(e));
            }
            // Dropping the resolver settles the job as skipped.
            DeferredPhase::Disposed => {}
            phase => {
                state.queue.push_back(QueuedJob { job, resolver });
                drop(state);
                if phase == DeferredPhase::Ready {
                    self.inner.flush();
                }
            }
        }
        JobFuture { receiver }
    }

    pub fn phase(&self) -> DeferredPhase {
        self.inner.lock().phase.clone()
    }

    /// Number of jobs waiting for dispatch.
    pub fn queued_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Drop every queued job and refuse new ones. Idempotent.
    pub fn dispose(&self) {
        self.inner.dispose();
    }
}

impl<T: Send + 'static> ProcessorInner<T> {
    fn lock(&self) -> MutexGuard<'_, ProcessorState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_ready(&self) {
        {
            let mut state = self.lock();
            if state.phase != DeferredPhase::Waiting {
                return;
            }
            state.phase = DeferredPhase::Ready;
            state.on_rejected = None;
        }
        debug!("{}: the awaited readiness was resolved", self.name);
        self.flush();
    }

    fn on_failed(&self, error: ConduitError) {
        let (queue, on_rejected) = {
            let mut state = self.lock();
            if state.phase != DeferredPhase::Waiting {
                return;
            }
            state.phase = DeferredPhase::Failed(error.clone());
            (std::mem::take(&mut state.queue), state.on_rejected.take())
        };
        debug!(
            "{}: the awaited readiness failed ({}), rejecting {} queued job(s)",
            self.name,
            error,
            queue.len()
        );
        for queued in queue {
            let _ = queued.resolver.send(Err(error.clone()));
        }
        if let Some(on_rejected) = on_rejected {
            on_rejected(error);
        }
    }

    /// Dispatch queued jobs in order until the queue is empty.
    ///
    /// Re-entrant calls (a job adding another job) only enqueue; the outermost
    /// call keeps draining, which preserves FIFO order.
    fn flush(&self) {
        {
            let mut state = self.lock();
            if state.flushing {
                return;
            }
            state.flushing = true;
        }
        loop {
            let next = {
                let mut state = self.lock();
                let next = if state.phase == DeferredPhase::Ready {
                    state.queue.pop_front()
                } else {
                    None
                };
                if next.is_none() {
                    state.flushing = false;
                }
                next
            };
            let Some(QueuedJob { job, resolver }) = next else {
                return;
            };
            let outcome = job();
            tokio::spawn(async move {
                let _ = resolver.send(outcome.await);
            });
        }
    }

    fn dispose(&self) {
        let (queue, on_rejected) = {
            let mut state = self.lock();
            if state.phase == DeferredPhase::Disposed {
                return;
            }
            state.phase = DeferredPhase::Disposed;
            (std::mem::take(&mut state.queue), state.on_rejected.take())
        };
        self.cancel.cancel();
        if !queue.is_empty() {
            debug!("{}: disposed, skipping {} queued job(s)", self.name, queue.len());
        }
        drop(queue);
        drop(on_rejected);
    }
}

async fn await_readiness<T, F>(inner: Weak<ProcessorInner<T>>, cancel: CancellationToken, readiness: F)
where
    T: Send + 'static,
    F: Future<Output = Result<()>> + Send + 'static,
{
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        outcome = readiness => outcome,
    };
    let Some(inner) = inner.upgrade() else {
        return;
    };
    match outcome {
        Ok(()) => inner.on_ready(),
        Err(e) => inner.on_failed(e),
    }
}

/// Future settled with the outcome of one deferred job.
///
/// Resolves to [`ConduitError::JobSkipped`] if the job was dropped by
/// [`DeferredProcessor::dispose`] before running.
pub struct JobFuture<T> {
    receiver: oneshot::Receiver<Result<T>>,
}

impl<T> Future for JobFuture<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(ConduitError::JobSkipped)),
            Poll::Pending => Poll::Pending,
        }
    }
}
