//! Sending side of the request/response protocol.

use super::message::{request_service_name, response_service_name, RequestMessage, ResponseMessage, ResponseOutcome};
use crate::channel::{DisposeCallbackKey, MessageChannel};
use crate::fatal::InvalidMessagePolicy;
use crate::messaging::debug_dump;
use crate::{ConduitError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::debug;

struct PendingRequest {
    resolver: oneshot::Sender<Result<Value>>,
    // Kept for diagnostics only.
    payload: Value,
}

#[derive(Default)]
struct RequesterState {
    next_request_id: u64,
    pending: HashMap<u64, PendingRequest>,
    disposed: bool,
    dispose_key: Option<DisposeCallbackKey>,
}

struct RequesterInner {
    name: String,
    log_name: String,
    channel: Arc<dyn MessageChannel>,
    policy: InvalidMessagePolicy,
    state: Mutex<RequesterState>,
}

/// Correlates outgoing requests with incoming responses over a channel.
///
/// Every request gets a fresh id; the matching response settles the
/// [`ReplyFuture`] returned by [`Requester::post_request`]. When the channel
/// is disposed, or the requester itself is, every outstanding request fails
/// with [`ConduitError::RequesterDisposed`].
pub struct Requester {
    inner: Arc<RequesterInner>,
}

impl Requester {
    /// Create a requester named `name` on a trusted channel.
    pub fn new(name: impl Into<String>, channel: Arc<dyn MessageChannel>) -> Self {
        Self::with_policy(name, channel, InvalidMessagePolicy::Abort)
    }

    /// Create a requester with a custom policy for undecodable responses.
    pub fn with_policy(
        name: impl Into<String>,
        channel: Arc<dyn MessageChannel>,
        policy: InvalidMessagePolicy,
    ) -> Self {
        let name = name.into();
        let inner = Arc::new(RequesterInner {
            log_name: format!("Requester<\"{}\">", name),
            name,
            channel: Arc::clone(&channel),
            policy,
            state: Mutex::new(RequesterState::default()),
        });

        let weak = Arc::downgrade(&inner);
        channel.register_service(
            &response_service_name(&inner.name),
            Arc::new(move |payload| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_response(payload);
                }
            }),
        );
        let weak = Arc::downgrade(&inner);
        let key = channel.add_on_dispose_callback(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                debug!("{}: message channel was disposed, disposing...", inner.log_name);
                inner.dispose();
            }
        }));
        {
            // Already disposed if the channel was: the callback has run.
            let mut state = inner.lock();
            if !state.disposed {
                state.dispose_key = Some(key);
            }
        }
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Send `payload` as a new request.
    ///
    /// Fails right away, without touching the channel, once the requester is
    /// disposed.
    pub fn post_request(&self, payload: Value) -> ReplyFuture {
        self.inner.post_request(payload)
    }

    /// Number of requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.lock().disposed
    }

    /// Reject every outstanding request and refuse new ones. Idempotent.
    pub fn dispose(&self) {
        self.inner.dispose();
    }
}

impl RequesterInner {
    fn lock(&self) -> MutexGuard<'_, RequesterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn disposed_error(&self) -> ConduitError {
        ConduitError::RequesterDisposed {
            name: self.name.clone(),
        }
    }

    fn post_request(&self, payload: Value) -> ReplyFuture {
        let (resolver, receiver) = oneshot::channel();
        let reply = ReplyFuture {
            receiver,
            name: self.name.clone(),
        };

        let request_id = {
            let mut state = self.lock();
            if state.disposed {
                drop(state);
                let _ = resolver.send(Err(self.disposed_error()));
                return reply;
            }
            let request_id = state.next_request_id;
            state.next_request_id += 1;
            state.pending.insert(
                request_id,
                PendingRequest {
                    resolver,
                    payload: payload.clone(),
                },
            );
            request_id
        };

        debug!(
            "{}: starting a request with identifier {}, the payload is: {}",
            self.log_name,
            request_id,
            debug_dump(&payload)
        );
        let message = RequestMessage::new(request_id, payload).to_value();
        if let Err(e) = self.channel.send(&request_service_name(&self.name), message) {
            let pending = self.lock().pending.remove(&request_id);
            if let Some(pending) = pending {
                let _ = pending.resolver.send(Err(e));
            }
        }
        reply
    }

    fn on_response(&self, payload: Value) {
        let Some(response) = ResponseMessage::parse(&payload) else {
            self.policy.handle(
                &self.log_name,
                &format!(
                    "failed to parse the received response message: {}",
                    debug_dump(&payload)
                ),
                self.channel.as_ref(),
            );
            return;
        };

        let pending = {
            let mut state = self.lock();
            if state.disposed {
                return;
            }
            state.pending.remove(&response.request_id)
        };
        let Some(pending) = pending else {
            self.policy.handle(
                &self.log_name,
                &format!(
                    "received a response for unknown request with identifier {}",
                    response.request_id
                ),
                self.channel.as_ref(),
            );
            return;
        };

        let outcome = match response.outcome {
            ResponseOutcome::Success { value } => {
                debug!(
                    "{}: the request with identifier {} succeeded with the result: {}",
                    self.log_name,
                    response.request_id,
                    debug_dump(&value)
                );
                Ok(value)
            }
            ResponseOutcome::Failure { error } => {
                debug!(
                    "{}: the request with identifier {} failed: {}",
                    self.log_name, response.request_id, error
                );
                Err(ConduitError::remote(error))
            }
        };
        let _ = pending.resolver.send(outcome);
    }

    fn dispose(&self) {
        let (pending, dispose_key) = {
            let mut state = self.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            (std::mem::take(&mut state.pending), state.dispose_key.take())
        };

        self.channel
            .unregister_service(&response_service_name(&self.name));
        if let Some(key) = dispose_key {
            self.channel.remove_on_dispose_callback(key);
        }

        let mut pending: Vec<(u64, PendingRequest)> = pending.into_iter().collect();
        pending.sort_by_key(|(request_id, _)| *request_id);
        for (request_id, request) in pending {
            debug!(
                "{}: rejecting the request with identifier {} (payload: {})",
                self.log_name,
                request_id,
                debug_dump(&request.payload)
            );
            let _ = request.resolver.send(Err(self.disposed_error()));
        }
        debug!("{}: disposed", self.log_name);
    }
}

/// Future settled by the response to one request.
pub struct ReplyFuture {
    receiver: oneshot::Receiver<Result<Value>>,
    name: String,
}

impl Future for ReplyFuture {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(ConduitError::RequesterDisposed {
                name: self.name.clone(),
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}
