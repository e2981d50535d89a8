//! Per-client request gating and forwarding.

use super::server_request_handler::ServerRequestHandler;
use super::ServerConnection;
use crate::channel::MessageChannel;
use crate::config::ServiceNames;
use crate::deferred::{DeferredPhase, DeferredProcessor};
use crate::fatal::InvalidMessagePolicy;
use crate::messaging::{debug_dump, origin, RemoteCallMessage};
use crate::permissions::PermissionsChecker;
use crate::readiness::ReadinessSignal;
use crate::requesting::RequestReceiver;
use crate::{ConduitError, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Observable state of a [`ClientHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientHandlerState {
    /// Requests are buffered until the permission check settles.
    BufferingForPermission,
    /// Permission granted; requests wait for the server to become ready.
    BufferingForReadiness,
    /// Requests are forwarded to the server as they arrive.
    Forwarding,
    /// Permission denied; every request is rejected.
    Rejected,
    Disposed,
}

#[derive(Default)]
struct HandlerState {
    permission_gate: Option<DeferredProcessor<Value>>,
    receiver: Option<RequestReceiver>,
    disposed: bool,
}

struct HandlerInner {
    origin: Option<String>,
    log_name: String,
    client_channel: Arc<dyn MessageChannel>,
    server_handler: ServerRequestHandler,
    readiness: ReadinessSignal,
    checker: Arc<dyn PermissionsChecker>,
    state: Mutex<HandlerState>,
}

/// Serves one client channel: checks the client's permission on its first
/// request, buffers requests until both the permission and the server are
/// available, then forwards them in arrival order.
///
/// The handler lives as long as the client channel, the server channel and
/// the owner all keep it alive; closing any of them disposes it.
pub struct ClientHandler {
    inner: Arc<HandlerInner>,
}

impl ClientHandler {
    /// Start serving `client_channel`.
    ///
    /// `origin` identifies the client to the permission checker; `None`
    /// stands for the application itself.
    pub fn new(
        server: &ServerConnection,
        client_channel: Arc<dyn MessageChannel>,
        origin: Option<String>,
        checker: Arc<dyn PermissionsChecker>,
    ) -> Self {
        let client_name = origin::client_name_for_log(origin.as_deref());
        let server_handler = ServerRequestHandler::new(server, client_name.clone());
        let log_name = match &origin {
            Some(_) => format!("ClientHandler<{}, id={}>", client_name, server_handler.id()),
            None => format!("ClientHandler<ourselves, id={}>", server_handler.id()),
        };

        let inner = Arc::new(HandlerInner {
            origin,
            log_name,
            client_channel: Arc::clone(&client_channel),
            server_handler,
            readiness: server.readiness.clone(),
            checker,
            state: Mutex::new(HandlerState::default()),
        });

        let weak = Arc::downgrade(&inner);
        let receiver = RequestReceiver::with_policy(
            ServiceNames::CLIENT_REQUESTER,
            Arc::clone(&client_channel),
            Arc::new(move |payload| match weak.upgrade() {
                Some(inner) => inner.handle_request(payload),
                None => futures::future::ready(Err(ConduitError::ClientHandlerDisposed)).boxed(),
            }),
            InvalidMessagePolicy::DisposeChannel,
        );
        inner.lock().receiver = Some(receiver);

        let weak = Arc::downgrade(&inner);
        inner.server_handler.add_on_dispose_callback(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.dispose();
            }
        }));
        let weak = Arc::downgrade(&inner);
        client_channel.add_on_dispose_callback(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                if inner.origin.is_some() {
                    info!("{}: client message channel was disposed, disposing...", inner.log_name);
                } else {
                    debug!("{}: client message channel was disposed, disposing...", inner.log_name);
                }
                inner.dispose();
            }
        }));

        debug!("{}: initialized", inner.log_name);
        Self { inner }
    }

    /// Id announced to the server for this client.
    pub fn id(&self) -> u64 {
        self.inner.server_handler.id()
    }

    pub fn origin(&self) -> Option<&str> {
        self.inner.origin.as_deref()
    }

    pub fn state(&self) -> ClientHandlerState {
        self.inner.current_state()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.lock().disposed
    }

    /// Reject buffered requests, tell the server, close the client channel.
    /// Idempotent.
    pub fn dispose(&self) {
        self.inner.dispose();
    }
}

impl HandlerInner {
    fn lock(&self) -> MutexGuard<'_, HandlerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_state(&self) -> ClientHandlerState {
        let gate_phase = {
            let state = self.lock();
            if state.disposed {
                return ClientHandlerState::Disposed;
            }
            state.permission_gate.as_ref().map(DeferredProcessor::phase)
        };
        match gate_phase {
            None | Some(DeferredPhase::Waiting) => ClientHandlerState::BufferingForPermission,
            Some(DeferredPhase::Failed(_)) => ClientHandlerState::Rejected,
            Some(DeferredPhase::Disposed) => ClientHandlerState::Disposed,
            Some(DeferredPhase::Ready) if self.readiness.is_ready() => ClientHandlerState::Forwarding,
            Some(DeferredPhase::Ready) => ClientHandlerState::BufferingForReadiness,
        }
    }

    fn handle_request(self: &Arc<Self>, payload: Value) -> BoxFuture<'static, Result<Value>> {
        let Some(call) = RemoteCallMessage::parse(&payload) else {
            // The client breaks the protocol: only its own scope is torn down.
            warn!(
                "{}: failed to parse the remote call: {}, disposing of the client...",
                self.log_name,
                debug_dump(&payload)
            );
            self.client_channel.dispose();
            return futures::future::ready(Err(ConduitError::InvalidPayload {
                message: "the request payload is not a remote call".to_string(),
            }))
            .boxed();
        };
        debug!(
            "{}: received a remote call request: {}",
            self.log_name,
            call.debug_representation()
        );

        let Some(gate) = self.permission_gate() else {
            return futures::future::ready(Err(ConduitError::ClientHandlerDisposed)).boxed();
        };
        let server_handler = self.server_handler.clone();
        gate.add_job(Box::new(move || server_handler.handle_request(call).boxed()))
            .boxed()
    }

    /// The permission gate, created together with the permission check on
    /// the first request. `None` once disposed.
    fn permission_gate(self: &Arc<Self>) -> Option<DeferredProcessor<Value>> {
        let mut state = self.lock();
        if state.disposed {
            return None;
        }
        if let Some(gate) = &state.permission_gate {
            return Some(gate.clone());
        }

        debug!("{}: checking permissions of the client", self.log_name);
        let check = self.checker.check(self.origin.as_deref());
        let weak = Arc::downgrade(self);
        let readiness = async move {
            let outcome = check.await;
            if let Some(inner) = weak.upgrade() {
                inner.log_permission_outcome(&outcome);
            }
            outcome
        };
        let gate = DeferredProcessor::new(format!("{} permission", self.log_name), readiness, None);
        state.permission_gate = Some(gate.clone());
        Some(gate)
    }

    fn log_permission_outcome(&self, outcome: &Result<()>) {
        match (outcome, &self.origin) {
            (Ok(()), None) => debug!("{}: permission granted", self.log_name),
            (Ok(()), Some(_)) => info!(
                "{}: client was granted permissions to issue requests",
                self.log_name
            ),
            (Err(e), _) => info!(
                "{}: client permission denied ({}), all its requests will be rejected",
                self.log_name, e
            ),
        }
    }

    fn dispose(&self) {
        let (gate, receiver) = {
            let mut state = self.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            (state.permission_gate.take(), state.receiver.take())
        };
        if let Some(gate) = gate {
            gate.dispose();
        }
        self.server_handler.dispose();
        drop(receiver);
        self.client_channel.dispose();
        debug!("{}: disposed", self.log_name);
    }
}
