//! Per-client forwarding onto the shared server channel.

use super::control::{CreateClientHandlerMessage, DeleteClientHandlerMessage};
use super::ServerConnection;
use crate::channel::{DisposeCallback, DisposeCallbackKey, MessageChannel};
use crate::config::ServiceNames;
use crate::deferred::{DeferredProcessor, JobFuture};
use crate::messaging::{debug_dump, RemoteCallMessage};
use crate::requesting::Requester;
use crate::{ConduitError, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Default)]
struct HandlerState {
    requester: Option<Arc<Requester>>,
    server_channel_gone: bool,
    disposed: bool,
    on_dispose: Vec<DisposeCallback>,
    server_dispose_key: Option<DisposeCallbackKey>,
}

struct HandlerInner {
    id: u64,
    client_name_for_log: String,
    log_name: String,
    server_channel: Arc<dyn MessageChannel>,
    readiness_gate: DeferredProcessor<Value>,
    state: Mutex<HandlerState>,
}

/// Forwards one client's remote calls to the server.
///
/// Calls are held back until the server is ready. The dedicated requester,
/// and with it the `create_client_handler` announcement, is only created when
/// the first call is forwarded; a matching `delete_client_handler` is sent on
/// disposal if and only if the announcement went out and the server channel
/// is still open.
#[derive(Clone)]
pub struct ServerRequestHandler {
    inner: Arc<HandlerInner>,
}

impl ServerRequestHandler {
    pub fn new(server: &ServerConnection, client_name_for_log: impl Into<String>) -> Self {
        let id = NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed);
        let log_name = format!("ServerRequestHandler<id={}>", id);

        let inner = Arc::new_cyclic(|weak: &std::sync::Weak<HandlerInner>| {
            let on_rejected = {
                let weak = weak.clone();
                Box::new(move |e: ConduitError| {
                    if let Some(inner) = weak.upgrade() {
                        warn!("{}: server readiness failed ({}), disposing...", inner.log_name, e);
                        inner.dispose();
                    }
                }) as Box<dyn FnOnce(ConduitError) + Send>
            };
            HandlerInner {
                id,
                client_name_for_log: client_name_for_log.into(),
                readiness_gate: DeferredProcessor::new(
                    format!("{} readiness", log_name),
                    server.readiness.clone().wait(),
                    Some(on_rejected),
                ),
                log_name,
                server_channel: Arc::clone(&server.channel),
                state: Mutex::new(HandlerState::default()),
            }
        });

        let weak = Arc::downgrade(&inner);
        let key = server.channel.add_on_dispose_callback(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                warn!(
                    "{}: server message channel was disposed, disposing...",
                    inner.log_name
                );
                inner.lock().server_channel_gone = true;
                inner.dispose();
            }
        }));
        {
            let mut state = inner.lock();
            if !state.disposed {
                state.server_dispose_key = Some(key);
            }
        }
        Self { inner }
    }

    /// Process-unique id announced to the server.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Forward `call` to the server once it is ready.
    pub fn handle_request(&self, call: RemoteCallMessage) -> JobFuture<Value> {
        let weak = Arc::downgrade(&self.inner);
        self.inner.readiness_gate.add_job(Box::new(move || match weak.upgrade() {
            Some(inner) => inner.post_request_to_server(call),
            None => futures::future::ready(Err(ConduitError::ClientHandlerDisposed)).boxed(),
        }))
    }

    /// Run `callback` once this handler is disposed, or now if it already is.
    pub fn add_on_dispose_callback(&self, callback: DisposeCallback) {
        {
            let mut state = self.inner.lock();
            if !state.disposed {
                state.on_dispose.push(callback);
                return;
            }
        }
        callback();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.lock().disposed
    }

    /// Whether the `create_client_handler` announcement was sent.
    pub fn is_announced(&self) -> bool {
        self.inner.lock().requester.is_some()
    }

    pub fn dispose(&self) {
        self.inner.dispose();
    }
}

impl HandlerInner {
    fn lock(&self) -> MutexGuard<'_, HandlerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn post_request_to_server(&self, call: RemoteCallMessage) -> BoxFuture<'static, Result<Value>> {
        let requester = match self.requester() {
            Ok(requester) => requester,
            Err(e) => return futures::future::ready(Err(e)).boxed(),
        };
        let description = call.debug_representation();
        debug!("{}: forwarding the remote call {}", self.log_name, description);
        let reply = requester.post_request(call.to_value());

        let log_name = self.log_name.clone();
        async move {
            match reply.await {
                Ok(value) => {
                    debug!(
                        "{}: the remote call {} completed: {}",
                        log_name,
                        description,
                        debug_dump(&value)
                    );
                    Ok(value)
                }
                Err(e) => {
                    if e.is_disposal() {
                        debug!("{}: the remote call {} failed: {}", log_name, description, e);
                    } else {
                        warn!("{}: the remote call {} failed: {}", log_name, description, e);
                    }
                    Err(e)
                }
            }
        }
        .boxed()
    }

    /// The dedicated requester, created on first use together with the
    /// `create_client_handler` announcement.
    ///
    /// Only the readiness gate's flush loop calls this, one job at a time, so
    /// the announcement always precedes the first request on the channel.
    fn requester(&self) -> Result<Arc<Requester>> {
        let requester = {
            let mut state = self.lock();
            if state.disposed {
                return Err(ConduitError::ClientHandlerDisposed);
            }
            if let Some(requester) = &state.requester {
                return Ok(Arc::clone(requester));
            }
            if state.server_channel_gone || self.server_channel.is_disposed() {
                return Err(ConduitError::ChannelDisposed);
            }
            let requester = Arc::new(Requester::new(
                ServiceNames::client_handler_call_function(self.id),
                Arc::clone(&self.server_channel),
            ));
            state.requester = Some(Arc::clone(&requester));
            requester
        };

        debug!("{}: announcing the client handler to the server", self.log_name);
        let create = CreateClientHandlerMessage {
            handler_id: self.id,
            client_name_for_log: self.client_name_for_log.clone(),
        };
        self.server_channel
            .send(ServiceNames::CREATE_CLIENT_HANDLER, create.to_value())?;
        Ok(requester)
    }

    fn dispose(&self) {
        let (requester, server_channel_gone, callbacks, server_dispose_key) = {
            let mut state = self.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            (
                state.requester.take(),
                state.server_channel_gone,
                std::mem::take(&mut state.on_dispose),
                state.server_dispose_key.take(),
            )
        };

        if let Some(key) = server_dispose_key {
            self.server_channel.remove_on_dispose_callback(key);
        }
        self.readiness_gate.dispose();
        if let Some(requester) = requester {
            if !server_channel_gone && !self.server_channel.is_disposed() {
                let delete = DeleteClientHandlerMessage {
                    handler_id: self.id,
                };
                if let Err(e) = self
                    .server_channel
                    .send(ServiceNames::DELETE_CLIENT_HANDLER, delete.to_value())
                {
                    debug!("{}: failed to send the delete message: {}", self.log_name, e);
                }
            }
            requester.dispose();
        }
        debug!("{}: disposed", self.log_name);
        for callback in callbacks {
            callback();
        }
    }
}
