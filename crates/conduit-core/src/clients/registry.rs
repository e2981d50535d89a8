//! Server side of the client handler protocol.
//!
//! Listens for `create_client_handler` / `delete_client_handler` on the
//! server channel and serves each announced handler's remote calls through a
//! [`RemoteCallDispatch`] backend.

use super::control::{CreateClientHandlerMessage, DeleteClientHandlerMessage};
use crate::channel::MessageChannel;
use crate::config::ServiceNames;
use crate::fatal::protocol_desync;
use crate::messaging::{debug_dump, RemoteCallMessage};
use crate::requesting::RequestReceiver;
use crate::Result;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::info;

/// Backend executing remote calls on behalf of client handlers.
#[async_trait::async_trait]
pub trait RemoteCallDispatch: Send + Sync + 'static {
    /// Execute `call` for the client handler `handler_id`.
    async fn dispatch(&self, handler_id: u64, call: RemoteCallMessage) -> Result<Value>;

    /// Called when a client handler is announced.
    async fn on_handler_created(&self, _handler_id: u64, _client_name_for_log: &str) {}

    /// Called when a client handler goes away; release its resources.
    async fn on_handler_deleted(&self, _handler_id: u64) {}
}

struct HandlerEntry {
    client_name_for_log: String,
    _receiver: RequestReceiver,
}

struct RegistryInner {
    channel: Arc<dyn MessageChannel>,
    dispatch: Arc<dyn RemoteCallDispatch>,
    handlers: Mutex<HashMap<u64, HandlerEntry>>,
}

/// Registry of the client handlers announced over one server channel.
pub struct ClientHandlerRegistry {
    inner: Arc<RegistryInner>,
}

impl ClientHandlerRegistry {
    pub fn new(channel: Arc<dyn MessageChannel>, dispatch: Arc<dyn RemoteCallDispatch>) -> Self {
        let inner = Arc::new(RegistryInner {
            channel: Arc::clone(&channel),
            dispatch,
            handlers: Mutex::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&inner);
        channel.register_service(
            ServiceNames::CREATE_CLIENT_HANDLER,
            Arc::new(move |payload| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_create(payload);
                }
            }),
        );
        let weak = Arc::downgrade(&inner);
        channel.register_service(
            ServiceNames::DELETE_CLIENT_HANDLER,
            Arc::new(move |payload| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_delete(payload);
                }
            }),
        );
        let weak = Arc::downgrade(&inner);
        channel.add_on_dispose_callback(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                let count = {
                    let mut handlers = inner.lock();
                    let count = handlers.len();
                    handlers.clear();
                    count
                };
                if count > 0 {
                    info!(
                        "ClientHandlerRegistry: channel disposed, dropped {} client handler(s)",
                        count
                    );
                }
            }
        }));
        Self { inner }
    }

    /// Ids of the currently announced handlers, sorted.
    pub fn handler_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.inner.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn handler_count(&self) -> usize {
        self.inner.lock().len()
    }
}

impl RegistryInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, HandlerEntry>> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_create(&self, payload: Value) {
        let Some(message) = CreateClientHandlerMessage::parse(&payload) else {
            protocol_desync(
                "ClientHandlerRegistry",
                &format!(
                    "failed to parse the create message: {}",
                    debug_dump(&payload)
                ),
            );
        };
        let handler_id = message.handler_id;

        let dispatch = Arc::clone(&self.dispatch);
        let receiver = RequestReceiver::new(
            ServiceNames::client_handler_call_function(handler_id),
            Arc::clone(&self.channel),
            Arc::new(move |payload| {
                let Some(call) = RemoteCallMessage::parse(&payload) else {
                    protocol_desync(
                        "ClientHandlerRegistry",
                        &format!(
                            "failed to parse the remote call for handler {}: {}",
                            handler_id,
                            debug_dump(&payload)
                        ),
                    );
                };
                let dispatch = Arc::clone(&dispatch);
                async move { dispatch.dispatch(handler_id, call).await }.boxed()
            }),
        );

        {
            let mut handlers = self.lock();
            if handlers.contains_key(&handler_id) {
                drop(handlers);
                protocol_desync(
                    "ClientHandlerRegistry",
                    &format!("client handler {} was created twice", handler_id),
                );
            }
            handlers.insert(
                handler_id,
                HandlerEntry {
                    client_name_for_log: message.client_name_for_log.clone(),
                    _receiver: receiver,
                },
            );
        }
        info!(
            "ClientHandlerRegistry: created client handler {} for {}",
            handler_id,
            display_name(&message.client_name_for_log)
        );

        let dispatch = Arc::clone(&self.dispatch);
        tokio::spawn(async move {
            dispatch
                .on_handler_created(handler_id, &message.client_name_for_log)
                .await;
        });
    }

    fn on_delete(&self, payload: Value) {
        let Some(message) = DeleteClientHandlerMessage::parse(&payload) else {
            protocol_desync(
                "ClientHandlerRegistry",
                &format!(
                    "failed to parse the delete message: {}",
                    debug_dump(&payload)
                ),
            );
        };
        let handler_id = message.handler_id;
        let Some(entry) = self.lock().remove(&handler_id) else {
            protocol_desync(
                "ClientHandlerRegistry",
                &format!("deleting unknown client handler {}", handler_id),
            );
        };
        info!(
            "ClientHandlerRegistry: deleted client handler {} for {}",
            handler_id,
            display_name(&entry.client_name_for_log)
        );
        drop(entry);

        let dispatch = Arc::clone(&self.dispatch);
        tokio::spawn(async move { dispatch.on_handler_deleted(handler_id).await });
    }
}

fn display_name(client_name_for_log: &str) -> &str {
    if client_name_for_log.is_empty() {
        "ourselves"
    } else {
        client_name_for_log
    }
}
