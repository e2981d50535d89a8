//! TCP relay server.
//!
//! Owns one in-process server (backend, client handler registry, ping
//! responder) reached through an in-memory channel pair, and a TCP listener.
//! Every accepted connection becomes a stream channel served by its own
//! [`ClientHandler`], identified to the permission checker as
//! `tcp://<peer ip>`.

use conduit_core::{
    announce_ready, ClientHandler, ClientHandlerRegistry, InvalidMessagePolicy, LivenessConfig,
    MessageChannel, MessageChannelPair, PermissionsChecker, PingResponder, Pinger,
    ReadinessTracker, RemoteCallDispatch, ServerConnection, StreamChannel,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Maximum number of simultaneously connected clients.
pub const MAX_CLIENTS: usize = 64;

/// Listener settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    pub liveness: LivenessConfig,
}

/// The privileged side, kept alive for the relay's lifetime.
struct InProcessServer {
    connection: ServerConnection,
    _server_end: Arc<dyn MessageChannel>,
    _registry: ClientHandlerRegistry,
    _responder: PingResponder,
    _tracker: ReadinessTracker,
    _pinger: Pinger,
}

impl InProcessServer {
    fn start(backend: Arc<dyn RemoteCallDispatch>, liveness: LivenessConfig) -> Self {
        let (app_end, server_end) = MessageChannelPair::new("server");
        let app_end: Arc<dyn MessageChannel> = app_end;
        let server_end: Arc<dyn MessageChannel> = server_end;

        let tracker = ReadinessTracker::new(Arc::clone(&app_end));
        let pinger = Pinger::new(
            Arc::clone(&app_end),
            liveness,
            Some(Box::new(|| debug!("Server liveness established"))),
        );

        let responder = PingResponder::new(Arc::clone(&server_end));
        let registry = ClientHandlerRegistry::new(Arc::clone(&server_end), backend);
        if let Err(e) = announce_ready(server_end.as_ref()) {
            warn!("Failed to announce server readiness: {}", e);
        }

        app_end.add_on_dispose_callback(Box::new(|| {
            warn!("Server channel closed, clients will be disconnected");
        }));

        Self {
            connection: ServerConnection::new(app_end, tracker.signal()),
            _server_end: server_end,
            _registry: registry,
            _responder: responder,
            _tracker: tracker,
            _pinger: pinger,
        }
    }
}

/// Client handlers of the currently connected clients, by handler id.
#[derive(Default)]
struct ClientTable {
    clients: Mutex<HashMap<u64, ClientHandler>>,
}

impl ClientTable {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, ClientHandler>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn len(&self) -> usize {
        self.lock().len()
    }

    fn insert(self: &Arc<Self>, handler: ClientHandler, channel: &dyn MessageChannel) {
        let id = handler.id();
        self.lock().insert(id, handler);

        let table: Weak<Self> = Arc::downgrade(self);
        channel.add_on_dispose_callback(Box::new(move || {
            if let Some(table) = table.upgrade() {
                let removed = table.lock().remove(&id);
                if removed.is_some() {
                    debug!("Client {} removed, {} left", id, table.len());
                }
            }
        }));
    }

    fn dispose_all(&self) {
        let handlers: Vec<ClientHandler> = self.lock().drain().map(|(_, h)| h).collect();
        for handler in handlers {
            handler.dispose();
        }
    }
}

/// Handle to a running relay. Dropping shuts it down.
pub struct RelayHandle {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
    clients: Arc<ClientTable>,
    server: InProcessServer,
}

impl RelayHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Stop accepting connections and disconnect every client.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
            self.clients.dispose_all();
            self.server.connection.channel.dispose();
        }
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Start the relay.
///
/// Returns once the listener is bound; connections are served by background
/// tasks.
pub async fn start_relay(
    config: RelayConfig,
    backend: Arc<dyn RemoteCallDispatch>,
    checker: Arc<dyn PermissionsChecker>,
) -> anyhow::Result<RelayHandle> {
    config.liveness.validate()?;
    let server = InProcessServer::start(backend, config.liveness);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    let addr = listener.local_addr()?;
    info!("Relay listening on {}", addr);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let clients = Arc::new(ClientTable::default());
    let task_handle = tokio::spawn(accept_loop(
        listener,
        server.connection.clone(),
        checker,
        Arc::clone(&clients),
        shutdown_rx,
    ));

    Ok(RelayHandle {
        addr,
        shutdown_tx: Some(shutdown_tx),
        task_handle: Some(task_handle),
        clients,
        server,
    })
}

async fn accept_loop(
    listener: TcpListener,
    connection: ServerConnection,
    checker: Arc<dyn PermissionsChecker>,
    clients: Arc<ClientTable>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                info!("Relay shutting down");
                break;
            }
            accept_result = listener.accept() => {
                let (stream, peer_addr) = match accept_result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Relay accept error: {}", e);
                        continue;
                    }
                };
                if connection.channel.is_disposed() {
                    warn!("Rejecting client {}: the server is gone", peer_addr);
                    continue;
                }
                if clients.len() >= MAX_CLIENTS {
                    warn!(
                        "Rejecting client {}: at max capacity ({})",
                        peer_addr, MAX_CLIENTS
                    );
                    continue;
                }

                let channel = StreamChannel::from_tcp(
                    format!("client {}", peer_addr),
                    stream,
                    InvalidMessagePolicy::DisposeChannel,
                );
                let handler = ClientHandler::new(
                    &connection,
                    channel.clone(),
                    Some(format!("tcp://{}", peer_addr.ip())),
                    Arc::clone(&checker),
                );
                info!("Client {} connected as handler {}", peer_addr, handler.id());
                clients.insert(handler, channel.as_ref());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DemoBackend;
    use crate::prompt::StaticPrompt;
    use conduit_core::messaging::encode_call;
    use conduit_core::permissions::{
        ManagedRegistry, MemoryDecisionStore, TrustedClientsRegistry, UserPromptingChecker,
    };
    use conduit_core::{ConduitError, PermissionCache, PolicyOrPromptingChecker, Requester};
    use serde_json::json;
    use std::time::Duration;
    use tokio::net::TcpStream;

    fn checker(allowed: &[&str], grant: bool) -> Arc<dyn PermissionsChecker> {
        let user = UserPromptingChecker::new(
            Arc::new(TrustedClientsRegistry::new()),
            Arc::new(MemoryDecisionStore::new()),
            Arc::new(StaticPrompt::new(grant)),
        );
        Arc::new(PolicyOrPromptingChecker::new(
            Arc::new(PermissionCache::new()),
            Arc::new(ManagedRegistry::with_origins(allowed.iter().copied())),
            Arc::new(user),
        ))
    }

    async fn start(checker: Arc<dyn PermissionsChecker>) -> RelayHandle {
        let config = RelayConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            liveness: LivenessConfig::default(),
        };
        start_relay(config, Arc::new(DemoBackend::new()), checker)
            .await
            .unwrap()
    }

    async fn connect(relay: &RelayHandle) -> (Arc<StreamChannel>, Requester) {
        let stream = TcpStream::connect(relay.addr()).await.unwrap();
        let channel = StreamChannel::from_tcp("test client", stream, InvalidMessagePolicy::Abort);
        let requester = Requester::new("conduit", channel.clone());
        (channel, requester)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_allowed_client_round_trip() {
        let relay = start(checker(&["tcp://127.0.0.1"], false)).await;
        let (_channel, requester) = connect(&relay).await;

        let sum = requester
            .post_request(encode_call("add", vec![json!(2), json!(3)]))
            .await
            .unwrap();
        assert_eq!(sum, json!(5.0));

        let error = requester
            .post_request(encode_call("fail", vec![json!("no reader")]))
            .await
            .unwrap_err();
        assert_eq!(error, ConduitError::remote("no reader"));
        assert_eq!(relay.client_count(), 1);
    }

    #[tokio::test]
    async fn test_rejected_client() {
        let relay = start(checker(&[], false)).await;
        let (_channel, requester) = connect(&relay).await;

        let error = requester
            .post_request(encode_call("echo", vec![]))
            .await
            .unwrap_err();
        assert!(error.to_string().contains("Permission denied"));
    }

    #[tokio::test]
    async fn test_disconnect_removes_client() {
        let relay = start(checker(&["tcp://127.0.0.1"], false)).await;
        let (channel, requester) = connect(&relay).await;
        requester
            .post_request(encode_call("echo", vec![]))
            .await
            .unwrap();
        assert_eq!(relay.client_count(), 1);

        channel.dispose();
        wait_until(|| relay.client_count() == 0).await;
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_clients() {
        let mut relay = start(checker(&["tcp://127.0.0.1"], false)).await;
        let (channel, requester) = connect(&relay).await;
        requester
            .post_request(encode_call("echo", vec![]))
            .await
            .unwrap();

        relay.shutdown();
        assert_eq!(relay.client_count(), 0);
        wait_until(|| channel.is_disposed()).await;
    }
}
