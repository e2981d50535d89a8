//! Client handler multiplexer.
//!
//! Many untrusted clients share one trusted server channel. Each client gets
//! a [`ClientHandler`] that gates its requests on a permission check and on
//! server readiness, then forwards them over a dedicated requester on the
//! server channel. The server side answers through a
//! [`ClientHandlerRegistry`].

pub mod control;
pub mod handler;
pub mod registry;
pub mod server_request_handler;

pub use control::{CreateClientHandlerMessage, DeleteClientHandlerMessage};
pub use handler::{ClientHandler, ClientHandlerState};
pub use registry::{ClientHandlerRegistry, RemoteCallDispatch};
pub use server_request_handler::ServerRequestHandler;

use crate::channel::MessageChannel;
use crate::readiness::ReadinessSignal;
use std::sync::Arc;

/// The shared server channel together with its readiness signal.
#[derive(Clone)]
pub struct ServerConnection {
    pub channel: Arc<dyn MessageChannel>,
    pub readiness: ReadinessSignal,
}

impl ServerConnection {
    pub fn new(channel: Arc<dyn MessageChannel>, readiness: ReadinessSignal) -> Self {
        Self { channel, readiness }
    }
}
