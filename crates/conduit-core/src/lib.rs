//! Conduit Core - message-channel protocol stack for serving many untrusted
//! clients through one privileged server endpoint.
//!
//! Every endpoint talks through a [`MessageChannel`]: a named, service-keyed,
//! fire-and-forget message pipe that can be disposed at any time. On top of
//! that this crate provides:
//!
//! - typed envelopes and remote-call messages ([`messaging`])
//! - a ping/pong liveness protocol ([`liveness`])
//! - request/response correlation ([`requesting`])
//! - a gate that buffers work until a readiness signal resolves ([`deferred`])
//! - per-client multiplexing onto the shared server channel, gated by
//!   permission checks ([`clients`], [`permissions`])
//!
//! # Example
//!
//! ```rust,ignore
//! use conduit_core::{MessageChannelPair, Requester};
//! use serde_json::json;
//!
//! let (client_end, server_end) = MessageChannelPair::new("demo");
//! // ... serve "conduit" requests on `server_end` ...
//! let requester = Requester::new("conduit", client_end);
//! let reply = requester.post_request(json!({"function_name": "echo", "arguments": [1]})).await?;
//! ```

pub mod cancel;
pub mod channel;
pub mod clients;
pub mod config;
pub mod deferred;
pub mod error;
pub mod fatal;
pub mod liveness;
pub mod messaging;
pub mod permissions;
pub mod readiness;
pub mod requesting;

// Re-export commonly used types
pub use cancel::CancellationToken;
pub use channel::{MessageChannel, MessageChannelPair, PairedChannel, StreamChannel};
pub use clients::{
    ClientHandler, ClientHandlerRegistry, ClientHandlerState, RemoteCallDispatch,
    ServerConnection, ServerRequestHandler,
};
pub use config::{LivenessConfig, ProtocolConfig, ServiceNames};
pub use deferred::{DeferredPhase, DeferredProcessor, JobFuture};
pub use error::{ConduitError, Result};
pub use fatal::InvalidMessagePolicy;
pub use liveness::{PingResponder, Pinger, PingerState};
pub use messaging::{RemoteCallMessage, TypedMessage};
pub use permissions::{PermissionCache, PermissionsChecker, PolicyOrPromptingChecker};
pub use readiness::{announce_ready, ReadinessSignal, ReadinessState, ReadinessTracker};
pub use requesting::{ReplyFuture, RequestReceiver, Requester};
