//! Message channels: the transport capability every other layer builds on.
//!
//! A channel is a bidirectional, named-service multiplexed transport between
//! two endpoints. Messages sent on one channel are delivered to the other end
//! in FIFO order and dispatched to the handler registered for their service.
//!
//! # Implementations
//!
//! - [`MessageChannelPair`]: two in-process channels linked to each other
//! - [`StreamChannel`]: length-prefixed JSON frames over a tokio byte stream
//!
//! Both are built on [`ChannelCore`], which owns the service registry and the
//! disposal bookkeeping.

pub mod pair;
pub mod stream;

#[cfg(test)]
pub(crate) mod testing;

pub use pair::{MessageChannelPair, PairedChannel};
pub use stream::StreamChannel;

use crate::{ConduitError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace, warn};

/// Handler invoked with the payload of every message received for a service.
pub type ServiceHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Callback run exactly once when a channel is disposed.
pub type DisposeCallback = Box<dyn FnOnce() + Send>;

/// Identifies a registered dispose callback so it can be removed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DisposeCallbackKey(u64);

/// Capability interface of a message channel.
///
/// Implementations must never invoke service handlers or dispose callbacks
/// synchronously from inside [`MessageChannel::send`]; delivery always
/// happens from the transport's own task.
pub trait MessageChannel: Send + Sync {
    /// Send `payload` to the service named `service` on the other end.
    ///
    /// Fails with [`ConduitError::ChannelDisposed`] once the channel is disposed.
    fn send(&self, service: &str, payload: Value) -> Result<()>;

    /// Register the handler for messages addressed to `service`.
    ///
    /// Registering a service twice replaces the previous handler.
    fn register_service(&self, service: &str, handler: ServiceHandler);

    /// Remove the handler of `service`; later messages for it are dropped.
    fn unregister_service(&self, service: &str);

    /// Close the channel. Idempotent.
    fn dispose(&self);

    /// Whether the channel has been disposed.
    fn is_disposed(&self) -> bool;

    /// Run `callback` when the channel is disposed, or immediately if it
    /// already is.
    fn add_on_dispose_callback(&self, callback: DisposeCallback) -> DisposeCallbackKey;

    /// Forget a callback that has not run yet. Unknown keys are ignored.
    fn remove_on_dispose_callback(&self, key: DisposeCallbackKey);
}

#[derive(Default)]
struct CoreState {
    services: HashMap<String, ServiceHandler>,
    next_callback_key: u64,
    dispose_callbacks: Vec<(DisposeCallbackKey, DisposeCallback)>,
}

/// Service registry and disposal bookkeeping shared by channel implementations.
pub struct ChannelCore {
    name: String,
    disposed: AtomicBool,
    state: Mutex<CoreState>,
}

impl ChannelCore {
    /// Create a core; `name` is used in log lines only.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            disposed: AtomicBool::new(false),
            state: Mutex::new(CoreState::default()),
        }
    }

    /// Name used in log lines.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a service handler.
    pub fn register(&self, service: &str, handler: ServiceHandler) {
        if self.is_disposed() {
            debug!(
                "{}: ignoring registration of service \"{}\" on a disposed channel",
                self.name, service
            );
            return;
        }
        if self
            .lock()
            .services
            .insert(service.to_string(), handler)
            .is_some()
        {
            debug!("{}: replaced handler of service \"{}\"", self.name, service);
        }
    }

    /// Remove a service handler.
    pub fn unregister(&self, service: &str) {
        if self.lock().services.remove(service).is_some() {
            trace!("{}: unregistered service \"{}\"", self.name, service);
        }
    }

    /// Number of registered services.
    pub fn service_count(&self) -> usize {
        self.lock().services.len()
    }

    /// Number of dispose callbacks still waiting to run.
    pub fn dispose_callback_count(&self) -> usize {
        self.lock().dispose_callbacks.len()
    }

    /// Dispatch a received message to its service handler.
    ///
    /// The handler runs without any channel lock held, so it may freely send,
    /// register services, or dispose the channel.
    pub fn deliver(&self, service: &str, payload: Value) {
        if self.is_disposed() {
            debug!(
                "{}: dropping message for service \"{}\": channel is disposed",
                self.name, service
            );
            return;
        }
        let handler = self.lock().services.get(service).cloned();
        match handler {
            Some(handler) => handler(payload),
            None => warn!(
                "{}: no handler registered for service \"{}\", dropping the message",
                self.name, service
            ),
        }
    }

    /// Whether the core has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Run `callback` on disposal, or right away if already disposed.
    pub fn add_on_dispose_callback(&self, callback: DisposeCallback) -> DisposeCallbackKey {
        let key = {
            let mut state = self.lock();
            let key = DisposeCallbackKey(state.next_callback_key);
            state.next_callback_key += 1;
            if !self.is_disposed() {
                state.dispose_callbacks.push((key, callback));
                return key;
            }
            key
        };
        callback();
        key
    }

    /// Drop a pending dispose callback without running it.
    pub fn remove_on_dispose_callback(&self, key: DisposeCallbackKey) {
        self.lock()
            .dispose_callbacks
            .retain(|(registered, _)| *registered != key);
    }

    /// Mark the core disposed, drop every service handler and run the dispose
    /// callbacks in registration order.
    ///
    /// Returns `true` only for the call that performed the disposal.
    pub fn dispose(&self) -> bool {
        let (services, callbacks) = {
            let mut state = self.lock();
            if self.disposed.swap(true, Ordering::SeqCst) {
                return false;
            }
            (
                std::mem::take(&mut state.services),
                std::mem::take(&mut state.dispose_callbacks),
            )
        };
        // Handlers usually capture the components listening on this channel;
        // dropping them here breaks channel <-> component reference cycles.
        drop(services);
        debug!("{}: disposed", self.name);
        for (_, callback) in callbacks {
            callback();
        }
        true
    }
}

/// Fail with [`ConduitError::ChannelDisposed`] if `core` is disposed.
pub(crate) fn ensure_open(core: &ChannelCore) -> Result<()> {
    if core.is_disposed() {
        Err(ConduitError::ChannelDisposed)
    } else {
        Ok(())
    }
}
