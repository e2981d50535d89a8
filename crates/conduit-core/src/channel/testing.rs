//! Test double: a channel that records outgoing messages and lets the test
//! inject incoming ones.

use super::{
    ensure_open, ChannelCore, DisposeCallback, DisposeCallbackKey, MessageChannel, ServiceHandler,
};
use crate::Result;
use serde_json::Value;
use std::sync::Mutex;

pub(crate) struct RecordingChannel {
    core: ChannelCore,
    sent: Mutex<Vec<(String, Value)>>,
}

impl RecordingChannel {
    pub(crate) fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            core: ChannelCore::new("recording"),
            sent: Mutex::new(Vec::new()),
        })
    }

    /// Simulate a message arriving from the peer.
    pub(crate) fn receive(&self, service: &str, payload: Value) {
        self.core.deliver(service, payload);
    }

    /// `(registered services, pending dispose callbacks)`.
    pub(crate) fn registrations(&self) -> (usize, usize) {
        (self.core.service_count(), self.core.dispose_callback_count())
    }

    pub(crate) fn sent(&self) -> Vec<(String, Value)> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn sent_services(&self) -> Vec<String> {
        self.sent().into_iter().map(|(service, _)| service).collect()
    }

    pub(crate) fn sent_to(&self, service: &str) -> Vec<Value> {
        self.sent()
            .into_iter()
            .filter(|(s, _)| s == service)
            .map(|(_, payload)| payload)
            .collect()
    }
}

impl MessageChannel for RecordingChannel {
    fn send(&self, service: &str, payload: Value) -> Result<()> {
        ensure_open(&self.core)?;
        self.sent.lock().unwrap().push((service.to_string(), payload));
        Ok(())
    }

    fn register_service(&self, service: &str, handler: ServiceHandler) {
        self.core.register(service, handler);
    }

    fn unregister_service(&self, service: &str) {
        self.core.unregister(service);
    }

    fn dispose(&self) {
        self.core.dispose();
    }

    fn is_disposed(&self) -> bool {
        self.core.is_disposed()
    }

    fn add_on_dispose_callback(&self, callback: DisposeCallback) -> DisposeCallbackKey {
        self.core.add_on_dispose_callback(callback)
    }

    fn remove_on_dispose_callback(&self, key: DisposeCallbackKey) {
        self.core.remove_on_dispose_callback(key);
    }
}
