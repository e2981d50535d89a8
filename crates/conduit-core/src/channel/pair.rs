//! In-process pair of linked message channels.
//!
//! Whatever one end sends is delivered to the other end asynchronously, in
//! FIFO order, from a dedicated pump task per direction. Disposing either end
//! disposes both.

use super::{
    ensure_open, ChannelCore, DisposeCallback, DisposeCallbackKey, MessageChannel, ServiceHandler,
};
use crate::cancel::CancellationToken;
use crate::{ConduitError, Result};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

type Envelope = (String, Value);

struct PairShared {
    ends: [ChannelCore; 2],
    cancel: CancellationToken,
}

impl PairShared {
    fn dispose(&self) {
        self.cancel.cancel();
        for end in &self.ends {
            end.dispose();
        }
    }
}

/// Factory for two linked in-process channels.
pub struct MessageChannelPair;

impl MessageChannelPair {
    /// Create two linked channels named `"{name}/first"` and `"{name}/second"`.
    ///
    /// Must be called from within a tokio runtime: the pump tasks are spawned
    /// immediately.
    pub fn new(name: &str) -> (Arc<PairedChannel>, Arc<PairedChannel>) {
        let shared = Arc::new(PairShared {
            ends: [
                ChannelCore::new(format!("{}/first", name)),
                ChannelCore::new(format!("{}/second", name)),
            ],
            cancel: CancellationToken::new(),
        });

        let (first_tx, first_rx) = mpsc::unbounded_channel();
        let (second_tx, second_rx) = mpsc::unbounded_channel();

        // Messages sent by the first end are delivered to the second one and
        // vice versa.
        tokio::spawn(pump(Arc::clone(&shared), first_rx, 1));
        tokio::spawn(pump(Arc::clone(&shared), second_rx, 0));

        (
            Arc::new(PairedChannel {
                shared: Arc::clone(&shared),
                index: 0,
                outbox: first_tx,
            }),
            Arc::new(PairedChannel {
                shared,
                index: 1,
                outbox: second_tx,
            }),
        )
    }
}

async fn pump(shared: Arc<PairShared>, mut inbox: mpsc::UnboundedReceiver<Envelope>, target: usize) {
    loop {
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            envelope = inbox.recv() => match envelope {
                Some((service, payload)) => shared.ends[target].deliver(&service, payload),
                None => break,
            },
        }
    }
    trace!("{}: pump task finished", shared.ends[target].name());
}

/// One end of a [`MessageChannelPair`].
pub struct PairedChannel {
    shared: Arc<PairShared>,
    index: usize,
    outbox: mpsc::UnboundedSender<Envelope>,
}

impl PairedChannel {
    fn core(&self) -> &ChannelCore {
        &self.shared.ends[self.index]
    }
}

impl MessageChannel for PairedChannel {
    fn send(&self, service: &str, payload: Value) -> Result<()> {
        ensure_open(self.core())?;
        trace!("{}: sending message for service \"{}\"", self.core().name(), service);
        self.outbox
            .send((service.to_string(), payload))
            .map_err(|_| ConduitError::ChannelDisposed)
    }

    fn register_service(&self, service: &str, handler: ServiceHandler) {
        self.core().register(service, handler);
    }

    fn unregister_service(&self, service: &str) {
        self.core().unregister(service);
    }

    fn dispose(&self) {
        self.shared.dispose();
    }

    fn is_disposed(&self) -> bool {
        self.core().is_disposed()
    }

    fn add_on_dispose_callback(&self, callback: DisposeCallback) -> DisposeCallbackKey {
        self.core().add_on_dispose_callback(callback)
    }

    fn remove_on_dispose_callback(&self, key: DisposeCallbackKey) {
        self.core().remove_on_dispose_callback(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_messages_delivered_in_order() {
        let (first, second) = MessageChannelPair::new("test");
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        second.register_service("svc", Arc::new(move |v| sink.lock().unwrap().push(v)));

        for i in 0..5 {
            first.send("svc", json!(i)).unwrap();
        }
        settle().await;

        assert_eq!(
            *received.lock().unwrap(),
            (0..5).map(|i| json!(i)).collect::<Vec<_>>()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_is_asynchronous() {
        let (first, second) = MessageChannelPair::new("test");
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        second.register_service("svc", Arc::new(move |v| sink.lock().unwrap().push(v)));

        first.send("svc", json!("hello")).unwrap();
        assert!(received.lock().unwrap().is_empty());

        settle().await;
        assert_eq!(received.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_closes_both_ends() {
        let (first, second) = MessageChannelPair::new("test");
        let notified = Arc::new(Mutex::new(false));
        let flag = notified.clone();
        second.add_on_dispose_callback(Box::new(move || *flag.lock().unwrap() = true));

        first.dispose();

        assert!(first.is_disposed());
        assert!(second.is_disposed());
        assert!(*notified.lock().unwrap());
        assert_eq!(
            second.send("svc", Value::Null),
            Err(ConduitError::ChannelDisposed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_messages_dropped_after_dispose() {
        let (first, second) = MessageChannelPair::new("test");
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        second.register_service("svc", Arc::new(move |v| sink.lock().unwrap().push(v)));

        first.send("svc", json!(1)).unwrap();
        second.dispose();
        settle().await;

        assert!(received.lock().unwrap().is_empty());
    }
}
