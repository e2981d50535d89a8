//! Server readiness signal.
//!
//! The server announces that it finished initialising by sending a
//! `server_ready` message on its channel. A [`ReadinessTracker`] on the other
//! end turns that message into a [`ReadinessSignal`] shared by every client
//! handler talking to that server.

use crate::channel::MessageChannel;
use crate::config::ServiceNames;
use crate::{ConduitError, Result};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessState {
    Pending,
    Ready,
    Failed(ConduitError),
}

/// Cloneable view of a readiness state.
#[derive(Clone)]
pub struct ReadinessSignal {
    receiver: watch::Receiver<ReadinessState>,
}

impl ReadinessSignal {
    /// A signal that is already resolved.
    pub fn ready() -> Self {
        let (_, receiver) = watch::channel(ReadinessState::Ready);
        Self { receiver }
    }

    pub fn state(&self) -> ReadinessState {
        self.receiver.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        *self.receiver.borrow() == ReadinessState::Ready
    }

    /// Wait until the signal settles.
    pub async fn wait(mut self) -> Result<()> {
        let settled = self
            .receiver
            .wait_for(|state| *state != ReadinessState::Pending)
            .await;
        match settled {
            Ok(state) => match &*state {
                ReadinessState::Failed(e) => Err(e.clone()),
                _ => Ok(()),
            },
            Err(_) => Err(ConduitError::ReadinessFailed {
                reason: "the readiness tracker was dropped".to_string(),
            }),
        }
    }
}

struct TrackerInner {
    state: watch::Sender<ReadinessState>,
}

impl TrackerInner {
    fn settle(&self, next: ReadinessState) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ReadinessState::Pending {
                *state = next;
                true
            } else {
                false
            }
        })
    }
}

/// Watches a server channel for the readiness announcement.
pub struct ReadinessTracker {
    inner: Arc<TrackerInner>,
}

impl ReadinessTracker {
    pub fn new(channel: Arc<dyn MessageChannel>) -> Self {
        let (state, _) = watch::channel(ReadinessState::Pending);
        let inner = Arc::new(TrackerInner { state });

        let weak = Arc::downgrade(&inner);
        channel.register_service(
            ServiceNames::SERVER_READY,
            Arc::new(move |_| {
                if let Some(inner) = weak.upgrade() {
                    if inner.settle(ReadinessState::Ready) {
                        info!("Server has started successfully");
                    }
                }
            }),
        );
        let weak = Arc::downgrade(&inner);
        channel.add_on_dispose_callback(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                let failed = ReadinessState::Failed(ConduitError::ReadinessFailed {
                    reason: "the server message channel was disposed".to_string(),
                });
                if inner.settle(failed) {
                    warn!("Server message channel was disposed before the server became ready");
                }
            }
        }));
        Self { inner }
    }

    pub fn signal(&self) -> ReadinessSignal {
        ReadinessSignal {
            receiver: self.inner.state.subscribe(),
        }
    }
}

/// Announce readiness to the peer of `channel`.
pub fn announce_ready(channel: &dyn MessageChannel) -> Result<()> {
    channel.send(ServiceNames::SERVER_READY, json!({}))
}
