//! Ping/pong liveness protocol.
//!
//! The [`Pinger`] sits on the side that needs to know whether its peer is
//! still alive. It sends a ping right after construction and then every
//! `interval`, and disposes the channel once no qualifying pong arrived for
//! `timeout`. The [`PingResponder`] sits on the other side and answers every
//! ping with a pong carrying a random id fixed for its lifetime. A change of
//! that id means the peer was replaced (for example reloaded), which is
//! treated like a dead peer.

use crate::cancel::CancellationToken;
use crate::channel::{DisposeCallbackKey, MessageChannel};
use crate::config::{LivenessConfig, ProtocolConfig, ServiceNames};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Callback fired once, on the first pong.
pub type EstablishedCallback = Box<dyn FnOnce() + Send>;

/// Why a pinger stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisposeReason {
    /// No qualifying pong within the timeout.
    TimedOut,
    /// A pong carried a different channel id than the first one.
    ChannelIdMismatch,
    /// A pong payload without a numeric channel id.
    MalformedPong,
    /// The underlying channel was disposed by someone else.
    ChannelClosed,
    /// [`Pinger::dispose`] was called or the pinger was dropped.
    Explicit,
}

/// Lifecycle of a [`Pinger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingerState {
    AwaitingFirstPong,
    Established,
    Disposed(DisposeReason),
}

struct PingerShared {
    state: PingerState,
    remote_channel_id: Option<u64>,
    on_established: Option<EstablishedCallback>,
    dispose_key: Option<DisposeCallbackKey>,
}

struct PingerInner {
    channel: Arc<dyn MessageChannel>,
    config: LivenessConfig,
    cancel: CancellationToken,
    alive: mpsc::UnboundedSender<()>,
    shared: Mutex<PingerShared>,
}

enum PongOutcome {
    First(Option<EstablishedCallback>),
    Alive,
    Mismatch { expected: u64, received: u64 },
}

/// Liveness watchdog over a channel.
///
/// Dropping the pinger stops it without touching the channel.
pub struct Pinger {
    inner: Arc<PingerInner>,
}

impl Pinger {
    /// Start pinging over `channel`.
    ///
    /// The first ping goes out on the next scheduler tick; the timeout starts
    /// counting right now. Must be called from within a tokio runtime.
    pub fn new(
        channel: Arc<dyn MessageChannel>,
        config: LivenessConfig,
        on_established: Option<EstablishedCallback>,
    ) -> Self {
        let (alive, alive_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(PingerInner {
            channel: Arc::clone(&channel),
            config,
            cancel: CancellationToken::new(),
            alive,
            shared: Mutex::new(PingerShared {
                state: PingerState::AwaitingFirstPong,
                remote_channel_id: None,
                on_established,
                dispose_key: None,
            }),
        });

        let weak = Arc::downgrade(&inner);
        channel.register_service(
            ServiceNames::PONG,
            Arc::new(move |payload| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_pong(payload);
                }
            }),
        );
        let weak = Arc::downgrade(&inner);
        let key = channel.add_on_dispose_callback(Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.dispose(DisposeReason::ChannelClosed);
            }
        }));
        if !inner.cancel.is_cancelled() {
            inner.lock().dispose_key = Some(key);
        }

        let deadline = Instant::now() + config.timeout;
        tokio::spawn(run(Arc::downgrade(&inner), inner.cancel.clone(), alive_rx, deadline));
        Self { inner }
    }

    /// Send a ping now, outside of the regular schedule.
    pub fn post_ping(&self) {
        self.inner.post_ping();
    }

    pub fn state(&self) -> PingerState {
        self.inner.lock().state
    }

    /// Channel id of the responder, once the first pong arrived.
    pub fn remote_channel_id(&self) -> Option<u64> {
        self.inner.lock().remote_channel_id
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Stop pinging. The channel itself stays open.
    pub fn dispose(&self) {
        self.inner.dispose(DisposeReason::Explicit);
    }
}

impl Drop for Pinger {
    fn drop(&mut self) {
        self.inner.dispose(DisposeReason::Explicit);
    }
}

impl PingerInner {
    fn lock(&self) -> MutexGuard<'_, PingerShared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn post_ping(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        trace!("Pinger: sending a ping request");
        if let Err(e) = self.channel.send(ServiceNames::PING, json!({})) {
            debug!("Pinger: failed to send a ping: {}", e);
        }
    }

    fn on_pong(&self, payload: Value) {
        if self.cancel.is_cancelled() {
            return;
        }
        let Some(channel_id) = payload
            .get(ProtocolConfig::CHANNEL_ID_KEY)
            .and_then(Value::as_u64)
        else {
            warn!("Pinger: received a malformed pong: {}", payload);
            self.dispose_channel_and_self(DisposeReason::MalformedPong);
            return;
        };

        let outcome = {
            let mut shared = self.lock();
            match shared.remote_channel_id {
                None => {
                    shared.remote_channel_id = Some(channel_id);
                    shared.state = PingerState::Established;
                    PongOutcome::First(shared.on_established.take())
                }
                Some(expected) if expected == channel_id => PongOutcome::Alive,
                Some(expected) => PongOutcome::Mismatch {
                    expected,
                    received: channel_id,
                },
            }
        };

        match outcome {
            PongOutcome::First(callback) => {
                debug!(
                    "Pinger: received the first pong (remote channel id is {}), \
                     the message channel is considered established",
                    channel_id
                );
                if let Some(callback) = callback {
                    callback();
                }
            }
            PongOutcome::Alive => {
                trace!("Pinger: received a pong, the other side is alive");
                let _ = self.alive.send(());
            }
            PongOutcome::Mismatch { expected, received } => {
                warn!(
                    "Pinger: received a pong with a different channel id ({}, expected {}), \
                     the other side was probably reloaded, disposing...",
                    received, expected
                );
                self.dispose_channel_and_self(DisposeReason::ChannelIdMismatch);
            }
        }
    }

    fn on_timeout(&self) {
        warn!(
            "Pinger: no pong was received within {:?}, disposing...",
            self.config.timeout
        );
        self.dispose_channel_and_self(DisposeReason::TimedOut);
    }

    fn dispose_channel_and_self(&self, reason: DisposeReason) {
        // Record our own reason first: the channel's dispose callback would
        // otherwise report ChannelClosed.
        self.dispose(reason);
        self.channel.dispose();
    }

    fn dispose(&self, reason: DisposeReason) {
        if !self.cancel.cancel() {
            return;
        }
        let (callback, dispose_key) = {
            let mut shared = self.lock();
            shared.state = PingerState::Disposed(reason);
            (shared.on_established.take(), shared.dispose_key.take())
        };
        drop(callback);
        self.channel.unregister_service(ServiceNames::PONG);
        if let Some(key) = dispose_key {
            self.channel.remove_on_dispose_callback(key);
        }
        debug!("Pinger: disposed ({:?})", reason);
    }
}

async fn run(
    inner: Weak<PingerInner>,
    cancel: CancellationToken,
    mut alive: mpsc::UnboundedReceiver<()>,
    deadline: Instant,
) {
    let timeout = sleep_until(deadline);
    tokio::pin!(timeout);

    tokio::task::yield_now().await;
    let Some(interval) = with_inner(&inner, |inner| {
        inner.post_ping();
        inner.config.interval
    }) else {
        return;
    };

    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = &mut timeout => {
                with_inner(&inner, |inner| inner.on_timeout());
                return;
            }
            Some(()) = alive.recv() => {
                let timeout_after = with_inner(&inner, |inner| inner.config.timeout);
                match timeout_after {
                    Some(after) => timeout.as_mut().reset(Instant::now() + after),
                    None => return,
                }
            }
            _ = ticker.tick() => {
                if with_inner(&inner, |inner| inner.post_ping()).is_none() {
                    return;
                }
            }
        }
    }
}

fn with_inner<T>(inner: &Weak<PingerInner>, f: impl FnOnce(&PingerInner) -> T) -> Option<T> {
    inner.upgrade().map(|inner| f(&inner))
}

struct ResponderInner {
    channel: Arc<dyn MessageChannel>,
    channel_id: u64,
    disposed: AtomicBool,
    on_ping: Option<Box<dyn Fn() + Send + Sync>>,
}

/// Answers pings with pongs carrying a per-instance random channel id.
pub struct PingResponder {
    inner: Arc<ResponderInner>,
}

impl PingResponder {
    pub fn new(channel: Arc<dyn MessageChannel>) -> Self {
        Self::build(channel, None)
    }

    /// Like [`PingResponder::new`], additionally calling `on_ping` after every
    /// answered ping.
    pub fn with_ping_listener(
        channel: Arc<dyn MessageChannel>,
        on_ping: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self::build(channel, Some(Box::new(on_ping)))
    }

    fn build(
        channel: Arc<dyn MessageChannel>,
        on_ping: Option<Box<dyn Fn() + Send + Sync>>,
    ) -> Self {
        let inner = Arc::new(ResponderInner {
            channel: Arc::clone(&channel),
            channel_id: generate_channel_id(),
            disposed: AtomicBool::new(false),
            on_ping,
        });
        let weak = Arc::downgrade(&inner);
        channel.register_service(
            ServiceNames::PING,
            Arc::new(move |_| {
                if let Some(inner) = weak.upgrade() {
                    inner.on_ping();
                }
            }),
        );
        info!(
            "PingResponder: initialized with channel id {}",
            inner.channel_id
        );
        Self { inner }
    }

    pub fn channel_id(&self) -> u64 {
        self.inner.channel_id
    }

    /// Stop answering pings.
    pub fn dispose(&self) {
        if !self.inner.disposed.swap(true, Ordering::SeqCst) {
            debug!("PingResponder: disposed");
        }
    }
}

impl ResponderInner {
    fn on_ping(&self) {
        if self.disposed.load(Ordering::SeqCst) || self.channel.is_disposed() {
            return;
        }
        trace!("PingResponder: received a ping, sending a pong");
        if let Err(e) = self.channel.send(
            ServiceNames::PONG,
            json!({ "channel_id": self.channel_id }),
        ) {
            debug!("PingResponder: failed to send a pong: {}", e);
        }
        if let Some(on_ping) = &self.on_ping {
            on_ping();
        }
    }
}

/// Random id identifying one responder instance.
pub fn generate_channel_id() -> u64 {
    u64::from(rand::random::<u32>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::RecordingChannel;
    use crate::channel::MessageChannelPair;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn config() -> LivenessConfig {
        LivenessConfig::new(Duration::from_millis(200), Duration::from_millis(400)).unwrap()
    }

    fn pong(id: u64) -> Value {
        json!({ "channel_id": id })
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_ping_sent_on_next_tick() {
        let channel = RecordingChannel::new();
        let _pinger = Pinger::new(channel.clone(), config(), None);
        assert!(channel.sent().is_empty());

        settle().await;
        assert_eq!(channel.sent_services(), vec!["ping"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let channel = RecordingChannel::new();
        let pinger = Pinger::new(channel.clone(), config(), None);
        let start = Instant::now();

        settle().await;
        assert_eq!(channel.sent_to("ping").len(), 1);

        tokio::time::sleep_until(start + Duration::from_millis(250)).await;
        assert_eq!(channel.sent_to("ping").len(), 2);
        assert!(!channel.is_disposed());

        tokio::time::sleep_until(start + Duration::from_millis(401)).await;
        assert!(channel.is_disposed());
        assert_eq!(channel.sent_to("ping").len(), 2);
        assert_eq!(
            pinger.state(),
            PingerState::Disposed(DisposeReason::TimedOut)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pongs_keep_channel_alive() {
        let channel = RecordingChannel::new();
        let established = Arc::new(AtomicUsize::new(0));
        let counter = established.clone();
        let pinger = Pinger::new(
            channel.clone(),
            config(),
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );

        for _ in 0..10 {
            settle().await;
            channel.receive("pong", pong(42));
            tokio::time::sleep(Duration::from_millis(150)).await;
        }

        assert!(!channel.is_disposed());
        assert_eq!(pinger.state(), PingerState::Established);
        assert_eq!(pinger.remote_channel_id(), Some(42));
        assert_eq!(established.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_pong_does_not_reset_timeout() {
        let channel = RecordingChannel::new();
        let _pinger = Pinger::new(channel.clone(), config(), None);
        let start = Instant::now();

        tokio::time::sleep_until(start + Duration::from_millis(300)).await;
        channel.receive("pong", pong(1));

        tokio::time::sleep_until(start + Duration::from_millis(401)).await;
        assert!(channel.is_disposed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_id_mismatch_disposes() {
        let channel = RecordingChannel::new();
        let pinger = Pinger::new(channel.clone(), config(), None);
        settle().await;

        channel.receive("pong", pong(1));
        assert!(!channel.is_disposed());
        channel.receive("pong", pong(2));

        assert!(channel.is_disposed());
        assert_eq!(
            pinger.state(),
            PingerState::Disposed(DisposeReason::ChannelIdMismatch)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_pong_disposes() {
        let channel = RecordingChannel::new();
        let pinger = Pinger::new(channel.clone(), config(), None);
        settle().await;

        channel.receive("pong", json!({ "channel_id": "abc" }));

        assert!(channel.is_disposed());
        assert_eq!(
            pinger.state(),
            PingerState::Disposed(DisposeReason::MalformedPong)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_failure_disposes_once_and_never_times_out() {
        let bad_pongs = [
            (pong(2), DisposeReason::ChannelIdMismatch),
            (json!({ "channel_id": null }), DisposeReason::MalformedPong),
        ];
        for (bad_pong, reason) in bad_pongs {
            let channel = RecordingChannel::new();
            let pinger = Pinger::new(channel.clone(), config(), None);
            let disposals = Arc::new(AtomicUsize::new(0));
            let counter = disposals.clone();
            channel.add_on_dispose_callback(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
            settle().await;

            channel.receive("pong", pong(1));
            channel.receive("pong", bad_pong);
            assert_eq!(pinger.state(), PingerState::Disposed(reason));
            let pings = channel.sent_to("ping").len();

            // Well past the timeout and several intervals.
            tokio::time::sleep(Duration::from_secs(2)).await;

            assert_eq!(pinger.state(), PingerState::Disposed(reason));
            assert_eq!(disposals.load(Ordering::SeqCst), 1);
            assert_eq!(channel.sent_to("ping").len(), pings);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_releases_channel_registrations() {
        let channel = RecordingChannel::new();
        let pinger = Pinger::new(channel.clone(), config(), None);
        assert_eq!(channel.registrations(), (1, 1));

        pinger.dispose();
        assert_eq!(channel.registrations(), (0, 0));
        assert!(!channel.is_disposed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_channel_dispose_stops_pinger() {
        let channel = RecordingChannel::new();
        let pinger = Pinger::new(channel.clone(), config(), None);
        settle().await;

        channel.dispose();
        assert_eq!(
            pinger.state(),
            PingerState::Disposed(DisposeReason::ChannelClosed)
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(channel.sent_to("ping").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_pinger_leaves_channel_open() {
        let channel = RecordingChannel::new();
        let pinger = Pinger::new(channel.clone(), config(), None);
        settle().await;
        drop(pinger);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!channel.is_disposed());
        assert_eq!(channel.sent_to("ping").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_responder_answers_with_stable_id() {
        let channel = RecordingChannel::new();
        let pings = Arc::new(AtomicUsize::new(0));
        let counter = pings.clone();
        let responder = PingResponder::with_ping_listener(channel.clone(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        channel.receive("ping", json!({}));
        channel.receive("ping", json!({}));

        let pongs = channel.sent_to("pong");
        assert_eq!(pongs.len(), 2);
        assert_eq!(pongs[0], pong(responder.channel_id()));
        assert_eq!(pongs[0], pongs[1]);
        assert_eq!(pings.load(Ordering::SeqCst), 2);

        responder.dispose();
        channel.receive("ping", json!({}));
        assert_eq!(channel.sent_to("pong").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pinger_and_responder_over_pair() {
        let (near, far) = MessageChannelPair::new("liveness");
        let responder = PingResponder::new(far.clone());
        let pinger = Pinger::new(near.clone(), config(), None);

        tokio::time::sleep(Duration::from_secs(5)).await;

        assert!(!near.is_disposed());
        assert_eq!(pinger.state(), PingerState::Established);
        assert_eq!(pinger.remote_channel_id(), Some(responder.channel_id()));
    }
}
