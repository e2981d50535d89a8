//! Message channel over a tokio byte stream.
//!
//! Every message travels as one frame: a 4-byte big-endian length followed by
//! that many bytes of a JSON [`TypedMessage`]. A reader task decodes incoming
//! frames and dispatches them; a writer task drains the outgoing queue in FIFO
//! order. EOF, an I/O error or a dispose call tears the channel down.

use super::{
    ensure_open, ChannelCore, DisposeCallback, DisposeCallbackKey, MessageChannel, ServiceHandler,
};
use crate::cancel::CancellationToken;
use crate::config::ProtocolConfig;
use crate::fatal::InvalidMessagePolicy;
use crate::messaging::TypedMessage;
use crate::{ConduitError, Result};
use serde_json::Value;
use std::io::{self, ErrorKind};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

const LENGTH_PREFIX: usize = 4;

/// A [`MessageChannel`] speaking length-prefixed JSON frames.
pub struct StreamChannel {
    core: ChannelCore,
    outbox: mpsc::UnboundedSender<Vec<u8>>,
    cancel: CancellationToken,
    policy: InvalidMessagePolicy,
}

impl StreamChannel {
    /// Start a channel over the given read and write halves.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<R, W>(
        name: impl Into<String>,
        reader: R,
        writer: W,
        policy: InvalidMessagePolicy,
    ) -> Arc<Self>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbox, queue) = mpsc::unbounded_channel();
        let channel = Arc::new(Self {
            core: ChannelCore::new(name),
            outbox,
            cancel: CancellationToken::new(),
            policy,
        });

        tokio::spawn(read_loop(Arc::downgrade(&channel), channel.cancel.clone(), reader));
        tokio::spawn(write_loop(
            Arc::downgrade(&channel),
            channel.cancel.clone(),
            queue,
            writer,
        ));
        channel
    }

    /// Start a channel over an accepted or connected TCP stream.
    pub fn from_tcp(
        name: impl Into<String>,
        stream: TcpStream,
        policy: InvalidMessagePolicy,
    ) -> Arc<Self> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }
        let (reader, writer) = stream.into_split();
        Self::spawn(name, reader, writer, policy)
    }

    fn on_frame(&self, frame: &[u8]) {
        let message = serde_json::from_slice::<Value>(frame)
            .ok()
            .and_then(|value| TypedMessage::parse(&value));
        match message {
            Some(message) => {
                trace!(
                    "{}: received message for service \"{}\"",
                    self.core.name(),
                    message.service
                );
                self.core.deliver(&message.service, message.data);
            }
            None => self.policy.handle(
                self.core.name(),
                &format!("failed to decode a frame of {} bytes", frame.len()),
                self,
            ),
        }
    }
}

/// Encode one typed message as a complete frame, length prefix included.
fn encode_frame(service: &str, payload: Value) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(&TypedMessage::new(service, payload))?;
    if body.len() > ProtocolConfig::MAX_FRAME_SIZE {
        return Err(ConduitError::InvalidPayload {
            message: format!(
                "message for service \"{}\" is {} bytes, the frame limit is {}",
                service,
                body.len(),
                ProtocolConfig::MAX_FRAME_SIZE
            ),
        });
    }
    let mut frame = Vec::with_capacity(LENGTH_PREFIX + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Read the next frame body into `body`, reusing its allocation.
///
/// Returns `false` when the peer closed the stream between frames.
async fn read_frame_into<R>(reader: &mut R, body: &mut Vec<u8>) -> io::Result<bool>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(false),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(prefix) as usize;
    if len > ProtocolConfig::MAX_FRAME_SIZE {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            format!(
                "incoming frame of {} bytes exceeds the limit of {}",
                len,
                ProtocolConfig::MAX_FRAME_SIZE
            ),
        ));
    }
    body.resize(len, 0);
    reader.read_exact(body).await?;
    Ok(true)
}

async fn read_loop<R>(channel: Weak<StreamChannel>, cancel: CancellationToken, mut reader: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut body = Vec::new();
    loop {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            outcome = read_frame_into(&mut reader, &mut body) => outcome,
        };
        let Some(channel) = channel.upgrade() else {
            return;
        };
        match outcome {
            Ok(true) => {
                channel.on_frame(&body);
                if channel.is_disposed() {
                    return;
                }
            }
            Ok(false) => {
                debug!("{}: peer closed the stream", channel.core.name());
                channel.dispose();
                return;
            }
            Err(e) => {
                warn!("{}: failed to read a frame: {}", channel.core.name(), e);
                channel.dispose();
                return;
            }
        }
    }
}

async fn write_loop<W>(
    channel: Weak<StreamChannel>,
    cancel: CancellationToken,
    mut queue: mpsc::UnboundedReceiver<Vec<u8>>,
    mut writer: W,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let written = match writer.write_all(&frame).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            if let Some(channel) = channel.upgrade() {
                warn!(
                    "{}: failed to write a frame of {} bytes: {}",
                    channel.core.name(),
                    frame.len(),
                    e
                );
                channel.dispose();
            }
            return;
        }
    }
    let _ = writer.shutdown().await;
}

impl MessageChannel for StreamChannel {
    fn send(&self, service: &str, payload: Value) -> Result<()> {
        ensure_open(&self.core)?;
        let frame = encode_frame(service, payload)?;
        self.outbox
            .send(frame)
            .map_err(|_| ConduitError::ChannelDisposed)
    }

    fn register_service(&self, service: &str, handler: ServiceHandler) {
        self.core.register(service, handler);
    }

    fn unregister_service(&self, service: &str) {
        self.core.unregister(service);
    }

    fn dispose(&self) {
        if self.core.dispose() {
            self.cancel.cancel();
        }
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
