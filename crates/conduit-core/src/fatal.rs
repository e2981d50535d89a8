//! Protocol desync handling.
//!
//! A message that fails to decode means both endpoints disagree on the wire
//! contract. On trusted channels that is fatal for the detecting process; on
//! channels facing untrusted clients the damage is confined to that client's
//! channel.

use tracing::{error, warn};

use crate::channel::MessageChannel;

/// What to do when a message on a channel cannot be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InvalidMessagePolicy {
    /// Log and abort the process.
    #[default]
    Abort,
    /// Log and dispose the channel the message arrived on.
    DisposeChannel,
}

impl InvalidMessagePolicy {
    /// Apply the policy to an undecodable message received on `channel`.
    pub fn handle(self, scope: &str, detail: &str, channel: &dyn MessageChannel) {
        match self {
            InvalidMessagePolicy::Abort => protocol_desync(scope, detail),
            InvalidMessagePolicy::DisposeChannel => {
                warn!(
                    "{}: {}, disposing of the message channel...",
                    scope, detail
                );
                channel.dispose();
            }
        }
    }
}

/// Log a protocol desync and abort the process.
pub fn protocol_desync(scope: &str, detail: &str) -> ! {
    error!("{}: protocol desync: {}", scope, detail);
    std::process::abort()
}
