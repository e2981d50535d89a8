//! Centralized configuration for the message-channel stack.
//!
//! Holds the liveness timing parameters, the well-known service names used on
//! the wire, and framing limits for stream-backed channels.

use crate::{ConduitError, Result};
use std::time::Duration;

/// Timing parameters of the ping/pong liveness protocol.
///
/// The interval must be strictly smaller than the timeout: a pinger sends
/// pings unconditionally every `interval`, so a live peer always has at least
/// one chance to answer before `timeout` expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessConfig {
    /// Time between consecutive pings.
    pub interval: Duration,
    /// Time without a qualifying pong after which the peer is considered dead.
    pub timeout: Duration,
}

impl LivenessConfig {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

    pub const DEBUG_INTERVAL: Duration = Duration::from_secs(1);
    pub const DEBUG_TIMEOUT: Duration = Duration::from_secs(20);

    /// Create a liveness configuration, validating `interval < timeout`.
    pub fn new(interval: Duration, timeout: Duration) -> Result<Self> {
        let config = Self { interval, timeout };
        config.validate()?;
        Ok(config)
    }

    /// Shorter timings suited to development builds.
    pub fn debug() -> Self {
        Self {
            interval: Self::DEBUG_INTERVAL,
            timeout: Self::DEBUG_TIMEOUT,
        }
    }

    /// Check the invariants the pinger relies on.
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(ConduitError::Config {
                message: "ping interval must be non-zero".to_string(),
            });
        }
        if self.interval >= self.timeout {
            return Err(ConduitError::Config {
                message: format!(
                    "ping interval {:?} must be smaller than the timeout {:?}",
                    self.interval, self.timeout
                ),
            });
        }
        Ok(())
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            interval: Self::DEFAULT_INTERVAL,
            timeout: Self::DEFAULT_TIMEOUT,
        }
    }
}

/// Well-known service names exchanged over channels.
pub struct ServiceNames;

impl ServiceNames {
    pub const PING: &'static str = "ping";
    pub const PONG: &'static str = "pong";
    pub const SERVER_READY: &'static str = "server_ready";
    pub const CREATE_CLIENT_HANDLER: &'static str = "create_client_handler";
    pub const DELETE_CLIENT_HANDLER: &'static str = "delete_client_handler";
    /// Requester name used by clients when talking to their client handler.
    pub const CLIENT_REQUESTER: &'static str = "conduit";

    /// Requester name a client handler uses for its dedicated server requester.
    pub fn client_handler_call_function(handler_id: u64) -> String {
        format!("client_handler_{}_call_function", handler_id)
    }
}

/// Wire-level protocol limits and keys.
pub struct ProtocolConfig;

impl ProtocolConfig {
    /// Upper bound of a single frame on stream-backed channels.
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
    pub const HANDLER_ID_KEY: &'static str = "handler_id";
    pub const CLIENT_NAME_FOR_LOG_KEY: &'static str = "client_name_for_log";
    pub const CHANNEL_ID_KEY: &'static str = "channel_id";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_liveness_is_valid() {
        assert!(LivenessConfig::default().validate().is_ok());
        assert!(LivenessConfig::debug().validate().is_ok());
    }

    #[test]
    fn test_interval_must_be_smaller_than_timeout() {
        let result = LivenessConfig::new(Duration::from_millis(400), Duration::from_millis(400));
        assert!(matches!(result, Err(ConduitError::Config { .. })));

        let result = LivenessConfig::new(Duration::ZERO, Duration::from_millis(400));
        assert!(result.is_err());

        let config =
            LivenessConfig::new(Duration::from_millis(200), Duration::from_millis(400)).unwrap();
        assert_eq!(config.interval, Duration::from_millis(200));
    }

    #[test]
    fn test_call_function_service_name() {
        assert_eq!(
            ServiceNames::client_handler_call_function(7),
            "client_handler_7_call_function"
        );
    }
}
