//! Network configuration types for the `taskwire` server.

use std::time::Duration;

use taskwire_core::MIN_LOOP_RATE;

use super::codec::DEFAULT_MAX_FRAME_LENGTH;

/// Worker count used when none is configured.
pub const DEFAULT_POOL_SIZE: usize = 8;

/// Top-level configuration for a [`Server`](super::Server).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address for the server.
    pub host: String,
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    /// Number of workers processing requests.
    pub pool_size: usize,
    /// How long a single accept waits before the client manager re-checks
    /// for shutdown.
    pub accept_timeout: Duration,
    /// Pause between iterations of the client and request managers.
    pub loop_rate: Duration,
    /// Settings applied to every accepted client.
    pub client: ClientConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 0,
            pool_size: DEFAULT_POOL_SIZE,
            accept_timeout: Duration::from_secs(1),
            loop_rate: MIN_LOOP_RATE,
            client: ClientConfig::default(),
        }
    }
}

/// Per-client settings controlling framing and the receive loop.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Largest payload accepted or sent in one frame. Larger inbound frames
    /// are discarded without closing the connection.
    pub max_frame_length: usize,
    /// Pause between iterations of the receive loop.
    pub loop_rate: Duration,
    /// Upper bound on the reconnect attempt made when an outbound client's
    /// stream ends.
    pub recovery_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            loop_rate: MIN_LOOP_RATE,
            recovery_timeout: Duration::from_secs(2),
        }
    }
}
