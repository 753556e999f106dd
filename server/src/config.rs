//! Server configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use serde::Deserialize;

/// Tunables for the bichannel listener and its sessions.
///
/// Both channels bind to `(address, port)`; the family of `address` decides
/// whether the listener speaks IPv4 or IPv6. Every field has a conservative
/// default, and the struct deserializes from any serde format with missing
/// keys falling back to those defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for both the reliable and unreliable channel.
    pub address: IpAddr,
    /// Bind port for both channels. Port 0 picks an ephemeral port.
    pub port: u16,
    /// Strike ledger ceiling per connection.
    pub max_strikes: u32,
    /// TCP_NODELAY pass-through for the reliable socket.
    pub no_delay: bool,
    /// Whether reliable delivery serializes with reception (see the
    /// connection state machine docs).
    pub preserve_ordering: bool,
    /// Declared frame bodies at or beyond this length are rejected.
    pub max_reliable_body_length: u32,
    /// Ceiling on buffers cached by the message pool.
    pub max_cached_messages: usize,
    /// Bound on the dispatcher queue; submissions beyond it apply
    /// backpressure to the producing task.
    pub max_dispatcher_tasks: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 4296,
            max_strikes: 3,
            no_delay: true,
            preserve_ordering: true,
            max_reliable_body_length: 65536,
            max_cached_messages: 512,
            max_dispatcher_tasks: 1024,
        }
    }
}

impl ServerConfig {
    /// The socket address both channels bind to.
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}
