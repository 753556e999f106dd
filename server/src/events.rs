//! Extension-facing events.

use std::sync::Arc;

use shared::MessageBuffer;

use crate::client::Client;
use crate::error::DisconnectReason;

/// Which channel a message travelled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    /// The ordered, reliable byte stream.
    Reliable,
    /// The unordered, lossy datagram channel.
    Unreliable,
}

/// Details handed to `client_disconnected`.
#[derive(Debug, Clone, Copy)]
pub struct DisconnectEvent {
    /// True when this side initiated the teardown.
    pub local_disconnect: bool,
    /// Why the session ended.
    pub reason: DisconnectReason,
}

/// Error type extension handlers report failures with.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Callbacks an extension registers to observe the server.
///
/// Unless [`thread_safe`](ServerEvents::thread_safe) returns true, every
/// callback is serialized onto the dispatcher, so implementations may keep
/// plain mutable state behind a lock-free cell. Thread-safe extensions run
/// directly on the I/O task that produced the event.
///
/// `client_connected` runs before the client's reliable receive loop starts;
/// returning an error drops the client as if it had never been admitted and
/// no `client_disconnected` follows. A `client_disconnected` error is logged
/// and counted but never prevents the session from being finalized.
pub trait ServerEvents: Send + Sync + 'static {
    /// A client completed the handshake and was admitted.
    fn client_connected(&self, _client: Arc<Client>) -> Result<(), HandlerError> {
        Ok(())
    }

    /// An admitted client's session ended.
    fn client_disconnected(
        &self,
        _client: Arc<Client>,
        _event: DisconnectEvent,
    ) -> Result<(), HandlerError> {
        Ok(())
    }

    /// A payload arrived for an admitted client.
    fn message_received(&self, _client: Arc<Client>, _message: MessageBuffer, _mode: ChannelMode) {}

    /// Whether callbacks may run concurrently on I/O tasks.
    fn thread_safe(&self) -> bool {
        false
    }
}
