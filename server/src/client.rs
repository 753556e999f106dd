use std::net::SocketAddr;
use std::sync::Arc;

use shared::MessageBuffer;

use crate::connection::Connection;
use crate::events::ChannelMode;

/// Extension-visible identity bound to one connection.
///
/// Exactly one connection backs each client; the 16-bit ID is unique among
/// currently connected clients and is released only after the disconnect has
/// fully run its course.
#[derive(Debug)]
pub struct Client {
    id: u16,
    connection: Arc<Connection>,
}

impl Client {
    pub(crate) fn new(id: u16, connection: Arc<Connection>) -> Self {
        Client { id, connection }
    }

    /// The server-assigned session ID.
    pub fn id(&self) -> u16 {
        self.id
    }

    pub(crate) fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Queue `message` on the reliable channel.
    ///
    /// Returns false (and releases the buffer) when the session can no
    /// longer send. A transport failure during the write tears the session
    /// down and also returns false.
    pub async fn send_reliable(&self, message: MessageBuffer) -> bool {
        self.connection.send_reliable(message).await
    }

    /// Hand `message` to the datagram sender for the unreliable channel.
    ///
    /// Returns false (and releases the buffer) when the session can no
    /// longer send. Send failures past the hand-off surface asynchronously.
    pub async fn send_unreliable(&self, message: MessageBuffer) -> bool {
        self.connection.send_unreliable(message).await
    }

    /// Tear the session down.
    ///
    /// The first call returns true and no send succeeds afterwards; later
    /// calls return false.
    pub fn disconnect(&self) -> bool {
        self.connection
            .begin_disconnect(true, crate::error::DisconnectReason::Requested)
    }

    /// Add `weight` to the session's strike ledger, disconnecting it with
    /// the strike-limit reason once the configured ceiling is reached.
    pub fn strike(&self, reason: &str, weight: u32) {
        self.connection.strike(reason, weight);
    }

    /// Current value of the strike ledger.
    pub fn strike_count(&self) -> u32 {
        self.connection.strike_count()
    }

    /// Whether sends can still be attempted. Once false, never true again.
    pub fn can_send(&self) -> bool {
        self.connection.can_send()
    }

    /// The peer's endpoint on the requested channel. The unreliable
    /// endpoint exists only once the handshake completed, which is always
    /// the case for admitted clients.
    pub fn remote_endpoint(&self, mode: ChannelMode) -> Option<SocketAddr> {
        match mode {
            ChannelMode::Reliable => Some(self.connection.remote_reliable_endpoint()),
            ChannelMode::Unreliable => self.connection.remote_unreliable_endpoint(),
        }
    }
}
