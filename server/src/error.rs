//! Error taxonomy for the connection subsystem.
//!
//! Only construction and bind failures surface to the caller; steady-state
//! failures are reported through the `client_disconnected` event and the
//! metrics sink.

use std::net::SocketAddr;

use thiserror::Error;

/// Errors surfaced to the embedding process.
#[derive(Debug, Error)]
pub enum ServerError {
    /// One of the two channel sockets failed to bind.
    #[error("failed to bind {addr}")]
    BindFailed {
        /// The address the bind was attempted on.
        addr: SocketAddr,
        /// The underlying socket error.
        #[source]
        source: std::io::Error,
    },

    /// No free 16-bit client ID remained after a full probe.
    #[error("client id space exhausted")]
    IdExhaustion,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed the reliable stream (zero-byte read).
    PeerClosed,
    /// An extension or the server requested the disconnect.
    Requested,
    /// Listener shutdown tore the session down.
    Aborted,
    /// The strike ledger reached the configured ceiling.
    StrikeLimit,
    /// A transport-level socket failure.
    SocketError(std::io::ErrorKind),
}

impl DisconnectReason {
    /// Reasons that log without an error payload: an orderly peer close, a
    /// requested disconnect, and a shutdown abort.
    pub fn is_quiet(&self) -> bool {
        matches!(
            self,
            DisconnectReason::PeerClosed | DisconnectReason::Requested | DisconnectReason::Aborted
        )
    }
}
