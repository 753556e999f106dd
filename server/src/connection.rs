//! Per-session connection state machine.
//!
//! Each accepted peer gets one [`Connection`] driving both halves of its
//! bichannel session. States progress one way only:
//!
//! ```text
//! handshaking ──> listening ──> disconnecting ──> closed
//! ```
//!
//! A connection is `handshaking` from TCP accept until the extension's
//! connected callback has run, `listening` while its reliable receive loop
//! is live, and `disconnecting` from the first teardown trigger (peer close,
//! socket error, strike ceiling, extension request, listener shutdown) until
//! the disconnected callback has finalized it.
//!
//! The receive loop reads a 4-byte header, validates the declared length,
//! reads the body, and then either delivers before issuing the next read
//! (`preserve_ordering`) or issues the next read first and delivers on a
//! separate task. `read_exact` absorbs short reads, so the loop is a single
//! logical cursor over the stream.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use log::{debug, trace, warn};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::watch;

use shared::framing::{self, HEADER_LEN};
use shared::MessageBuffer;

use crate::client::Client;
use crate::client_manager::ClientManager;
use crate::config::ServerConfig;
use crate::error::DisconnectReason;
use crate::events::ChannelMode;
use crate::listener::ListenerShared;

/// Strike weight for wire protocol violations.
pub const STRIKE_WEIGHT_PROTOCOL: u32 = 10;
/// Strike weight for routine misbehavior.
pub const STRIKE_WEIGHT_ROUTINE: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionState {
    Handshaking,
    Listening,
    Disconnecting,
    Closed,
}

/// A session with one remote peer across both channels.
pub struct Connection {
    auth_token: u64,
    remote_reliable: SocketAddr,
    remote_unreliable: OnceLock<SocketAddr>,
    no_delay: bool,
    preserve_ordering: bool,
    max_body_length: u32,
    max_strikes: u32,
    strikes: AtomicU32,
    can_send: AtomicBool,
    is_listening: AtomicBool,
    state: Mutex<ConnectionState>,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: tokio::sync::Mutex<Option<BufWriter<OwnedWriteHalf>>>,
    closed_tx: watch::Sender<bool>,
    client: OnceLock<Arc<Client>>,
    shared: Arc<ListenerShared>,
    manager: Arc<ClientManager>,
}

impl Connection {
    pub(crate) fn new(
        auth_token: u64,
        remote_reliable: SocketAddr,
        read_half: OwnedReadHalf,
        write_half: OwnedWriteHalf,
        config: &ServerConfig,
        shared: Arc<ListenerShared>,
        manager: Arc<ClientManager>,
    ) -> Arc<Self> {
        let (closed_tx, _) = watch::channel(false);
        Arc::new(Self {
            auth_token,
            remote_reliable,
            remote_unreliable: OnceLock::new(),
            no_delay: config.no_delay,
            preserve_ordering: config.preserve_ordering,
            max_body_length: config.max_reliable_body_length,
            max_strikes: config.max_strikes,
            strikes: AtomicU32::new(0),
            can_send: AtomicBool::new(true),
            is_listening: AtomicBool::new(false),
            state: Mutex::new(ConnectionState::Handshaking),
            reader: Mutex::new(Some(read_half)),
            writer: tokio::sync::Mutex::new(Some(BufWriter::new(write_half))),
            closed_tx,
            client: OnceLock::new(),
            shared,
            manager,
        })
    }

    /// The peer's reliable-channel endpoint.
    pub fn remote_reliable_endpoint(&self) -> SocketAddr {
        self.remote_reliable
    }

    /// The peer's unreliable-channel endpoint, set once by the handshake.
    pub fn remote_unreliable_endpoint(&self) -> Option<SocketAddr> {
        self.remote_unreliable.get().copied()
    }

    pub(crate) fn set_remote_unreliable(&self, endpoint: SocketAddr) {
        let _ = self.remote_unreliable.set(endpoint);
    }

    pub(crate) fn attach_client(&self, client: Arc<Client>) {
        let _ = self.client.set(client);
    }

    /// Whether the no-delay flag was applied to the reliable socket.
    pub fn no_delay(&self) -> bool {
        self.no_delay
    }

    /// Whether sends can still be attempted. Monotone: once false, stays
    /// false.
    pub fn can_send(&self) -> bool {
        self.can_send.load(Ordering::SeqCst)
    }

    /// Whether the reliable receive loop is live.
    pub fn is_listening(&self) -> bool {
        self.is_listening.load(Ordering::SeqCst)
    }

    /// Current value of the strike ledger.
    pub fn strike_count(&self) -> u32 {
        self.strikes.load(Ordering::SeqCst)
    }

    /// Add `weight` strikes. Returns true when the ledger has reached the
    /// ceiling and the session is (now) coming down.
    pub(crate) fn strike(self: &Arc<Self>, reason: &str, weight: u32) -> bool {
        let total = self
            .strikes
            .fetch_add(weight, Ordering::SeqCst)
            .saturating_add(weight);
        warn!(
            "striking client at {} ({}): {}/{}",
            self.remote_reliable, reason, total, self.max_strikes
        );
        if total >= self.max_strikes {
            self.begin_disconnect(true, DisconnectReason::StrikeLimit);
            true
        } else {
            false
        }
    }

    /// Begin the reliable receive loop. Runs as the continuation of the
    /// connected callback so that no payload is delivered before it.
    pub(crate) fn start_listening(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if *state != ConnectionState::Handshaking {
                return;
            }
            *state = ConnectionState::Listening;
        }
        self.is_listening.store(true, Ordering::SeqCst);
        let connection = Arc::clone(self);
        tokio::spawn(async move { connection.run_receive_loop().await });
    }

    async fn run_receive_loop(self: Arc<Self>) {
        let reader = self.reader.lock().take();
        let Some(mut reader) = reader else { return };
        let mut closed = self.closed_tx.subscribe();
        // A teardown that raced the loop start has already fired the watch.
        if *closed.borrow() {
            return;
        }
        debug!(
            "client at {} entered the reliable receive loop",
            self.remote_reliable
        );

        loop {
            let mut header = self.shared.pool.acquire(HEADER_LEN);
            let read = tokio::select! {
                result = reader.read_exact(header.as_mut_slice()) => result,
                _ = closed.changed() => break,
            };
            if let Err(e) = read {
                self.receive_failed(e);
                break;
            }
            self.shared
                .metrics
                .counter("bytes_received", &[("protocol", "tcp")], HEADER_LEN as u64);
            let mut prefix = [0u8; HEADER_LEN];
            prefix.copy_from_slice(header.as_slice());
            drop(header);

            let declared = framing::decode_header(prefix);
            let body_len = match framing::check_body_length(declared, self.max_body_length) {
                Ok(len) => len,
                Err(e) => {
                    warn!("client at {}: {}", self.remote_reliable, e);
                    if self.strike("malformed frame length", STRIKE_WEIGHT_PROTOCOL) {
                        break;
                    }
                    // The declared length is untrusted; resynchronize at the
                    // next header boundary rather than draining it.
                    continue;
                }
            };

            let mut body = self.shared.pool.acquire(body_len);
            if body_len > 0 {
                let read = tokio::select! {
                    result = reader.read_exact(body.as_mut_slice()) => result,
                    _ = closed.changed() => break,
                };
                if let Err(e) = read {
                    self.receive_failed(e);
                    break;
                }
                self.shared
                    .metrics
                    .counter("bytes_received", &[("protocol", "tcp")], body_len as u64);
            }

            if self.preserve_ordering {
                // Deliver before the next read: reliable messages reach the
                // upper layer in wire order.
                self.deliver(body, ChannelMode::Reliable).await;
            } else {
                // Resume reading immediately; delivery order across frames
                // is unspecified in this mode.
                let connection = Arc::clone(&self);
                tokio::spawn(async move {
                    connection.deliver(body, ChannelMode::Reliable).await;
                });
            }
        }

        trace!("receive loop for {} ended", self.remote_reliable);
    }

    fn receive_failed(self: &Arc<Self>, error: std::io::Error) {
        let reason = if error.kind() == std::io::ErrorKind::UnexpectedEof {
            DisconnectReason::PeerClosed
        } else {
            DisconnectReason::SocketError(error.kind())
        };
        self.begin_disconnect(false, reason);
    }

    /// Route a completed message to the extension layer.
    pub(crate) async fn deliver(&self, message: MessageBuffer, mode: ChannelMode) {
        if let Some(client) = self.client.get() {
            self.manager
                .deliver_message(Arc::clone(client), message, mode)
                .await;
        }
    }

    /// Write `[prefix][body]` to the reliable socket. The buffer is released
    /// on every path.
    pub(crate) async fn send_reliable(self: &Arc<Self>, message: MessageBuffer) -> bool {
        if !self.can_send() {
            return false;
        }
        let prefix = framing::encode_header(message.count() as u32);
        let result = {
            let mut guard = self.writer.lock().await;
            let Some(writer) = guard.as_mut() else {
                return false;
            };
            let write = async {
                writer.write_all(&prefix).await?;
                writer.write_all(message.as_slice()).await?;
                writer.flush().await
            };
            write.await
        };
        let sent = HEADER_LEN + message.count();
        drop(message);
        match result {
            Ok(()) => {
                self.shared
                    .metrics
                    .counter("bytes_sent", &[("protocol", "tcp")], sent as u64);
                true
            }
            Err(e) => {
                debug!("reliable send to {} failed: {}", self.remote_reliable, e);
                self.begin_disconnect(false, DisconnectReason::SocketError(e.kind()));
                false
            }
        }
    }

    /// Hand `(endpoint, message)` to the listener's datagram sender. Send
    /// failures past the hand-off are reported asynchronously by that task.
    pub(crate) async fn send_unreliable(&self, message: MessageBuffer) -> bool {
        if !self.can_send() {
            return false;
        }
        let Some(endpoint) = self.remote_unreliable.get().copied() else {
            return false;
        };
        self.shared.udp_tx.send((endpoint, message)).await.is_ok()
    }

    /// Transition to `disconnecting`. Only the first caller wins; it stops
    /// sends and the receive loop, removes the session from the listener's
    /// route tables, and schedules the completion that shuts the socket down
    /// and notifies the client manager.
    pub(crate) fn begin_disconnect(
        self: &Arc<Self>,
        local_disconnect: bool,
        reason: DisconnectReason,
    ) -> bool {
        {
            let mut state = self.state.lock();
            match *state {
                ConnectionState::Disconnecting | ConnectionState::Closed => return false,
                _ => *state = ConnectionState::Disconnecting,
            }
        }
        self.can_send.store(false, Ordering::SeqCst);
        self.is_listening.store(false, Ordering::SeqCst);
        let _ = self.closed_tx.send(true);

        if let Some(endpoint) = self.remote_unreliable.get() {
            self.shared.routes.lock().remove(endpoint);
        }
        self.shared.pending.lock().remove(&self.auth_token);

        let connection = Arc::clone(self);
        tokio::spawn(async move {
            connection.complete_disconnect(local_disconnect, reason).await;
        });
        true
    }

    async fn complete_disconnect(self: Arc<Self>, local_disconnect: bool, reason: DisconnectReason) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            // "Already shut down" class failures are expected here.
            if let Err(e) = writer.shutdown().await {
                debug!("shutdown of {} reported {}", self.remote_reliable, e);
            }
        }
        match self.client.get() {
            Some(client) => {
                self.manager
                    .handle_disconnection(Arc::clone(client), local_disconnect, reason)
                    .await;
            }
            None => {
                // Never admitted: nothing to notify.
                self.finalize().await;
            }
        }
    }

    /// Final teardown, run after the disconnected callback (or immediately
    /// when none is registered). Past this point the connection holds no
    /// socket resources.
    pub(crate) async fn finalize(&self) {
        *self.state.lock() = ConnectionState::Closed;
        self.reader.lock().take();
        self.writer.lock().await.take();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote_reliable", &self.remote_reliable)
            .field("remote_unreliable", &self.remote_unreliable.get())
            .field("state", &*self.state.lock())
            .field("strikes", &self.strike_count())
            .finish()
    }
}
