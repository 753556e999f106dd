//! Bichannel listener: one reliable acceptor and one datagram socket bound
//! to the same address, plus the routing that stitches datagrams to
//! sessions.
//!
//! Every accepted stream is issued a fresh 64-bit auth token (written as the
//! first 8 bytes on the wire, before framing starts) and parked in the
//! pending table. The peer proves ownership of its datagram endpoint by
//! echoing the token as its first datagram; only then is the session routed
//! and admitted. Datagrams from unknown endpoints are dropped without any
//! response, which keeps the UDP surface unamplified.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch};

use shared::framing::TOKEN_LEN;
use shared::{BufferPool, MessageBuffer, MetricsSink};

use crate::client_manager::ClientManager;
use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::error::ServerError;
use crate::events::ChannelMode;

/// Ceiling on sessions that accepted on the stream but have not yet proven
/// their datagram endpoint. Accepts beyond it are refused outright, which
/// bounds the state a peer can pin by never finishing the handshake.
const MAX_PENDING_HANDSHAKES: usize = 4096;

/// Outbound datagram queue depth.
const UDP_SEND_QUEUE: usize = 1024;

/// State shared between the listener tasks and every connection.
pub(crate) struct ListenerShared {
    /// Datagram source -> session, populated by the handshake.
    pub(crate) routes: Mutex<HashMap<SocketAddr, Arc<Connection>>>,
    /// Auth token -> session awaiting its first datagram.
    pub(crate) pending: Mutex<HashMap<u64, Arc<Connection>>>,
    /// Hand-off to the datagram sender task.
    pub(crate) udp_tx: mpsc::Sender<(SocketAddr, MessageBuffer)>,
    pub(crate) pool: BufferPool,
    pub(crate) metrics: Arc<dyn MetricsSink>,
}

pub(crate) struct BichannelListener {
    tcp: TcpListener,
    udp: Arc<UdpSocket>,
    udp_rx: mpsc::Receiver<(SocketAddr, MessageBuffer)>,
    shared: Arc<ListenerShared>,
    manager: Arc<ClientManager>,
    config: ServerConfig,
    local_addr: SocketAddr,
}

impl BichannelListener {
    /// Bind both channels to the configured address. Either bind failing
    /// fails the whole start.
    pub(crate) async fn bind(
        config: ServerConfig,
        manager: Arc<ClientManager>,
        pool: BufferPool,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, ServerError> {
        let addr = config.bind_addr();
        let tcp = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::BindFailed { addr, source })?;
        // With port 0 the kernel picked one; the datagram socket must share
        // whatever the acceptor actually got.
        let local_addr = tcp
            .local_addr()
            .map_err(|source| ServerError::BindFailed { addr, source })?;
        let udp = UdpSocket::bind(local_addr)
            .await
            .map_err(|source| ServerError::BindFailed {
                addr: local_addr,
                source,
            })?;
        info!("listening on {} (tcp+udp)", local_addr);

        let (udp_tx, udp_rx) = mpsc::channel(UDP_SEND_QUEUE);
        let shared = Arc::new(ListenerShared {
            routes: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            udp_tx,
            pool,
            metrics,
        });

        Ok(Self {
            tcp,
            udp: Arc::new(udp),
            udp_rx,
            shared,
            manager,
            config,
            local_addr,
        })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn shared(&self) -> Arc<ListenerShared> {
        Arc::clone(&self.shared)
    }

    /// Spawn the accept loop, the datagram receive loop, and the datagram
    /// send loop.
    pub(crate) fn start(
        self,
        accept_shutdown: watch::Receiver<bool>,
        udp_shutdown: watch::Receiver<bool>,
    ) {
        let Self {
            tcp,
            udp,
            udp_rx,
            shared,
            manager,
            config,
            ..
        } = self;
        tokio::spawn(run_accept_loop(
            tcp,
            Arc::clone(&shared),
            Arc::clone(&manager),
            config,
            accept_shutdown,
        ));
        tokio::spawn(run_udp_receive_loop(
            Arc::clone(&udp),
            Arc::clone(&shared),
            manager,
            udp_shutdown.clone(),
        ));
        tokio::spawn(run_udp_send_loop(udp, udp_rx, shared, udp_shutdown));
    }
}

/// Accept reliable sockets until shut down. Dropping out of this loop closes
/// the acceptor, which is the first step of an orderly stop.
async fn run_accept_loop(
    tcp: TcpListener,
    shared: Arc<ListenerShared>,
    manager: Arc<ClientManager>,
    config: ServerConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            result = tcp.accept() => result,
            _ = shutdown.changed() => break,
        };
        match accepted {
            Ok((stream, peer)) => {
                if let Err(e) = admit_stream(stream, peer, &shared, &manager, &config).await {
                    debug!("dropping freshly accepted {}: {}", peer, e);
                }
            }
            Err(e) => {
                error!("accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
    debug!("acceptor closed");
}

/// Issue an auth token to a freshly accepted stream and park the session in
/// the pending table until its first datagram arrives.
async fn admit_stream(
    mut stream: TcpStream,
    peer: SocketAddr,
    shared: &Arc<ListenerShared>,
    manager: &Arc<ClientManager>,
    config: &ServerConfig,
) -> std::io::Result<()> {
    stream.set_nodelay(config.no_delay)?;

    if shared.pending.lock().len() >= MAX_PENDING_HANDSHAKES {
        warn!("pending handshake table full; refusing {}", peer);
        return Ok(());
    }

    // rand::random draws from a CSPRNG, so the token is unguessable by a
    // datagram spoofer. Collisions among live tokens are retried.
    let token = loop {
        let candidate: u64 = rand::random();
        if !shared.pending.lock().contains_key(&candidate) {
            break candidate;
        }
    };

    // The token is the only pre-handshake traffic and carries no length
    // prefix.
    stream.write_all(&token.to_be_bytes()).await?;
    shared
        .metrics
        .counter("bytes_sent", &[("protocol", "tcp")], TOKEN_LEN as u64);

    let (read_half, write_half) = stream.into_split();
    let connection = Connection::new(
        token,
        peer,
        read_half,
        write_half,
        config,
        Arc::clone(shared),
        Arc::clone(manager),
    );

    let mut pending = shared.pending.lock();
    if pending.len() >= MAX_PENDING_HANDSHAKES || pending.contains_key(&token) {
        warn!("pending handshake table full; refusing {}", peer);
        return Ok(());
    }
    pending.insert(token, connection);
    debug!("issued auth token to {}", peer);
    Ok(())
}

/// Route incoming datagrams: known endpoints feed their session, 8-byte
/// datagrams from unknown endpoints are tried as handshakes, everything
/// else is dropped silently.
async fn run_udp_receive_loop(
    udp: Arc<UdpSocket>,
    shared: Arc<ListenerShared>,
    manager: Arc<ClientManager>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = [0u8; 65535];
    loop {
        let received = tokio::select! {
            result = udp.recv_from(&mut buf) => result,
            _ = shutdown.changed() => break,
        };
        let (len, peer) = match received {
            Ok(ok) => ok,
            Err(e) => {
                error!("datagram receive failed: {}", e);
                tokio::time::sleep(Duration::from_millis(10)).await;
                continue;
            }
        };
        shared
            .metrics
            .counter("bytes_received", &[("protocol", "udp")], len as u64);

        let routed = shared.routes.lock().get(&peer).cloned();
        if let Some(connection) = routed {
            // Payloads flow only while the session is live; anything earlier
            // or later is indistinguishable from datagram loss.
            if !connection.is_listening() {
                continue;
            }
            let message = shared.pool.acquire_from(&buf[..len]);
            connection.deliver(message, ChannelMode::Unreliable).await;
            continue;
        }

        if len == TOKEN_LEN {
            let mut token_bytes = [0u8; TOKEN_LEN];
            token_bytes.copy_from_slice(&buf[..len]);
            let token = u64::from_be_bytes(token_bytes);
            let pending = shared.pending.lock().remove(&token);
            if let Some(connection) = pending {
                connection.set_remote_unreliable(peer);
                shared.routes.lock().insert(peer, Arc::clone(&connection));
                debug!("datagram handshake completed for {}", peer);
                // The handshake datagram itself is never delivered as a
                // payload.
                manager.handle_new_connection(connection).await;
                continue;
            }
        }
        // Unknown source or wrong token: no response, no per-datagram log.
        shared.metrics.counter("handshake_rejections", &[], 1);
    }
    debug!("datagram receiver closed");
}

/// Drain the outbound datagram queue. Failures are reported here, after the
/// send call that a connection already returned from.
async fn run_udp_send_loop(
    udp: Arc<UdpSocket>,
    mut udp_rx: mpsc::Receiver<(SocketAddr, MessageBuffer)>,
    shared: Arc<ListenerShared>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let queued = tokio::select! {
            item = udp_rx.recv() => item,
            _ = shutdown.changed() => break,
        };
        let Some((endpoint, message)) = queued else { break };
        match udp.send_to(message.as_slice(), endpoint).await {
            Ok(sent) => {
                shared
                    .metrics
                    .counter("bytes_sent", &[("protocol", "udp")], sent as u64);
            }
            Err(e) => warn!("datagram send to {} failed: {}", endpoint, e),
        }
    }
    debug!("datagram sender closed");
}
