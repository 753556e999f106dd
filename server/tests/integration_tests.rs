//! Integration tests for the bichannel session subsystem.
//!
//! These exercise real sockets on loopback: the auth handshake, framing,
//! the ordering policy, strikes, disconnect paths, and the metrics the
//! server emits along the way.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use server::{
    ChannelMode, Client, DisconnectEvent, DisconnectReason, HandlerError, Server, ServerConfig,
    ServerEvents,
};
use shared::{MessageBuffer, RecordingSink};

const EVENT_WAIT: Duration = Duration::from_secs(2);
const QUIET_WAIT: Duration = Duration::from_millis(200);

struct Recorder {
    connected_tx: mpsc::UnboundedSender<u16>,
    disconnected_tx: mpsc::UnboundedSender<(u16, DisconnectEvent)>,
    message_tx: mpsc::UnboundedSender<(u16, Vec<u8>, ChannelMode)>,
}

struct Events {
    connected: mpsc::UnboundedReceiver<u16>,
    disconnected: mpsc::UnboundedReceiver<(u16, DisconnectEvent)>,
    messages: mpsc::UnboundedReceiver<(u16, Vec<u8>, ChannelMode)>,
}

impl ServerEvents for Recorder {
    fn client_connected(&self, client: Arc<Client>) -> Result<(), HandlerError> {
        let _ = self.connected_tx.send(client.id());
        Ok(())
    }

    fn client_disconnected(
        &self,
        client: Arc<Client>,
        event: DisconnectEvent,
    ) -> Result<(), HandlerError> {
        let _ = self.disconnected_tx.send((client.id(), event));
        Ok(())
    }

    fn message_received(&self, client: Arc<Client>, message: MessageBuffer, mode: ChannelMode) {
        let _ = self
            .message_tx
            .send((client.id(), message.as_slice().to_vec(), mode));
    }
}

fn recorder() -> (Arc<Recorder>, Events) {
    let (connected_tx, connected) = mpsc::unbounded_channel();
    let (disconnected_tx, disconnected) = mpsc::unbounded_channel();
    let (message_tx, messages) = mpsc::unbounded_channel();
    (
        Arc::new(Recorder {
            connected_tx,
            disconnected_tx,
            message_tx,
        }),
        Events {
            connected,
            disconnected,
            messages,
        },
    )
}

/// Start a server on an ephemeral loopback port with a recording extension.
async fn start_server(mut config: ServerConfig) -> (Server, Events, Arc<RecordingSink>) {
    let _ = env_logger::builder().is_test(true).try_init();
    config.address = "127.0.0.1".parse().unwrap();
    config.port = 0;
    let (events, receivers) = recorder();
    let sink = RecordingSink::shared();
    let server = Server::bind(config, Some(events), sink.clone())
        .await
        .expect("server failed to bind");
    (server, receivers, sink)
}

/// Open the reliable stream, read the auth token, and echo it as the first
/// datagram from a fresh ephemeral port.
async fn connect(addr: SocketAddr) -> (TcpStream, UdpSocket, [u8; 8]) {
    let mut tcp = TcpStream::connect(addr).await.unwrap();
    let mut token = [0u8; 8];
    tcp.read_exact(&mut token).await.unwrap();
    let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    udp.send_to(&token, addr).await.unwrap();
    (tcp, udp, token)
}

async fn write_frame(tcp: &mut TcpStream, body: &[u8]) {
    tcp.write_all(&(body.len() as u32).to_be_bytes())
        .await
        .unwrap();
    tcp.write_all(body).await.unwrap();
}

async fn next_connected(events: &mut Events) -> u16 {
    timeout(EVENT_WAIT, events.connected.recv())
        .await
        .expect("timed out waiting for a connect event")
        .unwrap()
}

async fn next_disconnected(events: &mut Events) -> (u16, DisconnectEvent) {
    timeout(EVENT_WAIT, events.disconnected.recv())
        .await
        .expect("timed out waiting for a disconnect event")
        .unwrap()
}

async fn next_message(events: &mut Events) -> (u16, Vec<u8>, ChannelMode) {
    timeout(EVENT_WAIT, events.messages.recv())
        .await
        .expect("timed out waiting for a message event")
        .unwrap()
}

/// HANDSHAKE TESTS
mod handshake_tests {
    use super::*;

    #[tokio::test]
    async fn handshake_admits_client_and_routes_its_datagrams() {
        let (server, mut events, _sink) = start_server(ServerConfig::default()).await;
        let (_tcp, udp, _token) = connect(server.local_addr()).await;

        let id = next_connected(&mut events).await;
        assert_eq!(server.connected_count(), 1);

        // The handshake pinned both endpoints.
        let client = server.client(id).unwrap();
        assert!(client.remote_endpoint(ChannelMode::Reliable).is_some());
        assert_eq!(
            client.remote_endpoint(ChannelMode::Unreliable),
            Some(udp.local_addr().unwrap())
        );

        // Let the connected callback's continuation start the session.
        sleep(Duration::from_millis(50)).await;

        udp.send_to(b"ping", server.local_addr()).await.unwrap();
        let (from, payload, mode) = next_message(&mut events).await;
        assert_eq!(from, id);
        assert_eq!(payload, b"ping");
        assert_eq!(mode, ChannelMode::Unreliable);

        // A datagram from a port that never handshook must never surface.
        let rogue = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        rogue.send_to(b"intruder!", server.local_addr()).await.unwrap();
        assert!(
            timeout(QUIET_WAIT, events.messages.recv()).await.is_err(),
            "datagram from an unauthenticated endpoint was delivered"
        );
    }

    #[tokio::test]
    async fn wrong_token_is_silently_dropped() {
        let (server, mut events, sink) = start_server(ServerConfig::default()).await;

        let mut tcp = TcpStream::connect(server.local_addr()).await.unwrap();
        let mut token = [0u8; 8];
        tcp.read_exact(&mut token).await.unwrap();

        let mut wrong = token;
        wrong[0] ^= 0xFF;
        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        udp.send_to(&wrong, server.local_addr()).await.unwrap();

        assert!(
            timeout(QUIET_WAIT, events.connected.recv()).await.is_err(),
            "a wrong token completed the handshake"
        );
        assert_eq!(server.connected_count(), 0);
        assert!(sink.counter_value("handshake_rejections", &[]) >= 1);
    }

    #[tokio::test]
    async fn non_token_datagram_from_unknown_endpoint_is_dropped() {
        let (server, mut events, sink) = start_server(ServerConfig::default()).await;

        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        udp.send_to(b"hello there", server.local_addr()).await.unwrap();

        assert!(timeout(QUIET_WAIT, events.messages.recv()).await.is_err());
        assert!(timeout(QUIET_WAIT, events.connected.recv()).await.is_err());
        assert!(sink.counter_value("handshake_rejections", &[]) >= 1);
    }

    #[tokio::test]
    async fn token_write_is_counted_on_the_reliable_channel() {
        let (server, mut events, sink) = start_server(ServerConfig::default()).await;
        let (_tcp, _udp, _token) = connect(server.local_addr()).await;
        next_connected(&mut events).await;

        assert_eq!(sink.counter_value("bytes_sent", &[("protocol", "tcp")]), 8);
    }
}

/// FRAMING AND DELIVERY TESTS
mod delivery_tests {
    use super::*;

    #[tokio::test]
    async fn reliable_frames_are_delivered_in_wire_order() {
        let (server, mut events, _sink) = start_server(ServerConfig::default()).await;
        let (mut tcp, _udp, _token) = connect(server.local_addr()).await;
        next_connected(&mut events).await;
        sleep(Duration::from_millis(50)).await;

        // All three frames in one write, so they land in one segment.
        let mut wire = Vec::new();
        for body in [b"A", b"B", b"C"] {
            wire.extend_from_slice(&(body.len() as u32).to_be_bytes());
            wire.extend_from_slice(&body[..]);
        }
        tcp.write_all(&wire).await.unwrap();

        for expected in [b"A", b"B", b"C"] {
            let (_, payload, mode) = next_message(&mut events).await;
            assert_eq!(payload, expected);
            assert_eq!(mode, ChannelMode::Reliable);
        }
    }

    #[tokio::test]
    async fn zero_length_frame_is_delivered() {
        let (server, mut events, _sink) = start_server(ServerConfig::default()).await;
        let (mut tcp, _udp, _token) = connect(server.local_addr()).await;
        next_connected(&mut events).await;
        sleep(Duration::from_millis(50)).await;

        write_frame(&mut tcp, b"").await;
        let (_, payload, mode) = next_message(&mut events).await;
        assert!(payload.is_empty());
        assert_eq!(mode, ChannelMode::Reliable);
    }

    #[tokio::test]
    async fn unordered_mode_still_delivers_every_frame() {
        let config = ServerConfig {
            preserve_ordering: false,
            ..ServerConfig::default()
        };
        let (server, mut events, _sink) = start_server(config).await;
        let (mut tcp, _udp, _token) = connect(server.local_addr()).await;
        next_connected(&mut events).await;
        sleep(Duration::from_millis(50)).await;

        let bodies: Vec<Vec<u8>> = (0..8u8).map(|i| vec![b'0' + i]).collect();
        for body in &bodies {
            write_frame(&mut tcp, body).await;
        }

        let mut received = Vec::new();
        for _ in 0..bodies.len() {
            let (_, payload, _) = next_message(&mut events).await;
            received.push(payload);
        }
        received.sort();
        assert_eq!(received, bodies);
    }

    #[tokio::test]
    async fn server_reliable_send_reaches_the_peer_framed() {
        let (server, mut events, sink) = start_server(ServerConfig::default()).await;
        let (mut tcp, _udp, _token) = connect(server.local_addr()).await;
        let id = next_connected(&mut events).await;

        let client = server.client(id).expect("admitted client is missing");
        let message = server.pool().acquire_from(b"hello");
        assert!(client.send_reliable(message).await);

        let mut prefix = [0u8; 4];
        tcp.read_exact(&mut prefix).await.unwrap();
        assert_eq!(u32::from_be_bytes(prefix), 5);
        let mut body = [0u8; 5];
        tcp.read_exact(&mut body).await.unwrap();
        assert_eq!(&body, b"hello");

        // 8 token bytes plus a 4+5 byte frame.
        assert_eq!(
            sink.counter_value("bytes_sent", &[("protocol", "tcp")]),
            17
        );
    }

    #[tokio::test]
    async fn server_unreliable_send_reaches_the_peer_bare() {
        let (server, mut events, _sink) = start_server(ServerConfig::default()).await;
        let (_tcp, udp, _token) = connect(server.local_addr()).await;
        let id = next_connected(&mut events).await;

        let client = server.client(id).unwrap();
        let message = server.pool().acquire_from(b"state-update");
        assert!(client.send_unreliable(message).await);

        let mut buf = [0u8; 64];
        let (len, _) = timeout(EVENT_WAIT, udp.recv_from(&mut buf))
            .await
            .expect("no datagram arrived")
            .unwrap();
        assert_eq!(&buf[..len], b"state-update");
    }
}

/// STRIKE AND DISCONNECT TESTS
mod disconnect_tests {
    use super::*;

    #[tokio::test]
    async fn oversized_frame_declaration_is_fatal() {
        let (server, mut events, _sink) = start_server(ServerConfig::default()).await;
        let (mut tcp, _udp, _token) = connect(server.local_addr()).await;
        next_connected(&mut events).await;
        sleep(Duration::from_millis(50)).await;

        // Declared length 0xFFFFFFFF: one protocol violation outweighs the
        // default strike ceiling of 3.
        tcp.write_all(&[0xFF, 0xFF, 0xFF, 0xFF]).await.unwrap();

        let (_, event) = next_disconnected(&mut events).await;
        assert!(event.local_disconnect);
        assert_eq!(event.reason, DisconnectReason::StrikeLimit);
        assert_eq!(server.connected_count(), 0);

        // The server shut the stream down.
        let mut buf = [0u8; 16];
        let read = timeout(EVENT_WAIT, tcp.read(&mut buf))
            .await
            .expect("stream was not shut down");
        assert_eq!(read.unwrap(), 0);
    }

    #[tokio::test]
    async fn repeated_small_strikes_reach_the_ceiling() {
        let (server, mut events, _sink) = start_server(ServerConfig::default()).await;
        let (_tcp, _udp, _token) = connect(server.local_addr()).await;
        let id = next_connected(&mut events).await;

        let client = server.client(id).unwrap();
        client.strike("late heartbeat", server::STRIKE_WEIGHT_ROUTINE);
        client.strike("late heartbeat", server::STRIKE_WEIGHT_ROUTINE);
        assert_eq!(client.strike_count(), 2);
        assert!(client.can_send());

        client.strike("late heartbeat", server::STRIKE_WEIGHT_ROUTINE);
        let (_, event) = next_disconnected(&mut events).await;
        assert!(event.local_disconnect);
        assert_eq!(event.reason, DisconnectReason::StrikeLimit);
        assert!(!client.can_send());
    }

    #[tokio::test]
    async fn disconnect_returns_true_exactly_once() {
        let (server, mut events, _sink) = start_server(ServerConfig::default()).await;
        let (_tcp, _udp, _token) = connect(server.local_addr()).await;
        let id = next_connected(&mut events).await;

        let client = server.client(id).unwrap();
        assert!(client.disconnect());
        assert!(!client.disconnect());

        let (from, event) = next_disconnected(&mut events).await;
        assert_eq!(from, id);
        assert!(event.local_disconnect);
        assert_eq!(event.reason, DisconnectReason::Requested);

        // No second event, no lingering sends.
        assert!(
            timeout(QUIET_WAIT, events.disconnected.recv()).await.is_err(),
            "a second disconnect event fired"
        );
        let message = server.pool().acquire_from(b"too late");
        assert!(!client.send_reliable(message).await);
        assert!(server.client(id).is_none());
    }

    #[tokio::test]
    async fn peer_close_surfaces_as_remote_disconnect() {
        let (server, mut events, _sink) = start_server(ServerConfig::default()).await;
        let (tcp, _udp, _token) = connect(server.local_addr()).await;
        next_connected(&mut events).await;
        sleep(Duration::from_millis(50)).await;

        drop(tcp);

        let (_, event) = next_disconnected(&mut events).await;
        assert!(!event.local_disconnect);
        assert_eq!(event.reason, DisconnectReason::PeerClosed);
        assert_eq!(server.connected_count(), 0);
    }

    #[tokio::test]
    async fn gauge_follows_the_connected_population() {
        let (server, mut events, sink) = start_server(ServerConfig::default()).await;

        let (_tcp_a, _udp_a, _) = connect(server.local_addr()).await;
        next_connected(&mut events).await;
        let (tcp_b, _udp_b, _) = connect(server.local_addr()).await;
        next_connected(&mut events).await;
        assert_eq!(sink.gauge_value("clients_connected", &[]), Some(2));

        drop(tcp_b);
        next_disconnected(&mut events).await;
        assert_eq!(sink.gauge_value("clients_connected", &[]), Some(1));
    }

    #[tokio::test]
    async fn shutdown_aborts_every_session() {
        let (server, mut events, _sink) = start_server(ServerConfig::default()).await;
        let (mut tcp, _udp, _token) = connect(server.local_addr()).await;
        next_connected(&mut events).await;

        server.shutdown().await;

        let (_, event) = next_disconnected(&mut events).await;
        assert!(event.local_disconnect);
        assert_eq!(event.reason, DisconnectReason::Aborted);
        assert_eq!(server.connected_count(), 0);

        // The stream was shut down under the peer.
        let mut buf = [0u8; 16];
        let read = timeout(EVENT_WAIT, tcp.read(&mut buf))
            .await
            .expect("stream was not shut down");
        assert_eq!(read.unwrap(), 0);
    }
}

/// HANDLER FAILURE TESTS
mod handler_failure_tests {
    use super::*;

    struct RejectingEvents {
        connect_attempts: AtomicU32,
        disconnect_events: AtomicU32,
    }

    impl ServerEvents for RejectingEvents {
        fn client_connected(&self, _client: Arc<Client>) -> Result<(), HandlerError> {
            self.connect_attempts.fetch_add(1, Ordering::SeqCst);
            Err("extension rejected the client".into())
        }

        fn client_disconnected(
            &self,
            _client: Arc<Client>,
            _event: DisconnectEvent,
        ) -> Result<(), HandlerError> {
            self.disconnect_events.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn failing_connect_handler_drops_the_client_without_disconnect_event() {
        let _ = env_logger::builder().is_test(true).try_init();
        let events = Arc::new(RejectingEvents {
            connect_attempts: AtomicU32::new(0),
            disconnect_events: AtomicU32::new(0),
        });
        let sink = RecordingSink::shared();
        let config = ServerConfig {
            address: "127.0.0.1".parse().unwrap(),
            port: 0,
            ..ServerConfig::default()
        };
        let server = Server::bind(config, Some(events.clone()), sink.clone())
            .await
            .unwrap();

        let (mut tcp, _udp, _token) = connect(server.local_addr()).await;

        // The handler ran, failed, and the client was dropped as if never
        // admitted: no disconnect event, no roster entry, stream closed.
        let mut buf = [0u8; 16];
        let read = timeout(EVENT_WAIT, tcp.read(&mut buf))
            .await
            .expect("rejected client's stream was not closed");
        assert_eq!(read.unwrap(), 0);

        assert_eq!(events.connect_attempts.load(Ordering::SeqCst), 1);
        assert_eq!(events.disconnect_events.load(Ordering::SeqCst), 0);
        assert_eq!(server.connected_count(), 0);
        assert_eq!(sink.counter_value("client_connected_event_failures", &[]), 1);
        assert_eq!(sink.gauge_value("clients_connected", &[]), Some(0));
    }
}
