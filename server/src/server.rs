//! Extension-facing server facade.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;

use shared::{BufferPool, MetricsSink};

use crate::client::Client;
use crate::client_manager::ClientManager;
use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{DisconnectReason, ServerError};
use crate::events::ServerEvents;
use crate::listener::{BichannelListener, ListenerShared};

/// A running bichannel game server.
///
/// Binding wires the whole subsystem together: the buffer pool, the
/// dispatcher, the client manager, and the listener tasks for both
/// channels. The extension interacts with admitted sessions through the
/// [`Client`] handles surfaced by its [`ServerEvents`] callbacks or looked
/// up here by ID.
pub struct Server {
    config: ServerConfig,
    manager: Arc<ClientManager>,
    shared: Arc<ListenerShared>,
    pool: BufferPool,
    dispatcher: Dispatcher,
    local_addr: SocketAddr,
    accept_shutdown: watch::Sender<bool>,
    udp_shutdown: watch::Sender<bool>,
}

impl Server {
    /// Bind both channels and start serving.
    ///
    /// This is the only point where the subsystem surfaces an error to its
    /// caller; once it returns, failures are reported through the
    /// `client_disconnected` event and the metrics sink.
    pub async fn bind(
        config: ServerConfig,
        events: Option<Arc<dyn ServerEvents>>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, ServerError> {
        let pool = BufferPool::new(config.max_cached_messages, Arc::clone(&metrics));
        let dispatcher = Dispatcher::start(config.max_dispatcher_tasks);
        let manager = ClientManager::new(events, dispatcher.clone(), Arc::clone(&metrics));

        let listener =
            BichannelListener::bind(config.clone(), Arc::clone(&manager), pool.clone(), metrics)
                .await?;
        let local_addr = listener.local_addr();
        let shared = listener.shared();

        let (accept_shutdown, accept_rx) = watch::channel(false);
        let (udp_shutdown, udp_rx) = watch::channel(false);
        listener.start(accept_rx, udp_rx);

        Ok(Self {
            config,
            manager,
            shared,
            pool,
            dispatcher,
            local_addr,
            accept_shutdown,
            udp_shutdown,
        })
    }

    /// The address both channels are bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The configuration the server was started with.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The pool extensions acquire outbound message buffers from.
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// The serial queue extension callbacks run on. Extensions may schedule
    /// their own work here to stay on the application thread.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Look up a connected client by ID.
    pub fn client(&self, id: u16) -> Option<Arc<Client>> {
        self.manager.client(id)
    }

    /// Snapshot of every connected client.
    pub fn clients(&self) -> Vec<Arc<Client>> {
        self.manager.clients_snapshot()
    }

    /// Number of currently connected clients.
    pub fn connected_count(&self) -> usize {
        self.manager.connected_count()
    }

    /// Stop serving: refuse new sessions first, tear down every live and
    /// pending session, then close the datagram socket.
    pub async fn shutdown(&self) {
        let _ = self.accept_shutdown.send(true);

        for client in self.manager.clients_snapshot() {
            client
                .connection()
                .begin_disconnect(true, DisconnectReason::Aborted);
        }
        let parked: Vec<_> = {
            let mut pending = self.shared.pending.lock();
            pending.drain().map(|(_, connection)| connection).collect()
        };
        for connection in parked {
            connection.begin_disconnect(true, DisconnectReason::Aborted);
        }

        let _ = self.udp_shutdown.send(true);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        // Stop the listener tasks even when the embedder never called
        // shutdown(); sessions already torn down are unaffected.
        let _ = self.accept_shutdown.send(true);
        let _ = self.udp_shutdown.send(true);
    }
}
