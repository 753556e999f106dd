//! Client admission and event fan-out for the bichannel server.
//!
//! This module owns the server-side roster of connected clients:
//! - 16-bit session ID allocation with reservation, so an ID is never
//!   visible to two sessions at once
//! - admission of freshly handshaken connections and teardown of dead ones
//! - fan-out of connect/disconnect/message events to the registered
//!   extension, either directly (thread-safe extensions) or serialized
//!   through the dispatcher
//!
//! Two locks guard the roster. `ids` protects the probe cursor and the
//! reserved-but-unpopulated set; `clients` protects the populated table.
//! Where both are needed the order is always `ids` then `clients` — taking
//! them the other way around is how this kind of code deadlocks.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use log::{error, info, warn};
use parking_lot::Mutex;

use shared::{MessageBuffer, MetricsSink};

use crate::client::Client;
use crate::connection::Connection;
use crate::dispatcher::Dispatcher;
use crate::error::{DisconnectReason, ServerError};
use crate::events::{ChannelMode, DisconnectEvent, ServerEvents};

struct IdAllocator {
    /// Where the next probe starts (one past the last handed-out ID).
    last_allocated: u16,
    /// IDs reserved for sessions that have not finished admission yet.
    reserved: HashSet<u16>,
}

/// Allocates session IDs, tracks connected clients, and routes events to
/// the extension layer.
pub struct ClientManager {
    clients: Mutex<HashMap<u16, Arc<Client>>>,
    ids: Mutex<IdAllocator>,
    events: Option<Arc<dyn ServerEvents>>,
    dispatcher: Dispatcher,
    metrics: Arc<dyn MetricsSink>,
}

impl ClientManager {
    pub(crate) fn new(
        events: Option<Arc<dyn ServerEvents>>,
        dispatcher: Dispatcher,
        metrics: Arc<dyn MetricsSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            clients: Mutex::new(HashMap::new()),
            ids: Mutex::new(IdAllocator {
                last_allocated: 0,
                reserved: HashSet::new(),
            }),
            events,
            dispatcher,
            metrics,
        })
    }

    /// Reserve a free 16-bit ID with a linear probe starting one past the
    /// previous allocation. A candidate must be absent from both the
    /// reserved set and the populated table; only after the full space has
    /// been tested — the cursor slot itself included, since releases never
    /// move the cursor — does the probe fail with
    /// [`ServerError::IdExhaustion`].
    fn reserve_id(&self) -> Result<u16, ServerError> {
        let mut ids = self.ids.lock();
        let start = ids.last_allocated;
        let mut candidate = start.wrapping_add(1);
        loop {
            let taken = ids.reserved.contains(&candidate)
                || self.clients.lock().contains_key(&candidate);
            if !taken {
                ids.reserved.insert(candidate);
                ids.last_allocated = candidate;
                return Ok(candidate);
            }
            if candidate == start {
                return Err(ServerError::IdExhaustion);
            }
            candidate = candidate.wrapping_add(1);
        }
    }

    /// Admit a connection that completed the unreliable handshake.
    ///
    /// Reserves an ID, publishes the client, fires `client_connected`, and
    /// starts the reliable receive loop as the callback's continuation. When
    /// no handler is registered listening starts immediately (and a warning
    /// notes that inbound messages have nowhere to go).
    pub(crate) async fn handle_new_connection(self: &Arc<Self>, connection: Arc<Connection>) {
        let id = match self.reserve_id() {
            Ok(id) => id,
            Err(e) => {
                error!(
                    "rejecting connection from {}: {}",
                    connection.remote_reliable_endpoint(),
                    e
                );
                connection.begin_disconnect(true, DisconnectReason::Aborted);
                return;
            }
        };

        let client = Arc::new(Client::new(id, Arc::clone(&connection)));
        {
            // reserved -> populated atomically with publishing the client on
            // its connection; the gauge reflects the table before the locks
            // drop.
            let mut ids = self.ids.lock();
            let mut clients = self.clients.lock();
            ids.reserved.remove(&id);
            clients.insert(id, Arc::clone(&client));
            connection.attach_client(Arc::clone(&client));
            self.metrics
                .gauge("clients_connected", &[], clients.len() as i64);
        }
        info!(
            "client {} connected from {}",
            id,
            connection.remote_reliable_endpoint()
        );

        match &self.events {
            None => {
                warn!(
                    "no event handler registered; messages from client {} will be discarded",
                    id
                );
                connection.start_listening();
            }
            Some(events) if events.thread_safe() => {
                if self.run_connected_handler(events, &client) {
                    connection.start_listening();
                } else {
                    self.drop_client(id);
                    connection.begin_disconnect(true, DisconnectReason::Requested);
                }
            }
            Some(events) => {
                let events = Arc::clone(events);
                let manager = Arc::clone(self);
                let handler_client = Arc::clone(&client);
                let drop_connection = Arc::clone(&connection);
                let listen_connection = Arc::clone(&connection);
                self.dispatcher
                    .submit(
                        Box::new(move || {
                            if manager.run_connected_handler(&events, &handler_client) {
                                true
                            } else {
                                manager.drop_client(handler_client.id());
                                drop_connection
                                    .begin_disconnect(true, DisconnectReason::Requested);
                                false
                            }
                        }),
                        Some(Box::new(move || listen_connection.start_listening())),
                    )
                    .await;
            }
        }
    }

    fn run_connected_handler(&self, events: &Arc<dyn ServerEvents>, client: &Arc<Client>) -> bool {
        let started = Instant::now();
        let result = events.client_connected(Arc::clone(client));
        self.metrics.histogram(
            "client_connected_event_time",
            &[],
            started.elapsed().as_secs_f64(),
        );
        match result {
            Ok(()) => true,
            Err(e) => {
                error!(
                    "client_connected handler failed for client {}: {}",
                    client.id(),
                    e
                );
                self.metrics
                    .counter("client_connected_event_failures", &[], 1);
                false
            }
        }
    }

    /// Tear a client out of the roster after its connection began
    /// disconnecting. Idempotent: only the caller that actually removes the
    /// ID fires the disconnected event.
    pub(crate) async fn handle_disconnection(
        self: &Arc<Self>,
        client: Arc<Client>,
        local_disconnect: bool,
        reason: DisconnectReason,
    ) {
        let removed = {
            let mut ids = self.ids.lock();
            let mut clients = self.clients.lock();
            let was_reserved = ids.reserved.remove(&client.id());
            let was_populated = clients.remove(&client.id()).is_some();
            if was_reserved || was_populated {
                self.metrics
                    .gauge("clients_connected", &[], clients.len() as i64);
                true
            } else {
                false
            }
        };
        if !removed {
            // A disconnect raced a disconnect (or the client was dropped);
            // whoever removed the ID owns the event. Finalizing twice is
            // harmless.
            client.connection().finalize().await;
            return;
        }

        match reason {
            DisconnectReason::SocketError(kind) => {
                info!("client {} disconnected: {:?}", client.id(), kind);
            }
            DisconnectReason::StrikeLimit => {
                info!("client {} disconnected: strike limit reached", client.id());
            }
            _ => info!("client {} disconnected", client.id()),
        }

        let event = DisconnectEvent {
            local_disconnect,
            reason,
        };
        match &self.events {
            None => client.connection().finalize().await,
            Some(events) if events.thread_safe() => {
                self.run_disconnected_handler(events, &client, event);
                client.connection().finalize().await;
            }
            Some(events) => {
                let events = Arc::clone(events);
                let manager = Arc::clone(self);
                let handler_client = Arc::clone(&client);
                self.dispatcher
                    .submit(
                        Box::new(move || {
                            manager.run_disconnected_handler(&events, &handler_client, event);
                            // Finalization is never skipped, handler failure
                            // or not.
                            true
                        }),
                        Some(Box::new(move || {
                            let connection = Arc::clone(client.connection());
                            tokio::spawn(async move { connection.finalize().await });
                        })),
                    )
                    .await;
            }
        }
    }

    fn run_disconnected_handler(
        &self,
        events: &Arc<dyn ServerEvents>,
        client: &Arc<Client>,
        event: DisconnectEvent,
    ) {
        let started = Instant::now();
        let result = events.client_disconnected(Arc::clone(client), event);
        self.metrics.histogram(
            "client_disconnected_event_time",
            &[],
            started.elapsed().as_secs_f64(),
        );
        if let Err(e) = result {
            error!(
                "client_disconnected handler failed for client {}: {}",
                client.id(),
                e
            );
            self.metrics
                .counter("client_disconnected_event_failures", &[], 1);
        }
    }

    /// Brutal removal used when the `client_connected` handler itself
    /// failed: the ID is released and the gauge updated without firing the
    /// disconnected event, as if the client had never been admitted.
    pub(crate) fn drop_client(&self, id: u16) {
        let mut ids = self.ids.lock();
        let mut clients = self.clients.lock();
        ids.reserved.remove(&id);
        clients.remove(&id);
        self.metrics
            .gauge("clients_connected", &[], clients.len() as i64);
    }

    /// Fan a received payload out to the extension layer.
    pub(crate) async fn deliver_message(
        &self,
        client: Arc<Client>,
        message: MessageBuffer,
        mode: ChannelMode,
    ) {
        match &self.events {
            None => drop(message),
            Some(events) if events.thread_safe() => {
                events.message_received(client, message, mode);
            }
            Some(events) => {
                let events = Arc::clone(events);
                self.dispatcher
                    .submit(
                        Box::new(move || {
                            events.message_received(client, message, mode);
                            true
                        }),
                        None,
                    )
                    .await;
            }
        }
    }

    /// Look up a connected client by ID.
    pub(crate) fn client(&self, id: u16) -> Option<Arc<Client>> {
        self.clients.lock().get(&id).cloned()
    }

    /// Snapshot of every connected client.
    pub(crate) fn clients_snapshot(&self) -> Vec<Arc<Client>> {
        self.clients.lock().values().cloned().collect()
    }

    /// Number of currently connected clients.
    pub(crate) fn connected_count(&self) -> usize {
        self.clients.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::NullSink;

    fn test_manager() -> Arc<ClientManager> {
        ClientManager::new(None, Dispatcher::start(16), Arc::new(NullSink))
    }

    #[tokio::test]
    async fn test_reserved_ids_are_distinct() {
        let manager = test_manager();
        let mut seen = HashSet::new();
        for _ in 0..100 {
            let id = manager.reserve_id().unwrap();
            assert!(seen.insert(id), "id {} handed out twice", id);
        }
    }

    #[tokio::test]
    async fn test_probe_starts_after_last_allocation() {
        let manager = test_manager();
        assert_eq!(manager.reserve_id().unwrap(), 1);
        assert_eq!(manager.reserve_id().unwrap(), 2);
        assert_eq!(manager.reserve_id().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_probe_wraps_around_the_id_space() {
        let manager = test_manager();
        manager.ids.lock().last_allocated = u16::MAX - 1;
        assert_eq!(manager.reserve_id().unwrap(), u16::MAX);
        assert_eq!(manager.reserve_id().unwrap(), 0);
        assert_eq!(manager.reserve_id().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_probe_skips_reserved_ids() {
        let manager = test_manager();
        manager.ids.lock().reserved.extend([1u16, 2, 3]);
        assert_eq!(manager.reserve_id().unwrap(), 4);
    }

    #[tokio::test]
    async fn test_full_space_reports_exhaustion_and_recovers() {
        let manager = test_manager();
        // Fill the entire ID space, then confirm the probe gives up only
        // after a full loop and recovers as soon as one ID frees up.
        for _ in 0..=u16::MAX {
            manager.reserve_id().unwrap();
        }
        assert!(matches!(
            manager.reserve_id(),
            Err(ServerError::IdExhaustion)
        ));

        manager.drop_client(100);
        assert_eq!(manager.reserve_id().unwrap(), 100);
    }

    #[tokio::test]
    async fn test_freed_cursor_slot_is_found_within_one_probe() {
        let manager = test_manager();
        for _ in 0..=u16::MAX {
            manager.reserve_id().unwrap();
        }
        assert!(matches!(
            manager.reserve_id(),
            Err(ServerError::IdExhaustion)
        ));

        // Free exactly the slot the probe cursor rests on; releases never
        // move the cursor, so the probe must test that slot too before
        // reporting exhaustion.
        let cursor = manager.ids.lock().last_allocated;
        manager.drop_client(cursor);
        assert_eq!(manager.reserve_id().unwrap(), cursor);
    }

    #[tokio::test]
    async fn test_drop_client_releases_reservation() {
        let manager = test_manager();
        let id = manager.reserve_id().unwrap();
        assert!(manager.ids.lock().reserved.contains(&id));
        manager.drop_client(id);
        assert!(!manager.ids.lock().reserved.contains(&id));
    }
}
