//! Registry of live connections
//!
//! This module owns the server-side view of who is connected:
//! - Slot allocation (lowest free index, reused after disconnect)
//! - Lookup by slot, session id and endpoint
//! - Disconnects initiated by the server, the peer, or the idle sweep
//!
//! All three indices live behind one reader-writer lock. Lookups from the
//! packet workers share the read side; registration, disconnects and the
//! keep-alive sweep take the write side. The lock is never held across a
//! socket send.

use log::{debug, info, warn};
use soe_shared::{DisconnectReason, Packet};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::connection::Connection;
use crate::error::ConnectError;
use crate::network::PacketSink;
use crate::utils::{read, write};

#[derive(Debug, Default)]
struct Registry {
    slots: Vec<Option<Arc<Connection>>>,
    by_endpoint: HashMap<SocketAddr, usize>,
    by_session: HashMap<u32, usize>,
}

impl Registry {
    fn free_slot(&self) -> usize {
        self.slots
            .iter()
            .position(Option::is_none)
            .unwrap_or(self.slots.len())
    }

    fn get(&self, slot: usize) -> Option<&Arc<Connection>> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    fn holds(&self, connection: &Connection) -> bool {
        connection
            .slot_id()
            .and_then(|slot| self.get(slot))
            .map_or(false, |live| std::ptr::eq(live.as_ref(), connection))
    }
}

/// Tracks every registered connection of one server
pub struct ConnectionManager {
    registry: RwLock<Registry>,
    sink: Arc<dyn PacketSink>,
    client_timeout: Duration,
}

impl ConnectionManager {
    pub fn new(sink: Arc<dyn PacketSink>, client_timeout: Duration) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            sink,
            client_timeout,
        }
    }

    /// Adds a connection to the registry and returns its slot
    ///
    /// A connection whose session id or endpoint is already live is turned
    /// away with a `ConnectFail` disconnect and the registry is left as is.
    pub fn register(&self, connection: Arc<Connection>) -> Result<usize, ConnectError> {
        let endpoint = connection.endpoint();
        let session_id = connection.session_id();

        let error = {
            let mut registry = write(&self.registry);

            if registry.by_session.contains_key(&session_id) {
                ConnectError::DuplicateSession(session_id)
            } else if registry.by_endpoint.contains_key(&endpoint) {
                ConnectError::DuplicateEndpoint(endpoint)
            } else {
                let slot = registry.free_slot();
                if slot == registry.slots.len() {
                    registry.slots.push(None);
                }
                connection.assign_slot(slot);
                registry.slots[slot] = Some(Arc::clone(&connection));
                registry.by_endpoint.insert(endpoint, slot);
                registry.by_session.insert(session_id, slot);

                info!(
                    "Client {} connected from {} (session {:#010x})",
                    slot, endpoint, session_id
                );
                return Ok(slot);
            }
        };

        warn!("Rejecting connection from {}: {}", endpoint, error);
        self.notify(endpoint, session_id, DisconnectReason::ConnectFail);
        Err(error)
    }

    pub fn lookup_by_slot(&self, slot: usize) -> Option<Arc<Connection>> {
        read(&self.registry).get(slot).cloned()
    }

    pub fn lookup_by_session(&self, session_id: u32) -> Option<Arc<Connection>> {
        let registry = read(&self.registry);
        registry
            .by_session
            .get(&session_id)
            .and_then(|slot| registry.get(*slot))
            .cloned()
    }

    pub fn lookup_by_endpoint(&self, endpoint: SocketAddr) -> Option<Arc<Connection>> {
        let registry = read(&self.registry);
        registry
            .by_endpoint
            .get(&endpoint)
            .and_then(|slot| registry.get(*slot))
            .cloned()
    }

    /// Checks if `connection` is the one currently registered in its slot
    pub fn is_live(&self, connection: &Connection) -> bool {
        read(&self.registry).holds(connection)
    }

    /// Removes a connection from every index and frees its slot
    ///
    /// Unless the peer asked to leave, it is sent a `DISCONNECT` carrying the
    /// reason. Returns true if the connection was registered.
    pub fn disconnect(
        &self,
        connection: &Connection,
        reason: DisconnectReason,
        client_initiated: bool,
    ) -> bool {
        let removed = self.remove_if(connection, |_| true);

        if !client_initiated {
            self.notify(connection.endpoint(), connection.session_id(), reason);
        }

        if removed {
            self.log_removal(connection, reason);
        } else {
            debug!(
                "Disconnect for unregistered peer {}: {}",
                connection.endpoint(),
                reason
            );
        }
        removed
    }

    /// Disconnects every connection idle for longer than the client timeout
    ///
    /// Returns the connections that were removed.
    pub fn sweep_idle(&self) -> Vec<Arc<Connection>> {
        let idle: Vec<Arc<Connection>> = read(&self.registry)
            .slots
            .iter()
            .flatten()
            .filter(|connection| connection.is_timed_out(self.client_timeout))
            .cloned()
            .collect();

        idle.into_iter()
            .filter(|connection| self.disconnect_if_idle(connection))
            .collect()
    }

    /// Times out `connection` if it is still registered and still idle once
    /// the registry is locked for writing.
    pub(crate) fn disconnect_if_idle(&self, connection: &Connection) -> bool {
        let timeout = self.client_timeout;
        if !self.remove_if(connection, |connection| connection.is_timed_out(timeout)) {
            return false;
        }

        let reason = DisconnectReason::Timeout;
        self.notify(connection.endpoint(), connection.session_id(), reason);
        self.log_removal(connection, reason);
        true
    }

    fn remove_if(
        &self,
        connection: &Connection,
        condition: impl FnOnce(&Connection) -> bool,
    ) -> bool {
        let mut registry = write(&self.registry);
        match connection.slot_id() {
            Some(slot) if registry.holds(connection) && condition(connection) => {
                registry.slots[slot] = None;
                registry.by_endpoint.remove(&connection.endpoint());
                registry.by_session.remove(&connection.session_id());
                connection.clear_slot();
                true
            }
            _ => false,
        }
    }

    fn log_removal(&self, connection: &Connection, reason: DisconnectReason) {
        info!(
            "Client {} disconnected: {} (session {:#010x})",
            connection.endpoint(),
            reason,
            connection.session_id()
        );
    }

    /// Snapshot of all live connections in slot order
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        read(&self.registry).slots.iter().flatten().cloned().collect()
    }

    pub fn len(&self) -> usize {
        read(&self.registry).by_session.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn client_timeout(&self) -> Duration {
        self.client_timeout
    }

    fn notify(&self, endpoint: SocketAddr, session_id: u32, reason: DisconnectReason) {
        match Packet::disconnect(session_id, reason) {
            Ok(packet) => self.sink.send_packet(endpoint, packet),
            Err(e) => warn!("Failed to encode disconnect for {}: {}", endpoint, e),
        }
    }
}
