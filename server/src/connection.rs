//! Per-client session state.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::data_channel::DataChannel;
use crate::utils::lock;

const NO_SLOT: usize = usize::MAX;

/// Represents one peer talking to the server
///
/// Each connection carries:
/// - Identity (endpoint, client-chosen session id, server-assigned slot)
/// - Liveness (last time any packet arrived from the peer)
/// - Its own reliable data channel
#[derive(Debug)]
pub struct Connection {
    endpoint: SocketAddr,
    session_id: u32,
    slot_id: AtomicUsize,
    last_interaction: Mutex<Instant>,
    channel: DataChannel,
}

impl Connection {
    /// Creates a connection for a peer that announced `session_id`
    ///
    /// The connection is not reachable through the connection manager until
    /// it has been registered.
    pub fn new(endpoint: SocketAddr, session_id: u32, max_message_size: usize) -> Self {
        Self {
            endpoint,
            session_id,
            slot_id: AtomicUsize::new(NO_SLOT),
            last_interaction: Mutex::new(Instant::now()),
            channel: DataChannel::new(endpoint, max_message_size),
        }
    }

    /// Creates a stand-in for a packet from an endpoint we have never seen
    pub fn provisional(endpoint: SocketAddr, max_message_size: usize) -> Self {
        Self::new(endpoint, 0, max_message_size)
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Slot in the connection table, `None` while unregistered
    pub fn slot_id(&self) -> Option<usize> {
        match self.slot_id.load(Ordering::Acquire) {
            NO_SLOT => None,
            slot => Some(slot),
        }
    }

    pub(crate) fn assign_slot(&self, slot: usize) {
        self.slot_id.store(slot, Ordering::Release);
    }

    pub(crate) fn clear_slot(&self) {
        self.slot_id.store(NO_SLOT, Ordering::Release);
    }

    pub fn channel(&self) -> &DataChannel {
        &self.channel
    }

    /// Records inbound activity from the peer
    pub fn touch(&self) {
        *lock(&self.last_interaction) = Instant::now();
    }

    pub fn last_interaction(&self) -> Instant {
        *lock(&self.last_interaction)
    }

    #[cfg(test)]
    pub(crate) fn set_last_interaction(&self, at: Instant) {
        *lock(&self.last_interaction) = at;
    }

    /// Checks if the peer has been silent for longer than `timeout`
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_interaction().elapsed() > timeout
    }
}
