//! Packet routing between the socket, the connection registry, the data
//! channels and the application

use log::{debug, info, warn};
use soe_shared::{
    CodecError, DisconnectBody, DisconnectReason, OpCode, Packet, SessionRequestBody,
    SessionResponseBody,
};
use std::sync::Arc;

use crate::connection::Connection;
use crate::network::ServerHandle;
use crate::queue::WorkQueue;

/// A reassembled message on its way to the application
pub type Delivery = (Arc<Connection>, Vec<u8>);

/// Application hooks called by the server
///
/// Callbacks run on the worker pools, so implementations must be thread
/// safe. Messages from one connection arrive in order on a single worker.
pub trait Dispatcher: Send + Sync {
    /// Packets the transport does not consume itself, including anything
    /// from endpoints that have not established a session
    fn handle_packet(&self, _server: &ServerHandle, connection: &Arc<Connection>, packet: &Packet) {
        debug!(
            "Unhandled {:?} ({} bytes) from {}",
            packet.opcode(),
            packet.len(),
            connection.endpoint()
        );
    }

    /// A complete application message delivered by a connection's data channel
    fn handle_message(&self, server: &ServerHandle, connection: &Arc<Connection>, message: &[u8]);
}

/// Dispatcher that only reports traffic, used by the standalone daemon
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingDispatcher;

impl Dispatcher for LoggingDispatcher {
    fn handle_message(&self, _server: &ServerHandle, connection: &Arc<Connection>, message: &[u8]) {
        info!(
            "Message of {} bytes from {} (session {:#010x})",
            message.len(),
            connection.endpoint(),
            connection.session_id()
        );
    }
}

/// Decides what happens to each inbound packet
pub struct PacketRouter {
    server: ServerHandle,
    dispatcher: Arc<dyn Dispatcher>,
    messages: Option<WorkQueue<Delivery>>,
}

impl PacketRouter {
    /// With `messages` set, reassembled messages are queued for the message
    /// workers; otherwise the dispatcher is called in place.
    pub fn new(
        server: ServerHandle,
        dispatcher: Arc<dyn Dispatcher>,
        messages: Option<WorkQueue<Delivery>>,
    ) -> Self {
        Self {
            server,
            dispatcher,
            messages,
        }
    }

    pub fn route(&self, connection: &Arc<Connection>, packet: &Packet) {
        // The packet may have been resolved before an earlier packet from the
        // same endpoint finished registering a session.
        let connection = self
            .server
            .connections()
            .lookup_by_endpoint(connection.endpoint())
            .unwrap_or_else(|| Arc::clone(connection));

        let live = self.server.connections().is_live(&connection);
        if live {
            connection.touch();
        }

        let result = match packet.opcode() {
            OpCode::SessionRequest => self.session_request(&connection, packet, live),
            OpCode::Disconnect if live => self.client_disconnect(&connection, packet),
            OpCode::Ping if live => {
                self.server.send_packet(&connection, Packet::ping());
                Ok(())
            }
            OpCode::ReliableData
            | OpCode::FragmentedReliableData
            | OpCode::AckReliableData
            | OpCode::OutOfOrderReliableData
                if live =>
            {
                self.data(&connection, packet)
            }
            _ => {
                self.dispatcher.handle_packet(&self.server, &connection, packet);
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!(
                "Dropping malformed {:?} from {}: {}",
                packet.opcode(),
                connection.endpoint(),
                e
            );
        }
    }

    fn session_request(
        &self,
        connection: &Arc<Connection>,
        packet: &Packet,
        live: bool,
    ) -> Result<(), CodecError> {
        let config = self.server.config();
        let mut reader = packet.reader();
        let request: SessionRequestBody = reader.read()?;
        let protocol = reader.read_cstring()?;

        if protocol != config.protocol_name {
            warn!(
                "{} asked for protocol '{}', expected '{}'",
                connection.endpoint(),
                protocol,
                config.protocol_name
            );
            self.server.sink().send_packet(
                connection.endpoint(),
                Packet::disconnect(request.session_id, DisconnectReason::ConnectionRefused)?,
            );
            return Ok(());
        }

        if live && connection.session_id() == request.session_id {
            debug!("Repeated session request from {}", connection.endpoint());
            return self.respond(connection);
        }

        debug!(
            "Session request from {} (session {:#010x}, udp length {})",
            connection.endpoint(),
            request.session_id,
            request.udp_length
        );
        let client = Arc::new(Connection::new(
            connection.endpoint(),
            request.session_id,
            config.max_message_size,
        ));
        if self.server.connections().register(Arc::clone(&client)).is_ok() {
            self.respond(&client)?;
        }
        Ok(())
    }

    fn respond(&self, connection: &Connection) -> Result<(), CodecError> {
        let response = Packet::session_response(SessionResponseBody {
            session_id: connection.session_id(),
            crc_seed: rand::random(),
            crc_length: 0,
            compressed: false,
            encrypted: false,
            udp_length: self.server.config().udp_length,
        })?;
        self.server.send_packet(connection, response);
        Ok(())
    }

    fn client_disconnect(
        &self,
        connection: &Arc<Connection>,
        packet: &Packet,
    ) -> Result<(), CodecError> {
        let body: DisconnectBody = packet.reader().read()?;
        if body.session_id != connection.session_id() {
            warn!(
                "{} sent disconnect for session {:#010x}, owns {:#010x}",
                connection.endpoint(),
                body.session_id,
                connection.session_id()
            );
            return Ok(());
        }

        let reason =
            DisconnectReason::try_from(body.reason).unwrap_or(DisconnectReason::Application);
        self.server.connections().disconnect(connection, reason, true);
        Ok(())
    }

    fn data(&self, connection: &Arc<Connection>, packet: &Packet) -> Result<(), CodecError> {
        let delivered = connection.channel().receive(packet, self.server.sink())?;
        for message in delivered {
            self.deliver(connection, message);
        }
        Ok(())
    }

    fn deliver(&self, connection: &Arc<Connection>, message: Vec<u8>) {
        match &self.messages {
            Some(queue) => {
                if !queue.push(connection.endpoint(), (Arc::clone(connection), message)) {
                    warn!(
                        "Message queue closed, dropping message from {}",
                        connection.endpoint()
                    );
                }
            }
            None => self.dispatcher.handle_message(&self.server, connection, &message),
        }
    }
}
