//! Server network layer: UDP socket, receive loop, worker pools and keep-alive

use log::{debug, error, info, warn};
use soe_shared::{CodecError, DisconnectReason, Message, Packet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::connection_manager::ConnectionManager;
use crate::error::ServerError;
use crate::protocol::{Delivery, Dispatcher, PacketRouter};
use crate::queue::{stopped, WorkQueue};

/// Destination for every packet the server emits
///
/// Sends are synchronous and unbuffered. Implementations must not call back
/// into a `DataChannel`, since callers may hold its locks.
pub trait PacketSink: Send + Sync {
    fn send_packet(&self, endpoint: SocketAddr, packet: Packet);
}

/// Writes packets straight to the server's UDP socket
pub struct SocketSink {
    socket: Arc<UdpSocket>,
}

impl SocketSink {
    pub fn new(socket: Arc<UdpSocket>) -> Self {
        Self { socket }
    }
}

impl PacketSink for SocketSink {
    fn send_packet(&self, endpoint: SocketAddr, packet: Packet) {
        match self.socket.try_send_to(packet.raw(), endpoint) {
            Ok(_) => debug!("Sent {:?} ({} bytes) to {}", packet.opcode(), packet.len(), endpoint),
            Err(e) => warn!("Failed to send {:?} to {}: {}", packet.opcode(), endpoint, e),
        }
    }
}

/// Cloneable access to a running server
///
/// Dispatchers receive one with every callback; applications keep one to
/// send messages, drop clients and stop the server.
#[derive(Clone)]
pub struct ServerHandle {
    config: Arc<ServerConfig>,
    connections: Arc<ConnectionManager>,
    sink: Arc<dyn PacketSink>,
    stop: Arc<watch::Sender<bool>>,
}

impl ServerHandle {
    pub(crate) fn new(config: ServerConfig, sink: Arc<dyn PacketSink>) -> Self {
        let connections = Arc::new(ConnectionManager::new(
            Arc::clone(&sink),
            config.client_timeout(),
        ));
        let (stop, _) = watch::channel(false);

        Self {
            config: Arc::new(config),
            connections,
            sink,
            stop: Arc::new(stop),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub(crate) fn sink(&self) -> &dyn PacketSink {
        self.sink.as_ref()
    }

    /// Sends a raw transport packet to a connection's endpoint
    pub fn send_packet(&self, connection: &Connection, packet: Packet) {
        self.sink.send_packet(connection.endpoint(), packet);
    }

    /// Sends an application message over the connection's reliable channel,
    /// fragmenting it when it does not fit one datagram
    pub fn send_message(
        &self,
        connection: &Connection,
        message: Vec<u8>,
    ) -> Result<(), CodecError> {
        let message = if message.len() > self.config.max_reliable_payload() {
            Message::fragmented(message, self.config.fragment_size())
        } else {
            Message::new(message)
        };
        connection.channel().send(message, self.sink.as_ref())
    }

    /// Drops a client, telling it why
    pub fn disconnect(&self, connection: &Connection, reason: DisconnectReason) -> bool {
        self.connections.disconnect(connection, reason, false)
    }

    /// Asks every loop of the server to exit
    pub fn stop(&self) {
        if !self.stop.send_replace(true) {
            info!("{} stopping", self.config.name);
        }
    }

    pub fn is_running(&self) -> bool {
        !*self.stop.borrow()
    }

    pub(crate) fn subscribe_stop(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }
}

/// One SOE server bound to a UDP port
pub struct Server {
    socket: Arc<UdpSocket>,
    handle: ServerHandle,
    dispatcher: Arc<dyn Dispatcher>,
}

impl Server {
    pub async fn bind(
        config: ServerConfig,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Result<Self, ServerError> {
        let config = config.validated();
        let socket = Arc::new(UdpSocket::bind(config.bind_address()).await?);
        info!(
            "{} listening on {} ({} server {})",
            config.name,
            socket.local_addr()?,
            config.short_app_name,
            config.id
        );
        if !config.roles.is_empty() {
            debug!("{} roles: {}", config.name, config.roles.join(", "));
        }

        let sink: Arc<dyn PacketSink> = Arc::new(SocketSink::new(Arc::clone(&socket)));
        Ok(Self {
            socket,
            handle: ServerHandle::new(config, sink),
            dispatcher,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.socket.local_addr()?)
    }

    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Runs the receive loop until the server is stopped
    ///
    /// Spawns the worker pools and the keep-alive task, then waits for all
    /// of them to exit before returning.
    pub async fn run(self) -> Result<(), ServerError> {
        let config = self.handle.config().clone();
        let stop = self.handle.subscribe_stop();
        let mut tasks = Vec::new();

        let messages = if config.want_message_threading {
            let (queue, receivers) = WorkQueue::<Delivery>::new(config.max_thread_pool_size);
            let handle = self.handle.clone();
            let dispatcher = Arc::clone(&self.dispatcher);
            tasks.extend(WorkQueue::spawn_workers(
                "message",
                receivers,
                stop.clone(),
                move |(connection, message): Delivery| {
                    let handle = handle.clone();
                    let dispatcher = Arc::clone(&dispatcher);
                    async move { dispatcher.handle_message(&handle, &connection, &message) }
                },
            ));
            Some(queue)
        } else {
            None
        };

        let router = Arc::new(PacketRouter::new(
            self.handle.clone(),
            Arc::clone(&self.dispatcher),
            messages,
        ));

        let packets = if config.want_packet_threading {
            let (queue, receivers) =
                WorkQueue::<(Arc<Connection>, Packet)>::new(config.max_thread_pool_size);
            let router = Arc::clone(&router);
            tasks.extend(WorkQueue::spawn_workers(
                "packet",
                receivers,
                stop.clone(),
                move |(connection, packet): (Arc<Connection>, Packet)| {
                    let router = Arc::clone(&router);
                    async move { router.route(&connection, &packet) }
                },
            ));
            Some(queue)
        } else {
            None
        };

        tasks.push(self.spawn_keep_alive(stop.clone()));

        info!(
            "{} running ({} workers per pool, packet threading {}, message threading {})",
            config.name,
            config.max_thread_pool_size,
            config.want_packet_threading,
            config.want_message_threading
        );

        self.receive_loop(stop, packets.as_ref(), &router).await;

        drop(packets);
        for task in tasks {
            if let Err(e) = task.await {
                error!("{} task failed: {}", config.name, e);
            }
        }

        info!("{} stopped", config.name);
        Ok(())
    }

    async fn receive_loop(
        &self,
        mut stop: watch::Receiver<bool>,
        packets: Option<&WorkQueue<(Arc<Connection>, Packet)>>,
        router: &PacketRouter,
    ) {
        let config = self.handle.config();
        let mut buffer = vec![0u8; config.receive_buffer_size];

        loop {
            tokio::select! {
                _ = stopped(&mut stop) => break,
                received = self.socket.recv_from(&mut buffer) => match received {
                    Ok((len, endpoint)) => {
                        self.on_datagram(buffer[..len].to_vec(), endpoint, packets, router);
                    }
                    Err(e) => {
                        warn!("{}: receive failed: {}", config.name, e);
                        sleep(config.server_thread_sleep()).await;
                    }
                },
            }
        }
    }

    fn on_datagram(
        &self,
        datagram: Vec<u8>,
        endpoint: SocketAddr,
        packets: Option<&WorkQueue<(Arc<Connection>, Packet)>>,
        router: &PacketRouter,
    ) {
        let packet = match Packet::from_bytes(datagram) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Ignoring datagram from {}: {}", endpoint, e);
                return;
            }
        };

        let connection = self
            .handle
            .connections()
            .lookup_by_endpoint(endpoint)
            .unwrap_or_else(|| {
                Arc::new(Connection::provisional(
                    endpoint,
                    self.handle.config().max_message_size,
                ))
            });

        match packets {
            Some(queue) => {
                if !queue.push(endpoint, (connection, packet)) {
                    warn!("Packet queue closed, dropping packet from {}", endpoint);
                }
            }
            None => router.route(&connection, &packet),
        }
    }

    fn spawn_keep_alive(&self, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        let connections = Arc::clone(&self.handle.connections);
        let period = self.handle.config().keep_alive_interval();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = stopped(&mut stop) => break,
                    _ = ticker.tick() => {
                        let swept = connections.sweep_idle();
                        if !swept.is_empty() {
                            debug!("Keep-alive sweep dropped {} idle clients", swept.len());
                        }
                    }
                }
            }
        })
    }
}
