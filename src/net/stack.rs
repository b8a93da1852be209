//! Minimal packet-routing stack.
//!
//! Provides node addressing, bound service ports, one-shot connections and
//! a single default route to a link interface. Packets addressed to this
//! node are looped back locally.

use super::interface::Interface;
use super::packet::{
    BufferPool, CapacityError, Packet, PacketHeader, Priority, MAX_ADDRESS, MAX_PORT,
};
use crate::frame::FrameError;
use slab::Slab;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Highest port a service may bind.
pub const MAX_BIND_PORT: u8 = 31;

/// Packets queued per connection before further packets are dropped.
const CONNECTION_QUEUE_LEN: usize = 10;

/// Interface name used for locally delivered packets.
const LOOPBACK: &str = "loopback";

/// Stack errors
#[derive(Debug)]
pub enum StackError {
    /// Node address outside 0..=31.
    InvalidAddress(u8),
    /// Port outside the permitted range.
    InvalidPort(u8),
    /// Port already bound by another socket.
    PortInUse(u8),
    /// No ephemeral port left for an outgoing connection.
    PortsExhausted,
    /// The buffer pool has no buffers at all.
    EmptyPool,
    /// Pool buffers cannot hold a full link payload.
    BufferTooSmall { size: usize, mtu: usize },
    /// MTU leaves no room for packet data.
    InvalidMtu(usize),
    /// Outbound reserve is zero or leaves no buffers for inbound traffic.
    InvalidReserve { reserve: usize, count: usize },
    /// Data does not fit a packet buffer.
    Capacity(CapacityError),
    /// No free buffer of the requested size.
    PoolExhausted,
    /// No interface registered for non-local destinations.
    NoRoute,
    /// The link did not accept the packet in time.
    Timeout,
    /// Packet does not fit the link.
    Frame(FrameError),
    /// Link I/O failure.
    Io(std::io::Error),
}

impl std::fmt::Display for StackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StackError::InvalidAddress(addr) => {
                write!(f, "Invalid node address {} (max {})", addr, MAX_ADDRESS)
            }
            StackError::InvalidPort(port) => write!(f, "Invalid port {}", port),
            StackError::PortInUse(port) => write!(f, "Port {} already bound", port),
            StackError::PortsExhausted => write!(f, "No ephemeral ports available"),
            StackError::EmptyPool => write!(f, "Buffer pool has no buffers"),
            StackError::BufferTooSmall { size, mtu } => write!(
                f,
                "Packet buffers of {} bytes cannot hold an MTU of {} bytes",
                size, mtu
            ),
            StackError::InvalidMtu(mtu) => write!(f, "MTU of {} bytes is too small", mtu),
            StackError::InvalidReserve { reserve, count } => write!(
                f,
                "Outbound reserve of {} must be between 1 and {}",
                reserve,
                count.saturating_sub(1)
            ),
            StackError::Capacity(e) => write!(f, "{}", e),
            StackError::PoolExhausted => write!(f, "No packet buffer available"),
            StackError::NoRoute => write!(f, "No route to destination"),
            StackError::Timeout => write!(f, "Link operation timed out"),
            StackError::Frame(e) => write!(f, "Framing error: {}", e),
            StackError::Io(e) => write!(f, "Link I/O error: {}", e),
        }
    }
}

impl std::error::Error for StackError {}

impl From<FrameError> for StackError {
    fn from(e: FrameError) -> Self {
        StackError::Frame(e)
    }
}

impl From<CapacityError> for StackError {
    fn from(e: CapacityError) -> Self {
        StackError::Capacity(e)
    }
}

impl From<std::io::Error> for StackError {
    fn from(e: std::io::Error) -> Self {
        StackError::Io(e)
    }
}

/// Connection table entry.
struct ConnEntry {
    remote_addr: u8,
    remote_port: u8,
    local_port: u8,
    ephemeral: bool,
    tx: mpsc::Sender<Packet>,
}

impl ConnEntry {
    fn matches(&self, header: &PacketHeader) -> bool {
        self.remote_addr == header.src
            && self.remote_port == header.sport
            && self.local_port == header.dport
    }
}

#[derive(Default)]
struct Tables {
    sockets: HashMap<u8, mpsc::Sender<Connection>>,
    connections: Slab<ConnEntry>,
    ephemeral: HashSet<u8>,
    next_ephemeral: u8,
}

impl Tables {
    fn alloc_ephemeral(&mut self) -> Option<u8> {
        let first = MAX_BIND_PORT + 1;
        let span = MAX_PORT - MAX_BIND_PORT;
        for i in 0..span {
            let port = first + (self.next_ephemeral + i) % span;
            if self.ephemeral.insert(port) {
                self.next_ephemeral = (port - first + 1) % span;
                return Some(port);
            }
        }
        None
    }
}

/// The packet-routing stack for one node.
pub struct Stack {
    address: u8,
    pool: BufferPool,
    route: RwLock<Option<Arc<dyn Interface>>>,
    tables: Mutex<Tables>,
}

impl Stack {
    /// Create a stack for node `address` drawing buffers from `pool`.
    pub fn new(address: u8, pool: BufferPool) -> Result<Arc<Self>, StackError> {
        if address > MAX_ADDRESS {
            return Err(StackError::InvalidAddress(address));
        }
        if pool.capacity() == 0 {
            return Err(StackError::EmptyPool);
        }

        Ok(Arc::new(Self {
            address,
            pool,
            route: RwLock::new(None),
            tables: Mutex::new(Tables::default()),
        }))
    }

    /// This node's address.
    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Acquire a packet buffer able to hold `size` data bytes.
    pub fn get_buffer(&self, size: usize) -> Option<Packet> {
        self.pool.get(size)
    }

    /// Acquire a buffer for a packet arriving from a link.
    ///
    /// Never takes the pool's outbound reserve.
    pub fn get_inbound_buffer(&self, size: usize) -> Option<Packet> {
        self.pool.get_inbound(size)
    }

    /// Register `iface` as the route for every non-local destination.
    pub fn set_default_route(&self, iface: Arc<dyn Interface>) {
        debug!(interface = iface.name(), mtu = iface.mtu(), "Default route set");
        *self.route.write().unwrap_or_else(PoisonError::into_inner) = Some(iface);
    }

    /// Name of the interface currently holding the default route.
    pub fn default_route(&self) -> Option<String> {
        self.route
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|iface| iface.name().to_string())
    }

    /// Bind a service port and start accepting connections on it.
    ///
    /// At most `backlog` unaccepted connections are queued.
    pub fn bind(self: &Arc<Self>, port: u8, backlog: usize) -> Result<Socket, StackError> {
        if port > MAX_BIND_PORT {
            return Err(StackError::InvalidPort(port));
        }

        let mut tables = self.tables();
        if tables.sockets.contains_key(&port) {
            return Err(StackError::PortInUse(port));
        }
        let (tx, rx) = mpsc::channel(backlog.max(1));
        tables.sockets.insert(port, tx);
        debug!(port, backlog, "Port bound");

        Ok(Socket {
            stack: Arc::clone(self),
            port,
            rx,
        })
    }

    /// Open an outgoing connection to `dport` on node `dst`.
    pub fn connect(
        self: &Arc<Self>,
        priority: Priority,
        dst: u8,
        dport: u8,
    ) -> Result<Connection, StackError> {
        if dst > MAX_ADDRESS {
            return Err(StackError::InvalidAddress(dst));
        }
        if dport > MAX_PORT {
            return Err(StackError::InvalidPort(dport));
        }

        let mut tables = self.tables();
        let local_port = tables.alloc_ephemeral().ok_or(StackError::PortsExhausted)?;
        let (tx, rx) = mpsc::channel(CONNECTION_QUEUE_LEN);
        let key = tables.connections.insert(ConnEntry {
            remote_addr: dst,
            remote_port: dport,
            local_port,
            ephemeral: true,
            tx,
        });
        trace!(dst, dport, sport = local_port, "Connection opened");

        Ok(Connection {
            stack: Arc::clone(self),
            key,
            rx,
            priority,
            local_port,
            remote_addr: dst,
            remote_port: dport,
        })
    }

    /// Deliver an inbound packet that arrived on interface `iface`.
    ///
    /// Packets for other nodes, unbound ports, or full queues are dropped
    /// and their buffers released.
    pub fn ingress(self: &Arc<Self>, packet: Packet, iface: &str) {
        let header = *packet.header();
        if header.dst != self.address {
            debug!(
                interface = iface,
                dst = header.dst,
                "Dropping packet for another node"
            );
            return;
        }

        // Values dropped only after the table lock is released
        let mut overflow = None;
        let mut refused = None;
        {
            let mut tables = self.tables();
            let existing = tables
                .connections
                .iter()
                .find(|(_, entry)| entry.matches(&header))
                .map(|(key, _)| key);

            if let Some(key) = existing {
                if let Err(e) = tables.connections[key].tx.try_send(packet) {
                    overflow = Some(e);
                }
            } else if let Some(listener) = tables.sockets.get(&header.dport).cloned() {
                let (tx, rx) = mpsc::channel(CONNECTION_QUEUE_LEN);
                let key = tables.connections.insert(ConnEntry {
                    remote_addr: header.src,
                    remote_port: header.sport,
                    local_port: header.dport,
                    ephemeral: false,
                    tx: tx.clone(),
                });
                let conn = Connection {
                    stack: Arc::clone(self),
                    key,
                    rx,
                    priority: header.priority,
                    local_port: header.dport,
                    remote_addr: header.src,
                    remote_port: header.sport,
                };
                if let Err(e) = tx.try_send(packet) {
                    overflow = Some(e);
                }
                trace!(
                    interface = iface,
                    src = header.src,
                    sport = header.sport,
                    dport = header.dport,
                    "New inbound connection"
                );
                if let Err(e) = listener.try_send(conn) {
                    refused = Some(e);
                }
            } else {
                debug!(
                    interface = iface,
                    src = header.src,
                    dport = header.dport,
                    "Dropping packet for unbound port"
                );
                return;
            }
        }

        if overflow.is_some() {
            warn!(
                interface = iface,
                src = header.src,
                dport = header.dport,
                "Connection queue full, packet dropped"
            );
        }
        if refused.is_some() {
            warn!(port = header.dport, "Accept backlog full, connection refused");
        }
    }

    /// Route an outbound packet: loop back if it is for us, otherwise hand it
    /// to the default route.
    async fn route(self: &Arc<Self>, packet: Packet, timeout: Duration) -> Result<(), StackError> {
        if packet.header().dst == self.address {
            self.ingress(packet, LOOPBACK);
            return Ok(());
        }

        let iface = self
            .route
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(StackError::NoRoute)?;
        iface.transmit(packet, timeout).await
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.tables().connections.len()
    }

    fn release_connection(&self, key: usize) {
        let mut tables = self.tables();
        if let Some(entry) = tables.connections.try_remove(key) {
            if entry.ephemeral {
                tables.ephemeral.remove(&entry.local_port);
            }
            trace!(
                remote = entry.remote_addr,
                rport = entry.remote_port,
                lport = entry.local_port,
                "Connection closed"
            );
        }
    }

    fn unbind(&self, port: u8) {
        self.tables().sockets.remove(&port);
        debug!(port, "Port unbound");
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A bound service port.
pub struct Socket {
    stack: Arc<Stack>,
    port: u8,
    rx: mpsc::Receiver<Connection>,
}

impl Socket {
    pub fn port(&self) -> u8 {
        self.port
    }

    /// Wait up to `timeout` for the next inbound connection.
    pub async fn accept(&mut self, timeout: Duration) -> Option<Connection> {
        tokio::time::timeout(timeout, self.rx.recv())
            .await
            .ok()
            .flatten()
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.stack.unbind(self.port);
    }
}

/// A one-shot connection between a local and a remote port.
///
/// Closed when dropped.
pub struct Connection {
    stack: Arc<Stack>,
    key: usize,
    rx: mpsc::Receiver<Packet>,
    priority: Priority,
    local_port: u8,
    remote_addr: u8,
    remote_port: u8,
}

impl Connection {
    pub fn local_port(&self) -> u8 {
        self.local_port
    }

    pub fn remote_address(&self) -> u8 {
        self.remote_addr
    }

    pub fn remote_port(&self) -> u8 {
        self.remote_port
    }

    /// Wait up to `timeout` for the next packet on this connection.
    pub async fn read(&mut self, timeout: Duration) -> Option<Packet> {
        tokio::time::timeout(timeout, self.rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Address `packet` to the remote end and route it.
    ///
    /// The packet is consumed whether or not the send succeeds.
    pub async fn send(&self, mut packet: Packet, timeout: Duration) -> Result<(), StackError> {
        *packet.header_mut() = PacketHeader {
            priority: self.priority,
            src: self.stack.address,
            dst: self.remote_addr,
            dport: self.remote_port,
            sport: self.local_port,
            flags: 0,
        };
        self.stack.route(packet, timeout).await
    }

    /// Close the connection.
    pub fn close(self) {}
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.stack.release_connection(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    const TIMEOUT: Duration = Duration::from_millis(100);

    /// Interface that records transmitted packets' headers and data.
    struct Recorder {
        sent: Mutex<Vec<(PacketHeader, Vec<u8>)>>,
    }

    #[async_trait]
    impl Interface for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn mtu(&self) -> usize {
            250
        }

        async fn transmit(&self, packet: Packet, _timeout: Duration) -> Result<(), StackError> {
            self.sent
                .lock()
                .unwrap()
                .push((*packet.header(), packet.data().to_vec()));
            Ok(())
        }
    }

    fn stack(address: u8) -> Arc<Stack> {
        Stack::new(address, BufferPool::new(10, 300)).unwrap()
    }

    fn inbound(stack: &Stack, header: PacketHeader, data: &[u8]) -> Packet {
        let mut packet = stack.get_buffer(data.len()).unwrap();
        packet.set_data(data).unwrap();
        *packet.header_mut() = header;
        packet
    }

    #[test]
    fn test_init_validation() {
        assert!(matches!(
            Stack::new(32, BufferPool::new(1, 10)),
            Err(StackError::InvalidAddress(32))
        ));
        assert!(matches!(
            Stack::new(1, BufferPool::new(0, 10)),
            Err(StackError::EmptyPool)
        ));
    }

    #[tokio::test]
    async fn test_bind_rules() {
        let stack = stack(1);
        let socket = stack.bind(10, 5).unwrap();
        assert!(matches!(stack.bind(10, 5), Err(StackError::PortInUse(10))));
        assert!(matches!(stack.bind(40, 5), Err(StackError::InvalidPort(40))));

        drop(socket);
        assert!(stack.bind(10, 5).is_ok());
    }

    #[tokio::test]
    async fn test_inbound_packet_creates_connection() {
        let stack = stack(1);
        let mut socket = stack.bind(10, 5).unwrap();

        let header = PacketHeader {
            src: 2,
            dst: 1,
            dport: 10,
            sport: 40,
            ..Default::default()
        };
        stack.ingress(inbound(&stack, header, b"hello"), "test");

        let mut conn = socket.accept(TIMEOUT).await.unwrap();
        assert_eq!(conn.remote_address(), 2);
        assert_eq!(conn.remote_port(), 40);
        assert_eq!(conn.local_port(), 10);

        let packet = conn.read(TIMEOUT).await.unwrap();
        assert_eq!(packet.data(), b"hello");
        drop(packet);

        conn.close();
        assert_eq!(stack.connection_count(), 0);
        assert_eq!(stack.pool().available(), 10);
    }

    #[tokio::test]
    async fn test_follow_up_packet_joins_existing_connection() {
        let stack = stack(1);
        let mut socket = stack.bind(10, 5).unwrap();
        let header = PacketHeader {
            src: 2,
            dst: 1,
            dport: 10,
            sport: 40,
            ..Default::default()
        };

        stack.ingress(inbound(&stack, header, b"first"), "test");
        stack.ingress(inbound(&stack, header, b"second"), "test");

        let mut conn = socket.accept(TIMEOUT).await.unwrap();
        assert_eq!(conn.read(TIMEOUT).await.unwrap().data(), b"first");
        assert_eq!(conn.read(TIMEOUT).await.unwrap().data(), b"second");
        assert!(socket.accept(Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn test_unroutable_packets_are_released() {
        let stack = stack(1);

        let other_node = PacketHeader {
            src: 2,
            dst: 5,
            dport: 10,
            ..Default::default()
        };
        stack.ingress(inbound(&stack, other_node, b"x"), "test");

        let unbound = PacketHeader {
            src: 2,
            dst: 1,
            dport: 11,
            ..Default::default()
        };
        stack.ingress(inbound(&stack, unbound, b"x"), "test");

        assert_eq!(stack.pool().available(), 10);
        assert_eq!(stack.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_backlog_full_refuses_connection() {
        let stack = stack(1);
        let _socket = stack.bind(10, 1).unwrap();

        for sport in [40, 41] {
            let header = PacketHeader {
                src: 2,
                dst: 1,
                dport: 10,
                sport,
                ..Default::default()
            };
            stack.ingress(inbound(&stack, header, b"x"), "test");
        }

        assert_eq!(stack.connection_count(), 1);
        assert_eq!(stack.pool().available(), 9);
    }

    #[tokio::test]
    async fn test_send_without_route() {
        let stack = stack(1);
        let conn = stack.connect(Priority::Norm, 2, 10).unwrap();
        let packet = stack.get_buffer(4).unwrap();

        assert!(matches!(
            conn.send(packet, TIMEOUT).await,
            Err(StackError::NoRoute)
        ));
        assert_eq!(stack.pool().available(), 10);
    }

    #[tokio::test]
    async fn test_send_through_default_route() {
        let stack = stack(1);
        let recorder = Arc::new(Recorder {
            sent: Mutex::new(Vec::new()),
        });
        stack.set_default_route(recorder.clone());
        assert_eq!(stack.default_route().as_deref(), Some("recorder"));

        let conn = stack.connect(Priority::High, 2, 10).unwrap();
        let mut packet = stack.get_buffer(3).unwrap();
        packet.set_data(b"ack").unwrap();
        conn.send(packet, TIMEOUT).await.unwrap();

        let sent = recorder.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let (header, data) = &sent[0];
        assert_eq!(header.src, 1);
        assert_eq!(header.dst, 2);
        assert_eq!(header.dport, 10);
        assert_eq!(header.sport, conn.local_port());
        assert_eq!(header.priority, Priority::High);
        assert_eq!(data, b"ack");
    }

    #[tokio::test]
    async fn test_loopback_round_trip() {
        let stack = stack(1);
        let mut socket = stack.bind(10, 5).unwrap();

        let mut client = stack.connect(Priority::Norm, 1, 10).unwrap();
        let mut packet = stack.get_buffer(4).unwrap();
        packet.set_data(b"ping").unwrap();
        client.send(packet, TIMEOUT).await.unwrap();

        let mut server = socket.accept(TIMEOUT).await.unwrap();
        assert_eq!(server.remote_port(), client.local_port());
        assert_eq!(server.read(TIMEOUT).await.unwrap().data(), b"ping");

        let mut reply = stack.get_buffer(4).unwrap();
        reply.set_data(b"pong").unwrap();
        server.send(reply, TIMEOUT).await.unwrap();

        assert_eq!(client.read(TIMEOUT).await.unwrap().data(), b"pong");
    }

    #[tokio::test]
    async fn test_ephemeral_ports_are_recycled() {
        let stack = stack(1);
        let mut conns = Vec::new();
        for _ in 0..(MAX_PORT - MAX_BIND_PORT) {
            conns.push(stack.connect(Priority::Norm, 2, 10).unwrap());
        }
        assert!(conns
            .iter()
            .all(|c| c.local_port() > MAX_BIND_PORT && c.local_port() <= MAX_PORT));
        assert!(matches!(
            stack.connect(Priority::Norm, 2, 10),
            Err(StackError::PortsExhausted)
        ));

        conns.pop();
        assert!(stack.connect(Priority::Norm, 2, 10).is_ok());
    }

    #[tokio::test]
    async fn test_read_times_out() {
        let stack = stack(1);
        let mut conn = stack.connect(Priority::Norm, 2, 10).unwrap();
        assert!(conn.read(Duration::from_millis(10)).await.is_none());
    }
}
