//! Socket layer consumed by the channel.
//!
//! The channel talks to the network only through [`Transport`]: TCP-like
//! point-to-point connections for gap-fill traffic and UDP multicast for
//! the data path. [`NetTransport`] implements it over a `mio` poller;
//! `MemoryTransport` implements it in-process for tests.

use crate::message::{Message, MAX_MESSAGE_SIZE};
use bytes::{Buf, Bytes, BytesMut};
use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::{Events, Interest, Poll, Token};
use socket2::{Domain, Protocol, Socket as RawSocket, Type};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, ErrorKind, Read, Write};
use std::net::{self, Ipv4Addr, SocketAddrV4};
use std::time::{Duration, Instant};
use tessera_common::{ConnId, Result, TesseraError};
use tracing::{debug, info, warn};

/// Something that happened on a transport since the last poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A listener accepted a new connection.
    Accepted { listener: ConnId, conn: ConnId },
    /// One complete message arrived on a connection or multicast socket.
    Message { conn: ConnId, bytes: Bytes },
    /// The peer closed the connection or its framing broke.
    Closed { conn: ConnId },
}

/// Non-blocking message transport.
pub trait Transport {
    /// Opens a listener for gap-fill connections.
    fn listen(&mut self, port: u16) -> Result<ConnId>;

    /// Opens a connection to a listener.
    fn connect(&mut self, host: &str, port: u16) -> Result<ConnId>;

    /// Joins a multicast group and returns the receiving socket.
    fn join_multicast(&mut self, interface: &str, group: &str, port: u16) -> Result<ConnId>;

    /// Opens a socket that sends to a multicast group.
    fn multicast_sender(&mut self, interface: &str, group: &str, port: u16) -> Result<ConnId>;

    /// Collects pending events. Waits up to `timeout` for the first one,
    /// or indefinitely when `timeout` is `None`.
    fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<TransportEvent>>;

    /// Sends one encoded message.
    fn send(&mut self, conn: ConnId, bytes: &[u8]) -> Result<()>;

    /// Local port a listener or multicast socket is bound to.
    fn local_port(&self, conn: ConnId) -> Option<u16>;
}

const EVENT_CAPACITY: usize = 256;
const LISTEN_BACKLOG: i32 = 128;
const READ_CHUNK: usize = 4096;

/// Parses a dotted IPv4 address; an empty string means any interface.
pub(crate) fn parse_ipv4(addr: &str) -> Result<Ipv4Addr> {
    if addr.is_empty() {
        return Ok(Ipv4Addr::UNSPECIFIED);
    }
    addr.parse::<Ipv4Addr>()
        .map_err(|_| TesseraError::Address(format!("invalid IPv4 address '{}'", addr)))
}

fn parse_group(group: &str) -> Result<Ipv4Addr> {
    let addr = parse_ipv4(group)?;
    if !addr.is_multicast() {
        return Err(TesseraError::Address(format!(
            "{} is not a multicast group",
            group
        )));
    }
    Ok(addr)
}

/// Opens a UDP socket bound to `port` on every interface that other
/// subscribers on the same host can bind too.
fn group_socket(port: u16) -> io::Result<RawSocket> {
    let socket = RawSocket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
    Ok(socket)
}

struct TcpConn {
    stream: TcpStream,
    inbound: BytesMut,
    outbound: BytesMut,
}

impl TcpConn {
    fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            inbound: BytesMut::with_capacity(READ_CHUNK),
            outbound: BytesMut::new(),
        })
    }

    /// Reads until the socket would block and splits the bytes into
    /// messages. Returns false once the connection is finished.
    fn read_available(&mut self, conn: ConnId, events: &mut Vec<TransportEvent>) -> bool {
        let mut chunk = [0u8; READ_CHUNK];
        let mut open = true;
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    open = false;
                    break;
                }
                Ok(n) => self.inbound.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(conn, error = %e, "connection read failed");
                    open = false;
                    break;
                }
            }
        }

        loop {
            match Message::peek_length(&self.inbound) {
                Ok(Some(len)) if self.inbound.len() >= len => {
                    let bytes = self.inbound.split_to(len).freeze();
                    events.push(TransportEvent::Message { conn, bytes });
                }
                Ok(_) => return open,
                Err(e) => {
                    warn!(conn, error = %e, "broken stream framing, closing connection");
                    return false;
                }
            }
        }
    }

    /// Writes queued bytes until the socket would block. The rest goes out
    /// on the next writable event.
    fn flush(&mut self) -> io::Result<()> {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) => self.outbound.advance(n),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

enum Socket {
    Listener(TcpListener),
    Stream(TcpConn),
    Receiver(UdpSocket),
    Sender {
        socket: net::UdpSocket,
        target: SocketAddrV4,
    },
}

/// [`Transport`] over sockets registered with a `mio` poller.
///
/// Each connection id doubles as its poll token. Readiness is edge
/// triggered, so every ready socket is drained until it would block. TCP
/// streams are split into messages by their ASCII length header; multicast
/// datagrams carry exactly one message each.
pub struct NetTransport {
    poll: Poll,
    events: Events,
    sockets: BTreeMap<ConnId, Socket>,
    next_id: ConnId,
}

impl NetTransport {
    pub fn new() -> Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENT_CAPACITY),
            sockets: BTreeMap::new(),
            next_id: 0,
        })
    }

    fn next_conn(&mut self) -> ConnId {
        self.next_id += 1;
        self.next_id
    }

    fn add_listener(&mut self, mut listener: TcpListener) -> io::Result<ConnId> {
        let id = self.next_conn();
        self.poll
            .registry()
            .register(&mut listener, Token(id as usize), Interest::READABLE)?;
        self.sockets.insert(id, Socket::Listener(listener));
        Ok(id)
    }

    fn add_stream(&mut self, mut stream: TcpStream) -> io::Result<ConnId> {
        let id = self.next_conn();
        self.poll.registry().register(
            &mut stream,
            Token(id as usize),
            Interest::READABLE | Interest::WRITABLE,
        )?;
        self.sockets.insert(id, Socket::Stream(TcpConn::new(stream)?));
        Ok(id)
    }

    fn add_receiver(&mut self, mut socket: UdpSocket) -> io::Result<ConnId> {
        let id = self.next_conn();
        self.poll
            .registry()
            .register(&mut socket, Token(id as usize), Interest::READABLE)?;
        self.sockets.insert(id, Socket::Receiver(socket));
        Ok(id)
    }

    fn close(&mut self, conn: ConnId) {
        if let Some(Socket::Stream(mut tcp)) = self.sockets.remove(&conn) {
            if let Err(e) = self.poll.registry().deregister(&mut tcp.stream) {
                debug!(conn, error = %e, "deregister failed");
            }
        }
    }

    /// Services every socket the last poll reported ready.
    fn drain_ready(&mut self) -> Vec<TransportEvent> {
        let ready: BTreeSet<ConnId> = self
            .events
            .iter()
            .filter_map(|e| ConnId::try_from(e.token().0).ok())
            .collect();
        let mut events = Vec::new();
        let mut accepted = Vec::new();
        let mut closed = Vec::new();

        for id in ready {
            let Some(socket) = self.sockets.get_mut(&id) else {
                continue;
            };
            match socket {
                Socket::Listener(listener) => loop {
                    match listener.accept() {
                        Ok((stream, peer)) => accepted.push((id, stream, peer)),
                        Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                        Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                        Err(e) => {
                            warn!(listener = id, error = %e, "accept failed");
                            break;
                        }
                    }
                },
                Socket::Stream(conn) => {
                    if let Err(e) = conn.flush() {
                        warn!(conn = id, error = %e, "connection write failed");
                        closed.push(id);
                        continue;
                    }
                    if !conn.read_available(id, &mut events) {
                        closed.push(id);
                    }
                }
                Socket::Receiver(socket) => {
                    let mut buf = [0u8; MAX_MESSAGE_SIZE];
                    loop {
                        match socket.recv_from(&mut buf) {
                            Ok((n, _)) => events.push(TransportEvent::Message {
                                conn: id,
                                bytes: Bytes::copy_from_slice(&buf[..n]),
                            }),
                            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                            Err(e) => {
                                warn!(conn = id, error = %e, "multicast receive failed");
                                break;
                            }
                        }
                    }
                }
                Socket::Sender { .. } => {}
            }
        }

        for (listener, stream, peer) in accepted {
            match self.add_stream(stream) {
                Ok(conn) => {
                    info!(listener, conn, %peer, "accepted connection");
                    events.push(TransportEvent::Accepted { listener, conn });
                }
                Err(e) => warn!(listener, %peer, error = %e, "failed to register accepted connection"),
            }
        }
        for conn in closed {
            self.close(conn);
            debug!(conn, "connection closed");
            events.push(TransportEvent::Closed { conn });
        }
        events
    }
}

impl Transport for NetTransport {
    fn listen(&mut self, port: u16) -> Result<ConnId> {
        let socket = RawSocket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
        socket.listen(LISTEN_BACKLOG)?;
        let listener = TcpListener::from_std(net::TcpListener::from(socket));
        Ok(self.add_listener(listener)?)
    }

    fn connect(&mut self, host: &str, port: u16) -> Result<ConnId> {
        // Blocking connect so a refused peer is reported to the caller.
        let stream = net::TcpStream::connect((host, port))?;
        stream.set_nonblocking(true)?;
        Ok(self.add_stream(TcpStream::from_std(stream))?)
    }

    fn join_multicast(&mut self, interface: &str, group: &str, port: u16) -> Result<ConnId> {
        let interface = parse_ipv4(interface)?;
        let group = parse_group(group)?;
        let socket = group_socket(port)?;
        socket.join_multicast_v4(&group, &interface)?;
        let socket = UdpSocket::from_std(net::UdpSocket::from(socket));
        Ok(self.add_receiver(socket)?)
    }

    fn multicast_sender(&mut self, interface: &str, group: &str, port: u16) -> Result<ConnId> {
        let interface = parse_ipv4(interface)?;
        let group = parse_group(group)?;
        let socket = RawSocket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_multicast_if_v4(&interface)?;
        socket.set_multicast_loop_v4(true)?;
        let id = self.next_conn();
        self.sockets.insert(
            id,
            Socket::Sender {
                socket: net::UdpSocket::from(socket),
                target: SocketAddrV4::new(group, port),
            },
        );
        Ok(id)
    }

    fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<TransportEvent>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let wait = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            match self.poll.poll(&mut self.events, wait) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
            let events = self.drain_ready();
            // Writable-only wakeups produce no events; keep waiting.
            if !events.is_empty() || deadline.map_or(false, |d| Instant::now() >= d) {
                return Ok(events);
            }
        }
    }

    fn send(&mut self, conn: ConnId, bytes: &[u8]) -> Result<()> {
        match self.sockets.get_mut(&conn) {
            Some(Socket::Stream(tcp)) => {
                tcp.outbound.extend_from_slice(bytes);
                tcp.flush()?;
                Ok(())
            }
            Some(Socket::Sender { socket, target }) => {
                socket.send_to(bytes, *target)?;
                Ok(())
            }
            Some(_) => Err(TesseraError::InvalidParameter {
                name: "conn".to_string(),
                value: format!("{} is not writable", conn),
            }),
            None => Err(TesseraError::ConnectionNotFound(conn)),
        }
    }

    fn local_port(&self, conn: ConnId) -> Option<u16> {
        let addr = match self.sockets.get(&conn)? {
            Socket::Listener(listener) => listener.local_addr(),
            Socket::Stream(tcp) => tcp.stream.local_addr(),
            Socket::Receiver(socket) => socket.local_addr(),
            Socket::Sender { socket, .. } => socket.local_addr(),
        };
        addr.ok().map(|a| a.port())
    }
}
