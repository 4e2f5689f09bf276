//! In-process transport.
//!
//! A [`MemoryNetwork`] is a hub shared by any number of [`MemoryTransport`]
//! nodes. Each node has a host name; listeners are addressed by
//! `(host, port)` and multicast groups by `(group, port)`. Delivery is
//! immediate and ordered, which makes channel scenarios deterministic. A
//! drop filter can discard multicast datagrams per receiving host to
//! exercise gap recovery.

use crate::transport::{Transport, TransportEvent};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::{Error as IoError, ErrorKind};
use std::sync::Arc;
use std::time::Duration;
use tessera_common::{ConnId, Result, TesseraError};
use tracing::trace;

/// Decides whether a multicast datagram is lost on its way to `host`.
pub type DropFilter = Box<dyn FnMut(&str, &[u8]) -> bool + Send>;

enum Endpoint {
    Listener { port: u16 },
    Stream { peer: ConnId },
    Receiver,
    Sender { group: (String, u16) },
}

struct Conn {
    node: usize,
    endpoint: Endpoint,
}

#[derive(Default)]
struct Hub {
    hosts: Vec<String>,
    inboxes: Vec<VecDeque<TransportEvent>>,
    conns: BTreeMap<ConnId, Conn>,
    listeners: HashMap<(String, u16), ConnId>,
    groups: HashMap<(String, u16), Vec<ConnId>>,
    next_conn: ConnId,
    drop_filter: Option<DropFilter>,
    multicast_sent: u64,
    multicast_dropped: u64,
}

impl Hub {
    fn add_conn(&mut self, node: usize, endpoint: Endpoint) -> ConnId {
        self.next_conn += 1;
        self.conns.insert(self.next_conn, Conn { node, endpoint });
        self.next_conn
    }

    fn push(&mut self, node: usize, event: TransportEvent) {
        if let Some(inbox) = self.inboxes.get_mut(node) {
            inbox.push_back(event);
        }
    }
}

/// Shared in-process network.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node reachable under `host`.
    pub fn transport(&self, host: &str) -> MemoryTransport {
        let mut hub = self.hub.lock();
        hub.hosts.push(host.to_string());
        hub.inboxes.push(VecDeque::new());
        MemoryTransport {
            node: hub.hosts.len() - 1,
            hub: Arc::clone(&self.hub),
        }
    }

    /// Installs a filter consulted for every multicast delivery; returning
    /// true drops the datagram for that receiving host.
    pub fn set_drop_filter<F>(&self, filter: F)
    where
        F: FnMut(&str, &[u8]) -> bool + Send + 'static,
    {
        self.hub.lock().drop_filter = Some(Box::new(filter));
    }

    pub fn clear_drop_filter(&self) {
        self.hub.lock().drop_filter = None;
    }

    /// Multicast datagrams handed to receivers.
    pub fn multicast_sent(&self) -> u64 {
        self.hub.lock().multicast_sent
    }

    /// Multicast datagrams discarded by the drop filter.
    pub fn multicast_dropped(&self) -> u64 {
        self.hub.lock().multicast_dropped
    }

    /// Closes both ends of a connection, as if the peer went away.
    pub fn disconnect(&self, conn: ConnId) {
        let mut hub = self.hub.lock();
        let (node, peer) = match hub.conns.get(&conn) {
            Some(Conn {
                node,
                endpoint: Endpoint::Stream { peer },
            }) => (*node, *peer),
            _ => return,
        };
        hub.conns.remove(&conn);
        hub.push(node, TransportEvent::Closed { conn });
        if let Some(other) = hub.conns.remove(&peer) {
            hub.push(other.node, TransportEvent::Closed { conn: peer });
        }
    }
}

/// One node on a [`MemoryNetwork`].
pub struct MemoryTransport {
    node: usize,
    hub: Arc<Mutex<Hub>>,
}

impl MemoryTransport {
    /// Host name this node was registered under.
    pub fn host(&self) -> String {
        self.hub.lock().hosts[self.node].clone()
    }
}

impl Transport for MemoryTransport {
    fn listen(&mut self, port: u16) -> Result<ConnId> {
        let mut hub = self.hub.lock();
        let key = (hub.hosts[self.node].clone(), port);
        if hub.listeners.contains_key(&key) {
            return Err(IoError::new(
                ErrorKind::AddrInUse,
                format!("{}:{} already listening", key.0, port),
            )
            .into());
        }
        let conn = hub.add_conn(self.node, Endpoint::Listener { port });
        hub.listeners.insert(key, conn);
        Ok(conn)
    }

    fn connect(&mut self, host: &str, port: u16) -> Result<ConnId> {
        let mut hub = self.hub.lock();
        let Some(&listener) = hub.listeners.get(&(host.to_string(), port)) else {
            return Err(IoError::new(
                ErrorKind::ConnectionRefused,
                format!("nothing listening on {}:{}", host, port),
            )
            .into());
        };
        let server_node = hub.conns[&listener].node;
        let client = hub.add_conn(self.node, Endpoint::Stream { peer: 0 });
        let server = hub.add_conn(server_node, Endpoint::Stream { peer: client });
        if let Some(conn) = hub.conns.get_mut(&client) {
            conn.endpoint = Endpoint::Stream { peer: server };
        }
        hub.push(
            server_node,
            TransportEvent::Accepted {
                listener,
                conn: server,
            },
        );
        Ok(client)
    }

    fn join_multicast(&mut self, _interface: &str, group: &str, port: u16) -> Result<ConnId> {
        let mut hub = self.hub.lock();
        let conn = hub.add_conn(self.node, Endpoint::Receiver);
        hub.groups
            .entry((group.to_string(), port))
            .or_default()
            .push(conn);
        Ok(conn)
    }

    fn multicast_sender(&mut self, _interface: &str, group: &str, port: u16) -> Result<ConnId> {
        let mut hub = self.hub.lock();
        Ok(hub.add_conn(
            self.node,
            Endpoint::Sender {
                group: (group.to_string(), port),
            },
        ))
    }

    fn poll(&mut self, _timeout: Option<Duration>) -> Result<Vec<TransportEvent>> {
        let mut hub = self.hub.lock();
        Ok(hub.inboxes[self.node].drain(..).collect())
    }

    fn send(&mut self, conn: ConnId, bytes: &[u8]) -> Result<()> {
        let mut guard = self.hub.lock();
        let hub = &mut *guard;
        let Some(entry) = hub.conns.get(&conn) else {
            return Err(TesseraError::ConnectionNotFound(conn));
        };
        if entry.node != self.node {
            return Err(TesseraError::ConnectionNotFound(conn));
        }

        match &entry.endpoint {
            Endpoint::Stream { peer } => {
                let peer = *peer;
                let node = hub
                    .conns
                    .get(&peer)
                    .map(|c| c.node)
                    .ok_or(TesseraError::ConnectionNotFound(peer))?;
                hub.push(
                    node,
                    TransportEvent::Message {
                        conn: peer,
                        bytes: Bytes::copy_from_slice(bytes),
                    },
                );
                Ok(())
            }
            Endpoint::Sender { group } => {
                let receivers = hub.groups.get(group).cloned().unwrap_or_default();
                for receiver in receivers {
                    let Some(node) = hub.conns.get(&receiver).map(|c| c.node) else {
                        continue;
                    };
                    let host = &hub.hosts[node];
                    if let Some(filter) = hub.drop_filter.as_mut() {
                        if filter(host, bytes) {
                            hub.multicast_dropped += 1;
                            trace!(host = %host, "multicast datagram dropped");
                            continue;
                        }
                    }
                    hub.multicast_sent += 1;
                    hub.inboxes[node].push_back(TransportEvent::Message {
                        conn: receiver,
                        bytes: Bytes::copy_from_slice(bytes),
                    });
                }
                Ok(())
            }
            Endpoint::Listener { .. } | Endpoint::Receiver => Err(TesseraError::InvalidParameter {
                name: "conn".to_string(),
                value: format!("{} is not writable", conn),
            }),
        }
    }

    fn local_port(&self, conn: ConnId) -> Option<u16> {
        let hub = self.hub.lock();
        let entry = hub.conns.get(&conn)?;
        match (&entry.endpoint, entry.node == self.node) {
            (Endpoint::Listener { port }, true) => Some(*port),
            (Endpoint::Sender { group }, true) => Some(group.1),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_and_exchange() {
        let net = MemoryNetwork::new();
        let mut server = net.transport("server");
        let mut client = net.transport("client");
        assert_eq!(server.host(), "server");

        let listener = server.listen(9000).unwrap();
        assert_eq!(server.local_port(listener), Some(9000));
        let conn = client.connect("server", 9000).unwrap();

        let events = server.poll(None).unwrap();
        let accepted = match events.as_slice() {
            [TransportEvent::Accepted { listener: l, conn }] if *l == listener => *conn,
            other => panic!("unexpected {:?}", other),
        };

        client.send(conn, b"ping").unwrap();
        server.send(accepted, b"pong").unwrap();
        assert_eq!(
            server.poll(None).unwrap(),
            vec![TransportEvent::Message {
                conn: accepted,
                bytes: Bytes::from_static(b"ping")
            }]
        );
        assert_eq!(
            client.poll(None).unwrap(),
            vec![TransportEvent::Message {
                conn,
                bytes: Bytes::from_static(b"pong")
            }]
        );
    }

    #[test]
    fn test_connect_refused_and_duplicate_listen() {
        let net = MemoryNetwork::new();
        let mut a = net.transport("a");
        assert!(matches!(a.connect("b", 1), Err(TesseraError::Io(_))));
        a.listen(1).unwrap();
        assert!(a.listen(1).is_err());
    }

    #[test]
    fn test_multicast_fanout_and_drops() {
        let net = MemoryNetwork::new();
        let mut publisher = net.transport("pub");
        let mut x = net.transport("x");
        let mut y = net.transport("y");
        let sender = publisher.multicast_sender("", "239.0.0.1", 5000).unwrap();
        let rx = x.join_multicast("", "239.0.0.1", 5000).unwrap();
        let ry = y.join_multicast("", "239.0.0.1", 5000).unwrap();
        // Other group, never receives.
        let mut z = net.transport("z");
        z.join_multicast("", "239.0.0.2", 5000).unwrap();

        net.set_drop_filter(|host, _| host == "y");
        publisher.send(sender, b"one").unwrap();
        net.clear_drop_filter();
        publisher.send(sender, b"two").unwrap();

        let xs: Vec<_> = x.poll(None).unwrap();
        assert_eq!(xs.len(), 2);
        assert!(xs.iter().all(|e| matches!(e, TransportEvent::Message { conn, .. } if *conn == rx)));
        assert_eq!(
            y.poll(None).unwrap(),
            vec![TransportEvent::Message {
                conn: ry,
                bytes: Bytes::from_static(b"two")
            }]
        );
        assert!(z.poll(None).unwrap().is_empty());
        assert_eq!(net.multicast_sent(), 3);
        assert_eq!(net.multicast_dropped(), 1);
    }

    #[test]
    fn test_disconnect_closes_both_ends() {
        let net = MemoryNetwork::new();
        let mut server = net.transport("s");
        let mut client = net.transport("c");
        server.listen(1).unwrap();
        let conn = client.connect("s", 1).unwrap();
        let accepted = match server.poll(None).unwrap().as_slice() {
            [TransportEvent::Accepted { conn, .. }] => *conn,
            other => panic!("unexpected {:?}", other),
        };

        net.disconnect(conn);
        assert_eq!(client.poll(None).unwrap(), vec![TransportEvent::Closed { conn }]);
        assert_eq!(
            server.poll(None).unwrap(),
            vec![TransportEvent::Closed { conn: accepted }]
        );
        assert!(client.send(conn, b"x").is_err());
    }
}
