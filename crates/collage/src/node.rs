//! Remote peer proxies.

use std::net::SocketAddr;

use crate::connection::Connection;
use crate::ident::NodeId;

/// A connected peer: its identity, endianness and connection.
///
/// Proxies are created by the handshake and live until disconnect. During a
/// simultaneous two-sided connect two proxies for the same peer transiently
/// exist; registration resolves the duplicate by keeping the connection
/// initiated by the smaller node id.
pub struct Node {
    id: NodeId,
    big_endian: bool,
    connection: Connection,
    /// The peer's advertised listen address, if it accepts connections.
    listen_addr: Option<SocketAddr>,
    /// True when this process initiated the connection.
    outbound: bool,
}

impl Node {
    pub(crate) fn new(
        id: NodeId,
        big_endian: bool,
        connection: Connection,
        listen_addr: Option<SocketAddr>,
        outbound: bool,
    ) -> Node {
        Node {
            id,
            big_endian,
            connection,
            listen_addr,
            outbound,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The peer's native byte order differs from little-endian hosts when
    /// set; receivers swap multi-byte fields accordingly.
    pub fn big_endian(&self) -> bool {
        self.big_endian
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr
    }

    /// The node id that initiated this connection, the tie-break key for
    /// duplicate simultaneous connects.
    pub(crate) fn initiator(&self, local: NodeId) -> NodeId {
        if self.outbound {
            local
        } else {
            self.id
        }
    }

    pub fn is_reachable(&self) -> bool {
        !self.connection.is_closed()
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Node({}, be: {})", self.id, self.big_endian)
    }
}
