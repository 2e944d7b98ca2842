use std::net::{SocketAddr, UdpSocket};

use crate::common::Id;

#[derive(Debug, Default)]
/// Dht Configurations
pub struct Config {
    /// Node Id to initialize the engine with.
    ///
    /// Defaults to a random Id.
    pub id: Option<Id>,
    /// UDP sockets the engine sends from, to read incoming datagrams on.
    ///
    /// Usually one IPv4 and one IPv6 socket, bound by the caller. The actor
    /// switches them to non-blocking mode.
    ///
    /// Defaults to no sockets, where the engine is only driven by its timer.
    pub sockets: Vec<UdpSocket>,
    /// Nodes to ping once the actor starts, to populate the routing table.
    ///
    /// Defaults to an empty list.
    pub bootstrap: Vec<SocketAddr>,
}
