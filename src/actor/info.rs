use std::net::SocketAddr;

use crate::common::{AddressFamily, Id, TableStats};
use crate::engine::NativeEngine;
use crate::host::HostCallbacks;
use crate::Result;

use super::Actor;

/// Information and statistics about this mainline node.
#[derive(Debug, Clone)]
pub struct Info {
    id: Id,
    local_addrs: Vec<SocketAddr>,
    ipv4: TableStats,
    ipv6: TableStats,
}

impl Info {
    /// This Node's [Id]
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Local UDP socket addresses that this node is reading from.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Routing table counters for IPv4 nodes.
    pub fn ipv4(&self) -> TableStats {
        self.ipv4
    }

    /// Routing table counters for IPv6 nodes.
    pub fn ipv6(&self) -> TableStats {
        self.ipv6
    }
}

impl Info {
    pub(crate) fn collect<N: NativeEngine, H: HostCallbacks>(actor: &mut Actor<N, H>) -> Result<Self> {
        let ipv4 = actor.engine.get_stats(AddressFamily::V4)?;
        let ipv6 = actor.engine.get_stats(AddressFamily::V6)?;

        Ok(Self {
            id: *actor.engine.id(),
            local_addrs: actor.socket.local_addrs().to_vec(),
            ipv4,
            ipv6,
        })
    }
}
