//! Compact contact records exchanged with the engine.
//!
//! A record is an address followed by a port, both in network order: 6 bytes
//! for IPv4 and 18 bytes for IPv6. Lists of records are concatenated without
//! separators or a count prefix.

use std::fmt::{self, Debug, Formatter};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tracing::trace;

use crate::{Error, Result};

/// Size of an IPv4 contact record.
pub const IPV4_RECORD_SIZE: usize = 6;
/// Size of an IPv6 contact record.
pub const IPV6_RECORD_SIZE: usize = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Address family of a contact record.
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    /// Size in bytes of one record of this family.
    pub const fn stride(&self) -> usize {
        match self {
            AddressFamily::V4 => IPV4_RECORD_SIZE,
            AddressFamily::V6 => IPV6_RECORD_SIZE,
        }
    }

    pub fn of(address: &SocketAddr) -> Self {
        match address {
            SocketAddr::V4(_) => AddressFamily::V4,
            SocketAddr::V6(_) => AddressFamily::V6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Address family a search runs on, with the engine's numbering.
pub enum SearchFamily {
    /// Accepted for completeness, has no routing table behind it.
    Local = 0,
    V4 = 1,
    V6 = 2,
}

impl TryFrom<i32> for SearchFamily {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self> {
        match value {
            0 => Ok(SearchFamily::Local),
            1 => Ok(SearchFamily::V4),
            2 => Ok(SearchFamily::V6),
            _ => Err(Error::InvalidArgument(format!(
                "unsupported address family {}",
                value
            ))),
        }
    }
}

impl From<AddressFamily> for SearchFamily {
    fn from(family: AddressFamily) -> Self {
        match family {
            AddressFamily::V4 => SearchFamily::V4,
            AddressFamily::V6 => SearchFamily::V6,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
/// A peer or node address decoded from a compact record.
pub struct NodeContact(SocketAddr);

impl NodeContact {
    pub fn new(address: SocketAddr) -> Self {
        NodeContact(address)
    }

    pub fn address(&self) -> SocketAddr {
        self.0
    }

    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(&self.0)
    }

    /// Encode this contact as a compact record.
    pub fn to_bytes(&self) -> Vec<u8> {
        encode_address(&self.0)
    }
}

impl From<SocketAddr> for NodeContact {
    fn from(address: SocketAddr) -> Self {
        NodeContact(address)
    }
}

impl From<NodeContact> for SocketAddr {
    fn from(contact: NodeContact) -> Self {
        contact.0
    }
}

impl Debug for NodeContact {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "NodeContact({})", self.0)
    }
}

/// Encode an address as a compact record.
///
/// IPv6 scope ids and flow info have no place in the record and are dropped.
pub fn encode_address(address: &SocketAddr) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(AddressFamily::of(address).stride());

    match address.ip() {
        IpAddr::V4(v4) => bytes.extend_from_slice(&v4.octets()),
        IpAddr::V6(v6) => bytes.extend_from_slice(&v6.octets()),
    }

    bytes.extend_from_slice(&address.port().to_be_bytes());

    bytes
}

/// Decode a single compact record. `bytes` must be exactly one record long.
pub fn decode_address(bytes: &[u8], family: AddressFamily) -> Result<SocketAddr> {
    if bytes.len() != family.stride() {
        return Err(Error::InvalidArgument(format!(
            "expected {} bytes for a {:?} record, got {}",
            family.stride(),
            family,
            bytes.len()
        )));
    }

    let (ip_bytes, port_bytes) = bytes.split_at(bytes.len() - 2);
    let port = u16::from_be_bytes([port_bytes[0], port_bytes[1]]);

    let ip = match family {
        AddressFamily::V4 => {
            let mut octets = [0_u8; 4];
            octets.copy_from_slice(ip_bytes);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        AddressFamily::V6 => {
            let mut octets = [0_u8; 16];
            octets.copy_from_slice(ip_bytes);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
    };

    Ok(SocketAddr::new(ip, port))
}

/// Decode every whole record of `buffer`, in order.
///
/// Trailing bytes that do not make up a whole record are ignored.
pub fn decode_contacts(buffer: &[u8], family: AddressFamily) -> Vec<NodeContact> {
    let stride = family.stride();
    let chunks = buffer.chunks_exact(stride);

    let remainder = chunks.remainder().len();
    if remainder > 0 {
        trace!(
            ?family,
            len = buffer.len(),
            remainder,
            "Dropping partial trailing contact record"
        );
    }

    chunks
        .filter_map(|chunk| decode_address(chunk, family).ok())
        .map(NodeContact)
        .collect()
}

/// Concatenate the compact records of `contacts`.
pub fn encode_contacts(contacts: &[NodeContact]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(contacts.iter().map(|c| c.family().stride()).sum());

    for contact in contacts {
        bytes.extend(contact.to_bytes());
    }

    bytes
}
