//! Kademlia node Id or a lookup target
use rand::Rng;
use std::{
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

use crate::{Error, Result};

/// The size of node IDs and info hashes in bytes.
pub const ID_SIZE: usize = 20;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash)]
/// Kademlia node Id or a lookup target
pub struct Id(pub [u8; ID_SIZE]);

/// Info hashes are lookup targets, and share the layout of node Ids.
pub type InfoHash = Id;

impl Id {
    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE](crate::common::ID_SIZE).
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidArgument(format!(
                "expected {} bytes for an Id, got {}",
                ID_SIZE,
                bytes.len()
            )));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp.copy_from_slice(bytes);

        Ok(Id(tmp))
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl From<[u8; ID_SIZE]> for Id {
    fn from(bytes: [u8; ID_SIZE]) -> Self {
        Id(bytes)
    }
}

impl TryFrom<&[u8]> for Id {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self> {
        Id::from_bytes(bytes)
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }

        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

impl FromStr for Id {
    type Err = Error;

    /// Parse an Id from 40 hex characters.
    fn from_str(s: &str) -> Result<Self> {
        if s.len() != ID_SIZE * 2 || !s.is_ascii() {
            return Err(Error::InvalidArgument(format!(
                "expected {} hex characters for an Id",
                ID_SIZE * 2
            )));
        }

        let mut bytes = [0_u8; ID_SIZE];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let pair = &s[i * 2..i * 2 + 2];
            *byte = u8::from_str_radix(pair, 16)
                .map_err(|_| Error::InvalidArgument(format!("invalid hex in Id: {:?}", pair)))?;
        }

        Ok(Id(bytes))
    }
}
