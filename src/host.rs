//! Callbacks the engine requires from its host.
//!
//! The engine calls these synchronously from inside native calls: a blacklist
//! check on every received packet, a hash used to derive tokens and obfuscate
//! ids, and a source of random bytes for transaction ids and secrets.

use std::fmt::Debug;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroUsize;

use lru::LruCache;
use rand::{rngs::OsRng, RngCore};
use tracing::debug;

use crate::{Error, Result};

/// Default maximum number of banned IPs kept by [Blacklist].
pub const MAX_BLACKLISTED: usize = 1000;

/// Capabilities injected into an [Engine](crate::Engine) at construction.
pub trait HostCallbacks: Send + Debug {
    /// Returns true if packets from this address must be ignored.
    ///
    /// Runs on the hot path of every received packet, so keep it cheap.
    fn blacklisted(&self, address: &SocketAddr) -> bool;

    /// Fill `out` with a deterministic cryptographic digest of the concatenated `parts`.
    fn hash(&self, out: &mut [u8], parts: [&[u8]; 3]);

    /// Fill `buf` with cryptographically strong random bytes.
    ///
    /// Must fail with [Error::EntropyFailure] rather than return weak or partial output.
    fn random_bytes(&mut self, buf: &mut [u8]) -> Result<()>;
}

/// Bounded set of banned IPs, evicting the least recently banned one when full.
pub struct Blacklist {
    ips: LruCache<IpAddr, ()>,
}

impl Debug for Blacklist {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Blacklist ({} ips)", self.ips.len())
    }
}

impl Blacklist {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Blacklist {
            ips: LruCache::new(capacity),
        }
    }

    pub fn ban(&mut self, ip: IpAddr) {
        self.ips.put(ip, ());
    }

    pub fn unban(&mut self, ip: &IpAddr) {
        self.ips.pop(ip);
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.ips.contains(ip)
    }

    pub fn len(&self) -> usize {
        self.ips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ips.is_empty()
    }
}

impl Default for Blacklist {
    fn default() -> Self {
        Self::new(NonZeroUsize::new(MAX_BLACKLISTED).unwrap_or(NonZeroUsize::MIN))
    }
}

#[derive(Debug, Default)]
/// SHA-1 hashing, OS entropy and an IP [Blacklist].
pub struct DefaultHost {
    blacklist: Blacklist,
}

impl DefaultHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blacklist(mut self, blacklist: Blacklist) -> Self {
        self.blacklist = blacklist;
        self
    }

    pub fn blacklist(&self) -> &Blacklist {
        &self.blacklist
    }

    pub fn blacklist_mut(&mut self) -> &mut Blacklist {
        &mut self.blacklist
    }
}

impl HostCallbacks for DefaultHost {
    fn blacklisted(&self, address: &SocketAddr) -> bool {
        self.blacklist.contains(&address.ip())
    }

    fn hash(&self, out: &mut [u8], parts: [&[u8]; 3]) {
        sha1_digest(out, parts)
    }

    fn random_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        OsRng.try_fill_bytes(buf).map_err(|error| {
            debug!(?error, "OS random source failed");
            Error::EntropyFailure(error.to_string())
        })
    }
}

/// SHA-1 of the concatenated `parts`, truncated or zero-padded to `out`.
pub fn sha1_digest(out: &mut [u8], parts: [&[u8]; 3]) {
    let mut hasher = sha1_smol::Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    let digest = hasher.digest().bytes();

    let len = out.len().min(digest.len());
    out[..len].copy_from_slice(&digest[..len]);
    out[len..].fill(0);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hash_is_sha1_of_concatenation() {
        let host = DefaultHost::new();

        let mut split = [0_u8; 20];
        host.hash(&mut split, [b"mainline", b"-", b"dht"]);

        let mut whole = [0_u8; 20];
        host.hash(&mut whole, [b"mainline-dht", b"", b""]);

        assert_eq!(split, whole);
        assert_eq!(
            split,
            sha1_smol::Sha1::from("mainline-dht").digest().bytes()
        );
    }

    #[test]
    fn hash_truncates_and_pads() {
        let host = DefaultHost::new();
        let parts: [&[u8]; 3] = [b"token", b"10.0.0.1", b"secret"];

        let mut full = [0_u8; 20];
        host.hash(&mut full, parts);

        let mut short = [0xff_u8; 8];
        host.hash(&mut short, parts);
        assert_eq!(short, full[..8]);

        let mut long = [0xff_u8; 32];
        host.hash(&mut long, parts);
        assert_eq!(long[..20], full);
        assert!(long[20..].iter().all(|b| *b == 0));
    }

    #[test]
    fn random_bytes_fill_the_buffer() {
        let mut host = DefaultHost::new();

        let mut a = [0_u8; 32];
        let mut b = [0_u8; 32];
        host.random_bytes(&mut a).unwrap();
        host.random_bytes(&mut b).unwrap();

        assert_ne!(a, b);
        host.random_bytes(&mut []).unwrap();
    }

    #[test]
    fn blacklist() {
        let mut host = DefaultHost::new()
            .with_blacklist(Blacklist::new(NonZeroUsize::new(2).unwrap()));

        let a: SocketAddr = "10.0.0.1:6881".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:6881".parse().unwrap();
        let c: SocketAddr = "[::2]:6881".parse().unwrap();

        assert!(!host.blacklisted(&a));

        host.blacklist_mut().ban(a.ip());
        assert!(host.blacklisted(&a));
        assert!(host.blacklisted(&"10.0.0.1:1".parse().unwrap()));

        host.blacklist_mut().ban(b.ip());
        host.blacklist_mut().ban(c.ip());
        assert!(!host.blacklisted(&a));
        assert!(host.blacklisted(&b));
        assert!(host.blacklisted(&c));

        host.blacklist_mut().unban(&b.ip());
        assert!(!host.blacklisted(&b));
        assert_eq!(host.blacklist().len(), 1);
    }
}
