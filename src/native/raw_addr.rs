//! Conversions between [SocketAddr] and C socket addresses.

use std::ffi::c_int;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use libc::{in6_addr, in_addr, sa_family_t, sockaddr, sockaddr_in, sockaddr_in6, sockaddr_storage};

/// A socket address laid out for the C library.
pub(super) struct RawAddr {
    storage: sockaddr_storage,
    len: c_int,
}

impl RawAddr {
    pub fn new(address: &SocketAddr) -> Self {
        // SAFETY: all zeroes is a valid sockaddr_storage.
        let mut storage: sockaddr_storage = unsafe { mem::zeroed() };

        let len = match address {
            SocketAddr::V4(v4) => {
                let sin = sockaddr_in {
                    sin_family: libc::AF_INET as sa_family_t,
                    sin_port: v4.port().to_be(),
                    sin_addr: in_addr {
                        s_addr: u32::from(*v4.ip()).to_be(),
                    },
                    ..zeroed_in()
                };

                // SAFETY: sockaddr_storage is large and aligned enough for any sockaddr.
                unsafe { (&mut storage as *mut sockaddr_storage).cast::<sockaddr_in>().write(sin) };

                mem::size_of::<sockaddr_in>()
            }
            SocketAddr::V6(v6) => {
                let sin6 = sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as sa_family_t,
                    sin6_port: v6.port().to_be(),
                    sin6_flowinfo: v6.flowinfo(),
                    sin6_addr: in6_addr {
                        s6_addr: v6.ip().octets(),
                    },
                    sin6_scope_id: v6.scope_id(),
                    ..zeroed_in6()
                };

                // SAFETY: see above.
                unsafe { (&mut storage as *mut sockaddr_storage).cast::<sockaddr_in6>().write(sin6) };

                mem::size_of::<sockaddr_in6>()
            }
        };

        RawAddr {
            storage,
            len: len as c_int,
        }
    }

    pub fn as_ptr(&self) -> *const sockaddr {
        (&self.storage as *const sockaddr_storage).cast()
    }

    pub fn as_mut_ptr(&mut self) -> *mut sockaddr {
        (&mut self.storage as *mut sockaddr_storage).cast()
    }

    pub fn len(&self) -> c_int {
        self.len
    }
}

pub(super) fn zeroed_in() -> sockaddr_in {
    // SAFETY: all zeroes is a valid sockaddr_in.
    unsafe { mem::zeroed() }
}

pub(super) fn zeroed_in6() -> sockaddr_in6 {
    // SAFETY: all zeroes is a valid sockaddr_in6.
    unsafe { mem::zeroed() }
}

pub(super) fn from_in(sin: &sockaddr_in) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
        u16::from_be(sin.sin_port),
    ))
}

pub(super) fn from_in6(sin6: &sockaddr_in6) -> SocketAddr {
    SocketAddr::V6(SocketAddrV6::new(
        Ipv6Addr::from(sin6.sin6_addr.s6_addr),
        u16::from_be(sin6.sin6_port),
        sin6.sin6_flowinfo,
        sin6.sin6_scope_id,
    ))
}

/// Read a C socket address, `None` for null pointers, short lengths and
/// families other than IPv4 and IPv6.
///
/// # Safety
///
/// `sa` must be null or point to at least `salen` readable bytes.
pub(super) unsafe fn to_socket_addr(sa: *const sockaddr, salen: c_int) -> Option<SocketAddr> {
    if sa.is_null() {
        return None;
    }
    let len = usize::try_from(salen).ok()?;

    match c_int::from((*sa).sa_family) {
        libc::AF_INET if len >= mem::size_of::<sockaddr_in>() => {
            Some(from_in(&*sa.cast::<sockaddr_in>()))
        }
        libc::AF_INET6 if len >= mem::size_of::<sockaddr_in6>() => {
            Some(from_in6(&*sa.cast::<sockaddr_in6>()))
        }
        _ => None,
    }
}
