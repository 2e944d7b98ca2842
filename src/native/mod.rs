//! FFI backend linking the C `dht` library.
//!
//! The library keeps global state, so only one [LibDht] may be alive per
//! process. It also expects the host to export `dht_blacklisted`, `dht_hash`
//! and `dht_random_bytes`: these forward to the [HostContext] of the engine
//! call in progress on the current thread.

mod raw_addr;

use std::cell::Cell;
use std::ffi::{c_int, c_uchar, c_void};
use std::marker::PhantomData;
use std::net::{SocketAddr, UdpSocket};
use std::os::fd::AsRawFd;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::atomic::{AtomicBool, Ordering};

use libc::{size_t, sockaddr, sockaddr_in, sockaddr_in6, time_t};
use rand::{rngs::OsRng, RngCore};
use tracing::{debug, warn};

use crate::common::{AddressFamily, Id, SearchFamily, ID_SIZE};
use crate::engine::{HostContext, InboundPacket, NativeEngine, NativeResult, NativeStatus, PendingCallback};
use crate::host::sha1_digest;
use crate::{Error, Result};

use raw_addr::RawAddr;

type DhtCallback = unsafe extern "C" fn(
    closure: *mut c_void,
    event: c_int,
    info_hash: *const c_uchar,
    data: *const c_void,
    data_len: size_t,
);

#[link(name = "dht")]
extern "C" {
    fn dht_init(s: c_int, s6: c_int, id: *const c_uchar, v: *const c_uchar) -> c_int;
    fn dht_uninit() -> c_int;
    fn dht_insert_node(id: *const c_uchar, sa: *mut sockaddr, salen: c_int) -> c_int;
    fn dht_ping_node(sa: *const sockaddr, salen: c_int) -> c_int;
    fn dht_periodic(
        buf: *const c_void,
        buflen: size_t,
        from: *const sockaddr,
        fromlen: c_int,
        tosleep: *mut time_t,
        callback: Option<DhtCallback>,
        closure: *mut c_void,
    ) -> c_int;
    fn dht_search(
        id: *const c_uchar,
        port: c_int,
        af: c_int,
        callback: Option<DhtCallback>,
        closure: *mut c_void,
    ) -> c_int;
    fn dht_nodes(
        af: c_int,
        good_return: *mut c_int,
        dubious_return: *mut c_int,
        cached_return: *mut c_int,
        incoming_return: *mut c_int,
    ) -> c_int;
    fn dht_get_nodes(
        sin: *mut sockaddr_in,
        num: *mut c_int,
        sin6: *mut sockaddr_in6,
        num6: *mut c_int,
    ) -> c_int;
}

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Most nodes a routing table holds per family: 8 per bucket, 160 buckets.
const MAX_TABLE_NODES: usize = 8 * 160;

#[derive(Debug)]
/// The C `dht` library, driven through an [Engine](crate::Engine).
pub struct LibDht {
    ipv4: Option<UdpSocket>,
    ipv6: Option<UdpSocket>,
    /// Packets are copied here to append the NUL terminator the library requires.
    packet: Vec<u8>,
}

impl LibDht {
    /// Claim the library, to run over these sockets.
    ///
    /// The engine sends from these sockets, and the host must feed it every
    /// datagram they receive, for example by passing clones of them to
    /// [DhtBuilder::socket](crate::DhtBuilder::socket).
    pub fn new(ipv4: Option<UdpSocket>, ipv6: Option<UdpSocket>) -> Result<Self> {
        if ipv4.is_none() && ipv6.is_none() {
            return Err(Error::InvalidArgument(
                "at least one socket is required".to_string(),
            ));
        }

        INITIALIZED
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::AlreadyInitialized)?;

        Ok(LibDht {
            ipv4,
            ipv6,
            packet: Vec::new(),
        })
    }
}

impl Drop for LibDht {
    fn drop(&mut self) {
        INITIALIZED.store(false, Ordering::Release);
    }
}

fn fd(socket: &Option<UdpSocket>) -> c_int {
    socket.as_ref().map(|s| s.as_raw_fd()).unwrap_or(-1)
}

fn af(family: AddressFamily) -> c_int {
    match family {
        AddressFamily::V4 => libc::AF_INET,
        AddressFamily::V6 => libc::AF_INET6,
    }
}

fn search_af(family: SearchFamily) -> c_int {
    match family {
        SearchFamily::Local => libc::AF_UNIX,
        SearchFamily::V4 => libc::AF_INET,
        SearchFamily::V6 => libc::AF_INET6,
    }
}

impl NativeEngine for LibDht {
    fn init(&mut self, id: &Id, host: &mut HostContext<'_>) -> NativeResult<()> {
        let _scope = HostScope::enter(host);

        // SAFETY: the id is 20 bytes, and a null `v` means no client version.
        let rc = unsafe { dht_init(fd(&self.ipv4), fd(&self.ipv6), id.as_bytes().as_ptr(), ptr::null()) };

        NativeStatus::check(rc).map(|_| ())
    }

    fn uninit(&mut self) -> NativeResult<()> {
        // SAFETY: no arguments.
        NativeStatus::check(unsafe { dht_uninit() }).map(|_| ())
    }

    fn insert_node(
        &mut self,
        id: &Id,
        address: &SocketAddr,
        host: &mut HostContext<'_>,
    ) -> NativeResult<()> {
        let _scope = HostScope::enter(host);
        let mut raw = RawAddr::new(address);

        // SAFETY: `raw` holds a valid sockaddr of `raw.len()` bytes.
        let rc = unsafe { dht_insert_node(id.as_bytes().as_ptr(), raw.as_mut_ptr(), raw.len()) };

        NativeStatus::check(rc).map(|_| ())
    }

    fn ping_node(&mut self, address: &SocketAddr, host: &mut HostContext<'_>) -> NativeResult<()> {
        let _scope = HostScope::enter(host);
        let raw = RawAddr::new(address);

        // SAFETY: see `insert_node`.
        let rc = unsafe { dht_ping_node(raw.as_ptr(), raw.len()) };

        NativeStatus::check(rc).map(|_| ())
    }

    fn periodic(
        &mut self,
        packet: Option<InboundPacket<'_>>,
        callback: &mut PendingCallback<'_, '_>,
        host: &mut HostContext<'_>,
    ) -> NativeResult<i64> {
        let _scope = HostScope::enter(host);
        let closure = callback.closure();
        let mut tosleep: time_t = 0;

        let rc = match packet {
            None => {
                // SAFETY: no packet, and `closure` is alive until the call returns.
                unsafe {
                    dht_periodic(
                        ptr::null(),
                        0,
                        ptr::null(),
                        0,
                        &mut tosleep,
                        Some(event_trampoline),
                        closure,
                    )
                }
            }
            Some(InboundPacket { payload, from }) => {
                self.packet.clear();
                self.packet.extend_from_slice(payload);
                self.packet.push(0);

                let from = RawAddr::new(&from);

                // SAFETY: the buffer is `payload.len()` bytes followed by a NUL.
                unsafe {
                    dht_periodic(
                        self.packet.as_ptr().cast(),
                        payload.len(),
                        from.as_ptr(),
                        from.len(),
                        &mut tosleep,
                        Some(event_trampoline),
                        closure,
                    )
                }
            }
        };

        NativeStatus::check(rc)?;

        Ok(i64::from(tosleep))
    }

    fn search(
        &mut self,
        id: &Id,
        port: u16,
        family: SearchFamily,
        callback: &mut PendingCallback<'_, '_>,
        host: &mut HostContext<'_>,
    ) -> NativeResult<()> {
        let _scope = HostScope::enter(host);

        // SAFETY: `closure` is alive until the call returns.
        let rc = unsafe {
            dht_search(
                id.as_bytes().as_ptr(),
                c_int::from(port),
                search_af(family),
                Some(event_trampoline),
                callback.closure(),
            )
        };

        NativeStatus::check(rc).map(|_| ())
    }

    fn nodes(&mut self, family: AddressFamily) -> NativeResult<[i32; 4]> {
        let (mut good, mut dubious, mut cached, mut incoming) = (0, 0, 0, 0);

        // SAFETY: the library writes one int to each pointer.
        let rc = unsafe { dht_nodes(af(family), &mut good, &mut dubious, &mut cached, &mut incoming) };
        NativeStatus::check(rc)?;

        Ok([good, dubious, cached, incoming])
    }

    fn get_nodes(&mut self, max_v4: usize, max_v6: usize) -> NativeResult<Vec<SocketAddr>> {
        let (max_v4, max_v6) = node_caps(max_v4, max_v6);

        let mut sin = vec![raw_addr::zeroed_in(); max_v4];
        let mut sin6 = vec![raw_addr::zeroed_in6(); max_v6];
        let mut num = c_int::try_from(max_v4).unwrap_or(c_int::MAX);
        let mut num6 = c_int::try_from(max_v6).unwrap_or(c_int::MAX);

        // SAFETY: the library writes at most `num` and `num6` entries, and
        // updates them with the number of entries written.
        let rc = unsafe { dht_get_nodes(sin.as_mut_ptr(), &mut num, sin6.as_mut_ptr(), &mut num6) };
        NativeStatus::check(rc)?;

        let num = usize::try_from(num).unwrap_or(0).min(max_v4);
        let num6 = usize::try_from(num6).unwrap_or(0).min(max_v6);

        Ok(sin[..num]
            .iter()
            .map(raw_addr::from_in)
            .chain(sin6[..num6].iter().map(raw_addr::from_in6))
            .collect())
    }
}

/// Clamp the requested caps to what a routing table can hold, since they size
/// the buffers handed to the library.
fn node_caps(max_v4: usize, max_v6: usize) -> (usize, usize) {
    (max_v4.min(MAX_TABLE_NODES), max_v6.min(MAX_TABLE_NODES))
}

unsafe extern "C" fn event_trampoline(
    closure: *mut c_void,
    event: c_int,
    info_hash: *const c_uchar,
    data: *const c_void,
    data_len: size_t,
) {
    if closure.is_null() || info_hash.is_null() {
        return;
    }

    let info_hash = &*info_hash.cast::<[u8; ID_SIZE]>();
    let payload = if data.is_null() {
        &[][..]
    } else {
        slice::from_raw_parts(data.cast::<u8>(), data_len)
    };

    PendingCallback::deliver_raw(closure, event, info_hash, payload)
}

// === Host callbacks ===

thread_local! {
    static CURRENT_HOST: Cell<Option<NonNull<HostContext<'static>>>> = const { Cell::new(None) };
}

/// Exposes a [HostContext] to the exported host callbacks for one native call.
struct HostScope<'a> {
    previous: Option<NonNull<HostContext<'static>>>,
    _host: PhantomData<&'a mut ()>,
}

impl<'a> HostScope<'a> {
    fn enter(host: &'a mut HostContext<'_>) -> Self {
        let current = NonNull::from(host).cast::<HostContext<'static>>();

        HostScope {
            previous: CURRENT_HOST.with(|cell| cell.replace(Some(current))),
            _host: PhantomData,
        }
    }
}

impl Drop for HostScope<'_> {
    fn drop(&mut self) {
        CURRENT_HOST.with(|cell| cell.set(self.previous));
    }
}

fn with_host<R>(f: impl FnOnce(Option<&mut HostContext<'_>>) -> R) -> R {
    let current = CURRENT_HOST.with(Cell::get);

    // SAFETY: only set by a live HostScope, which holds the exclusive borrow.
    f(current.map(|mut host| unsafe { host.as_mut() }))
}

unsafe fn raw_part<'a>(ptr: *const c_void, len: c_int) -> &'a [u8] {
    match usize::try_from(len) {
        Ok(len) if len > 0 && !ptr.is_null() => slice::from_raw_parts(ptr.cast::<u8>(), len),
        _ => &[],
    }
}

/// # Safety
///
/// Called by the C library, `sa` must point to `salen` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn dht_blacklisted(sa: *const sockaddr, salen: c_int) -> c_int {
    let Some(address) = raw_addr::to_socket_addr(sa, salen) else {
        return 0;
    };

    let blacklisted = panic::catch_unwind(AssertUnwindSafe(|| {
        with_host(|host| host.is_some_and(|host| host.blacklisted(&address)))
    }))
    .unwrap_or_else(|_| {
        warn!(?address, "Blacklist callback panicked");
        false
    });

    c_int::from(blacklisted)
}

/// # Safety
///
/// Called by the C library, every pointer must be valid for its length.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn dht_hash(
    hash_return: *mut c_void,
    hash_size: c_int,
    v1: *const c_void,
    len1: c_int,
    v2: *const c_void,
    len2: c_int,
    v3: *const c_void,
    len3: c_int,
) {
    let size = match usize::try_from(hash_size) {
        Ok(size) if size > 0 && !hash_return.is_null() => size,
        _ => return,
    };

    let out = slice::from_raw_parts_mut(hash_return.cast::<u8>(), size);
    let parts = [raw_part(v1, len1), raw_part(v2, len2), raw_part(v3, len3)];

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        with_host(|host| match host {
            Some(host) => host.hash(out, parts),
            None => sha1_digest(out, parts),
        })
    }));

    if result.is_err() {
        warn!("Hash callback panicked");
        out.fill(0);
    }
}

/// Returns the number of bytes written, or -1 on failure.
///
/// # Safety
///
/// Called by the C library, `buf` must point to `size` writable bytes.
#[no_mangle]
pub unsafe extern "C" fn dht_random_bytes(buf: *mut c_void, size: size_t) -> c_int {
    if size == 0 {
        return 0;
    }
    let Ok(written) = c_int::try_from(size) else {
        return -1;
    };
    if buf.is_null() {
        return -1;
    }

    let out = slice::from_raw_parts_mut(buf.cast::<u8>(), size);

    let filled = panic::catch_unwind(AssertUnwindSafe(|| {
        with_host(|host| match host {
            Some(host) => host.random_bytes(out),
            None => OsRng.try_fill_bytes(out).is_ok(),
        })
    }))
    .unwrap_or_else(|_| {
        warn!("Random bytes callback panicked");
        false
    });

    if filled {
        written
    } else {
        debug!(size, "Reporting entropy failure to the engine");
        out.fill(0);
        -1
    }
}
