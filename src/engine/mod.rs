//! Safe driver around a native DHT engine.
//!
//! The engine is single threaded and has no timers of its own: all of its work
//! happens inside [Engine::tick], [Engine::search] and the table mutation
//! calls, which synchronously call back into the host before returning.

pub mod registry;
#[cfg(test)]
pub(crate) mod stub;

use std::cell::Cell;
use std::net::SocketAddr;
use std::panic;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::common::{AddressFamily, Event, Id, NodeContact, SearchFamily, TableStats};
use crate::host::{DefaultHost, HostCallbacks};
use crate::{Error, Result};

pub use registry::{ClosureRegistry, EventCallback, EventMarshaler, PendingCallback};

thread_local! {
    static IN_ENGINE_CALL: Cell<bool> = const { Cell::new(false) };
}

/// Returns true while an engine call is running on this thread, i.e. when
/// called from inside an engine callback.
pub fn in_engine_call() -> bool {
    IN_ENGINE_CALL.with(|flag| flag.get())
}

/// Marks this thread as running an engine call until dropped.
struct RunningCall;

impl RunningCall {
    fn enter(operation: &'static str) -> Result<Self> {
        IN_ENGINE_CALL.with(|flag| {
            if flag.replace(true) {
                Err(Error::Reentrant { operation })
            } else {
                Ok(RunningCall)
            }
        })
    }
}

impl Drop for RunningCall {
    fn drop(&mut self) {
        IN_ENGINE_CALL.with(|flag| flag.set(false));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Negative status returned by a native call.
pub struct NativeStatus(pub i32);

/// Result of a native call.
pub type NativeResult<T> = std::result::Result<T, NativeStatus>;

impl NativeStatus {
    /// Turn a C style return code into a [NativeResult].
    pub fn check(rc: i32) -> NativeResult<i32> {
        if rc < 0 {
            Err(NativeStatus(rc))
        } else {
            Ok(rc)
        }
    }
}

#[derive(Debug, Clone, Copy)]
/// A datagram received on the DHT socket.
pub struct InboundPacket<'a> {
    pub payload: &'a [u8],
    pub from: SocketAddr,
}

/// Host callbacks as seen by the native engine during one call.
///
/// Records entropy failures so they can be surfaced once the call returns.
pub struct HostContext<'h> {
    host: &'h mut dyn HostCallbacks,
    entropy_failure: Option<Error>,
}

impl<'h> HostContext<'h> {
    pub fn new(host: &'h mut dyn HostCallbacks) -> Self {
        HostContext {
            host,
            entropy_failure: None,
        }
    }

    pub fn blacklisted(&self, address: &SocketAddr) -> bool {
        self.host.blacklisted(address)
    }

    pub fn hash(&self, out: &mut [u8], parts: [&[u8]; 3]) {
        self.host.hash(out, parts)
    }

    /// Fill `buf` with random bytes, returning false on failure.
    ///
    /// On failure `buf` is zeroed and must not be used by the engine.
    pub fn random_bytes(&mut self, buf: &mut [u8]) -> bool {
        match self.host.random_bytes(buf) {
            Ok(()) => true,
            Err(error) => {
                warn!(?error, len = buf.len(), "Random bytes requested by the engine are unavailable");
                buf.fill(0);
                self.entropy_failure.get_or_insert(error);
                false
            }
        }
    }

    /// Map the outcome of a native call, entropy failures first.
    fn finish<T>(self, operation: &'static str, result: NativeResult<T>) -> Result<T> {
        if let Some(error) = self.entropy_failure {
            return Err(match error {
                Error::EntropyFailure(_) => error,
                other => Error::EntropyFailure(other.to_string()),
            });
        }

        result.map_err(|NativeStatus(status)| {
            warn!(operation, status, "Native engine call failed");
            Error::EngineFault { operation, status }
        })
    }
}

/// The native DHT engine, as called by [Engine].
///
/// Implementations forward to the real engine. Errors are the negative status
/// codes it returns. Calls receiving a [PendingCallback] may invoke it any
/// number of times before returning, and must not keep it afterwards.
pub trait NativeEngine {
    /// Initialize the engine with this node's id.
    fn init(&mut self, id: &Id, host: &mut HostContext<'_>) -> NativeResult<()>;

    /// Tear the engine down.
    fn uninit(&mut self) -> NativeResult<()>;

    fn insert_node(
        &mut self,
        id: &Id,
        address: &SocketAddr,
        host: &mut HostContext<'_>,
    ) -> NativeResult<()>;

    fn ping_node(&mut self, address: &SocketAddr, host: &mut HostContext<'_>) -> NativeResult<()>;

    /// Process an optional incoming packet and run due maintenance.
    ///
    /// Returns the number of seconds until the engine must be called again.
    fn periodic(
        &mut self,
        packet: Option<InboundPacket<'_>>,
        callback: &mut PendingCallback<'_, '_>,
        host: &mut HostContext<'_>,
    ) -> NativeResult<i64>;

    fn search(
        &mut self,
        id: &Id,
        port: u16,
        family: SearchFamily,
        callback: &mut PendingCallback<'_, '_>,
        host: &mut HostContext<'_>,
    ) -> NativeResult<()>;

    /// Raw counters for one family: good, dubious, cached, incoming.
    fn nodes(&mut self, family: AddressFamily) -> NativeResult<[i32; 4]>;

    /// Known node addresses, at most `max_v4` IPv4 and `max_v6` IPv6 ones.
    fn get_nodes(&mut self, max_v4: usize, max_v6: usize) -> NativeResult<Vec<SocketAddr>>;
}

#[derive(Debug)]
/// Owner of a native engine instance and its host callbacks.
///
/// Dropping the Engine shuts the native engine down.
pub struct Engine<N: NativeEngine, H: HostCallbacks = DefaultHost> {
    native: N,
    host: H,
    id: Id,
    registry: ClosureRegistry,
}

impl<N: NativeEngine, H: HostCallbacks> Engine<N, H> {
    /// Initialize `native` with the node `id`, injecting the `host` callbacks.
    pub fn new(mut native: N, mut host: H, id: Id) -> Result<Self> {
        {
            let _running = RunningCall::enter("dht_init")?;
            let mut context = HostContext::new(&mut host);
            let result = native.init(&id, &mut context);
            context.finish("dht_init", result)?;
        }

        debug!(?id, "Native engine initialized");

        Ok(Engine {
            native,
            host,
            id,
            registry: ClosureRegistry::new(),
        })
    }

    // === Getters ===

    /// Returns this node's Id.
    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut H {
        &mut self.host
    }

    pub fn native(&self) -> &N {
        &self.native
    }

    /// Number of callbacks currently pinned for native calls.
    pub fn outstanding_pins(&self) -> usize {
        self.registry.outstanding()
    }

    // === Public Methods ===

    /// Drive the engine: feed it an incoming datagram, or `None` on timeout.
    ///
    /// Events produced during the call are handed to `on_event` before this
    /// returns. Must be called whenever a datagram arrives, and no later than
    /// the returned duration after the previous call.
    pub fn tick(
        &mut self,
        packet: Option<InboundPacket<'_>>,
        mut on_event: impl FnMut(&Id, Event),
    ) -> Result<Duration> {
        let _running = RunningCall::enter("tick")?;

        if let Some(packet) = &packet {
            trace!(from = ?packet.from, len = packet.payload.len(), "Ticking with packet");
        }

        let mut context = HostContext::new(&mut self.host);
        let mut pending = self.registry.register(&mut on_event);

        let result = self.native.periodic(packet, &mut pending, &mut context);

        let panic = pending.take_panic();
        self.registry.release(pending);

        if let Some(panic) = panic {
            panic::resume_unwind(panic);
        }

        let seconds = context.finish("dht_periodic", result)?;

        Ok(Duration::from_secs(u64::try_from(seconds).unwrap_or(0)))
    }

    /// Start a search for `target`, announcing `port` if it is not zero.
    ///
    /// `on_event` only sees events raised while this call runs. Results that
    /// arrive later are delivered to the callbacks of subsequent [Engine::tick]s.
    pub fn search(
        &mut self,
        target: &Id,
        port: u16,
        family: SearchFamily,
        mut on_event: impl FnMut(&Id, Event),
    ) -> Result<()> {
        let _running = RunningCall::enter("search")?;

        debug!(?target, port, ?family, "Starting search");

        let mut context = HostContext::new(&mut self.host);
        let mut pending = self.registry.register(&mut on_event);

        let result = self
            .native
            .search(target, port, family, &mut pending, &mut context);

        let panic = pending.take_panic();
        self.registry.release(pending);

        if let Some(panic) = panic {
            panic::resume_unwind(panic);
        }

        context.finish("dht_search", result)
    }

    /// Add a node we know about to the routing table.
    pub fn insert_node(&mut self, id: &Id, address: SocketAddr) -> Result<()> {
        let _running = RunningCall::enter("insert_node")?;

        let mut context = HostContext::new(&mut self.host);
        let result = self.native.insert_node(id, &address, &mut context);

        context.finish("dht_insert_node", result)
    }

    /// Ping a node, typically to bootstrap from it.
    pub fn ping_node(&mut self, address: SocketAddr) -> Result<()> {
        let _running = RunningCall::enter("ping_node")?;

        let mut context = HostContext::new(&mut self.host);
        let result = self.native.ping_node(&address, &mut context);

        context.finish("dht_ping_node", result)
    }

    /// Snapshot of known nodes, up to `max_v4` IPv4 and `max_v6` IPv6 ones.
    pub fn get_nodes(&mut self, max_v4: usize, max_v6: usize) -> Result<Vec<NodeContact>> {
        let _running = RunningCall::enter("get_nodes")?;

        let addresses = self
            .native
            .get_nodes(max_v4, max_v6)
            .map_err(|NativeStatus(status)| Error::EngineFault {
                operation: "dht_get_nodes",
                status,
            })?;

        let (v4, v6): (Vec<_>, Vec<_>) = addresses
            .into_iter()
            .map(NodeContact::new)
            .partition(|contact| contact.family() == AddressFamily::V4);

        Ok(v4
            .into_iter()
            .take(max_v4)
            .chain(v6.into_iter().take(max_v6))
            .collect())
    }

    /// Snapshot of the routing table counters for one family.
    pub fn get_stats(&mut self, family: AddressFamily) -> Result<TableStats> {
        let _running = RunningCall::enter("get_stats")?;

        let raw = self
            .native
            .nodes(family)
            .map_err(|NativeStatus(status)| Error::EngineFault {
                operation: "dht_nodes",
                status,
            })?;

        Ok(TableStats::from_raw(raw))
    }
}

impl<N: NativeEngine, H: HostCallbacks> Drop for Engine<N, H> {
    fn drop(&mut self) {
        if let Err(NativeStatus(status)) = self.native.uninit() {
            warn!(status, "Failed to shut the native engine down");
        } else {
            debug!(id = ?self.id, "Native engine shut down");
        }
    }
}
