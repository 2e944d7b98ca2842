//! Scripted in-memory engine for tests.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{HostContext, InboundPacket, NativeEngine, NativeResult, NativeStatus, PendingCallback};
use crate::common::{AddressFamily, Id, SearchFamily};
use crate::host::HostCallbacks;
use crate::{Error, Result};

type RawEvent = (i32, Id, Vec<u8>);

#[derive(Debug)]
pub(crate) struct StubState {
    /// Every native call, in order, including failed ones.
    pub calls: Vec<&'static str>,
    /// One-shot failures per native call.
    pub failures: Vec<(&'static str, i32)>,
    /// Events emitted on the next periodic call.
    pub events: VecDeque<RawEvent>,
    /// Events emitted on the next periodic call that carries a packet.
    pub packet_events: VecDeque<RawEvent>,
    /// Events emitted inline by the next search.
    pub search_events: VecDeque<RawEvent>,
    /// Ask the host for random bytes on every call.
    pub needs_entropy: bool,
    pub tosleep: i64,
    pub stats: [i32; 4],
    pub nodes: Vec<SocketAddr>,

    pub packets: Vec<(Vec<u8>, SocketAddr)>,
    pub searches: Vec<(Id, u16, SearchFamily)>,
    pub inserted: Vec<(Id, SocketAddr)>,
    pub pinged: Vec<SocketAddr>,
}

impl Default for StubState {
    fn default() -> Self {
        StubState {
            calls: vec![],
            failures: vec![],
            events: VecDeque::new(),
            packet_events: VecDeque::new(),
            search_events: VecDeque::new(),
            needs_entropy: false,
            tosleep: 1,
            stats: [0; 4],
            nodes: vec![],
            packets: vec![],
            searches: vec![],
            inserted: vec![],
            pinged: vec![],
        }
    }
}

#[derive(Debug, Clone, Default)]
/// Shared handle, so tests can script and inspect an engine they gave away.
pub(crate) struct StubEngine(Arc<Mutex<StubState>>);

impl StubEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, StubState> {
        self.0.lock().unwrap()
    }

    pub fn fail(&self, operation: &'static str, status: i32) {
        self.state().failures.push((operation, status));
    }

    pub fn emit(&self, code: i32, info_hash: Id, payload: Vec<u8>) {
        self.state().events.push_back((code, info_hash, payload));
    }

    pub fn emit_on_packet(&self, code: i32, info_hash: Id, payload: Vec<u8>) {
        self.state().packet_events.push_back((code, info_hash, payload));
    }

    pub fn emit_on_search(&self, code: i32, info_hash: Id, payload: Vec<u8>) {
        self.state().search_events.push_back((code, info_hash, payload));
    }

    fn enter(&self, operation: &'static str, host: Option<&mut HostContext<'_>>) -> NativeResult<()> {
        let mut state = self.state();
        state.calls.push(operation);

        if let Some(position) = state.failures.iter().position(|(op, _)| *op == operation) {
            let (_, status) = state.failures.remove(position);
            return Err(NativeStatus(status));
        }

        if let (true, Some(host)) = (state.needs_entropy, host) {
            let mut tid = [0_u8; 4];
            if !host.random_bytes(&mut tid) {
                return Err(NativeStatus(-1));
            }
        }

        Ok(())
    }
}

fn deliver(events: VecDeque<RawEvent>, callback: &mut PendingCallback<'_, '_>) {
    for (code, info_hash, payload) in events {
        callback.deliver(code, &info_hash.0, &payload);
    }
}

impl NativeEngine for StubEngine {
    fn init(&mut self, _id: &Id, host: &mut HostContext<'_>) -> NativeResult<()> {
        self.enter("dht_init", Some(host))
    }

    fn uninit(&mut self) -> NativeResult<()> {
        self.enter("dht_uninit", None)
    }

    fn insert_node(
        &mut self,
        id: &Id,
        address: &SocketAddr,
        host: &mut HostContext<'_>,
    ) -> NativeResult<()> {
        self.enter("dht_insert_node", Some(host))?;
        self.state().inserted.push((*id, *address));
        Ok(())
    }

    fn ping_node(&mut self, address: &SocketAddr, host: &mut HostContext<'_>) -> NativeResult<()> {
        self.enter("dht_ping_node", Some(host))?;
        self.state().pinged.push(*address);
        Ok(())
    }

    fn periodic(
        &mut self,
        packet: Option<InboundPacket<'_>>,
        callback: &mut PendingCallback<'_, '_>,
        host: &mut HostContext<'_>,
    ) -> NativeResult<i64> {
        self.enter("dht_periodic", Some(&mut *host))?;

        // Take the events out before delivering, callbacks may inspect the state.
        let (events, tosleep) = {
            let mut state = self.state();
            let mut events = std::mem::take(&mut state.events);

            if let Some(packet) = packet {
                if !host.blacklisted(&packet.from) {
                    state.packets.push((packet.payload.to_vec(), packet.from));
                    events.extend(std::mem::take(&mut state.packet_events));
                }
            }

            (events, state.tosleep)
        };

        deliver(events, callback);

        Ok(tosleep)
    }

    fn search(
        &mut self,
        id: &Id,
        port: u16,
        family: SearchFamily,
        callback: &mut PendingCallback<'_, '_>,
        host: &mut HostContext<'_>,
    ) -> NativeResult<()> {
        // Inline events are delivered even if the search then fails.
        let result = self.enter("dht_search", Some(&mut *host));

        let events = {
            let mut state = self.state();
            if result.is_ok() {
                state.searches.push((*id, port, family));
            }
            std::mem::take(&mut state.search_events)
        };

        deliver(events, callback);

        result
    }

    fn nodes(&mut self, family: AddressFamily) -> NativeResult<[i32; 4]> {
        self.enter(
            match family {
                AddressFamily::V4 => "dht_nodes",
                AddressFamily::V6 => "dht_nodes6",
            },
            None,
        )?;
        Ok(self.state().stats)
    }

    fn get_nodes(&mut self, max_v4: usize, max_v6: usize) -> NativeResult<Vec<SocketAddr>> {
        self.enter("dht_get_nodes", None)?;

        let state = self.state();
        let v4 = state.nodes.iter().filter(|a| a.is_ipv4()).take(max_v4);
        let v6 = state.nodes.iter().filter(|a| a.is_ipv6()).take(max_v6);

        Ok(v4.chain(v6).copied().collect())
    }
}

#[derive(Debug)]
/// Host whose entropy source is always exhausted.
pub(crate) struct FailingHost;

impl HostCallbacks for FailingHost {
    fn blacklisted(&self, _address: &SocketAddr) -> bool {
        false
    }

    fn hash(&self, out: &mut [u8], _parts: [&[u8]; 3]) {
        out.fill(0)
    }

    fn random_bytes(&mut self, _buf: &mut [u8]) -> Result<()> {
        Err(Error::EntropyFailure("entropy pool exhausted".into()))
    }
}
