//! Actor implementation - I/O orchestration layer for the engine.

pub(crate) mod config;
mod info;
pub(crate) mod socket;

use std::collections::HashMap;
use std::time::Instant;

use flume::Sender;
use tracing::{debug, info, trace, warn};

use crate::common::{AddressFamily, Event, Id, NodeContact, SearchFamily, TableStats};
use crate::engine::{Engine, InboundPacket, NativeEngine};
use crate::host::HostCallbacks;
use crate::Result;

use socket::DhtSocket;

pub use config::Config;
pub use info::Info;
pub use socket::MAX_THREAD_BLOCK_DURATION;

/// Subscribers waiting on events per info hash.
type Subscribers = HashMap<Id, Vec<Sender<Event>>>;

#[derive(Debug)]
/// Internal Actor called in the Dht thread loop, useful to create your own actor setup.
///
/// Owns the [Engine], feeds it every datagram read from the sockets, ticks it
/// when its wake deadline expires, and routes its events to subscribers.
pub struct Actor<N: NativeEngine, H: HostCallbacks> {
    engine: Engine<N, H>,
    socket: DhtSocket,
    subscribers: Subscribers,
    /// When the engine must be ticked, even without incoming datagrams.
    next_tick: Instant,
}

impl<N: NativeEngine, H: HostCallbacks> Actor<N, H> {
    /// Creates a new Actor and pings the bootstrapping nodes.
    pub fn new(mut engine: Engine<N, H>, config: Config) -> Result<Self> {
        let socket = DhtSocket::new(config.sockets)?;

        for address in config.bootstrap {
            if let Err(error) = engine.ping_node(address) {
                warn!(?address, ?error, "Failed to ping bootstrapping node");
            }
        }

        info!(id = ?engine.id(), local_addrs = ?socket.local_addrs(), "Mainline DHT listening");

        Ok(Actor {
            engine,
            socket,
            subscribers: HashMap::new(),
            next_tick: Instant::now(),
        })
    }

    // === Getters ===

    pub fn engine(&self) -> &Engine<N, H> {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine<N, H> {
        &mut self.engine
    }

    /// Returns a summary of this node's information and statistics.
    pub fn info(&mut self) -> Result<Info> {
        Info::collect(self)
    }

    /// Returns true if someone is still waiting on events for this info hash.
    pub fn is_subscribed(&self, info_hash: &Id) -> bool {
        self.subscribers.contains_key(info_hash)
    }

    // === Public Methods ===

    /// Feed the engine the next pending datagram, or tick it if its deadline
    /// expired.
    ///
    /// Returns `false` if there was nothing to do.
    pub fn tick(&mut self) -> Result<bool> {
        let now = Instant::now();
        let subscribers = &mut self.subscribers;

        let wake = match self.socket.recv_from() {
            Some((payload, from)) => self.engine.tick(
                Some(InboundPacket { payload, from }),
                |info_hash, event| route(subscribers, info_hash, event),
            )?,
            None if now >= self.next_tick => self
                .engine
                .tick(None, |info_hash, event| route(subscribers, info_hash, event))?,
            None => return Ok(false),
        };

        self.next_tick = now + wake;

        Ok(true)
    }

    /// Start a search, delivering its events to `sender` until it is done.
    pub fn search(
        &mut self,
        info_hash: Id,
        port: u16,
        family: SearchFamily,
        sender: Sender<Event>,
    ) -> Result<()> {
        self.subscribers
            .entry(info_hash)
            .or_default()
            .push(sender.clone());

        let subscribers = &mut self.subscribers;
        let result = self
            .engine
            .search(&info_hash, port, family, |id, event| route(subscribers, id, event));

        match result {
            // The engine has new work, don't wait for the previous deadline.
            Ok(()) => self.next_tick = Instant::now(),
            Err(_) => {
                if let Some(senders) = self.subscribers.get_mut(&info_hash) {
                    senders.retain(|subscriber| !subscriber.same_channel(&sender));
                    if senders.is_empty() {
                        self.subscribers.remove(&info_hash);
                    }
                }
            }
        }

        result
    }

    pub fn insert_node(&mut self, id: &Id, address: std::net::SocketAddr) -> Result<()> {
        self.engine.insert_node(id, address)
    }

    pub fn ping_node(&mut self, address: std::net::SocketAddr) -> Result<()> {
        self.engine.ping_node(address)
    }

    pub fn get_nodes(&mut self, max_v4: usize, max_v6: usize) -> Result<Vec<NodeContact>> {
        self.engine.get_nodes(max_v4, max_v6)
    }

    pub fn get_stats(&mut self, family: AddressFamily) -> Result<TableStats> {
        self.engine.get_stats(family)
    }
}

/// Hand an event to everyone waiting on its info hash, and forget them once
/// the search is done or they stopped listening.
fn route(subscribers: &mut Subscribers, info_hash: &Id, event: Event) {
    let done = event.is_done();

    match subscribers.get_mut(info_hash) {
        Some(senders) => {
            senders.retain(|sender| sender.send(event.clone()).is_ok());

            if done || senders.is_empty() {
                debug!(?info_hash, done, "Dropping search subscribers");
                subscribers.remove(info_hash);
            }
        }
        None => {
            trace!(?info_hash, ?event, "Event for a search nobody is waiting on");
        }
    }
}
