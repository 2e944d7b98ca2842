//! Dht node.

use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use flume::{Receiver, Sender, TryRecvError};
use tracing::{debug, error};

use crate::actor::{Actor, Config, Info, MAX_THREAD_BLOCK_DURATION};
use crate::common::{AddressFamily, Event, Id, NodeContact, SearchFamily, TableStats};
use crate::engine::{in_engine_call, Engine, NativeEngine};
use crate::host::{DefaultHost, HostCallbacks};
use crate::{Error, Result};

/// Maximum number of nodes per address family returned by [Dht::to_bootstrap].
pub const MAX_BOOTSTRAP_NODES: usize = 20;

#[derive(Debug, Clone)]
/// Mainline Dht node.
///
/// A handle to an actor thread owning the [Engine]. Cloning is cheap, and the
/// actor stops once every clone is dropped or [Dht::shutdown] is called.
pub struct Dht {
    sender: Sender<ActorMessage>,
    stopped: Stopped,
}

/// Why the actor thread stopped, set before its queue is drained.
type Stopped = Arc<Mutex<Option<Error>>>;

fn lock(stopped: &Stopped) -> MutexGuard<'_, Option<Error>> {
    stopped.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
/// A builder for the [Dht] node.
pub struct DhtBuilder(Config);

impl DhtBuilder {
    /// Set the node's Id, random by default.
    pub fn id(mut self, id: Id) -> Self {
        self.0.id = Some(id);
        self
    }

    /// Add a socket to read incoming datagrams from.
    ///
    /// It should be the same socket the engine sends from.
    pub fn socket(mut self, socket: UdpSocket) -> Self {
        self.0.sockets.push(socket);
        self
    }

    /// Set bootstrapping nodes, pinged once the node starts.
    pub fn bootstrap(mut self, bootstrap: &[SocketAddr]) -> Self {
        self.0.bootstrap = bootstrap.to_vec();
        self
    }

    /// Initialize `native` with the [DefaultHost] callbacks, and start the node.
    pub fn build<N>(self, native: N) -> Result<Dht>
    where
        N: NativeEngine + Send + 'static,
    {
        self.build_with_host(native, DefaultHost::new())
    }

    /// Initialize `native` with custom host callbacks, and start the node.
    pub fn build_with_host<N, H>(self, native: N, host: H) -> Result<Dht>
    where
        N: NativeEngine + Send + 'static,
        H: HostCallbacks + 'static,
    {
        Dht::new(native, host, self.0)
    }
}

impl Dht {
    /// Returns a builder to edit settings before creating a Dht node.
    pub fn builder() -> DhtBuilder {
        DhtBuilder::default()
    }

    /// Initialize `native` with the `host` callbacks, and start the actor thread.
    pub fn new<N, H>(native: N, host: H, mut config: Config) -> Result<Self>
    where
        N: NativeEngine + Send + 'static,
        H: HostCallbacks + 'static,
    {
        let id = config.id.take().unwrap_or_else(Id::random);

        let engine = Engine::new(native, host, id)?;
        let actor = Actor::new(engine, config)?;

        let (sender, receiver) = flume::unbounded();
        let stopped = Stopped::default();

        let mailbox = Mailbox {
            receiver,
            stopped: stopped.clone(),
            reason: None,
        };

        thread::Builder::new()
            .name("Mainline Dht actor thread".to_string())
            .spawn(move || run(actor, mailbox))?;

        Ok(Dht { sender, stopped })
    }

    // === Getters ===

    /// Information and statistics about this [Dht] node.
    pub fn info(&self) -> Result<Info> {
        self.request("info", ActorMessage::Info)
    }

    /// Turn this node's routing table to a list of bootstrapping nodes.
    pub fn to_bootstrap(&self) -> Result<Vec<String>> {
        self.request("to_bootstrap", ActorMessage::ToBootstrap)
    }

    /// Snapshot of known nodes, up to `max_v4` IPv4 and `max_v6` IPv6 ones.
    pub fn nodes(&self, max_v4: usize, max_v6: usize) -> Result<Vec<NodeContact>> {
        self.request("nodes", |sender| ActorMessage::Nodes(max_v4, max_v6, sender))
    }

    /// Routing table counters for one address family.
    pub fn stats(&self, family: AddressFamily) -> Result<TableStats> {
        self.request("stats", |sender| ActorMessage::Stats(family, sender))
    }

    // === Public Methods ===

    /// Shutdown the actor thread loop, and the engine with it.
    ///
    /// Returns once the engine is shut down, or right away if the actor
    /// already stopped.
    pub fn shutdown(&self) {
        let (sender, receiver) = flume::bounded::<()>(1);

        let _ = self.send(ActorMessage::Shutdown(sender));
        let _ = receiver.recv();
    }

    /// Search for peers of an info hash, announcing `port` if it is not zero.
    ///
    /// The returned iterator yields every [Event] of this search, and ends
    /// after [Event::SearchDone], or when the node stops. In the latter case
    /// the next request returns the error that stopped it.
    pub fn search(
        &self,
        info_hash: Id,
        port: u16,
        family: SearchFamily,
    ) -> Result<flume::IntoIter<Event>> {
        // Searches use unbounded channels to avoid blocking in the run loop.
        let (events, receiver) = flume::unbounded::<Event>();

        self.request("search", |result| ActorMessage::Search {
            info_hash,
            port,
            family,
            events,
            result,
        })?;

        Ok(receiver.into_iter())
    }

    /// Add a node we know about to the routing table.
    pub fn insert_node(&self, id: Id, address: SocketAddr) -> Result<()> {
        self.request("insert_node", |sender| {
            ActorMessage::InsertNode(id, address, sender)
        })
    }

    /// Ping a node, typically to bootstrap from it.
    pub fn ping_node(&self, address: SocketAddr) -> Result<()> {
        self.request("ping_node", |sender| ActorMessage::PingNode(address, sender))
    }

    // === Private Methods ===

    fn request<T>(
        &self,
        operation: &'static str,
        message: impl FnOnce(Sender<Result<T>>) -> ActorMessage,
    ) -> Result<T> {
        // Host callbacks run on the actor thread, which would wait on itself.
        if in_engine_call() {
            return Err(Error::Reentrant { operation });
        }

        let (sender, receiver) = flume::bounded::<Result<T>>(1);

        self.send(message(sender))?;

        receiver.recv().map_err(|_| self.stop_reason())?
    }

    /// Queue a message for the actor, unless it already stopped.
    pub(crate) fn send(&self, message: ActorMessage) -> Result<()> {
        // Held while sending: the actor either drains this message, or
        // stopped before and we return why.
        let stopped = lock(&self.stopped);

        if let Some(reason) = stopped.as_ref() {
            return Err(reason.clone());
        }

        self.sender.send(message).map_err(|_| Error::Shutdown)
    }

    /// The error that stopped the actor, [Error::Shutdown] for a regular shutdown.
    pub(crate) fn stop_reason(&self) -> Error {
        lock(&self.stopped).clone().unwrap_or(Error::Shutdown)
    }
}

/// The actor's end of the channel.
///
/// Dropping it records why the actor stopped and drops every queued message,
/// which disconnects their reply channels.
struct Mailbox {
    receiver: Receiver<ActorMessage>,
    stopped: Stopped,
    reason: Option<Error>,
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        let reason = self.reason.take().unwrap_or(Error::Shutdown);

        let mut stopped = lock(&self.stopped);
        if stopped.is_none() {
            *stopped = Some(reason);
        }
        drop(stopped);

        self.receiver.drain().for_each(drop);
    }
}

fn run<N: NativeEngine, H: HostCallbacks>(mut actor: Actor<N, H>, mut mailbox: Mailbox) {
    loop {
        let mut busy = false;

        match mailbox.receiver.try_recv() {
            Ok(ActorMessage::Shutdown(sender)) => {
                drop(actor);
                let _ = sender.send(());

                debug!("mainline::Dht's actor thread was shutdown.");
                return;
            }
            Ok(actor_message) => {
                handle(&mut actor, actor_message);
                busy = true;
            }
            Err(TryRecvError::Disconnected) => {
                // Node was dropped, kill this thread.
                debug!("mainline::Dht's actor thread was shutdown after Drop.");
                return;
            }
            Err(TryRecvError::Empty) => {
                // No op
            }
        }

        match actor.tick() {
            Ok(ticked) => busy |= ticked,
            Err(error) => {
                error!(?error, "Native engine failed, stopping mainline::Dht's actor thread");
                mailbox.reason = Some(error);
                return;
            }
        }

        if !busy {
            thread::sleep(MAX_THREAD_BLOCK_DURATION);
        }
    }
}

fn handle<N: NativeEngine, H: HostCallbacks>(actor: &mut Actor<N, H>, message: ActorMessage) {
    match message {
        ActorMessage::Search {
            info_hash,
            port,
            family,
            events,
            result,
        } => {
            let _ = result.send(actor.search(info_hash, port, family, events));
        }
        ActorMessage::InsertNode(id, address, sender) => {
            let _ = sender.send(actor.insert_node(&id, address));
        }
        ActorMessage::PingNode(address, sender) => {
            let _ = sender.send(actor.ping_node(address));
        }
        ActorMessage::Nodes(max_v4, max_v6, sender) => {
            let _ = sender.send(actor.get_nodes(max_v4, max_v6));
        }
        ActorMessage::Stats(family, sender) => {
            let _ = sender.send(actor.get_stats(family));
        }
        ActorMessage::Info(sender) => {
            let _ = sender.send(actor.info());
        }
        ActorMessage::ToBootstrap(sender) => {
            let nodes = actor
                .get_nodes(MAX_BOOTSTRAP_NODES, MAX_BOOTSTRAP_NODES)
                .map(|nodes| nodes.iter().map(|node| node.address().to_string()).collect());

            let _ = sender.send(nodes);
        }
        ActorMessage::Shutdown(sender) => {
            // Handled by the run loop before reaching here.
            let _ = sender.send(());
        }
    }
}

#[derive(Debug)]
pub(crate) enum ActorMessage {
    Search {
        info_hash: Id,
        port: u16,
        family: SearchFamily,
        events: Sender<Event>,
        result: Sender<Result<()>>,
    },
    InsertNode(Id, SocketAddr, Sender<Result<()>>),
    PingNode(SocketAddr, Sender<Result<()>>),
    Nodes(usize, usize, Sender<Result<Vec<NodeContact>>>),
    Stats(AddressFamily, Sender<Result<TableStats>>),
    Info(Sender<Result<Info>>),
    ToBootstrap(Sender<Result<Vec<String>>>),
    Shutdown(Sender<()>),
}

#[cfg(test)]
mod test {
    use std::time::{Duration, Instant};

    use super::*;
    use crate::common::{encode_address, EVENT_SEARCH_DONE, EVENT_VALUES};
    use crate::engine::stub::StubEngine;

    /// Host whose entropy source fails after serving the engine's init.
    #[derive(Debug, Default)]
    struct FlakyHost {
        served: bool,
    }

    impl HostCallbacks for FlakyHost {
        fn blacklisted(&self, _address: &SocketAddr) -> bool {
            false
        }

        fn hash(&self, out: &mut [u8], parts: [&[u8]; 3]) {
            crate::host::sha1_digest(out, parts)
        }

        fn random_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
            if std::mem::replace(&mut self.served, true) {
                return Err(Error::EntropyFailure("entropy pool exhausted".into()));
            }
            buf.fill(7);
            Ok(())
        }
    }

    /// Host calling back into its own [Dht] while asked for random bytes.
    #[derive(Debug, Default, Clone)]
    struct CallingHost {
        dht: Arc<Mutex<Option<Dht>>>,
        nested: Arc<Mutex<Option<Result<Info>>>>,
    }

    impl HostCallbacks for CallingHost {
        fn blacklisted(&self, _address: &SocketAddr) -> bool {
            false
        }

        fn hash(&self, out: &mut [u8], parts: [&[u8]; 3]) {
            crate::host::sha1_digest(out, parts)
        }

        fn random_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
            if let Some(dht) = self.dht.lock().unwrap().as_ref() {
                *self.nested.lock().unwrap() = Some(dht.info());
            }
            buf.fill(7);
            Ok(())
        }
    }

    fn busy_stub() -> StubEngine {
        let stub = StubEngine::new();
        // Tick on every loop iteration.
        stub.state().tosleep = 0;
        stub
    }

    #[test]
    fn search_events_are_routed_per_info_hash() {
        let stub = busy_stub();
        let dht = Dht::builder().build(stub.clone()).unwrap();

        let target = Id::random();
        let other = Id::random();
        let peer: SocketAddr = "1.2.3.4:5".parse().unwrap();

        let events = dht.search(target, 6881, SearchFamily::V4).unwrap();

        stub.emit(EVENT_VALUES, other, encode_address(&peer));
        stub.emit(EVENT_VALUES, target, encode_address(&peer));
        stub.emit(EVENT_SEARCH_DONE, target, vec![]);

        assert_eq!(
            events.collect::<Vec<_>>(),
            vec![
                Event::Values(vec![NodeContact::new(peer)]),
                Event::SearchDone
            ]
        );
        assert_eq!(
            stub.state().searches,
            vec![(target, 6881, SearchFamily::V4)]
        );

        dht.shutdown();
    }

    #[test]
    fn datagrams_reach_the_engine() {
        let stub = StubEngine::new();
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let address = socket.local_addr().unwrap();

        let dht = Dht::builder().socket(socket).build(stub.clone()).unwrap();

        let target = Id::random();
        let peer: SocketAddr = "6.7.8.9:10".parse().unwrap();
        stub.emit_on_packet(EVENT_VALUES, target, encode_address(&peer));

        let mut events = dht.search(target, 0, SearchFamily::V4).unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"d1:y1:qe", address).unwrap();

        assert_eq!(
            events.next(),
            Some(Event::Values(vec![NodeContact::new(peer)]))
        );
        assert_eq!(dht.info().unwrap().local_addrs(), &[address]);

        dht.shutdown();
    }

    #[test]
    fn table_operations() {
        let stub = StubEngine::new();
        let bootstrap: SocketAddr = "10.0.0.1:6881".parse().unwrap();
        let id = Id::random();

        let dht = Dht::builder()
            .id(id)
            .bootstrap(&[bootstrap])
            .build(stub.clone())
            .unwrap();

        let node: SocketAddr = "10.0.0.2:6881".parse().unwrap();
        dht.insert_node(Id::random(), node).unwrap();
        dht.ping_node(node).unwrap();

        stub.state().stats = [5, 1, 0, 2];
        stub.state().nodes = vec![node, "[2001:db8::1]:6881".parse().unwrap()];

        assert_eq!(dht.stats(AddressFamily::V6).unwrap().good, 5);
        assert_eq!(dht.nodes(1, 0).unwrap(), vec![NodeContact::new(node)]);
        assert_eq!(
            dht.to_bootstrap().unwrap(),
            vec!["10.0.0.2:6881".to_string(), "[2001:db8::1]:6881".to_string()]
        );
        assert_eq!(dht.info().unwrap().id(), &id);
        assert_eq!(stub.state().pinged, vec![bootstrap, node]);

        dht.shutdown();
    }

    #[test]
    fn shutdown() {
        let stub = StubEngine::new();
        let dht = Dht::builder().build(stub.clone()).unwrap();
        let clone = dht.clone();

        clone.shutdown();

        assert_eq!(stub.state().calls.last(), Some(&"dht_uninit"));
        assert!(matches!(dht.info(), Err(Error::Shutdown)));
        assert!(matches!(
            dht.search(Id::random(), 0, SearchFamily::V4),
            Err(Error::Shutdown)
        ));
    }

    #[test]
    fn engine_fault_stops_the_actor() {
        let stub = busy_stub();
        let dht = Dht::builder().build(stub.clone()).unwrap();

        let events = dht.search(Id::random(), 0, SearchFamily::V4).unwrap();
        stub.fail("dht_periodic", -1);

        // Subscribers are dropped with the actor.
        assert_eq!(events.count(), 0);
        assert!(matches!(
            dht.stats(AddressFamily::V4),
            Err(Error::EngineFault {
                operation: "dht_periodic",
                status: -1
            })
        ));
        assert!(matches!(
            dht.search(Id::random(), 0, SearchFamily::V4),
            Err(Error::EngineFault { .. })
        ));

        // Nothing left to shut down.
        dht.shutdown();
    }

    #[test]
    fn entropy_failure_stops_the_actor() {
        let stub = busy_stub();
        let dht = Dht::builder()
            .build_with_host(stub.clone(), FlakyHost::default())
            .unwrap();

        stub.state().needs_entropy = true;

        let mut stopped = None;
        for _ in 0..200 {
            match dht.info() {
                Ok(_) => thread::sleep(Duration::from_millis(5)),
                Err(error) => {
                    stopped = Some(error);
                    break;
                }
            }
        }

        assert!(matches!(stopped, Some(Error::EntropyFailure(_))));
    }

    #[test]
    fn requests_racing_shutdown_return() {
        for _ in 0..50 {
            let dht = Dht::builder().build(StubEngine::new()).unwrap();
            let (done, watchdog) = flume::bounded(1);

            let racing = dht.clone();
            thread::spawn(move || {
                let caller = racing.clone();
                let requests = thread::spawn(move || {
                    for _ in 0..10 {
                        let _ = caller.info();
                    }
                });

                racing.clone().shutdown();
                let after = racing.info();

                let _ = requests.join();
                let _ = done.send(after);
            });

            let after = watchdog
                .recv_timeout(Duration::from_secs(2))
                .expect("request after shutdown never returned");
            assert!(matches!(after, Err(Error::Shutdown)));
        }
    }

    #[test]
    fn calling_from_a_host_callback_fails_fast() {
        let stub = busy_stub();
        let host = CallingHost::default();
        let dht = Dht::builder()
            .build_with_host(stub.clone(), host.clone())
            .unwrap();

        *host.dht.lock().unwrap() = Some(dht.clone());
        stub.state().needs_entropy = true;

        let mut nested = None;
        for _ in 0..200 {
            nested = host.nested.lock().unwrap().take();
            if nested.is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }

        assert!(matches!(
            nested,
            Some(Err(Error::Reentrant { operation: "info" }))
        ));
        assert!(dht.info().is_ok());

        dht.shutdown();
    }

    #[test]
    fn failed_request_keeps_the_actor_running() {
        let stub = StubEngine::new();
        let dht = Dht::builder().build(stub.clone()).unwrap();

        stub.fail("dht_ping_node", -2);
        assert!(matches!(
            dht.ping_node("10.0.0.1:6881".parse().unwrap()),
            Err(Error::EngineFault {
                operation: "dht_ping_node",
                status: -2
            })
        ));

        assert!(dht.info().is_ok());

        dht.shutdown();
    }

    #[test]
    fn calling_from_an_engine_callback_fails_fast() {
        let stub = StubEngine::new();
        let dht = Dht::builder().build(stub).unwrap();

        let local = StubEngine::new();
        let mut engine = Engine::new(local.clone(), DefaultHost::new(), Id::random()).unwrap();
        local.emit(EVENT_SEARCH_DONE, Id::random(), vec![]);

        let start = Instant::now();
        let mut nested = None;
        engine
            .tick(None, |_, _| nested = Some(dht.info()))
            .unwrap();

        assert!(matches!(
            nested,
            Some(Err(Error::Reentrant { operation: "info" }))
        ));
        assert!(start.elapsed() < Duration::from_secs(5));

        dht.shutdown();
    }

    #[test]
    fn init_failure_is_returned_by_build() {
        let stub = StubEngine::new();
        stub.fail("dht_init", -1);

        assert!(matches!(
            Dht::builder().build(stub),
            Err(Error::EngineFault {
                operation: "dht_init",
                ..
            })
        ));
    }
}
