//! AsyncDht node.

use std::net::SocketAddr;

use flume::Sender;

use crate::actor::Info;
use crate::common::{AddressFamily, Event, Id, NodeContact, SearchFamily, TableStats};
use crate::dht::{ActorMessage, Dht};
use crate::engine::in_engine_call;
use crate::{Error, Result};

impl Dht {
    /// Return an async version of the Dht client.
    pub fn as_async(self) -> AsyncDht {
        AsyncDht(self)
    }
}

#[derive(Debug, Clone)]
/// Async version of the Dht node.
pub struct AsyncDht(Dht);

impl AsyncDht {
    // === Getters ===

    /// Information and statistics about this [Dht] node.
    pub async fn info(&self) -> Result<Info> {
        self.request("info", ActorMessage::Info).await
    }

    /// Turn this node's routing table to a list of bootstrapping nodes.
    pub async fn to_bootstrap(&self) -> Result<Vec<String>> {
        self.request("to_bootstrap", ActorMessage::ToBootstrap).await
    }

    /// Snapshot of known nodes, up to `max_v4` IPv4 and `max_v6` IPv6 ones.
    pub async fn nodes(&self, max_v4: usize, max_v6: usize) -> Result<Vec<NodeContact>> {
        self.request("nodes", |sender| ActorMessage::Nodes(max_v4, max_v6, sender))
            .await
    }

    /// Routing table counters for one address family.
    pub async fn stats(&self, family: AddressFamily) -> Result<TableStats> {
        self.request("stats", |sender| ActorMessage::Stats(family, sender))
            .await
    }

    // === Public Methods ===

    /// Shutdown the actor thread loop.
    pub async fn shutdown(&self) {
        let (sender, receiver) = flume::bounded::<()>(1);

        let _ = self.0.send(ActorMessage::Shutdown(sender));
        let _ = receiver.recv_async().await;
    }

    /// Search for peers of an info hash, announcing `port` if it is not zero.
    ///
    /// The stream ends after [Event::SearchDone], or when the node stops. In
    /// the latter case the next request returns the error that stopped it.
    pub async fn search(
        &self,
        info_hash: Id,
        port: u16,
        family: SearchFamily,
    ) -> Result<flume::r#async::RecvStream<'static, Event>> {
        let (events, receiver) = flume::unbounded::<Event>();

        self.request("search", |result| ActorMessage::Search {
            info_hash,
            port,
            family,
            events,
            result,
        })
        .await?;

        Ok(receiver.into_stream())
    }

    /// Add a node we know about to the routing table.
    pub async fn insert_node(&self, id: Id, address: SocketAddr) -> Result<()> {
        self.request("insert_node", |sender| {
            ActorMessage::InsertNode(id, address, sender)
        })
        .await
    }

    /// Ping a node, typically to bootstrap from it.
    pub async fn ping_node(&self, address: SocketAddr) -> Result<()> {
        self.request("ping_node", |sender| ActorMessage::PingNode(address, sender))
            .await
    }

    // === Private Methods ===

    async fn request<T>(
        &self,
        operation: &'static str,
        message: impl FnOnce(Sender<Result<T>>) -> ActorMessage,
    ) -> Result<T> {
        // Host callbacks run on the actor thread, which would wait on itself.
        if in_engine_call() {
            return Err(Error::Reentrant { operation });
        }

        let (sender, receiver) = flume::bounded::<Result<T>>(1);

        self.0.send(message(sender))?;

        receiver
            .recv_async()
            .await
            .map_err(|_| self.0.stop_reason())?
    }
}
