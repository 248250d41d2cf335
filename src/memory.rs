//! # In-Process Reference Backend
//!
//! [`MemoryNetwork`] implements every collaborator trait over shared in-process
//! state, so overlays can be built, discovered and exercised without sockets.
//! It backs the binary's local cluster and the integration tests.
//!
//! ## Semantics
//!
//! | Operation | Behaviour |
//! |-----------|-----------|
//! | `build_host` | binds `listen_addr`; port 0 takes the next ephemeral port; a bound address is rejected |
//! | `connect` | succeeds when the peer id is registered at one of the given addresses |
//! | `advertise` / `find_peers` | per-namespace advertiser list, in advertisement order |
//! | `join` / `list_peers` | mesh = peers that joined the bitmask and are connected to us |
//! | `publish` | delivered once per connected node subscribed to the bitmask or to one of its bits, never to the publisher |
//!
//! Delivery is lossless: a subscriber with a full buffer makes `publish` wait.
//!
//! Fault toggles let tests force routing bootstrap, router construction, join
//! and subscribe failures.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, trace};

use crate::bitmask::Bitmask;
use crate::config::OverlayParams;
use crate::identity::{Keypair, PeerId, PeerInfo};
use crate::messages::{MAX_MESSAGE_SIZE, Message};
use crate::protocols::{Host, MessageSource, OverlayBackend, PeerRouting, Router, Topic};

const FIRST_EPHEMERAL_PORT: u16 = 40000;
const SUBSCRIBER_BUFFER: usize = 256;

#[derive(Default)]
struct Faults {
    routing_bootstrap: bool,
    router: bool,
    joins: HashSet<Bitmask>,
    subscribes: HashSet<Bitmask>,
}

struct Subscriber {
    id: u64,
    peer: PeerId,
    tx: mpsc::Sender<Message>,
}

struct NetworkState {
    hosts: HashMap<PeerId, String>,
    bound: HashMap<String, PeerId>,
    connections: HashMap<PeerId, HashSet<PeerId>>,
    peerstores: HashMap<PeerId, HashSet<PeerId>>,
    adverts: HashMap<Bitmask, Vec<PeerId>>,
    joined: HashMap<Bitmask, HashSet<PeerId>>,
    subscribers: HashMap<Bitmask, Vec<Subscriber>>,
    next_port: u16,
    next_subscriber: u64,
    publishes: usize,
    faults: Faults,
}

impl NetworkState {
    fn new() -> Self {
        Self {
            hosts: HashMap::new(),
            bound: HashMap::new(),
            connections: HashMap::new(),
            peerstores: HashMap::new(),
            adverts: HashMap::new(),
            joined: HashMap::new(),
            subscribers: HashMap::new(),
            next_port: FIRST_EPHEMERAL_PORT,
            next_subscriber: 0,
            publishes: 0,
            faults: Faults::default(),
        }
    }

    fn is_connected(&self, a: &PeerId, b: &PeerId) -> bool {
        self.connections.get(a).is_some_and(|peers| peers.contains(b))
    }
}

#[derive(Clone)]
pub struct MemoryNetwork {
    state: Arc<RwLock<NetworkState>>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(NetworkState::new())),
        }
    }

    /// Payloads accepted by any topic on this network.
    pub async fn publish_count(&self) -> usize {
        self.state.read().await.publishes
    }

    pub async fn host_count(&self) -> usize {
        self.state.read().await.hosts.len()
    }

    pub async fn fail_routing_bootstrap(&self, fail: bool) {
        self.state.write().await.faults.routing_bootstrap = fail;
    }

    pub async fn fail_router_construction(&self, fail: bool) {
        self.state.write().await.faults.router = fail;
    }

    pub async fn fail_join(&self, bitmask: Bitmask) {
        self.state.write().await.faults.joins.insert(bitmask);
    }

    pub async fn fail_subscribe(&self, bitmask: Bitmask) {
        self.state.write().await.faults.subscribes.insert(bitmask);
    }

    pub async fn clear_faults(&self) {
        self.state.write().await.faults = Faults::default();
    }
}

#[async_trait]
impl OverlayBackend for MemoryNetwork {
    async fn build_host(&self, keypair: &Keypair, listen_addr: &str) -> Result<Arc<dyn Host>> {
        let requested: SocketAddr = listen_addr
            .parse()
            .with_context(|| format!("invalid listen address {listen_addr:?}"))?;
        let id = keypair.peer_id();

        let mut state = self.state.write().await;
        if state.hosts.contains_key(&id) {
            bail!("peer {} already has a host on this network", id.short());
        }

        let addr = if requested.port() == 0 {
            loop {
                let port = state.next_port;
                state.next_port = state
                    .next_port
                    .checked_add(1)
                    .ok_or_else(|| anyhow!("ephemeral ports exhausted"))?;
                let candidate = SocketAddr::new(requested.ip(), port).to_string();
                if !state.bound.contains_key(&candidate) {
                    break candidate;
                }
            }
        } else {
            let addr = requested.to_string();
            if state.bound.contains_key(&addr) {
                bail!("address {addr} already in use");
            }
            addr
        };

        state.bound.insert(addr.clone(), id);
        state.hosts.insert(id, addr.clone());
        debug!(peer = %id.short(), addr = %addr, "memory host bound");

        Ok(Arc::new(MemoryHost {
            id,
            addr,
            net: self.clone(),
        }))
    }

    async fn build_routing(&self, host: Arc<dyn Host>) -> Result<Arc<dyn PeerRouting>> {
        Ok(Arc::new(MemoryRouting {
            id: host.local_peer(),
            net: self.clone(),
        }))
    }

    async fn build_router(
        &self,
        params: &OverlayParams,
        host: Arc<dyn Host>,
    ) -> Result<Arc<dyn Router>> {
        if self.state.read().await.faults.router {
            bail!("router construction refused");
        }
        trace!(d = params.d, d_lo = params.d_lo, d_hi = params.d_hi, "memory router parameters");
        Ok(Arc::new(MemoryRouter {
            id: host.local_peer(),
            net: self.clone(),
        }))
    }
}

// ============================================================================
// Host
// ============================================================================

pub struct MemoryHost {
    id: PeerId,
    addr: String,
    net: MemoryNetwork,
}

#[async_trait]
impl Host for MemoryHost {
    fn local_peer(&self) -> PeerId {
        self.id
    }

    fn listen_addrs(&self) -> Vec<String> {
        vec![self.addr.clone()]
    }

    async fn connect(&self, peer: &PeerInfo) -> Result<()> {
        if peer.id == self.id {
            bail!("cannot dial self");
        }

        let mut state = self.net.state.write().await;
        let registered = state
            .hosts
            .get(&peer.id)
            .cloned()
            .ok_or_else(|| anyhow!("peer {} is not reachable", peer.id.short()))?;
        if !peer.addrs.is_empty() && !peer.addrs.contains(&registered) {
            bail!("peer {} is not listening on {:?}", peer.id.short(), peer.addrs);
        }

        for (a, b) in [(self.id, peer.id), (peer.id, self.id)] {
            state.connections.entry(a).or_default().insert(b);
            state.peerstores.entry(a).or_default().insert(b);
        }
        debug!(
            local = %self.id.short(),
            remote = %peer.id.short(),
            "memory connection established"
        );
        Ok(())
    }

    async fn known_peers(&self) -> Vec<PeerId> {
        let state = self.net.state.read().await;
        state
            .peerstores
            .get(&self.id)
            .map(|peers| peers.iter().copied().collect())
            .unwrap_or_default()
    }

    async fn connected_peers(&self) -> Vec<PeerId> {
        let state = self.net.state.read().await;
        state
            .connections
            .get(&self.id)
            .map(|peers| peers.iter().copied().collect())
            .unwrap_or_default()
    }
}

// ============================================================================
// Routing
// ============================================================================

pub struct MemoryRouting {
    id: PeerId,
    net: MemoryNetwork,
}

#[async_trait]
impl PeerRouting for MemoryRouting {
    async fn bootstrap(&self) -> Result<()> {
        if self.net.state.read().await.faults.routing_bootstrap {
            bail!("failed to bootstrap routing table: no reachable peers");
        }
        Ok(())
    }

    async fn advertise(&self, namespace: &Bitmask) -> Result<()> {
        let mut state = self.net.state.write().await;
        let advertisers = state.adverts.entry(*namespace).or_default();
        if !advertisers.contains(&self.id) {
            advertisers.push(self.id);
        }
        Ok(())
    }

    async fn find_peers(&self, namespace: &Bitmask) -> Result<Vec<PeerInfo>> {
        let state = self.net.state.read().await;
        let found = state
            .adverts
            .get(namespace)
            .into_iter()
            .flatten()
            .filter_map(|id| state.hosts.get(id).map(|addr| PeerInfo::single(*id, addr.clone())))
            .collect();
        Ok(found)
    }
}

// ============================================================================
// Router, topics and sources
// ============================================================================

pub struct MemoryRouter {
    id: PeerId,
    net: MemoryNetwork,
}

#[async_trait]
impl Router for MemoryRouter {
    async fn join(&self, bitmask: &Bitmask) -> Result<Arc<dyn Topic>> {
        let mut state = self.net.state.write().await;
        if state.faults.joins.contains(bitmask) {
            bail!("join rejected by router");
        }
        state.joined.entry(*bitmask).or_default().insert(self.id);

        Ok(Arc::new(MemoryTopic {
            bitmask: *bitmask,
            peer: self.id,
            net: self.net.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn list_peers(&self, bitmask: &Bitmask) -> Vec<PeerId> {
        let state = self.net.state.read().await;
        let mut peers: Vec<PeerId> = state
            .joined
            .get(bitmask)
            .into_iter()
            .flatten()
            .filter(|p| **p != self.id && state.is_connected(&self.id, p))
            .copied()
            .collect();
        peers.sort();
        peers
    }
}

pub struct MemoryTopic {
    bitmask: Bitmask,
    peer: PeerId,
    net: MemoryNetwork,
    closed: AtomicBool,
}

#[async_trait]
impl Topic for MemoryTopic {
    fn bitmask(&self) -> Bitmask {
        self.bitmask
    }

    async fn subscribe(&self) -> Result<Box<dyn MessageSource>> {
        if self.closed.load(Ordering::Acquire) {
            bail!("topic is closed");
        }

        let mut state = self.net.state.write().await;
        if state.faults.subscribes.contains(&self.bitmask) {
            bail!("subscription rejected by router");
        }

        let id = state.next_subscriber;
        state.next_subscriber += 1;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        state
            .subscribers
            .entry(self.bitmask)
            .or_default()
            .push(Subscriber {
                id,
                peer: self.peer,
                tx,
            });
        trace!(bitmask = %self.bitmask, subscriber = id, "memory subscription opened");

        Ok(Box::new(MemorySource { rx }))
    }

    async fn publish(&self, data: Vec<u8>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            bail!("topic is closed");
        }
        if data.len() > MAX_MESSAGE_SIZE {
            bail!("message of {} bytes exceeds limit of {}", data.len(), MAX_MESSAGE_SIZE);
        }

        // Pick one subscriber per node under the lock, deliver after releasing it.
        let recipients: Vec<(u64, mpsc::Sender<Message>)> = {
            let mut state = self.net.state.write().await;
            state.publishes += 1;

            let mut chosen: HashSet<PeerId> = HashSet::new();
            let mut recipients = Vec::new();
            let covered = state
                .subscribers
                .iter()
                .filter(|(mask, _)| covers(&self.bitmask, mask))
                .flat_map(|(_, subs)| subs.iter());
            for sub in covered {
                if sub.peer == self.peer
                    || chosen.contains(&sub.peer)
                    || !state.is_connected(&self.peer, &sub.peer)
                {
                    continue;
                }
                chosen.insert(sub.peer);
                recipients.push((sub.id, sub.tx.clone()));
            }
            recipients
        };

        let message = Message::new(self.bitmask, self.peer, data);
        let mut delivered = 0usize;
        for (id, tx) in recipients {
            // A full buffer applies backpressure instead of dropping.
            if tx.send(message.clone()).await.is_ok() {
                delivered += 1;
            } else {
                debug!(bitmask = %self.bitmask, subscriber = id, "subscriber went away");
            }
        }
        trace!(bitmask = %self.bitmask, recipients = delivered, "memory publish");
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut state = self.net.state.write().await;
        if let Some(subscribers) = state.subscribers.get_mut(&self.bitmask) {
            subscribers.retain(|s| s.peer != self.peer);
        }
        if let Some(members) = state.joined.get_mut(&self.bitmask) {
            members.remove(&self.peer);
        }
        trace!(bitmask = %self.bitmask, "memory topic closed");
    }
}

/// A publish on `published` reaches subscribers of the same bitmask and of
/// every elementary bitmask it contains. Each node receives it at most once.
fn covers(published: &Bitmask, subscribed: &Bitmask) -> bool {
    published == subscribed || (subscribed.is_elementary() && published.overlaps(subscribed))
}

pub struct MemorySource {
    rx: mpsc::Receiver<Message>,
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn next(&mut self) -> Result<Option<Message>> {
        Ok(self.rx.recv().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn host(net: &MemoryNetwork, addr: &str) -> Arc<dyn Host> {
        net.build_host(&Keypair::generate(), addr).await.unwrap()
    }

    #[tokio::test]
    async fn ephemeral_ports_are_unique() {
        let net = MemoryNetwork::new();
        let a = host(&net, "127.0.0.1:0").await;
        let b = host(&net, "127.0.0.1:0").await;

        assert_ne!(a.listen_addrs(), b.listen_addrs());
        assert_eq!(a.listen_addrs(), vec!["127.0.0.1:40000".to_string()]);
        assert_eq!(net.host_count().await, 2);
    }

    #[tokio::test]
    async fn bound_address_is_rejected() {
        let net = MemoryNetwork::new();
        host(&net, "127.0.0.1:4001").await;

        let err = net
            .build_host(&Keypair::generate(), "127.0.0.1:4001")
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("already in use"));

        assert!(net.build_host(&Keypair::generate(), "not an address").await.is_err());
    }

    #[tokio::test]
    async fn connect_requires_registered_peer_at_address() {
        let net = MemoryNetwork::new();
        let a = host(&net, "127.0.0.1:0").await;
        let b = host(&net, "127.0.0.1:0").await;

        let wrong_addr = PeerInfo::single(b.local_peer(), "127.0.0.1:1");
        assert!(a.connect(&wrong_addr).await.is_err());

        let unknown = PeerInfo::single(Keypair::generate().peer_id(), "127.0.0.1:2");
        assert!(a.connect(&unknown).await.is_err());

        let right = PeerInfo::single(b.local_peer(), b.listen_addrs()[0].clone());
        a.connect(&right).await.unwrap();
        assert_eq!(a.connected_peers().await, vec![b.local_peer()]);
        assert_eq!(b.known_peers().await, vec![a.local_peer()]);
    }

    #[tokio::test]
    async fn publish_reaches_connected_subscribers_only() {
        let net = MemoryNetwork::new();
        let a = host(&net, "127.0.0.1:0").await;
        let b = host(&net, "127.0.0.1:0").await;
        let c = host(&net, "127.0.0.1:0").await;
        a.connect(&PeerInfo::single(b.local_peer(), b.listen_addrs()[0].clone()))
            .await
            .unwrap();

        let params = OverlayParams::default();
        let ra = net.build_router(&params, a.clone()).await.unwrap();
        let rb = net.build_router(&params, b.clone()).await.unwrap();
        let rc = net.build_router(&params, c.clone()).await.unwrap();

        let mask = Bitmask::elementary(1).unwrap();
        let ta = ra.join(&mask).await.unwrap();
        let tb = rb.join(&mask).await.unwrap();
        let tc = rc.join(&mask).await.unwrap();
        let mut own = ta.subscribe().await.unwrap();
        let mut sb = tb.subscribe().await.unwrap();
        let mut sc = tc.subscribe().await.unwrap();

        assert_eq!(ra.list_peers(&mask).await, vec![b.local_peer()]);

        ta.publish(b"hi".to_vec()).await.unwrap();
        let got = sb.next().await.unwrap().unwrap();
        assert_eq!(got.data, b"hi");
        assert_eq!(got.from, a.local_peer());
        assert_eq!(net.publish_count().await, 1);

        // Neither the publisher nor the unconnected node receive it.
        tb.close().await;
        ta.close().await;
        tc.close().await;
        assert!(own.next().await.unwrap().is_none());
        assert!(sc.next().await.unwrap().is_none());
        assert!(ra.list_peers(&mask).await.is_empty());
    }

    #[tokio::test]
    async fn faults_are_reported() {
        let net = MemoryNetwork::new();
        let a = host(&net, "127.0.0.1:0").await;
        let mask = Bitmask::elementary(3).unwrap();

        net.fail_routing_bootstrap(true).await;
        let routing = net.build_routing(a.clone()).await.unwrap();
        assert!(routing.bootstrap().await.is_err());

        net.fail_router_construction(true).await;
        assert!(net.build_router(&OverlayParams::default(), a.clone()).await.is_err());

        net.clear_faults().await;
        let router = net.build_router(&OverlayParams::default(), a.clone()).await.unwrap();
        net.fail_join(mask).await;
        assert!(router.join(&mask).await.is_err());

        net.clear_faults().await;
        net.fail_subscribe(mask).await;
        let topic = router.join(&mask).await.unwrap();
        assert!(topic.subscribe().await.is_err());
    }

    #[tokio::test]
    async fn full_subscriber_buffer_does_not_drop_messages() {
        let net = MemoryNetwork::new();
        let a = host(&net, "127.0.0.1:0").await;
        let b = host(&net, "127.0.0.1:0").await;
        a.connect(&PeerInfo::single(b.local_peer(), b.listen_addrs()[0].clone()))
            .await
            .unwrap();

        let params = OverlayParams::default();
        let ra = net.build_router(&params, a).await.unwrap();
        let rb = net.build_router(&params, b).await.unwrap();
        let mask = Bitmask::elementary(9).unwrap();
        let ta = ra.join(&mask).await.unwrap();
        let mut source = rb.join(&mask).await.unwrap().subscribe().await.unwrap();

        let total = SUBSCRIBER_BUFFER + 64;
        let publisher = tokio::spawn(async move {
            for i in 0..total {
                ta.publish((i as u32).to_be_bytes().to_vec()).await.unwrap();
            }
        });

        for i in 0..total {
            let msg = source.next().await.unwrap().unwrap();
            assert_eq!(msg.data, (i as u32).to_be_bytes().to_vec());
        }
        publisher.await.unwrap();
        assert_eq!(net.publish_count().await, total);
    }

    #[tokio::test]
    async fn closed_topic_rejects_publish() {
        let net = MemoryNetwork::new();
        let a = host(&net, "127.0.0.1:0").await;
        let router = net.build_router(&OverlayParams::default(), a).await.unwrap();
        let topic = router.join(&Bitmask::ZERO).await.unwrap();

        topic.close().await;
        assert!(topic.publish(b"late".to_vec()).await.is_err());
        assert!(topic.subscribe().await.is_err());
        assert_eq!(net.publish_count().await, 0);
    }
}
