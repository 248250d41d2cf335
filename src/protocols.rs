//! Collaborator trait definitions for the overlay control plane.
//!
//! The control plane never touches sockets, routing tables or mesh state
//! directly. Everything it needs from the networking stack goes through the
//! traits below, so any transport can be plugged in behind an
//! [`OverlayBackend`].
//!
//! ## Collaborators
//!
//! | Role | Trait | Used by |
//! |------|-------|---------|
//! | Transport host | [`Host`] | discovery, node accessors |
//! | DHT routing | [`PeerRouting`] | discovery |
//! | Gossip router | [`Router`] | registry, sampler |
//! | Joined topic | [`Topic`] | registry |
//! | Inbound messages | [`MessageSource`] | consumption streams |
//! | Construction | [`OverlayBackend`] | `Overlay::create` |

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::bitmask::Bitmask;
use crate::config::OverlayParams;
use crate::identity::{Keypair, PeerId, PeerInfo};
use crate::messages::Message;

/// Transport endpoint bound to a local identity.
#[async_trait]
pub trait Host: Send + Sync + 'static {
    fn local_peer(&self) -> PeerId;

    /// Addresses the host is listening on.
    fn listen_addrs(&self) -> Vec<String>;

    /// Dial a peer and record it as connected.
    async fn connect(&self, peer: &PeerInfo) -> Result<()>;

    /// Every peer in the address book, connected or not.
    async fn known_peers(&self) -> Vec<PeerId>;

    async fn connected_peers(&self) -> Vec<PeerId>;
}

/// DHT-backed peer routing.
#[async_trait]
pub trait PeerRouting: Send + Sync + 'static {
    /// Populate the routing table. Must succeed before discovery proceeds.
    async fn bootstrap(&self) -> Result<()>;

    /// Announce the local peer under a namespace.
    async fn advertise(&self, namespace: &Bitmask) -> Result<()>;

    /// Peers currently advertising under a namespace. May include the local peer.
    async fn find_peers(&self, namespace: &Bitmask) -> Result<Vec<PeerInfo>>;
}

/// Gossip router that owns the mesh for every joined bitmask.
#[async_trait]
pub trait Router: Send + Sync + 'static {
    async fn join(&self, bitmask: &Bitmask) -> Result<Arc<dyn Topic>>;

    /// Peers the router currently considers part of the bitmask's mesh.
    async fn list_peers(&self, bitmask: &Bitmask) -> Vec<PeerId>;
}

/// Handle to a joined bitmask.
#[async_trait]
pub trait Topic: Send + Sync + 'static {
    fn bitmask(&self) -> Bitmask;

    async fn subscribe(&self) -> Result<Box<dyn MessageSource>>;

    async fn publish(&self, data: Vec<u8>) -> Result<()>;

    /// Leave the bitmask. Open sources observe end-of-stream.
    async fn close(&self);
}

/// Pull side of a topic subscription.
#[async_trait]
pub trait MessageSource: Send + 'static {
    /// Next delivered message; `Ok(None)` once the subscription is closed.
    async fn next(&mut self) -> Result<Option<Message>>;
}

/// Factory for the collaborators, invoked in order by `Overlay::create`.
#[async_trait]
pub trait OverlayBackend: Send + Sync + 'static {
    async fn build_host(&self, keypair: &Keypair, listen_addr: &str) -> Result<Arc<dyn Host>>;

    async fn build_routing(&self, host: Arc<dyn Host>) -> Result<Arc<dyn PeerRouting>>;

    async fn build_router(
        &self,
        params: &OverlayParams,
        host: Arc<dyn Host>,
    ) -> Result<Arc<dyn Router>>;
}
