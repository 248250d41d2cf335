//! # High-Level Overlay API
//!
//! [`Overlay`] is the entry point of the crate. [`Overlay::create`] runs the
//! bootstrap sequence and returns a handle combining the subscription
//! registry, the peer sampler and the identity accessors.
//!
//! ## Quick Start
//!
//! ```ignore
//! let network = Arc::new(MemoryNetwork::new());
//! let overlay = Overlay::create(&P2PConfig::default(), network).await?;
//!
//! let shard = Bitmask::elementary(7).unwrap();
//! overlay
//!     .subscribe(shard, |msg| { println!("{:?}", msg); Ok(()) }, SubscribeMode::Raw)
//!     .await?;
//! overlay.publish_to_bitmask(shard, b"hello".to_vec()).await?;
//! ```
//!
//! ## Bootstrap Sequence
//!
//! 1. Identity: configured hex secret key, or a fresh keypair
//! 2. Host bound to `listen_addr`
//! 3. Routing table bootstrap, then the discovery loop as its own task
//! 4. Router from the resolved parameters
//! 5. Registry actor and peer sampler
//!
//! Any failure aborts the sequence and cancels whatever was already started.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bitmask::Bitmask;
use crate::config::{DiscoveryConfig, OverlayParams, P2PConfig, resolve};
use crate::discovery::{DiscoveryStatus, PeerDiscovery};
use crate::error::OverlayError;
use crate::identity::{Keypair, PeerId};
use crate::messages::{Message, MessageHandler};
use crate::protocols::{Host, OverlayBackend};
use crate::registry::{SubscribeMode, SubscriptionRegistry};
use crate::sampler::PeerSampler;

pub struct Overlay {
    keypair: Keypair,
    host: Arc<dyn Host>,
    registry: SubscriptionRegistry,
    sampler: PeerSampler,
    params: OverlayParams,
    discovery: watch::Receiver<DiscoveryStatus>,
    cancel: CancellationToken,
}

impl Overlay {
    /// Build an overlay on top of `backend`.
    ///
    /// # Errors
    /// Every error returned here is startup-fatal (see
    /// [`OverlayError::is_startup_fatal`]); nothing is left running.
    pub async fn create(
        config: &P2PConfig,
        backend: Arc<dyn OverlayBackend>,
    ) -> Result<Self, OverlayError> {
        let keypair = if config.peer_priv_key.trim().is_empty() {
            info!("no peer key configured, generating one");
            Keypair::generate()
        } else {
            Keypair::from_secret_hex(&config.peer_priv_key)?
        };
        let discovery_config = DiscoveryConfig::from_config(config)?;

        let host = backend
            .build_host(&keypair, &config.listen_addr)
            .await
            .map_err(OverlayError::Transport)?;
        info!(peer_id = %keypair.peer_id(), addrs = ?host.listen_addrs(), "established peer id");

        let routing = backend
            .build_routing(host.clone())
            .await
            .map_err(OverlayError::RoutingBootstrap)?;
        let discovery = PeerDiscovery::init(host.clone(), routing, discovery_config).await?;
        let discovery_status = discovery.status();

        let cancel = CancellationToken::new();
        let _ = discovery.spawn(cancel.child_token());

        let params = resolve(config);
        let router = match backend.build_router(&params, host.clone()).await {
            Ok(router) => router,
            Err(e) => {
                cancel.cancel();
                return Err(OverlayError::RouterInit(e));
            }
        };

        let registry = SubscriptionRegistry::spawn(router.clone(), cancel.child_token());
        let sampler = PeerSampler::new(router);

        Ok(Self {
            keypair,
            host,
            registry,
            sampler,
            params,
            discovery: discovery_status,
            cancel,
        })
    }

    // ------------------------------------------------------------------------
    // Publishing and subscriptions
    // ------------------------------------------------------------------------

    /// Publish on the bitmask derived from the payload's content.
    pub async fn publish(&self, data: Vec<u8>) -> Result<(), OverlayError> {
        self.registry.publish(data).await
    }

    pub async fn publish_to_bitmask(
        &self,
        bitmask: Bitmask,
        data: Vec<u8>,
    ) -> Result<(), OverlayError> {
        self.registry.publish_to_bitmask(bitmask, data).await
    }

    /// Join `bitmask` and deliver every message to `handler`.
    ///
    /// Join or subscribe failures for individual bitmasks are logged and do
    /// not fail the call. `Err` means the overlay is shut down.
    pub async fn subscribe<F>(
        &self,
        bitmask: Bitmask,
        handler: F,
        mode: SubscribeMode,
    ) -> Result<(), OverlayError>
    where
        F: Fn(Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let handler: MessageHandler = Arc::new(handler);
        self.registry.subscribe(bitmask, handler, mode).await
    }

    pub async fn unsubscribe(
        &self,
        bitmask: Bitmask,
        mode: SubscribeMode,
    ) -> Result<(), OverlayError> {
        self.registry.unsubscribe(bitmask, mode).await
    }

    pub async fn subscriptions(&self) -> Vec<Bitmask> {
        self.registry.subscriptions().await
    }

    pub async fn is_subscribed(&self, bitmask: Bitmask) -> bool {
        self.registry.is_subscribed(bitmask).await
    }

    pub async fn active_streams(&self) -> usize {
        self.registry.active_streams().await
    }

    pub async fn random_peer(&self, bitmask: &Bitmask) -> Result<PeerId, OverlayError> {
        self.sampler.random_peer(bitmask).await
    }

    // ------------------------------------------------------------------------
    // Identity and connectivity
    // ------------------------------------------------------------------------

    pub fn peer_id(&self) -> PeerId {
        self.keypair.peer_id()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    pub fn params(&self) -> &OverlayParams {
        &self.params
    }

    pub fn listen_addrs(&self) -> Vec<String> {
        self.host.listen_addrs()
    }

    /// `ADDR/PEER_ID` strings other nodes can use as bootstrap peers.
    pub fn bootstrap_addrs(&self) -> Vec<String> {
        let id = self.peer_id();
        self.listen_addrs()
            .into_iter()
            .map(|addr| format!("{addr}/{id}"))
            .collect()
    }

    /// Peers in the local address book.
    pub async fn peerstore_count(&self) -> usize {
        self.host.known_peers().await.len()
    }

    /// Peers with a live connection.
    pub async fn network_peers_count(&self) -> usize {
        self.host.connected_peers().await.len()
    }

    // ------------------------------------------------------------------------
    // Discovery and lifecycle
    // ------------------------------------------------------------------------

    pub fn discovery_status(&self) -> DiscoveryStatus {
        *self.discovery.borrow()
    }

    /// Wait until the discovery loop has finished, successfully or not.
    pub async fn wait_for_discovery(&self) -> DiscoveryStatus {
        let mut rx = self.discovery.clone();
        let finished = rx.wait_for(DiscoveryStatus::is_finished).await.map(|status| *status);
        finished.unwrap_or_else(|_| *rx.borrow())
    }

    /// Stop discovery, close every subscription and end all streams.
    pub fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            info!(peer_id = %self.peer_id(), "shutting down overlay");
            self.cancel.cancel();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for Overlay {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
