//! # Peer Discovery Loop
//!
//! Brings the local node up to a minimum number of connected overlay peers.
//!
//! ## Phases
//!
//! 1. **Routing bootstrap** ([`PeerDiscovery::init`]): populate the DHT routing
//!    table. Failure is fatal and reported to the caller.
//! 2. **Static bootstrap peers**: dialed concurrently; failures are logged.
//! 3. **Advertisement** under [`Bitmask::ALL`].
//! 4. **Acquisition**: repeatedly query the DHT for advertisers of
//!    [`Bitmask::ALL`], connecting to each new one until `min_peers` distinct
//!    peers are connected.
//!
//! The acquisition phase is bounded by `max_rounds`. A round that connects no
//! new peer is followed by an exponentially growing pause. The whole loop
//! observes a [`CancellationToken`] and reports progress on a `watch` channel.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bitmask::Bitmask;
use crate::config::DiscoveryConfig;
use crate::error::OverlayError;
use crate::identity::PeerId;
use crate::protocols::{Host, PeerRouting};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryStatus {
    Running { connected: usize },
    Complete { connected: usize },
    Exhausted { connected: usize },
    Cancelled { connected: usize },
}

impl DiscoveryStatus {
    pub fn connected(&self) -> usize {
        match *self {
            DiscoveryStatus::Running { connected }
            | DiscoveryStatus::Complete { connected }
            | DiscoveryStatus::Exhausted { connected }
            | DiscoveryStatus::Cancelled { connected } => connected,
        }
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self, DiscoveryStatus::Running { .. })
    }
}

pub struct PeerDiscovery {
    host: Arc<dyn Host>,
    routing: Arc<dyn PeerRouting>,
    config: DiscoveryConfig,
    status: watch::Sender<DiscoveryStatus>,
}

impl PeerDiscovery {
    /// Bootstrap the routing table and prepare the discovery loop.
    ///
    /// # Errors
    /// [`OverlayError::RoutingBootstrap`] if the routing table cannot be
    /// bootstrapped.
    pub async fn init(
        host: Arc<dyn Host>,
        routing: Arc<dyn PeerRouting>,
        config: DiscoveryConfig,
    ) -> Result<Self, OverlayError> {
        info!("establishing dht");
        routing
            .bootstrap()
            .await
            .map_err(OverlayError::RoutingBootstrap)?;

        let (status, _) = watch::channel(DiscoveryStatus::Running { connected: 0 });
        Ok(Self {
            host,
            routing,
            config,
            status,
        })
    }

    pub fn status(&self) -> watch::Receiver<DiscoveryStatus> {
        self.status.subscribe()
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<Result<usize, OverlayError>> {
        tokio::spawn(self.run(cancel))
    }

    /// Run until `min_peers` are connected, the round budget is spent, or
    /// `cancel` fires. Returns the number of discovered peers connected.
    pub async fn run(self, cancel: CancellationToken) -> Result<usize, OverlayError> {
        let mut counted: HashSet<PeerId> = HashSet::new();
        let result = self.discover(&cancel, &mut counted).await;
        let connected = counted.len();

        let final_status = match &result {
            Ok(_) => DiscoveryStatus::Complete { connected },
            Err(OverlayError::Closed) => {
                debug!(connected, "peer discovery cancelled");
                DiscoveryStatus::Cancelled { connected }
            }
            Err(e) => {
                error!(error = %e, "peer discovery stopped");
                DiscoveryStatus::Exhausted { connected }
            }
        };
        self.status.send_replace(final_status);
        result
    }

    async fn discover(
        &self,
        cancel: &CancellationToken,
        counted: &mut HashSet<PeerId>,
    ) -> Result<usize, OverlayError> {
        let local = self.host.local_peer();
        info!(peer_id = %local, "initiating peer discovery");

        self.connect_bootstrap_peers(cancel).await?;

        if let Err(e) = until_cancelled(cancel, self.routing.advertise(&Bitmask::ALL)).await? {
            warn!(error = %e, "failed to advertise on discovery namespace");
        }

        let required = self.config.min_peers;
        if required == 0 {
            info!("no minimum peer count configured, discovery complete");
            return Ok(0);
        }

        let mut backoff = self.config.backoff;
        for round in 1..=self.config.max_rounds {
            let before = counted.len();

            let query = self.routing.find_peers(&Bitmask::ALL);
            let found = match until_cancelled(cancel, query).await? {
                Ok(found) => found,
                Err(e) => {
                    warn!(round, error = %e, "peer query failed");
                    Vec::new()
                }
            };

            for peer in found {
                if peer.id == local || counted.contains(&peer.id) {
                    continue;
                }

                info!(peer_id = %peer.id, "found peer");
                match until_cancelled(cancel, self.host.connect(&peer)).await? {
                    Ok(()) => {
                        counted.insert(peer.id);
                        info!(
                            peer_id = %peer.id,
                            connected = counted.len(),
                            required,
                            "connected to peer"
                        );
                        self.status.send_replace(DiscoveryStatus::Running {
                            connected: counted.len(),
                        });
                        if counted.len() >= required {
                            info!(connected = counted.len(), "minimum peer count reached");
                            return Ok(counted.len());
                        }
                    }
                    Err(e) => {
                        let e = OverlayError::Connect {
                            peer: peer.id,
                            source: e,
                        };
                        warn!(error = %e, "error while connecting to discovered peer");
                    }
                }
            }

            if counted.len() > before {
                backoff = self.config.backoff;
                continue;
            }

            if round < self.config.max_rounds {
                debug!(round, delay = ?backoff, "no new peers this round, backing off");
                until_cancelled(cancel, tokio::time::sleep(backoff)).await?;
                backoff = next_backoff(backoff, self.config.max_backoff);
            }
        }

        Err(OverlayError::DiscoveryExhausted {
            connected: counted.len(),
            required,
        })
    }

    async fn connect_bootstrap_peers(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(), OverlayError> {
        if self.config.bootstrap_peers.is_empty() {
            return Ok(());
        }
        info!(count = self.config.bootstrap_peers.len(), "connecting to bootstrap peers");

        let mut join_set = JoinSet::new();
        for peer in self.config.bootstrap_peers.iter().cloned() {
            let host = self.host.clone();
            join_set.spawn(async move {
                if let Err(e) = host.connect(&peer).await {
                    warn!(peer = %peer, error = %e, "error while connecting to bootstrap peer");
                }
            });
        }

        until_cancelled(cancel, async {
            while let Some(joined) = join_set.join_next().await {
                if let Err(e) = joined {
                    warn!(error = %e, "bootstrap connect task failed");
                }
            }
        })
        .await
    }
}

/// Double `current`, saturating, and cap it at `max`.
fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

/// Await `fut` unless `cancel` fires first, in which case [`OverlayError::Closed`].
async fn until_cancelled<F: Future>(
    cancel: &CancellationToken,
    fut: F,
) -> Result<F::Output, OverlayError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(OverlayError::Closed),
        out = fut => Ok(out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PeerInfo;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn peer(n: u8) -> PeerInfo {
        PeerInfo::single(PeerId::from_bytes([n; 32]), format!("10.0.0.{n}:4001"))
    }

    const LOCAL: u8 = 0xEE;

    #[derive(Default)]
    struct MockHost {
        connects: Mutex<Vec<PeerId>>,
        refuse: Mutex<HashSet<PeerId>>,
        crash: Mutex<HashSet<PeerId>>,
    }

    #[async_trait]
    impl Host for MockHost {
        fn local_peer(&self) -> PeerId {
            PeerId::from_bytes([LOCAL; 32])
        }

        fn listen_addrs(&self) -> Vec<String> {
            vec!["10.0.0.238:4001".to_string()]
        }

        async fn connect(&self, peer: &PeerInfo) -> anyhow::Result<()> {
            if self.refuse.lock().unwrap().contains(&peer.id) {
                anyhow::bail!("connection refused");
            }
            if self.crash.lock().unwrap().contains(&peer.id) {
                panic!("transport crashed");
            }
            self.connects.lock().unwrap().push(peer.id);
            Ok(())
        }

        async fn known_peers(&self) -> Vec<PeerId> {
            self.connects.lock().unwrap().clone()
        }

        async fn connected_peers(&self) -> Vec<PeerId> {
            self.connects.lock().unwrap().clone()
        }
    }

    #[derive(Default)]
    struct ScriptedRouting {
        fail_bootstrap: bool,
        rounds: Mutex<VecDeque<anyhow::Result<Vec<PeerInfo>>>>,
        queries: AtomicUsize,
        adverts: Mutex<Vec<Bitmask>>,
    }

    impl ScriptedRouting {
        fn with_rounds(rounds: Vec<Vec<PeerInfo>>) -> Self {
            Self {
                rounds: Mutex::new(rounds.into_iter().map(Ok).collect()),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl PeerRouting for ScriptedRouting {
        async fn bootstrap(&self) -> anyhow::Result<()> {
            if self.fail_bootstrap {
                anyhow::bail!("no routing table peers");
            }
            Ok(())
        }

        async fn advertise(&self, namespace: &Bitmask) -> anyhow::Result<()> {
            self.adverts.lock().unwrap().push(*namespace);
            Ok(())
        }

        async fn find_peers(&self, _namespace: &Bitmask) -> anyhow::Result<Vec<PeerInfo>> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            self.rounds.lock().unwrap().pop_front().unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn config(min_peers: usize, max_rounds: u32) -> DiscoveryConfig {
        DiscoveryConfig {
            min_peers,
            max_rounds,
            backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            ..DiscoveryConfig::default()
        }
    }

    async fn discovery(
        host: &Arc<MockHost>,
        routing: &Arc<ScriptedRouting>,
        config: DiscoveryConfig,
    ) -> PeerDiscovery {
        PeerDiscovery::init(host.clone(), routing.clone(), config)
            .await
            .unwrap()
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let cap = Duration::from_secs(30);
        assert_eq!(next_backoff(Duration::from_secs(1), cap), Duration::from_secs(2));
        assert_eq!(next_backoff(Duration::from_secs(20), cap), cap);
        assert_eq!(next_backoff(Duration::MAX, Duration::MAX), Duration::MAX);
        assert_eq!(next_backoff(Duration::MAX / 2 + Duration::from_secs(1), cap), cap);
    }

    #[tokio::test(start_paused = true)]
    async fn skips_self_and_duplicates_and_stops_at_threshold() {
        let local = PeerInfo::single(PeerId::from_bytes([LOCAL; 32]), "10.0.0.238:4001");
        let host = Arc::new(MockHost::default());
        let routing = Arc::new(ScriptedRouting::with_rounds(vec![
            vec![peer(0xA)],
            vec![peer(0xA), local],
            vec![peer(0xB), peer(0xC)],
            vec![peer(0xD)],
        ]));

        let disc = discovery(&host, &routing, config(3, 64)).await;
        let status = disc.status();
        let connected = disc.run(CancellationToken::new()).await.unwrap();

        assert_eq!(connected, 3);
        assert_eq!(routing.queries.load(Ordering::SeqCst), 3);
        assert_eq!(
            *host.connects.lock().unwrap(),
            vec![peer(0xA).id, peer(0xB).id, peer(0xC).id]
        );
        assert_eq!(*routing.adverts.lock().unwrap(), vec![Bitmask::ALL]);
        assert_eq!(*status.borrow(), DiscoveryStatus::Complete { connected: 3 });
    }

    #[tokio::test(start_paused = true)]
    async fn stops_mid_batch_when_threshold_reached() {
        let host = Arc::new(MockHost::default());
        let routing = Arc::new(ScriptedRouting::with_rounds(vec![vec![
            peer(1),
            peer(2),
            peer(3),
            peer(4),
        ]]));

        let connected = discovery(&host, &routing, config(2, 64))
            .await
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(connected, 2);
        assert_eq!(*host.connects.lock().unwrap(), vec![peer(1).id, peer(2).id]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_connects_are_not_counted() {
        let host = Arc::new(MockHost::default());
        host.refuse.lock().unwrap().insert(peer(1).id);
        let routing = Arc::new(ScriptedRouting::with_rounds(vec![
            vec![peer(1), peer(2)],
            vec![peer(1), peer(3)],
        ]));

        let connected = discovery(&host, &routing, config(2, 64))
            .await
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(connected, 2);
        assert_eq!(*host.connects.lock().unwrap(), vec![peer(2).id, peer(3).id]);
    }

    #[tokio::test]
    async fn zero_min_peers_completes_after_advertising() {
        let host = Arc::new(MockHost::default());
        let routing = Arc::new(ScriptedRouting::default());

        let connected = discovery(&host, &routing, config(0, 64))
            .await
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(connected, 0);
        assert_eq!(routing.queries.load(Ordering::SeqCst), 0);
        assert_eq!(routing.adverts.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_round_budget() {
        let host = Arc::new(MockHost::default());
        let routing = Arc::new(ScriptedRouting::default());
        routing
            .rounds
            .lock()
            .unwrap()
            .push_back(Err(anyhow::anyhow!("dht query failed")));

        let disc = discovery(&host, &routing, config(2, 4)).await;
        let status = disc.status();
        let err = disc.run(CancellationToken::new()).await.unwrap_err();

        assert!(matches!(
            err,
            OverlayError::DiscoveryExhausted { connected: 0, required: 2 }
        ));
        assert_eq!(routing.queries.load(Ordering::SeqCst), 4);
        assert_eq!(*status.borrow(), DiscoveryStatus::Exhausted { connected: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_between_unproductive_rounds() {
        let host = Arc::new(MockHost::default());
        let routing = Arc::new(ScriptedRouting::default());
        let started = tokio::time::Instant::now();

        let _ = discovery(&host, &routing, config(1, 5))
            .await
            .run(CancellationToken::new())
            .await;

        // 100 + 200 + 400 + 800 ms between five rounds.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(1500), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(1600), "{elapsed:?}");
    }

    #[tokio::test]
    async fn routing_bootstrap_failure_is_fatal() {
        let host = Arc::new(MockHost::default());
        let routing = Arc::new(ScriptedRouting {
            fail_bootstrap: true,
            ..ScriptedRouting::default()
        });

        let result = PeerDiscovery::init(host, routing, config(1, 1)).await;
        assert!(matches!(result, Err(OverlayError::RoutingBootstrap(_))));
    }

    #[tokio::test]
    async fn bootstrap_peers_are_dialed_and_failures_ignored() {
        let host = Arc::new(MockHost::default());
        host.refuse.lock().unwrap().insert(peer(2).id);
        let routing = Arc::new(ScriptedRouting::default());
        let cfg = DiscoveryConfig {
            bootstrap_peers: vec![peer(1), peer(2), peer(3)],
            ..config(0, 1)
        };

        discovery(&host, &routing, cfg)
            .await
            .run(CancellationToken::new())
            .await
            .unwrap();

        let mut dialed = host.connects.lock().unwrap().clone();
        dialed.sort();
        assert_eq!(dialed, vec![peer(1).id, peer(3).id]);
    }

    #[tokio::test]
    async fn panicking_bootstrap_connect_does_not_stop_discovery() {
        let host = Arc::new(MockHost::default());
        host.crash.lock().unwrap().insert(peer(1).id);
        let routing = Arc::new(ScriptedRouting::with_rounds(vec![vec![peer(4)]]));
        let cfg = DiscoveryConfig {
            bootstrap_peers: vec![peer(1), peer(2)],
            ..config(1, 4)
        };

        let connected = discovery(&host, &routing, cfg)
            .await
            .run(CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(connected, 1);
        assert_eq!(*host.connects.lock().unwrap(), vec![peer(2).id, peer(4).id]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_loop() {
        let host = Arc::new(MockHost::default());
        let routing = Arc::new(ScriptedRouting::default());
        let cancel = CancellationToken::new();

        let disc = discovery(&host, &routing, config(5, 1000)).await;
        let mut status = disc.status();
        let task = disc.spawn(cancel.clone());

        tokio::time::sleep(Duration::from_secs(5)).await;
        cancel.cancel();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(OverlayError::Closed)));
        status.changed().await.unwrap();
        assert_eq!(*status.borrow(), DiscoveryStatus::Cancelled { connected: 0 });
    }
}
