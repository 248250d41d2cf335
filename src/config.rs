//! # Configuration and Parameter Resolution
//!
//! [`P2PConfig`] is the operator-facing configuration, loaded from TOML. Every
//! router tunable in it may be left at zero, meaning "use the protocol
//! default". [`resolve`] turns it into the immutable [`OverlayParams`] record
//! handed to the router at construction.
//!
//! ## Defaults
//!
//! | Group | Parameters |
//! |-------|------------|
//! | Mesh sizing | `d` 6, `d_lo` 5, `d_hi` 12, `d_score` 4, `d_out` 2 |
//! | History / lazy push | `history_length` 5, `history_gossip` 3, `d_lazy` 6, `gossip_factor` 0.25, `gossip_retransmission` 3 |
//! | Heartbeat | `heartbeat_initial_delay` 100ms, `heartbeat_interval` 1s |
//! | Fanout / backoff | `fanout_ttl` 60s, `prune_peers` 16, `prune_backoff` 60s, `unsubscribe_backoff` 10s |
//! | Direct connections | `connectors` 8, `max_pending_connections` 128, `connection_timeout` 30s, `direct_connect_ticks` 300, `direct_connect_initial_delay` 1s |
//! | Opportunistic graft | `opportunistic_graft_ticks` 60, `opportunistic_graft_peers` 2, `graft_flood_threshold` 10s |
//! | IHAVE / IWANT | `max_ihave_length` 5000, `max_ihave_messages` 10, `iwant_followup_time` 3s |

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::OverlayError;
use crate::identity::PeerInfo;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:0";

pub const DEFAULT_DISCOVERY_MAX_ROUNDS: u32 = 64;
pub const DEFAULT_DISCOVERY_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_DISCOVERY_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Fraction of the heartbeat interval after which a slow heartbeat is logged.
/// Not configurable.
pub const SLOW_HEARTBEAT_WARNING: f64 = 0.1;

// ============================================================================
// Operator configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct P2PConfig {
    /// Address the host binds to. Port 0 picks an ephemeral port.
    pub listen_addr: String,
    /// Hex-encoded Ed25519 secret key. Empty generates a fresh identity.
    pub peer_priv_key: String,
    /// Static peers dialed before discovery, as `ADDR/PEER_ID`.
    pub bootstrap_peers: Vec<String>,
    /// Distinct peers discovery must connect before it stops.
    pub min_peers: usize,
    /// When set, log events are also written here as JSON lines.
    pub trace_log_file: Option<PathBuf>,

    /// Discovery rounds before giving up. 0 selects the default.
    pub discovery_max_rounds: u32,
    #[serde(with = "humantime_serde")]
    pub discovery_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub discovery_max_backoff: Duration,

    pub d: usize,
    pub d_lo: usize,
    pub d_hi: usize,
    pub d_score: usize,
    pub d_out: usize,
    pub history_length: usize,
    pub history_gossip: usize,
    pub d_lazy: usize,
    pub gossip_factor: f64,
    pub gossip_retransmission: usize,
    #[serde(with = "humantime_serde")]
    pub heartbeat_initial_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub fanout_ttl: Duration,
    pub prune_peers: usize,
    #[serde(with = "humantime_serde")]
    pub prune_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub unsubscribe_backoff: Duration,
    pub connectors: usize,
    pub max_pending_connections: usize,
    #[serde(with = "humantime_serde")]
    pub connection_timeout: Duration,
    pub direct_connect_ticks: u64,
    #[serde(with = "humantime_serde")]
    pub direct_connect_initial_delay: Duration,
    pub opportunistic_graft_ticks: u64,
    pub opportunistic_graft_peers: usize,
    #[serde(with = "humantime_serde")]
    pub graft_flood_threshold: Duration,
    pub max_ihave_length: usize,
    pub max_ihave_messages: usize,
    #[serde(with = "humantime_serde")]
    pub iwant_followup_time: Duration,
}

impl Default for P2PConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            peer_priv_key: String::new(),
            bootstrap_peers: Vec::new(),
            min_peers: 0,
            trace_log_file: None,
            discovery_max_rounds: 0,
            discovery_backoff: Duration::ZERO,
            discovery_max_backoff: Duration::ZERO,
            d: 0,
            d_lo: 0,
            d_hi: 0,
            d_score: 0,
            d_out: 0,
            history_length: 0,
            history_gossip: 0,
            d_lazy: 0,
            gossip_factor: 0.0,
            gossip_retransmission: 0,
            heartbeat_initial_delay: Duration::ZERO,
            heartbeat_interval: Duration::ZERO,
            fanout_ttl: Duration::ZERO,
            prune_peers: 0,
            prune_backoff: Duration::ZERO,
            unsubscribe_backoff: Duration::ZERO,
            connectors: 0,
            max_pending_connections: 0,
            connection_timeout: Duration::ZERO,
            direct_connect_ticks: 0,
            direct_connect_initial_delay: Duration::ZERO,
            opportunistic_graft_ticks: 0,
            opportunistic_graft_peers: 0,
            graft_flood_threshold: Duration::ZERO,
            max_ihave_length: 0,
            max_ihave_messages: 0,
            iwant_followup_time: Duration::ZERO,
        }
    }
}

impl P2PConfig {
    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        toml::from_str(raw).context("invalid p2p configuration")
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("failed to parse {}", path.display()))
    }
}

// ============================================================================
// Resolved router parameters
// ============================================================================

/// Fully populated router tunables. Built once by [`resolve`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverlayParams {
    pub d: usize,
    pub d_lo: usize,
    pub d_hi: usize,
    pub d_score: usize,
    pub d_out: usize,
    pub history_length: usize,
    pub history_gossip: usize,
    pub d_lazy: usize,
    pub gossip_factor: f64,
    pub gossip_retransmission: usize,
    #[serde(with = "humantime_serde")]
    pub heartbeat_initial_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    pub slow_heartbeat_warning: f64,
    #[serde(with = "humantime_serde")]
    pub fanout_ttl: Duration,
    pub prune_peers: usize,
    #[serde(with = "humantime_serde")]
    pub prune_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub unsubscribe_backoff: Duration,
    pub connectors: usize,
    pub max_pending_connections: usize,
    #[serde(with = "humantime_serde")]
    pub connection_timeout: Duration,
    pub direct_connect_ticks: u64,
    #[serde(with = "humantime_serde")]
    pub direct_connect_initial_delay: Duration,
    pub opportunistic_graft_ticks: u64,
    pub opportunistic_graft_peers: usize,
    #[serde(with = "humantime_serde")]
    pub graft_flood_threshold: Duration,
    pub max_ihave_length: usize,
    pub max_ihave_messages: usize,
    #[serde(with = "humantime_serde")]
    pub iwant_followup_time: Duration,
}

impl Default for OverlayParams {
    fn default() -> Self {
        Self {
            d: 6,
            d_lo: 5,
            d_hi: 12,
            d_score: 4,
            d_out: 2,
            history_length: 5,
            history_gossip: 3,
            d_lazy: 6,
            gossip_factor: 0.25,
            gossip_retransmission: 3,
            heartbeat_initial_delay: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(1),
            slow_heartbeat_warning: SLOW_HEARTBEAT_WARNING,
            fanout_ttl: Duration::from_secs(60),
            prune_peers: 16,
            prune_backoff: Duration::from_secs(60),
            unsubscribe_backoff: Duration::from_secs(10),
            connectors: 8,
            max_pending_connections: 128,
            connection_timeout: Duration::from_secs(30),
            direct_connect_ticks: 300,
            direct_connect_initial_delay: Duration::from_secs(1),
            opportunistic_graft_ticks: 60,
            opportunistic_graft_peers: 2,
            graft_flood_threshold: Duration::from_secs(10),
            max_ihave_length: 5000,
            max_ihave_messages: 10,
            iwant_followup_time: Duration::from_secs(3),
        }
    }
}

#[inline]
fn or_default<T: PartialEq + Default>(value: T, fallback: T) -> T {
    if value == T::default() { fallback } else { value }
}

/// Replace every zero tunable in `config` with its protocol default.
pub fn resolve(config: &P2PConfig) -> OverlayParams {
    let defaults = OverlayParams::default();
    OverlayParams {
        d: or_default(config.d, defaults.d),
        d_lo: or_default(config.d_lo, defaults.d_lo),
        d_hi: or_default(config.d_hi, defaults.d_hi),
        d_score: or_default(config.d_score, defaults.d_score),
        d_out: or_default(config.d_out, defaults.d_out),
        history_length: or_default(config.history_length, defaults.history_length),
        history_gossip: or_default(config.history_gossip, defaults.history_gossip),
        d_lazy: or_default(config.d_lazy, defaults.d_lazy),
        gossip_factor: or_default(config.gossip_factor, defaults.gossip_factor),
        gossip_retransmission: or_default(
            config.gossip_retransmission,
            defaults.gossip_retransmission,
        ),
        heartbeat_initial_delay: or_default(
            config.heartbeat_initial_delay,
            defaults.heartbeat_initial_delay,
        ),
        heartbeat_interval: or_default(config.heartbeat_interval, defaults.heartbeat_interval),
        slow_heartbeat_warning: defaults.slow_heartbeat_warning,
        fanout_ttl: or_default(config.fanout_ttl, defaults.fanout_ttl),
        prune_peers: or_default(config.prune_peers, defaults.prune_peers),
        prune_backoff: or_default(config.prune_backoff, defaults.prune_backoff),
        unsubscribe_backoff: or_default(config.unsubscribe_backoff, defaults.unsubscribe_backoff),
        connectors: or_default(config.connectors, defaults.connectors),
        max_pending_connections: or_default(
            config.max_pending_connections,
            defaults.max_pending_connections,
        ),
        connection_timeout: or_default(config.connection_timeout, defaults.connection_timeout),
        direct_connect_ticks: or_default(
            config.direct_connect_ticks,
            defaults.direct_connect_ticks,
        ),
        direct_connect_initial_delay: or_default(
            config.direct_connect_initial_delay,
            defaults.direct_connect_initial_delay,
        ),
        opportunistic_graft_ticks: or_default(
            config.opportunistic_graft_ticks,
            defaults.opportunistic_graft_ticks,
        ),
        opportunistic_graft_peers: or_default(
            config.opportunistic_graft_peers,
            defaults.opportunistic_graft_peers,
        ),
        graft_flood_threshold: or_default(
            config.graft_flood_threshold,
            defaults.graft_flood_threshold,
        ),
        max_ihave_length: or_default(config.max_ihave_length, defaults.max_ihave_length),
        max_ihave_messages: or_default(config.max_ihave_messages, defaults.max_ihave_messages),
        iwant_followup_time: or_default(config.iwant_followup_time, defaults.iwant_followup_time),
    }
}

// ============================================================================
// Discovery settings
// ============================================================================

/// Settings consumed by the peer discovery loop.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub bootstrap_peers: Vec<PeerInfo>,
    pub min_peers: usize,
    pub max_rounds: u32,
    pub backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            bootstrap_peers: Vec::new(),
            min_peers: 0,
            max_rounds: DEFAULT_DISCOVERY_MAX_ROUNDS,
            backoff: DEFAULT_DISCOVERY_BACKOFF,
            max_backoff: DEFAULT_DISCOVERY_MAX_BACKOFF,
        }
    }
}

impl DiscoveryConfig {
    /// # Errors
    /// [`OverlayError::InvalidBootstrapPeer`] for the first malformed entry.
    pub fn from_config(config: &P2PConfig) -> Result<Self, OverlayError> {
        let bootstrap_peers = config
            .bootstrap_peers
            .iter()
            .map(|entry| entry.parse::<PeerInfo>())
            .collect::<Result<Vec<_>, _>>()?;

        let backoff = or_default(config.discovery_backoff, DEFAULT_DISCOVERY_BACKOFF);
        let max_backoff = or_default(config.discovery_max_backoff, DEFAULT_DISCOVERY_MAX_BACKOFF)
            .max(backoff);

        Ok(Self {
            bootstrap_peers,
            min_peers: config.min_peers,
            max_rounds: or_default(config.discovery_max_rounds, DEFAULT_DISCOVERY_MAX_ROUNDS),
            backoff,
            max_backoff,
        })
    }
}
