//! # Blossom Overlay - Bitmask-Sharded Pub/Sub Control Plane
//!
//! This crate manages which topic shards a node participates in and brings
//! the node up to a minimum set of overlay peers:
//!
//! - **Bitmasks**: 256-bit shard identifiers, with content-derived bloom indexes
//! - **Registry**: idempotent join/leave, raw and derived subscriptions, publish gating
//! - **Streams**: one consumption task per joined shard, feeding an application handler
//! - **Discovery**: routing-table bootstrap, advertisement and threshold-gated connects
//! - **Sampler**: uniformly random mesh peer selection from the OS CSPRNG
//!
//! ## Architecture
//!
//! The subscription registry follows the **Actor Pattern**: a cheap, cloneable
//! handle sends commands to a task that owns all mutable state. Discovery runs
//! as its own task. Every task hangs off one cancellation token owned by the
//! [`Overlay`], so shutting the overlay down stops everything.
//!
//! Transport, DHT routing and the gossip router are collaborators behind the
//! traits in `protocols`. [`MemoryNetwork`] provides an in-process
//! implementation of all of them.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | [`Overlay`] facade and bootstrap sequence |
//! | `bitmask` | Shard identifiers, bloom index, decomposition |
//! | `config` | Operator configuration and parameter resolution |
//! | `registry` | Subscription registry actor and topic multiplexer |
//! | `stream` | Per-subscription message consumption task |
//! | `discovery` | Peer discovery loop |
//! | `sampler` | Random peer selection |
//! | `identity` | Keypairs, peer ids, bootstrap peer addresses |
//! | `protocols` | Collaborator traits (Host, PeerRouting, Router, ...) |
//! | `memory` | In-process reference backend |
//! | `messages` | Delivered message type and handler alias |
//! | `error` | Error taxonomy |

mod bitmask;
mod config;
mod discovery;
mod error;
mod identity;
mod memory;
mod messages;
mod node;
mod protocols;
mod registry;
mod sampler;
mod stream;

pub use bitmask::{
    BITMASK_BITS, BITMASK_LEN, BLOOM_SET_BITS, BLOOM_WIDTH_BITS, Bitmask, bloom_index,
};
pub use config::{DiscoveryConfig, OverlayParams, P2PConfig, resolve};
pub use discovery::{DiscoveryStatus, PeerDiscovery};
pub use error::OverlayError;
pub use identity::{Keypair, PeerId, PeerInfo};
pub use memory::MemoryNetwork;
pub use messages::{Message, MessageHandler, message_handler};
pub use node::Overlay;
pub use protocols::{Host, MessageSource, OverlayBackend, PeerRouting, Router, Topic};
pub use registry::{SubscribeMode, SubscriptionRegistry, content_bitmask};
pub use sampler::PeerSampler;
pub use stream::{ConsumptionStream, StreamExit};
