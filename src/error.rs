//! Error taxonomy for the overlay control plane.
//!
//! | Class | Variants | Handling |
//! |-------|----------|----------|
//! | Recoverable | `NotSubscribed`, `NoPeersAvailable`, `Publish` | returned to the caller |
//! | Per-operation | `Join`, `Subscribe`, `Connect` | logged, registry left untouched |
//! | Startup-fatal | `InvalidKey`, `InvalidBootstrapPeer`, `Transport`, `RouterInit`, `RoutingBootstrap` | `Overlay::create` fails |
//! | Lifecycle | `DiscoveryExhausted`, `Closed` | reported by the owning task |

use crate::bitmask::Bitmask;
use crate::identity::PeerId;

#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    #[error("not subscribed to bitmask {0}")]
    NotSubscribed(Bitmask),

    #[error("no peers available for bitmask {0}")]
    NoPeersAvailable(Bitmask),

    #[error("publish to bitmask {bitmask} failed: {source}")]
    Publish {
        bitmask: Bitmask,
        source: anyhow::Error,
    },

    #[error("join failed for bitmask {bitmask}: {source}")]
    Join {
        bitmask: Bitmask,
        source: anyhow::Error,
    },

    #[error("subscription failed for bitmask {bitmask}: {source}")]
    Subscribe {
        bitmask: Bitmask,
        source: anyhow::Error,
    },

    #[error("connection to peer {peer} failed: {source}")]
    Connect {
        peer: PeerId,
        source: anyhow::Error,
    },

    #[error("invalid peer key: {0}")]
    InvalidKey(String),

    #[error("invalid bootstrap peer {entry:?}: {reason}")]
    InvalidBootstrapPeer { entry: String, reason: String },

    #[error("transport construction failed: {0}")]
    Transport(#[source] anyhow::Error),

    #[error("router construction failed: {0}")]
    RouterInit(#[source] anyhow::Error),

    #[error("routing table bootstrap failed: {0}")]
    RoutingBootstrap(#[source] anyhow::Error),

    #[error("peer discovery gave up with {connected}/{required} peers connected")]
    DiscoveryExhausted { connected: usize, required: usize },

    #[error("overlay is shut down")]
    Closed,
}

impl OverlayError {
    /// True for the conditions that stop an overlay from being constructed.
    pub fn is_startup_fatal(&self) -> bool {
        matches!(
            self,
            OverlayError::InvalidKey(_)
                | OverlayError::InvalidBootstrapPeer { .. }
                | OverlayError::Transport(_)
                | OverlayError::RouterInit(_)
                | OverlayError::RoutingBootstrap(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_bitmask() {
        let err = OverlayError::NotSubscribed(Bitmask::ALL);
        assert_eq!(err.to_string(), format!("not subscribed to bitmask {}", "ff".repeat(32)));
    }

    #[test]
    fn startup_fatal_classification() {
        assert!(OverlayError::InvalidKey("short".into()).is_startup_fatal());
        assert!(OverlayError::Transport(anyhow::anyhow!("bind")).is_startup_fatal());
        assert!(OverlayError::RoutingBootstrap(anyhow::anyhow!("dht")).is_startup_fatal());
        assert!(!OverlayError::NoPeersAvailable(Bitmask::ZERO).is_startup_fatal());
        assert!(!OverlayError::Closed.is_startup_fatal());
    }

    #[test]
    fn source_chain_is_preserved() {
        let err = OverlayError::Join {
            bitmask: Bitmask::ZERO,
            source: anyhow::anyhow!("router rejected join"),
        };
        let source = std::error::Error::source(&err).expect("source");
        assert_eq!(source.to_string(), "router rejected join");
    }
}
