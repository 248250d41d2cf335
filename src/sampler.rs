//! Uniform random peer selection for a bitmask, drawn from the OS CSPRNG.

use std::sync::Arc;

use rand::Rng;
use rand::rngs::OsRng;

use crate::bitmask::Bitmask;
use crate::error::OverlayError;
use crate::identity::PeerId;
use crate::protocols::Router;

#[derive(Clone)]
pub struct PeerSampler {
    router: Arc<dyn Router>,
}

impl PeerSampler {
    pub fn new(router: Arc<dyn Router>) -> Self {
        Self { router }
    }

    /// Pick one of the router's current peers for `bitmask`.
    ///
    /// # Errors
    /// [`OverlayError::NoPeersAvailable`] when the router lists no peers.
    pub async fn random_peer(&self, bitmask: &Bitmask) -> Result<PeerId, OverlayError> {
        let peers = self.router.list_peers(bitmask).await;
        pick(&peers).ok_or(OverlayError::NoPeersAvailable(*bitmask))
    }
}

fn pick(peers: &[PeerId]) -> Option<PeerId> {
    if peers.is_empty() {
        return None;
    }
    let index = OsRng.gen_range(0..peers.len());
    Some(peers[index])
}
