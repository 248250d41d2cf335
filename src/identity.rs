//! # Node Identity
//!
//! - [`Keypair`]: Ed25519 keypair owned by the local node
//! - [`PeerId`]: 32-byte public key naming a participant in the overlay
//! - [`PeerInfo`]: a peer id plus the addresses it can be dialed on
//!
//! Identity = public key. A node either loads its secret key from
//! configuration (hex-encoded 32-byte Ed25519 seed) or generates a fresh one
//! from the OS CSPRNG at startup.
//!
//! Bootstrap peers are written as `ADDR/PEER_ID`, e.g.
//! `127.0.0.1:4001/3b6a27bc…`, where `PEER_ID` is 64 hex characters.

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::OverlayError;

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    /// Load a keypair from a hex-encoded 32-byte secret key.
    ///
    /// # Errors
    /// [`OverlayError::InvalidKey`] when the input is not hex or not 32 bytes.
    pub fn from_secret_hex(secret: &str) -> Result<Self, OverlayError> {
        let bytes = hex::decode(secret.trim())
            .map_err(|e| OverlayError::InvalidKey(format!("error unmarshaling peer key: {e}")))?;
        let seed: [u8; 32] = bytes.try_into().map_err(|b: Vec<u8>| {
            OverlayError::InvalidKey(format!("expected 32 key bytes, got {}", b.len()))
        })?;
        Ok(Self::from_secret_key_bytes(&seed))
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn peer_id(&self) -> PeerId {
        PeerId::from_bytes(self.public_key_bytes())
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("peer_id", &self.peer_id().to_hex())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    #[inline]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for PeerId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A dialable peer: identity plus known addresses.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub addrs: Vec<String>,
}

impl PeerInfo {
    pub fn new(id: PeerId, addrs: Vec<String>) -> Self {
        Self { id, addrs }
    }

    pub fn single(id: PeerId, addr: impl Into<String>) -> Self {
        Self::new(id, vec![addr.into()])
    }

    pub fn primary_addr(&self) -> Option<&str> {
        self.addrs.first().map(|s| s.as_str())
    }
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.primary_addr() {
            Some(addr) => write!(f, "{}/{}", addr, self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

impl FromStr for PeerInfo {
    type Err = OverlayError;

    /// Parse `ADDR/PEER_ID`. The address part is kept verbatim.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| OverlayError::InvalidBootstrapPeer {
            entry: s.to_string(),
            reason: reason.to_string(),
        };

        let (addr, id) = s
            .trim()
            .rsplit_once('/')
            .ok_or_else(|| invalid("must include a peer id (format: ADDR/PEER_ID)"))?;
        if addr.is_empty() {
            return Err(invalid("missing address"));
        }
        let id = PeerId::from_hex(id)
            .map_err(|_| invalid("peer id must be 64 hex characters (32 bytes)"))?;

        Ok(PeerInfo::single(id, addr))
    }
}
