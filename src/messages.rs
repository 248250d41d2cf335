//! # Delivered Messages
//!
//! A [`Message`] is what a consumption stream pulls from a joined topic and
//! hands to the application's [`MessageHandler`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::bitmask::Bitmask;
use crate::identity::PeerId;

/// Upper bound on a single published payload accepted by the reference backend.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Bitmask of the topic the message was delivered on.
    pub bitmask: Bitmask,
    /// Peer that published the message.
    pub from: PeerId,
    pub data: Vec<u8>,
}

impl Message {
    pub fn new(bitmask: Bitmask, from: PeerId, data: Vec<u8>) -> Self {
        Self { bitmask, from, data }
    }
}

/// Application callback invoked once per delivered message.
///
/// Errors are logged by the stream and do not stop delivery.
pub type MessageHandler = Arc<dyn Fn(Message) -> anyhow::Result<()> + Send + Sync>;

/// Wrap a closure as a [`MessageHandler`].
pub fn message_handler<F>(f: F) -> MessageHandler
where
    F: Fn(Message) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}
