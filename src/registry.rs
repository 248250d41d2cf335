//! # Subscription Registry and Topic Multiplexer
//!
//! The registry tracks which bitmasks the local node participates in and
//! gates publishing on that participation.
//!
//! ## Architecture
//!
//! Actor model: a cheap, cloneable [`SubscriptionRegistry`] handle sends
//! commands to a single `RegistryActor` task that owns the
//! `HashMap<Bitmask, Entry>`. Every read and write of the map is therefore
//! serialized through the actor's command loop. Publishing runs inside the
//! actor too, so a publish either reaches a live topic or sees no entry.
//!
//! ## Subscription Modes
//!
//! | Mode | Subscribe | Unsubscribe |
//! |------|-----------|-------------|
//! | [`SubscribeMode::Raw`] | joins the bitmask itself | closes that entry |
//! | [`SubscribeMode::Derived`] | joins each elementary bit | releases this composite's claim on each bit |
//!
//! An entry stays open while it is claimed raw or by at least one composite.
//!
//! ## Failure Handling
//!
//! Join and subscribe failures are logged and leave no entry behind; the
//! remaining elementary bitmasks of a derived subscription are still
//! processed. A stream that has ended (source closed or failed) is restarted
//! by the next subscribe on the same bitmask.

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bitmask::{BLOOM_SET_BITS, BLOOM_WIDTH_BITS, Bitmask, bloom_index};
use crate::error::OverlayError;
use crate::messages::MessageHandler;
use crate::protocols::{Router, Topic};
use crate::stream::{ConsumptionStream, StreamExit};

const COMMAND_BUFFER: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscribeMode {
    /// Use the bitmask byte for byte as the join key.
    Raw,
    /// Decompose into elementary bitmasks and join each one.
    Derived,
}

/// Bitmask a published payload is routed to.
pub fn content_bitmask(data: &[u8]) -> Bitmask {
    bloom_index(data, BLOOM_WIDTH_BITS, BLOOM_SET_BITS)
}

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum Command {
    IsSubscribed(Bitmask, oneshot::Sender<bool>),
    Publish {
        bitmask: Bitmask,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<(), OverlayError>>,
    },
    Subscribe {
        bitmask: Bitmask,
        handler: MessageHandler,
        mode: SubscribeMode,
        reply: oneshot::Sender<()>,
    },
    Unsubscribe {
        bitmask: Bitmask,
        mode: SubscribeMode,
        reply: oneshot::Sender<()>,
    },
    Subscriptions(oneshot::Sender<Vec<Bitmask>>),
    ActiveStreams(oneshot::Sender<usize>),
}

// ============================================================================
// Registry Handle (public API - cheap to clone)
// ============================================================================

#[derive(Clone)]
pub struct SubscriptionRegistry {
    cmd_tx: mpsc::Sender<Command>,
}

impl SubscriptionRegistry {
    /// Spawn the registry actor. Cancelling `cancel` closes every entry and
    /// stops the actor; later calls return [`OverlayError::Closed`].
    pub fn spawn(router: Arc<dyn Router>, cancel: CancellationToken) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let actor = RegistryActor::new(router, cancel);
        tokio::spawn(actor.run(cmd_rx));
        Self { cmd_tx }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, OverlayError> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(build(tx))
            .await
            .map_err(|_| OverlayError::Closed)?;
        rx.await.map_err(|_| OverlayError::Closed)
    }

    /// Publish to the bitmask derived from the payload's content.
    pub async fn publish(&self, data: Vec<u8>) -> Result<(), OverlayError> {
        let bitmask = content_bitmask(&data);
        self.publish_to_bitmask(bitmask, data).await
    }

    /// Publish on an already joined bitmask. Never joins.
    ///
    /// # Errors
    /// - [`OverlayError::NotSubscribed`] if no entry exists (nothing is sent)
    /// - [`OverlayError::Publish`] if the topic rejects the payload
    pub async fn publish_to_bitmask(
        &self,
        bitmask: Bitmask,
        data: Vec<u8>,
    ) -> Result<(), OverlayError> {
        self.request(|reply| Command::Publish {
            bitmask,
            data,
            reply,
        })
        .await?
    }

    /// Join and start consuming. Per-bitmask failures are logged, not returned.
    pub async fn subscribe(
        &self,
        bitmask: Bitmask,
        handler: MessageHandler,
        mode: SubscribeMode,
    ) -> Result<(), OverlayError> {
        self.request(|reply| Command::Subscribe {
            bitmask,
            handler,
            mode,
            reply,
        })
        .await
    }

    pub async fn unsubscribe(
        &self,
        bitmask: Bitmask,
        mode: SubscribeMode,
    ) -> Result<(), OverlayError> {
        self.request(|reply| Command::Unsubscribe {
            bitmask,
            mode,
            reply,
        })
        .await
    }

    /// Live bitmasks ordered by their lowest set bit.
    pub async fn subscriptions(&self) -> Vec<Bitmask> {
        self.request(Command::Subscriptions).await.unwrap_or_default()
    }

    pub async fn is_subscribed(&self, bitmask: Bitmask) -> bool {
        self.request(|reply| Command::IsSubscribed(bitmask, reply))
            .await
            .unwrap_or(false)
    }

    /// Entries whose consumption stream is still running.
    pub async fn active_streams(&self) -> usize {
        self.request(Command::ActiveStreams).await.unwrap_or(0)
    }
}

// ============================================================================
// Registry Actor (owns state)
// ============================================================================

struct Entry {
    topic: Arc<dyn Topic>,
    stream: JoinHandle<StreamExit>,
    cancel: CancellationToken,
    /// Claimed by a raw subscribe.
    raw: bool,
    /// Composite bitmasks whose derived subscribe covers this entry.
    composites: HashSet<Bitmask>,
}

impl Entry {
    fn is_claimed(&self) -> bool {
        self.raw || !self.composites.is_empty()
    }

    fn claim(&mut self, claimant: Claim) {
        match claimant {
            Claim::Raw => self.raw = true,
            Claim::Composite(composite) => {
                self.composites.insert(composite);
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Claim {
    Raw,
    Composite(Bitmask),
}

struct RegistryActor {
    router: Arc<dyn Router>,
    cancel: CancellationToken,
    entries: HashMap<Bitmask, Entry>,
}

impl RegistryActor {
    fn new(router: Arc<dyn Router>, cancel: CancellationToken) -> Self {
        Self {
            router,
            cancel,
            entries: HashMap::new(),
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    debug!("registry cancelled, closing subscriptions");
                    break;
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::IsSubscribed(bitmask, reply)) => {
                            let _ = reply.send(self.entries.contains_key(&bitmask));
                        }
                        Some(Command::Publish { bitmask, data, reply }) => {
                            let result = self.handle_publish(bitmask, data).await;
                            let _ = reply.send(result);
                        }
                        Some(Command::Subscribe { bitmask, handler, mode, reply }) => {
                            self.handle_subscribe(bitmask, handler, mode).await;
                            let _ = reply.send(());
                        }
                        Some(Command::Unsubscribe { bitmask, mode, reply }) => {
                            self.handle_unsubscribe(bitmask, mode).await;
                            let _ = reply.send(());
                        }
                        Some(Command::Subscriptions(reply)) => {
                            let mut live: Vec<Bitmask> = self.entries.keys().copied().collect();
                            live.sort_by_key(|m| (m.first_bit(), Reverse(*m)));
                            let _ = reply.send(live);
                        }
                        Some(Command::ActiveStreams(reply)) => {
                            let running = self
                                .entries
                                .values()
                                .filter(|e| !e.stream.is_finished())
                                .count();
                            let _ = reply.send(running);
                        }
                        None => {
                            debug!("registry handles dropped, actor quitting");
                            break;
                        }
                    }
                }
            }
        }

        self.close_all().await;
    }

    async fn handle_publish(&self, bitmask: Bitmask, data: Vec<u8>) -> Result<(), OverlayError> {
        let entry = self
            .entries
            .get(&bitmask)
            .ok_or(OverlayError::NotSubscribed(bitmask))?;
        entry
            .topic
            .publish(data)
            .await
            .map_err(|source| OverlayError::Publish { bitmask, source })
    }

    async fn handle_subscribe(
        &mut self,
        bitmask: Bitmask,
        handler: MessageHandler,
        mode: SubscribeMode,
    ) {
        match mode {
            SubscribeMode::Raw => {
                self.open(bitmask, handler, Claim::Raw).await;
            }
            SubscribeMode::Derived => {
                for elementary in bitmask.decompose() {
                    self.open(elementary, handler.clone(), Claim::Composite(bitmask))
                        .await;
                }
            }
        }
    }

    /// Ensure an entry with a running stream exists for `bitmask`.
    async fn open(&mut self, bitmask: Bitmask, handler: MessageHandler, claim: Claim) {
        if let Some(entry) = self.entries.get_mut(&bitmask) {
            entry.claim(claim);
            if !entry.stream.is_finished() {
                return;
            }
            let topic = entry.topic.clone();

            debug!(bitmask = %bitmask, "restarting finished consumption stream");
            match topic.subscribe().await {
                Ok(source) => {
                    let cancel = self.cancel.child_token();
                    let stream =
                        ConsumptionStream::new(bitmask, source, handler, cancel.clone()).spawn();
                    if let Some(entry) = self.entries.get_mut(&bitmask) {
                        entry.stream = stream;
                        entry.cancel = cancel;
                    }
                }
                Err(e) => {
                    let e = OverlayError::Subscribe { bitmask, source: e };
                    error!(error = %e, "could not restart subscription, dropping entry");
                    if let Some(entry) = self.entries.remove(&bitmask) {
                        close_entry(entry).await;
                    }
                }
            }
            return;
        }

        let topic = match self.router.join(&bitmask).await {
            Ok(topic) => topic,
            Err(e) => {
                let e = OverlayError::Join { bitmask, source: e };
                error!(error = %e, "join bitmask failed");
                return;
            }
        };

        let source = match topic.subscribe().await {
            Ok(source) => source,
            Err(e) => {
                let e = OverlayError::Subscribe { bitmask, source: e };
                error!(error = %e, "subscribe to bitmask failed");
                topic.close().await;
                return;
            }
        };

        let cancel = self.cancel.child_token();
        let stream = ConsumptionStream::new(bitmask, source, handler, cancel.clone()).spawn();
        let mut entry = Entry {
            topic,
            stream,
            cancel,
            raw: false,
            composites: HashSet::new(),
        };
        entry.claim(claim);
        self.entries.insert(bitmask, entry);

        info!(bitmask = %bitmask, "subscribed");
    }

    async fn handle_unsubscribe(&mut self, bitmask: Bitmask, mode: SubscribeMode) {
        match mode {
            SubscribeMode::Raw => {
                if let Some(entry) = self.entries.remove(&bitmask) {
                    close_entry(entry).await;
                    info!(bitmask = %bitmask, "unsubscribed");
                }
            }
            SubscribeMode::Derived => {
                for elementary in bitmask.decompose() {
                    let released = match self.entries.get_mut(&elementary) {
                        Some(entry) => {
                            entry.composites.remove(&bitmask);
                            !entry.is_claimed()
                        }
                        None => false,
                    };
                    if released && let Some(entry) = self.entries.remove(&elementary) {
                        close_entry(entry).await;
                        info!(bitmask = %elementary, composite = %bitmask, "unsubscribed");
                    }
                }
            }
        }
    }

    async fn close_all(&mut self) {
        let count = self.entries.len();
        for (_, entry) in self.entries.drain() {
            close_entry(entry).await;
        }
        if count > 0 {
            warn!(count, "closed subscriptions on registry shutdown");
        }
    }
}

async fn close_entry(entry: Entry) {
    entry.cancel.cancel();
    entry.topic.close().await;
}
