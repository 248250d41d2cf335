//! # Message Consumption Stream
//!
//! One task per live subscription entry. It pulls deliveries from the topic's
//! [`MessageSource`] in order and hands each one to the application handler.
//!
//! | Event | Reaction |
//! |-------|----------|
//! | Message pulled | handler invoked; handler errors are logged |
//! | Pull error | logged, retried after backoff (10ms doubling, capped at 1s) |
//! | 32 consecutive pull errors | stream ends with [`StreamExit::Failed`] |
//! | Source returns `None` | stream ends with [`StreamExit::SourceClosed`] |
//! | Token cancelled | stream ends with [`StreamExit::Cancelled`] |

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::bitmask::Bitmask;
use crate::messages::MessageHandler;
use crate::protocols::MessageSource;

const INITIAL_RETRY_BACKOFF: Duration = Duration::from_millis(10);
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Consecutive pull failures tolerated before the stream gives up.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamExit {
    Cancelled,
    SourceClosed,
    Failed,
}

pub struct ConsumptionStream {
    bitmask: Bitmask,
    source: Box<dyn MessageSource>,
    handler: MessageHandler,
    cancel: CancellationToken,
}

impl ConsumptionStream {
    pub fn new(
        bitmask: Bitmask,
        source: Box<dyn MessageSource>,
        handler: MessageHandler,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            bitmask,
            source,
            handler,
            cancel,
        }
    }

    pub fn spawn(self) -> JoinHandle<StreamExit> {
        tokio::spawn(self.run())
    }

    pub async fn run(mut self) -> StreamExit {
        let mut failures: u32 = 0;
        let mut backoff = INITIAL_RETRY_BACKOFF;

        let exit = loop {
            let pulled = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break StreamExit::Cancelled,
                pulled = self.source.next() => pulled,
            };

            match pulled {
                Ok(Some(message)) => {
                    failures = 0;
                    backoff = INITIAL_RETRY_BACKOFF;
                    trace!(
                        bitmask = %self.bitmask,
                        from = %message.from,
                        len = message.data.len(),
                        "delivering message"
                    );
                    if let Err(e) = (self.handler)(message) {
                        error!(bitmask = %self.bitmask, error = %e, "message handler failed");
                    }
                }
                Ok(None) => break StreamExit::SourceClosed,
                Err(e) => {
                    failures += 1;
                    if failures >= MAX_CONSECUTIVE_FAILURES {
                        error!(
                            bitmask = %self.bitmask,
                            failures,
                            error = %e,
                            "giving up on subscription after repeated pull failures"
                        );
                        break StreamExit::Failed;
                    }
                    warn!(bitmask = %self.bitmask, failures, error = %e, "failed to pull message");

                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break StreamExit::Cancelled,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = backoff.saturating_mul(2).min(MAX_RETRY_BACKOFF);
                }
            }
        };

        debug!(bitmask = %self.bitmask, ?exit, "consumption stream stopped");
        exit
    }
}
