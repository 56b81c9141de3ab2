//! [`Broadcaster`] – drains the [`BroadcastQueue`] and offers each payload to
//! every registered viewer.
//!
//! One cycle per payload, in the order payloads leave the queue.  A cycle only
//! enqueues onto per-viewer queues, so a slow viewer delays nobody but itself.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::queue::BroadcastQueue;
use crate::registry::{ConnectionRegistry, Delivery};

/// Per-cycle delivery report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastOutcome {
    /// Viewers the payload was queued for.
    pub delivered: usize,
    /// Viewers found dead or too slow and removed during the cycle.
    pub pruned: usize,
}

pub struct Broadcaster {
    queue: Arc<BroadcastQueue<String>>,
    registry: Arc<ConnectionRegistry>,
}

impl Broadcaster {
    pub fn new(queue: Arc<BroadcastQueue<String>>, registry: Arc<ConnectionRegistry>) -> Self {
        Self { queue, registry }
    }

    /// Offer one payload to every registered viewer.
    pub fn broadcast(&self, payload: &str) -> BroadcastOutcome {
        let payload: Arc<str> = Arc::from(payload);
        let mut delivered = 0;
        let pruned = self.registry.for_each(|viewer| {
            let delivery = viewer.offer(&payload);
            if delivery == Delivery::Queued {
                delivered += 1;
            }
            delivery
        });
        BroadcastOutcome { delivered, pruned }
    }

    /// Run until `cancel` fires or the queue is closed and drained.  Returns
    /// the number of cycles completed.
    pub async fn run(self, cancel: CancellationToken) -> u64 {
        info!("broadcaster started");
        let mut cycles = 0u64;
        loop {
            let payload = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = self.queue.pop() => match next {
                    Some(payload) => payload,
                    None => break,
                },
            };
            let outcome = self.broadcast(&payload);
            cycles += 1;
            if outcome.pruned > 0 {
                debug!(delivered = outcome.delivered, pruned = outcome.pruned, "broadcast cycle");
            } else {
                trace!(delivered = outcome.delivered, "broadcast cycle");
            }
        }
        info!(cycles, "broadcaster stopped");
        cycles
    }
}
