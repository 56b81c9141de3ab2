//! [`BroadcastQueue`] – bounded conduit between the fanout subscription and
//! the broadcaster.
//!
//! The producer side never blocks the subscription indefinitely unless asked
//! to: what happens when the queue is full is an explicit [`OverflowPolicy`].
//!
//! | Policy | On full queue |
//! |---|---|
//! | [`OverflowPolicy::DropOldest`] | evict the oldest queued item, enqueue the new one |
//! | [`OverflowPolicy::DropNewest`] | refuse the new item |
//! | [`OverflowPolicy::Block`] | wait until the consumer makes room |

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;

/// Default queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// What to do when a push finds the queue full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    #[default]
    DropOldest,
    DropNewest,
    Block,
}

/// Result of a successful [`BroadcastQueue::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest item.
    EvictedOldest,
    /// Not queued; the queue was full.
    Rejected,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("broadcast queue is closed")]
pub struct QueueClosed;

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded multi-producer, single-consumer queue with an overflow policy.
pub struct BroadcastQueue<T> {
    state: Mutex<State<T>>,
    capacity: usize,
    policy: OverflowPolicy,
    not_empty: Notify,
    not_full: Notify,
    dropped: AtomicU64,
}

impl<T> BroadcastQueue<T> {
    /// A queue holding at most `capacity` items (zero is treated as one).
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity.min(DEFAULT_QUEUE_CAPACITY)),
                closed: false,
            }),
            capacity,
            policy,
            not_empty: Notify::new(),
            not_full: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.state().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items lost to the overflow policy so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Enqueue `item` according to the overflow policy.
    ///
    /// Only [`OverflowPolicy::Block`] ever waits.
    pub async fn push(&self, item: T) -> Result<PushOutcome, QueueClosed> {
        let mut item = Some(item);
        loop {
            let space = self.not_full.notified();
            {
                let mut state = self.state();
                if state.closed {
                    return Err(QueueClosed);
                }
                if state.items.len() < self.capacity {
                    state.items.extend(item.take());
                    drop(state);
                    self.not_empty.notify_one();
                    return Ok(PushOutcome::Queued);
                }
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        state.items.pop_front();
                        state.items.extend(item.take());
                        drop(state);
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        self.not_empty.notify_one();
                        return Ok(PushOutcome::EvictedOldest);
                    }
                    OverflowPolicy::DropNewest => {
                        drop(state);
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        return Ok(PushOutcome::Rejected);
                    }
                    OverflowPolicy::Block => {}
                }
            }
            space.await;
        }
    }

    /// Wait for the next item.  Returns `None` once the queue is closed and
    /// drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let ready = self.not_empty.notified();
            {
                let mut state = self.state();
                if let Some(item) = state.items.pop_front() {
                    drop(state);
                    self.not_full.notify_one();
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            ready.await;
        }
    }

    /// Refuse further pushes and wake everyone waiting.  Items already queued
    /// can still be popped.
    pub fn close(&self) {
        self.state().closed = true;
        self.not_empty.notify_waiters();
        self.not_full.notify_waiters();
    }

    fn state(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T> Default for BroadcastQueue<T> {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY, OverflowPolicy::default())
    }
}
