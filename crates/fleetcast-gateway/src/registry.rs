//! [`ConnectionRegistry`] – the set of live viewer connections.
//!
//! Every registered viewer gets its own bounded outbound queue drained by a
//! dedicated writer task.  The registry lock guards only the map from
//! [`ConnectionId`] to queue sender:
//!
//! * [`add`](ConnectionRegistry::add) and [`remove`](ConnectionRegistry::remove)
//!   hold it for one map mutation.
//! * [`for_each`](ConnectionRegistry::for_each) holds it for one traversal
//!   pass.  The callback may only do non-blocking work (enqueueing); viewers it
//!   reports dead are removed after the traversal, still under the same lock.
//!
//! No network write ever happens under the lock.  A write that fails or
//! exceeds the configured timeout ends the writer task, which removes the
//! viewer and closes its transport.  A viewer whose queue is full when a
//! frame is offered has fallen behind for good: it is removed too, so a
//! registered viewer never silently misses a frame.  Removal is permanent; a viewer that
//! reconnects is registered under a fresh identifier.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use fleetcast_types::ConnectionWriteError;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identity of one registered viewer.
pub type ConnectionId = Uuid;

/// Default per-viewer outbound queue depth.
pub const DEFAULT_VIEWER_QUEUE: usize = 64;

/// Default upper bound on a single write to a viewer.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Writes are always given at least this long.
pub const MIN_WRITE_TIMEOUT: Duration = Duration::from_millis(1);

/// Outbound half of a viewer transport.
#[async_trait]
pub trait ViewerSink: Send + 'static {
    /// Push one text frame to the viewer.
    async fn send_text(&mut self, payload: Arc<str>) -> Result<(), ConnectionWriteError>;

    /// Release the transport.  Called once, after the last write.
    async fn close(&mut self);
}

/// Tuning for [`ConnectionRegistry`].
#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    pub viewer_queue: usize,
    pub write_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            viewer_queue: DEFAULT_VIEWER_QUEUE,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }
}

/// What happened when a frame was offered to one viewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// The viewer's writer is gone or cannot keep up; remove it.
    Dead,
}

/// Borrowed view of one registered viewer, handed to the
/// [`ConnectionRegistry::for_each`] callback.
pub struct Viewer<'a> {
    id: ConnectionId,
    outbound: &'a mpsc::Sender<Arc<str>>,
}

impl Viewer<'_> {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Enqueue `payload` without waiting.  A full queue means the viewer is
    /// too slow and is reported [`Delivery::Dead`].
    pub fn offer(&self, payload: &Arc<str>) -> Delivery {
        match self.outbound.try_send(Arc::clone(payload)) {
            Ok(()) => Delivery::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    viewer = %self.id,
                    queued = self.outbound.max_capacity(),
                    "viewer cannot keep up; disconnecting"
                );
                Delivery::Dead
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Dead,
        }
    }
}

/// Lock-guarded set of live viewers.
pub struct ConnectionRegistry {
    viewers: Mutex<HashMap<ConnectionId, mpsc::Sender<Arc<str>>>>,
    config: RegistryConfig,
}

impl ConnectionRegistry {
    /// `write_timeout` is raised to at least [`MIN_WRITE_TIMEOUT`].
    pub fn new(mut config: RegistryConfig) -> Arc<Self> {
        config.write_timeout = config.write_timeout.max(MIN_WRITE_TIMEOUT);
        Arc::new(Self {
            viewers: Mutex::new(HashMap::new()),
            config,
        })
    }

    /// Register a viewer and start its writer task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn add<S: ViewerSink>(self: &Arc<Self>, sink: S) -> ConnectionId {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.config.viewer_queue.max(1));
        let count = {
            let mut viewers = self.viewers();
            viewers.insert(id, tx);
            viewers.len()
        };
        tokio::spawn(write_loop(
            id,
            sink,
            rx,
            self.config.write_timeout,
            Arc::downgrade(self),
        ));
        info!(viewer = %id, viewers = count, "viewer registered");
        id
    }

    /// Deregister a viewer.  Frames already queued are still flushed, then its
    /// transport is closed.  Returns `false` if it was not registered.
    pub fn remove(&self, id: ConnectionId) -> bool {
        let (removed, count) = {
            let mut viewers = self.viewers();
            let removed = viewers.remove(&id).is_some();
            (removed, viewers.len())
        };
        if removed {
            info!(viewer = %id, viewers = count, "viewer removed");
        }
        removed
    }

    /// Visit every registered viewer once under the registry lock.
    ///
    /// `f` must not block.  Viewers for which it returns [`Delivery::Dead`] are
    /// removed once the traversal is complete.  Returns how many were removed.
    pub fn for_each<F>(&self, mut f: F) -> usize
    where
        F: FnMut(&Viewer<'_>) -> Delivery,
    {
        let mut viewers = self.viewers();
        let dead: Vec<ConnectionId> = viewers
            .iter()
            .filter_map(|(id, outbound)| {
                let viewer = Viewer { id: *id, outbound };
                (f(&viewer) == Delivery::Dead).then_some(*id)
            })
            .collect();
        for id in &dead {
            viewers.remove(id);
            debug!(viewer = %id, "pruned dead viewer");
        }
        dead.len()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.viewers().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.viewers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deregister every viewer; their writers flush and close.
    pub fn close_all(&self) {
        let drained = {
            let mut viewers = self.viewers();
            let n = viewers.len();
            viewers.clear();
            n
        };
        if drained > 0 {
            info!(viewers = drained, "all viewers deregistered");
        }
    }

    fn viewers(&self) -> MutexGuard<'_, HashMap<ConnectionId, mpsc::Sender<Arc<str>>>> {
        self.viewers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Per-viewer writer
// ---------------------------------------------------------------------------

async fn write_loop<S: ViewerSink>(
    id: ConnectionId,
    mut sink: S,
    mut outbound: mpsc::Receiver<Arc<str>>,
    write_timeout: Duration,
    registry: Weak<ConnectionRegistry>,
) {
    while let Some(payload) = outbound.recv().await {
        let result = match tokio::time::timeout(write_timeout, sink.send_text(payload)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionWriteError::TimedOut(write_timeout)),
        };
        if let Err(e) = result {
            warn!(viewer = %id, error = %e, "viewer write failed; dropping connection");
            if let Some(registry) = registry.upgrade() {
                registry.remove(id);
            }
            break;
        }
    }
    sink.close().await;
    debug!(viewer = %id, "viewer writer stopped");
}
