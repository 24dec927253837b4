//! Registry of sessions waiting for attachments
//!
//! The registry is the only shared mutable structure of the collection
//! protocol. The lock is held for scans and list edits only; every send to a
//! session's channel happens after it is released.

use super::wait::{wait_for, WaitOutcome};
use super::{CollectError, CollectTimeouts, CollectionOutcome, Delivery, ImageItem};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Buffered deliveries per session. A burst larger than this just applies
/// backpressure to the senders.
const DELIVERY_BUFFER: usize = 16;

struct WaitingSession {
    id: u64,
    owner: i64,
    tx: mpsc::Sender<Delivery>,
}

/// Shared list of sessions currently waiting for attachments.
///
/// Lookups by user identity resolve to the oldest waiting session of that
/// user.
pub struct SessionRegistry {
    sessions: Mutex<Vec<WaitingSession>>,
    next_id: AtomicU64,
    timeouts: CollectTimeouts,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(CollectTimeouts::default())
    }
}

impl SessionRegistry {
    /// Create an empty registry whose sessions use `timeouts`.
    #[must_use]
    pub fn new(timeouts: CollectTimeouts) -> Self {
        Self {
            sessions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            timeouts,
        }
    }

    fn sessions(&self) -> MutexGuard<'_, Vec<WaitingSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new session accepting attachments from `owner`.
    ///
    /// The session is visible to [`Self::deliver`] and [`Self::cancel_for`]
    /// as soon as this returns.
    pub fn begin(self: &Arc<Self>, owner: i64) -> ImageCollector {
        let (tx, rx) = mpsc::channel(DELIVERY_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.sessions().push(WaitingSession {
            id,
            owner,
            tx: tx.clone(),
        });
        debug!(session_id = id, user_id = owner, "Waiting for image data");

        ImageCollector {
            registry: Arc::clone(self),
            id,
            owner,
            timeouts: self.timeouts,
            rx,
            feeder: tx,
            finished: false,
        }
    }

    /// Cancel the oldest session waiting for `user_id`.
    ///
    /// The session stops being waiting before this returns, so a second call
    /// for the same session reports [`CollectError::NotWaiting`]. If the
    /// session finishes on its own at the same moment the cancellation is
    /// dropped silently.
    ///
    /// # Errors
    ///
    /// Returns [`CollectError::NotWaiting`] if nobody waits for `user_id`;
    /// nothing is changed in that case.
    pub async fn cancel_for(&self, user_id: i64) -> Result<(), CollectError> {
        let session = {
            let mut sessions = self.sessions();
            let pos = sessions
                .iter()
                .position(|s| s.owner == user_id)
                .ok_or(CollectError::NotWaiting)?;
            sessions.remove(pos)
        };

        info!(
            session_id = session.id,
            user_id, "Canceling waiting for image data"
        );
        if session.tx.send(Delivery::CancelRequested).await.is_err() {
            debug!(
                session_id = session.id,
                "Session finished before the cancellation arrived"
            );
        }
        Ok(())
    }

    /// Deliver an attachment to the oldest session waiting for `user_id`.
    ///
    /// Returns `false` if nobody waits for this user or the session finished
    /// before the item could be handed over.
    pub async fn deliver(&self, user_id: i64, item: ImageItem) -> bool {
        let tx = self
            .sessions()
            .iter()
            .find(|s| s.owner == user_id)
            .map(|s| s.tx.clone());

        let Some(tx) = tx else {
            return false;
        };
        tx.send(Delivery::Item(item)).await.is_ok()
    }

    /// Whether a session is waiting for attachments from `user_id`.
    #[must_use]
    pub fn is_waiting(&self, user_id: i64) -> bool {
        self.sessions().iter().any(|s| s.owner == user_id)
    }

    /// Number of sessions currently waiting.
    #[must_use]
    pub fn waiting_count(&self) -> usize {
        self.sessions().len()
    }

    fn delist(&self, id: u64) {
        let mut sessions = self.sessions();
        if let Some(pos) = sessions.iter().position(|s| s.id == id) {
            sessions.remove(pos);
        }
    }
}

/// Sends attachments to one specific session.
#[derive(Clone, Debug)]
pub struct DeliveryHandle {
    tx: mpsc::Sender<Delivery>,
}

impl DeliveryHandle {
    /// Hand over an attachment. Returns `false` if the session already finished.
    pub async fn deliver(&self, item: ImageItem) -> bool {
        self.tx.send(Delivery::Item(item)).await.is_ok()
    }

    /// End the session quietly. Returns `false` if it already finished.
    pub async fn cancel(&self) -> bool {
        self.tx.send(Delivery::CancelRequested).await.is_ok()
    }
}

/// One command's attachment collection.
///
/// Created by [`SessionRegistry::begin`]. Finishing or dropping the collector
/// removes it from the registry and then closes its channel.
pub struct ImageCollector {
    registry: Arc<SessionRegistry>,
    id: u64,
    owner: i64,
    timeouts: CollectTimeouts,
    rx: mpsc::Receiver<Delivery>,
    feeder: mpsc::Sender<Delivery>,
    finished: bool,
}

impl ImageCollector {
    /// Handle that delivers straight into this session, regardless of owner.
    #[must_use]
    pub fn delivery_handle(&self) -> DeliveryHandle {
        DeliveryHandle {
            tx: self.feeder.clone(),
        }
    }

    /// User whose attachments this session accepts.
    #[must_use]
    pub const fn owner(&self) -> i64 {
        self.owner
    }

    /// Run the collection until it produces a batch, is cancelled or fails.
    ///
    /// # Errors
    ///
    /// Returns [`CollectError::TimedOut`] if no attachment arrived within the
    /// long ceiling and [`CollectError::Aborted`] if `cancel` fired first.
    pub async fn collect(
        mut self,
        cancel: &CancellationToken,
    ) -> Result<CollectionOutcome, CollectError> {
        let outcome = self.run(cancel).await;
        self.finish();

        match &outcome {
            Ok(CollectionOutcome::Batch(items)) => {
                info!(session_id = self.id, count = items.len(), "Got image data");
            }
            Ok(CollectionOutcome::Cancelled) => {
                info!(session_id = self.id, "Waiting for image data canceled");
            }
            Err(e) => {
                info!(session_id = self.id, error = %e, "Waiting for image data failed");
            }
        }
        outcome
    }

    async fn run(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<CollectionOutcome, CollectError> {
        let first = match wait_for(&mut self.rx, cancel, self.timeouts.first_image).await {
            WaitOutcome::Received(Delivery::Item(item)) => item,
            WaitOutcome::Received(Delivery::CancelRequested) => {
                return Ok(CollectionOutcome::Cancelled)
            }
            WaitOutcome::Cancelled | WaitOutcome::Closed => return Err(CollectError::Aborted),
            WaitOutcome::Elapsed => return Err(CollectError::TimedOut),
        };

        let mut batch = vec![first];
        loop {
            match wait_for(&mut self.rx, cancel, self.timeouts.quiet_window).await {
                WaitOutcome::Received(Delivery::Item(item)) => {
                    debug!(session_id = self.id, filename = %item.filename, "Image joined the batch");
                    batch.push(item);
                }
                WaitOutcome::Received(Delivery::CancelRequested) => {
                    return Ok(CollectionOutcome::Cancelled)
                }
                WaitOutcome::Cancelled | WaitOutcome::Closed => return Err(CollectError::Aborted),
                WaitOutcome::Elapsed => return Ok(CollectionOutcome::Batch(batch)),
            }
        }
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        // Delist first so no new sender can find the channel once it is closed.
        self.registry.delist(self.id);
        self.rx.close();
    }
}

impl Drop for ImageCollector {
    fn drop(&mut self) {
        self.finish();
    }
}
