//! The host platform's location-services seam.
//!
//! A provider exposes the two primitives every platform offers: a one-shot
//! position request and a continuous watch. Issuing either is synchronous and
//! may fail outright; results arrive later through the returned handles.

use std::fmt;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::types::{Fix, GeoResult, PositionErrorCode};

/// Result delivered by a native location callback.
pub type PositionOutcome = Result<Fix, PositionErrorCode>;

/// Accuracy, timeout, and cache-age knobs passed to the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionOptions {
    pub high_accuracy: bool,
    pub timeout: Duration,
    /// Oldest platform-cached fix the caller will accept.
    pub maximum_age: Duration,
}

/// Identifier of an active continuous watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(pub u64);

impl fmt::Display for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "watch#{}", self.0)
    }
}

/// Platform location services.
pub trait LocationProvider: Send + Sync + 'static {
    /// Whether location services exist at all on this host.
    fn is_supported(&self) -> bool;

    /// Issue a one-shot position request.
    fn request_position(&self, options: PositionOptions) -> GeoResult<PositionRequest>;

    /// Start a continuous watch that reports every position update.
    fn watch_position(&self, options: PositionOptions) -> GeoResult<PositionWatch>;

    /// Stop a watch. Unknown or already-cleared ids are ignored.
    fn clear_watch(&self, id: WatchId);
}

impl<T: LocationProvider + ?Sized> LocationProvider for std::sync::Arc<T> {
    fn is_supported(&self) -> bool {
        (**self).is_supported()
    }
    fn request_position(&self, options: PositionOptions) -> GeoResult<PositionRequest> {
        (**self).request_position(options)
    }
    fn watch_position(&self, options: PositionOptions) -> GeoResult<PositionWatch> {
        (**self).watch_position(options)
    }
    fn clear_watch(&self, id: WatchId) {
        (**self).clear_watch(id)
    }
}

/// Pending one-shot request, resolved at most once.
#[derive(Debug)]
pub struct PositionRequest {
    rx: oneshot::Receiver<PositionOutcome>,
}

/// Provider half of a [`PositionRequest`].
#[derive(Debug)]
pub struct PositionResponder {
    tx: oneshot::Sender<PositionOutcome>,
}

impl PositionRequest {
    pub fn channel() -> (PositionResponder, PositionRequest) {
        let (tx, rx) = oneshot::channel();
        (PositionResponder { tx }, PositionRequest { rx })
    }

    /// Wait for the callback. `None` if the provider dropped the request unanswered.
    pub async fn outcome(self) -> Option<PositionOutcome> {
        self.rx.await.ok()
    }
}

impl PositionResponder {
    /// Deliver the callback. Returns `false` if nobody is listening anymore.
    pub fn respond(self, outcome: PositionOutcome) -> bool {
        self.tx.send(outcome).is_ok()
    }

    /// Resolves once the requester has dropped its [`PositionRequest`].
    pub async fn closed(&mut self) {
        self.tx.closed().await
    }
}

/// Active continuous watch.
#[derive(Debug)]
pub struct PositionWatch {
    pub id: WatchId,
    pub updates: mpsc::UnboundedReceiver<PositionOutcome>,
}

/// Provider half of a [`PositionWatch`].
#[derive(Debug, Clone)]
pub struct WatchFeed {
    tx: mpsc::UnboundedSender<PositionOutcome>,
}

impl PositionWatch {
    pub fn channel(id: WatchId) -> (WatchFeed, PositionWatch) {
        let (tx, updates) = mpsc::unbounded_channel();
        (WatchFeed { tx }, PositionWatch { id, updates })
    }
}

impl WatchFeed {
    /// Push one update. Returns `false` once the watcher is gone.
    pub fn push(&self, outcome: PositionOutcome) -> bool {
        self.tx.send(outcome).is_ok()
    }

    /// Resolves once the watcher has dropped its [`PositionWatch`].
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}
