//! One acquisition cycle: the strategies in flight, their timers, and teardown.
//!
//! Every native callback and timer is forwarded into a single event channel so
//! the controller observes them strictly in arrival order. All spawned work is
//! owned by the session; [`AcquisitionSession::cancel_all`] (also run on drop)
//! aborts it and clears the watch exactly once.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::provider::{LocationProvider, PositionOptions, PositionOutcome, PositionWatch, WatchId};
use crate::types::{GeoError, GeoResult, PositionErrorCode};

/// The acquisition strategies raced by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Low-accuracy one-shot that tolerates platform-cached fixes.
    FastGuess,
    /// High-accuracy one-shot with no cache.
    Precise,
    /// Continuous low-power watch armed when the one-shots stall.
    Watch,
}

impl Strategy {
    /// Errors that let the cascade keep running instead of ending it.
    ///
    /// The fast guess is expected to miss on cold devices; only a permission
    /// refusal from it is final.
    pub fn is_silent(self, code: PositionErrorCode) -> bool {
        matches!(self, Strategy::FastGuess) && code != PositionErrorCode::PermissionDenied
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::FastGuess => "fast_guess",
            Strategy::Precise => "precise",
            Strategy::Watch => "watch",
        };
        f.write_str(name)
    }
}

/// Why a session was stopped from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    Superseded,
    TornDown,
}

impl From<AbortReason> for GeoError {
    fn from(reason: AbortReason) -> Self {
        match reason {
            AbortReason::Superseded => GeoError::Superseded,
            AbortReason::TornDown => GeoError::TornDown,
        }
    }
}

/// Something that happened during the session, in arrival order.
#[derive(Debug)]
pub enum SessionEvent {
    Position {
        strategy: Strategy,
        outcome: PositionOutcome,
    },
    FallbackDue,
    CeilingReached,
    Abort(AbortReason),
}

/// Handle used by the controller to stop a session it no longer owns.
#[derive(Debug, Clone)]
pub struct SessionAbort {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionAbort {
    pub fn abort(&self, reason: AbortReason) {
        let _ = self.tx.send(SessionEvent::Abort(reason));
    }
}

/// Ephemeral state of one `capture()` invocation.
pub struct AcquisitionSession<P: LocationProvider> {
    id: u64,
    provider: Arc<P>,
    tx: mpsc::UnboundedSender<SessionEvent>,
    rx: mpsc::UnboundedReceiver<SessionEvent>,
    requests: Vec<JoinHandle<()>>,
    fallback_timer: Option<JoinHandle<()>>,
    ceiling_timer: Option<JoinHandle<()>>,
    watch: Option<(WatchId, JoinHandle<()>)>,
    cancelled: bool,
}

impl<P: LocationProvider> AcquisitionSession<P> {
    pub fn new(id: u64, provider: Arc<P>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            id,
            provider,
            tx,
            rx,
            requests: Vec::new(),
            fallback_timer: None,
            ceiling_timer: None,
            watch: None,
            cancelled: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn abort_handle(&self) -> SessionAbort {
        SessionAbort {
            tx: self.tx.clone(),
        }
    }

    /// Issue a one-shot request and forward its callback into the session.
    pub fn issue(&mut self, strategy: Strategy, options: PositionOptions) -> GeoResult<()> {
        let request = self.provider.request_position(options)?;
        let tx = self.tx.clone();
        tracing::debug!(session = self.id, %strategy, ?options, "Issued position request");
        self.requests.push(tokio::spawn(async move {
            if let Some(outcome) = request.outcome().await {
                let _ = tx.send(SessionEvent::Position { strategy, outcome });
            }
        }));
        Ok(())
    }

    /// Start the fallback-arm and hard-ceiling timers.
    pub fn arm_timers(&mut self, fallback_after: Duration, hard_timeout: Duration) {
        self.fallback_timer = Some(self.timer(fallback_after, || SessionEvent::FallbackDue));
        self.ceiling_timer = Some(self.timer(hard_timeout, || SessionEvent::CeilingReached));
    }

    fn timer(&self, after: Duration, event: fn() -> SessionEvent) -> JoinHandle<()> {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(event());
        })
    }

    /// Start the continuous watch unless one is already active.
    ///
    /// Returns `Ok(false)` when a watch was already running.
    pub fn arm_watch(&mut self, options: PositionOptions) -> GeoResult<bool> {
        if self.watch.is_some() || self.cancelled {
            return Ok(false);
        }
        let PositionWatch { id, mut updates } = self.provider.watch_position(options)?;
        let tx = self.tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(outcome) = updates.recv().await {
                let event = SessionEvent::Position {
                    strategy: Strategy::Watch,
                    outcome,
                };
                if tx.send(event).is_err() {
                    break;
                }
            }
        });
        tracing::debug!(session = self.id, watch = %id, "Armed fallback watch");
        self.watch = Some((id, forwarder));
        Ok(true)
    }

    /// Next event in arrival order.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        if self.cancelled {
            return None;
        }
        self.rx.recv().await
    }

    pub fn is_watch_active(&self) -> bool {
        self.watch.is_some()
    }

    /// Timers that are armed and have not yet fired.
    pub fn pending_timers(&self) -> usize {
        [&self.fallback_timer, &self.ceiling_timer]
            .into_iter()
            .flatten()
            .filter(|t| !t.is_finished())
            .count()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Tear down every timer, forwarder, and the watch. Idempotent.
    pub fn cancel_all(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;

        for handle in self.requests.drain(..) {
            handle.abort();
        }
        if let Some(timer) = self.fallback_timer.take() {
            timer.abort();
        }
        if let Some(timer) = self.ceiling_timer.take() {
            timer.abort();
        }
        if let Some((id, forwarder)) = self.watch.take() {
            forwarder.abort();
            self.provider.clear_watch(id);
        }
        self.rx.close();
        tracing::debug!(session = self.id, "Session resources released");
    }
}

impl<P: LocationProvider> Drop for AcquisitionSession<P> {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
