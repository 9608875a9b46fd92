//! Geolocation acquisition controller.
//!
//! `capture()` answers from the cache when it can. Otherwise it races a fast
//! low-accuracy request against a precise one, arms a continuous watch if
//! neither answers in time, and gives up at a hard ceiling. The first terminal
//! outcome wins and tears the whole session down.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::cache::{GeostampCache, KeyValueStore};
use crate::config::AcquisitionConfig;
use crate::provider::{LocationProvider, PositionOptions};
use crate::session::{AbortReason, AcquisitionSession, SessionAbort, SessionEvent, Strategy};
use crate::types::{Fix, GeoError, GeoResult, Geostamp};

/// Options for one `capture()` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureOptions {
    /// Skip the cache and always run the cascade.
    pub force: bool,
}

impl CaptureOptions {
    pub fn forced() -> Self {
        Self { force: true }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    Loading,
    Succeeded,
    Failed,
}

/// Observable controller state.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GeoState {
    pub phase: Phase,
    pub loading: bool,
    pub geostamp: Option<Geostamp>,
    /// Strategy that produced `geostamp`. `None` when it came from the cache.
    pub strategy: Option<Strategy>,
    pub error: Option<String>,
}

struct ActiveSession {
    id: u64,
    abort: SessionAbort,
}

/// Produces geostamps for UI callers.
pub struct GeoController<P: LocationProvider, S: KeyValueStore> {
    provider: Arc<P>,
    cache: GeostampCache<S>,
    config: AcquisitionConfig,
    state: watch::Sender<GeoState>,
    active: Mutex<Option<ActiveSession>>,
    next_session: AtomicU64,
    torn_down: AtomicBool,
}

impl<P: LocationProvider, S: KeyValueStore> GeoController<P, S> {
    /// Create a controller, seeding its state from a fresh cache entry.
    pub fn new(provider: Arc<P>, store: S, config: AcquisitionConfig) -> Self {
        let cache = GeostampCache::new(store, config.cache_key.clone(), config.cache_ttl);
        let initial = GeoState {
            geostamp: cache.load_fresh(Utc::now()),
            ..GeoState::default()
        };
        let (state, _) = watch::channel(initial);
        Self {
            provider,
            cache,
            config,
            state,
            active: Mutex::new(None),
            next_session: AtomicU64::new(1),
            torn_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    pub fn cache(&self) -> &GeostampCache<S> {
        &self.cache
    }

    pub fn provider(&self) -> &Arc<P> {
        &self.provider
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> GeoState {
        self.state.borrow().clone()
    }

    /// Receive every state change.
    pub fn subscribe(&self) -> watch::Receiver<GeoState> {
        self.state.subscribe()
    }

    /// Clear the geostamp and error. Leaves the cache and any in-flight capture alone.
    pub fn reset(&self) {
        if self.is_torn_down() {
            return;
        }
        self.state.send_modify(|s| {
            s.geostamp = None;
            s.strategy = None;
            s.error = None;
            if !s.loading {
                s.phase = Phase::Idle;
            }
        });
    }

    /// Stop any in-flight capture and refuse further state updates.
    pub fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(active) = self.active().take() {
            active.abort.abort(AbortReason::TornDown);
        }
        tracing::debug!("Geolocation controller torn down");
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    /// Acquire a geostamp.
    pub async fn capture(&self, options: CaptureOptions) -> GeoResult<Geostamp> {
        if self.is_torn_down() {
            return Err(GeoError::TornDown);
        }

        let id = self.next_session.fetch_add(1, Ordering::SeqCst);
        let mut session = AcquisitionSession::new(id, self.provider.clone());
        self.register(&session);

        if !options.force {
            if let Some(stamp) = self.cache.load_fresh(Utc::now()) {
                tracing::debug!(session = id, "Serving geostamp from cache");
                let applied = self.finish(id, |s| {
                    s.phase = Phase::Succeeded;
                    s.loading = false;
                    s.geostamp = Some(stamp);
                    s.strategy = None;
                    s.error = None;
                });
                if !applied {
                    return Err(self.displaced_error());
                }
                return Ok(stamp);
            }
        }

        if !self.provider.is_supported() {
            return self.fail(id, &mut session, GeoError::Unsupported);
        }

        self.publish(id, |s| {
            s.phase = Phase::Loading;
            s.loading = true;
            s.error = None;
        });

        let started = Instant::now();
        let outcome = self.run_cascade(&mut session).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Settlement::Won(strategy, fix) => {
                session.cancel_all();
                let stamp = Geostamp::from_fix(&fix, Utc::now());
                if !self.is_current(id) {
                    return Err(self.displaced_error());
                }
                tracing::info!(session = id, %strategy, elapsed_ms, "Geostamp acquired");
                if let Err(e) = self.cache.store(stamp, Utc::now()) {
                    tracing::warn!("Failed to persist geostamp: {e}");
                }
                let applied = self.finish(id, |s| {
                    s.phase = Phase::Succeeded;
                    s.loading = false;
                    s.geostamp = Some(stamp);
                    s.strategy = Some(strategy);
                    s.error = None;
                });
                if !applied {
                    return Err(self.displaced_error());
                }
                Ok(stamp)
            }
            Settlement::Failed(err) => {
                tracing::info!(session = id, elapsed_ms, "Geolocation failed: {err}");
                self.fail(id, &mut session, err)
            }
            Settlement::Aborted(reason) => {
                session.cancel_all();
                tracing::debug!(session = id, ?reason, "Capture aborted");
                Err(reason.into())
            }
        }
    }

    async fn run_cascade(&self, session: &mut AcquisitionSession<P>) -> Settlement {
        let config = &self.config;
        let fast = PositionOptions {
            high_accuracy: false,
            timeout: config.fast_timeout,
            maximum_age: config.fast_maximum_age,
        };
        let precise = PositionOptions {
            high_accuracy: true,
            timeout: config.precise_timeout,
            maximum_age: config.precise_maximum_age,
        };
        let fallback = PositionOptions {
            high_accuracy: false,
            timeout: config.watch_timeout,
            maximum_age: config.watch_maximum_age,
        };

        for (strategy, options) in [(Strategy::FastGuess, fast), (Strategy::Precise, precise)] {
            if let Err(e) = session.issue(strategy, options) {
                return Settlement::Failed(start_error(e));
            }
        }
        session.arm_timers(config.fallback_after, config.hard_timeout);

        while let Some(event) = session.next_event().await {
            match event {
                SessionEvent::Position {
                    strategy,
                    outcome: Ok(fix),
                } => return Settlement::Won(strategy, fix),
                SessionEvent::Position {
                    strategy,
                    outcome: Err(code),
                } => {
                    if strategy.is_silent(code) {
                        tracing::debug!(session = session.id(), %strategy, ?code, "Cascade step missed");
                        continue;
                    }
                    return Settlement::Failed(code.into());
                }
                SessionEvent::FallbackDue => match session.arm_watch(fallback) {
                    Ok(true) => tracing::debug!(session = session.id(), "One-shots stalled, watching"),
                    Ok(false) => {}
                    Err(e) => return Settlement::Failed(start_error(e)),
                },
                SessionEvent::CeilingReached => return Settlement::Failed(GeoError::Timeout),
                SessionEvent::Abort(reason) => return Settlement::Aborted(reason),
            }
        }
        // Only reachable if the session was cancelled underneath us.
        Settlement::Aborted(AbortReason::TornDown)
    }

    fn fail(
        &self,
        id: u64,
        session: &mut AcquisitionSession<P>,
        err: GeoError,
    ) -> GeoResult<Geostamp> {
        session.cancel_all();
        if !self.is_current(id) {
            return Err(self.displaced_error());
        }
        let message = err.user_message();
        let applied = self.finish(id, |s| {
            s.phase = Phase::Failed;
            s.loading = false;
            s.error = Some(message);
        });
        if !applied {
            return Err(self.displaced_error());
        }
        Err(err)
    }

    fn register(&self, session: &AcquisitionSession<P>) {
        let previous = self.active().replace(ActiveSession {
            id: session.id(),
            abort: session.abort_handle(),
        });
        if let Some(previous) = previous {
            tracing::debug!(
                session = session.id(),
                previous = previous.id,
                "Superseding in-flight capture"
            );
            previous.abort.abort(AbortReason::Superseded);
        }
    }

    fn is_current(&self, id: u64) -> bool {
        !self.is_torn_down() && self.active().as_ref().map(|a| a.id) == Some(id)
    }

    fn displaced_error(&self) -> GeoError {
        if self.is_torn_down() {
            GeoError::TornDown
        } else {
            GeoError::Superseded
        }
    }

    /// Apply a state change if `id` still owns the controller.
    fn publish(&self, id: u64, f: impl FnOnce(&mut GeoState)) {
        let active = self.active();
        if !self.is_torn_down() && active.as_ref().map(|a| a.id) == Some(id) {
            self.state.send_modify(f);
        }
    }

    /// Apply the terminal state change and release ownership.
    ///
    /// Returns `false` if `id` lost the controller first.
    fn finish(&self, id: u64, f: impl FnOnce(&mut GeoState)) -> bool {
        let mut active = self.active();
        if self.is_torn_down() || active.as_ref().map(|a| a.id) != Some(id) {
            return false;
        }
        *active = None;
        self.state.send_modify(f);
        true
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

enum Settlement {
    Won(Strategy, Fix),
    Failed(GeoError),
    Aborted(AbortReason),
}

/// A provider that refuses to start a request reports why; anything else it
/// raises synchronously is a start failure.
fn start_error(err: GeoError) -> GeoError {
    match err {
        GeoError::StartFailed(_) | GeoError::Unsupported | GeoError::PermissionDenied => err,
        other => GeoError::StartFailed(other.to_string()),
    }
}
