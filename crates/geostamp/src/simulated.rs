//! Scenario-driven location provider.
//!
//! Used by the CLI's `simulate` command and throughout the test suite. Each
//! strategy gets a scripted response (or none, which models a request that
//! stalls forever). A response slower than the request's timeout is delivered
//! as a `Timeout` error at the timeout, as a real platform would.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::provider::{
    LocationProvider, PositionOptions, PositionOutcome, PositionRequest, PositionWatch, WatchId,
};
use crate::types::{Fix, GeoError, GeoResult, PositionErrorCode};

/// What a scripted callback delivers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScriptedOutcome {
    Fix {
        latitude: f64,
        longitude: f64,
        #[serde(default)]
        accuracy_m: Option<f64>,
    },
    Error {
        code: PositionErrorCode,
    },
}

impl ScriptedOutcome {
    fn resolve(self) -> PositionOutcome {
        match self {
            ScriptedOutcome::Fix {
                latitude,
                longitude,
                accuracy_m,
            } => Ok(Fix {
                latitude,
                longitude,
                accuracy_m,
                timestamp: Utc::now(),
            }),
            ScriptedOutcome::Error { code } => Err(code),
        }
    }
}

/// A callback scheduled `after_ms` after the request was issued.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScriptedResponse {
    pub after_ms: u64,
    #[serde(flatten)]
    pub outcome: ScriptedOutcome,
}

/// Full behaviour of a simulated device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Scenario {
    /// Device has no location capability.
    pub unsupported: bool,
    /// Issuing any request fails synchronously with this message.
    pub start_failure: Option<String>,
    /// Low-accuracy one-shot. `None` stalls.
    pub fast: Option<ScriptedResponse>,
    /// High-accuracy one-shot. `None` stalls.
    pub precise: Option<ScriptedResponse>,
    /// Watch updates; each `after_ms` is relative to the previous update.
    pub watch: Vec<ScriptedResponse>,
}

impl Scenario {
    /// A device whose every request stalls.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json_file(path: &Path) -> GeoResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn unsupported() -> Self {
        Self {
            unsupported: true,
            ..Self::default()
        }
    }

    pub fn with_start_failure(mut self, message: impl Into<String>) -> Self {
        self.start_failure = Some(message.into());
        self
    }

    pub fn fast_fix(mut self, after_ms: u64, latitude: f64, longitude: f64) -> Self {
        self.fast = Some(fix_after(after_ms, latitude, longitude));
        self
    }

    pub fn fast_error(mut self, after_ms: u64, code: PositionErrorCode) -> Self {
        self.fast = Some(error_after(after_ms, code));
        self
    }

    pub fn precise_fix(mut self, after_ms: u64, latitude: f64, longitude: f64) -> Self {
        self.precise = Some(fix_after(after_ms, latitude, longitude));
        self
    }

    pub fn precise_error(mut self, after_ms: u64, code: PositionErrorCode) -> Self {
        self.precise = Some(error_after(after_ms, code));
        self
    }

    pub fn watch_fix(mut self, after_ms: u64, latitude: f64, longitude: f64) -> Self {
        self.watch.push(fix_after(after_ms, latitude, longitude));
        self
    }

    pub fn watch_error(mut self, after_ms: u64, code: PositionErrorCode) -> Self {
        self.watch.push(error_after(after_ms, code));
        self
    }
}

fn fix_after(after_ms: u64, latitude: f64, longitude: f64) -> ScriptedResponse {
    ScriptedResponse {
        after_ms,
        outcome: ScriptedOutcome::Fix {
            latitude,
            longitude,
            accuracy_m: None,
        },
    }
}

fn error_after(after_ms: u64, code: PositionErrorCode) -> ScriptedResponse {
    ScriptedResponse {
        after_ms,
        outcome: ScriptedOutcome::Error { code },
    }
}

/// Bound a scripted delay by the request timeout.
fn effective(response: ScriptedResponse, timeout: Duration) -> (Duration, PositionOutcome) {
    let after = Duration::from_millis(response.after_ms);
    if after > timeout {
        (timeout, Err(PositionErrorCode::Timeout))
    } else {
        (after, response.outcome.resolve())
    }
}

/// Counters describing how a provider was driven.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProviderStats {
    pub requests: usize,
    pub watches_started: usize,
    pub watches_cleared: usize,
    pub active_watches: usize,
    /// Callbacks that fired after their listener had gone away.
    pub ignored_callbacks: usize,
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicUsize,
    watches_started: AtomicUsize,
    watches_cleared: AtomicUsize,
    ignored_callbacks: std::sync::Arc<AtomicUsize>,
}

/// [`LocationProvider`] that plays back a [`Scenario`].
pub struct ScriptedProvider {
    scenario: Scenario,
    counters: Counters,
    next_watch: AtomicU64,
    watches: Mutex<HashMap<WatchId, JoinHandle<()>>>,
}

impl ScriptedProvider {
    pub fn new(scenario: Scenario) -> Self {
        Self {
            scenario,
            counters: Counters::default(),
            next_watch: AtomicU64::new(1),
            watches: Mutex::new(HashMap::new()),
        }
    }

    /// A host with no location hardware.
    pub fn unsupported() -> Self {
        Self::new(Scenario::unsupported())
    }

    pub fn stats(&self) -> ProviderStats {
        ProviderStats {
            requests: self.counters.requests.load(Ordering::SeqCst),
            watches_started: self.counters.watches_started.load(Ordering::SeqCst),
            watches_cleared: self.counters.watches_cleared.load(Ordering::SeqCst),
            active_watches: self.watches.lock().map(|w| w.len()).unwrap_or(0),
            ignored_callbacks: self.counters.ignored_callbacks.load(Ordering::SeqCst),
        }
    }

    fn check_start(&self) -> GeoResult<()> {
        if self.scenario.unsupported {
            return Err(GeoError::Unsupported);
        }
        if let Some(message) = &self.scenario.start_failure {
            return Err(GeoError::StartFailed(message.clone()));
        }
        Ok(())
    }
}

impl LocationProvider for ScriptedProvider {
    fn is_supported(&self) -> bool {
        !self.scenario.unsupported
    }

    fn request_position(&self, options: PositionOptions) -> GeoResult<PositionRequest> {
        self.check_start()?;
        self.counters.requests.fetch_add(1, Ordering::SeqCst);

        let (mut responder, request) = PositionRequest::channel();
        let script = if options.high_accuracy {
            self.scenario.precise
        } else {
            self.scenario.fast
        };
        let Some(response) = script else {
            // Stalled: hold the responder unanswered until the requester leaves.
            tokio::spawn(async move { responder.closed().await });
            return Ok(request);
        };

        let ignored = self.counters.ignored_callbacks.clone();
        let (delay, outcome) = effective(response, options.timeout);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !responder.respond(outcome) {
                ignored.fetch_add(1, Ordering::SeqCst);
            }
        });
        Ok(request)
    }

    fn watch_position(&self, options: PositionOptions) -> GeoResult<PositionWatch> {
        self.check_start()?;
        let id = WatchId(self.next_watch.fetch_add(1, Ordering::SeqCst));
        self.counters.watches_started.fetch_add(1, Ordering::SeqCst);

        let (feed, watch) = PositionWatch::channel(id);
        let steps = self.scenario.watch.clone();
        let ignored = self.counters.ignored_callbacks.clone();
        let handle = tokio::spawn(async move {
            for step in steps {
                let (delay, outcome) = effective(step, options.timeout);
                tokio::time::sleep(delay).await;
                if !feed.push(outcome) {
                    ignored.fetch_add(1, Ordering::SeqCst);
                    return;
                }
            }
            // Keep the watch open with no further updates.
            feed.closed().await;
        });

        if let Ok(mut watches) = self.watches.lock() {
            watches.insert(id, handle);
        }
        tracing::debug!("Simulated {id} started");
        Ok(watch)
    }

    fn clear_watch(&self, id: WatchId) {
        let removed = self.watches.lock().ok().and_then(|mut w| w.remove(&id));
        if let Some(handle) = removed {
            handle.abort();
            self.counters.watches_cleared.fetch_add(1, Ordering::SeqCst);
            tracing::debug!("Simulated {id} cleared");
        }
    }
}

impl Drop for ScriptedProvider {
    fn drop(&mut self) {
        if let Ok(mut watches) = self.watches.lock() {
            for (_, handle) in watches.drain() {
                handle.abort();
            }
        }
    }
}
