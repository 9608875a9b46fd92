//! Acquisition cascade tests against a scripted device on a paused clock.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;

use geostamp::{
    AcquisitionConfig, CaptureOptions, GeoController, GeoError, GeoResult, Geostamp,
    GeostampCache, KeyValueStore, MemoryStore, Phase, PositionErrorCode, Scenario,
    ScriptedProvider, Strategy, DEFAULT_CACHE_KEY,
};

// ─────────────────────── helpers ───────────────────────

type Controller = GeoController<ScriptedProvider, Arc<MemoryStore>>;

struct Rig {
    provider: Arc<ScriptedProvider>,
    store: Arc<MemoryStore>,
    controller: Controller,
}

fn rig(scenario: Scenario) -> Rig {
    rig_with_store(scenario, Arc::new(MemoryStore::new()))
}

fn rig_with_store(scenario: Scenario, store: Arc<MemoryStore>) -> Rig {
    let provider = Arc::new(ScriptedProvider::new(scenario));
    let controller = GeoController::new(
        provider.clone(),
        store.clone(),
        AcquisitionConfig::default(),
    );
    Rig {
        provider,
        store,
        controller,
    }
}

fn cache_of(store: &Arc<MemoryStore>) -> GeostampCache<Arc<MemoryStore>> {
    GeostampCache::new(store.clone(), DEFAULT_CACHE_KEY, Duration::from_secs(15 * 60))
}

fn seeded_store(age: chrono::Duration) -> (Arc<MemoryStore>, Geostamp) {
    let store = Arc::new(MemoryStore::new());
    let stamp = Geostamp::new(52.52, 13.40, Utc::now() - age);
    cache_of(&store).store(stamp, Utc::now() - age).unwrap();
    (store, stamp)
}

/// Store that tears its controller down while a geostamp is being persisted.
#[derive(Default)]
struct TeardownOnWrite {
    inner: MemoryStore,
    controller: Mutex<Weak<GeoController<ScriptedProvider, Arc<TeardownOnWrite>>>>,
}

impl KeyValueStore for TeardownOnWrite {
    fn get(&self, key: &str) -> GeoResult<Option<String>> {
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> GeoResult<()> {
        self.inner.set(key, value)?;
        if let Some(controller) = self.controller.lock().unwrap().upgrade() {
            controller.teardown();
        }
        Ok(())
    }

    fn delete(&self, key: &str) -> GeoResult<()> {
        self.inner.delete(key)
    }
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

fn assert_near(elapsed: Duration, expected_ms: u64) {
    let expected = Duration::from_millis(expected_ms);
    assert!(
        elapsed >= expected && elapsed < expected + Duration::from_millis(100),
        "elapsed {elapsed:?}, expected ~{expected:?}"
    );
}

// ═══════════════════════════════════════════════════════
// CACHE
// ═══════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn fresh_cache_short_circuits_without_touching_hardware() {
    let (store, stamp) = seeded_store(chrono::Duration::minutes(5));
    let rig = rig_with_store(Scenario::new().fast_fix(10, 1.0, 1.0), store);

    let got = rig.controller.capture(CaptureOptions::default()).await.unwrap();
    assert_eq!(got, stamp);

    let stats = rig.provider.stats();
    assert_eq!(stats.requests, 0);
    assert_eq!(stats.watches_started, 0);
    let state = rig.controller.state();
    assert_eq!(state.geostamp, Some(stamp));
    assert_eq!(state.strategy, None);
    assert!(!state.loading);
}

#[test]
fn cache_hit_resolves_on_first_poll() {
    let (store, stamp) = seeded_store(chrono::Duration::seconds(30));
    let rig = rig_with_store(Scenario::new(), store);
    let mut capture = tokio_test::task::spawn(rig.controller.capture(CaptureOptions::default()));
    let got = tokio_test::assert_ready!(capture.poll());
    assert_eq!(got.unwrap(), stamp);
}

#[tokio::test(start_paused = true)]
async fn expired_cache_runs_full_cascade() {
    let (store, _) = seeded_store(chrono::Duration::minutes(16));
    let rig = rig_with_store(Scenario::new().fast_fix(100, 1.5, 2.5), store);
    assert!(rig.controller.state().geostamp.is_none());

    let got = rig.controller.capture(CaptureOptions::default()).await.unwrap();
    assert_eq!((got.latitude, got.longitude), (1.5, 2.5));
    assert_eq!(rig.provider.stats().requests, 2);
}

#[tokio::test(start_paused = true)]
async fn force_bypasses_fresh_cache() {
    let (store, stamp) = seeded_store(chrono::Duration::minutes(1));
    let rig = rig_with_store(Scenario::new().precise_fix(200, 9.0, 9.0), store);
    assert_eq!(rig.controller.state().geostamp, Some(stamp));

    let got = rig.controller.capture(CaptureOptions::forced()).await.unwrap();
    assert_eq!(got.latitude, 9.0);
    assert_eq!(cache_of(&rig.store).load().unwrap().geostamp, got);
}

#[tokio::test(start_paused = true)]
async fn malformed_cache_is_a_miss() {
    let store = Arc::new(MemoryStore::new());
    store.set(DEFAULT_CACHE_KEY, "[1, 2").unwrap();
    let rig = rig_with_store(Scenario::new().fast_fix(50, 3.0, 4.0), store);

    let got = rig.controller.capture(CaptureOptions::default()).await.unwrap();
    assert_eq!(got.longitude, 4.0);
    assert!(cache_of(&rig.store).load().is_some());
}

// ═══════════════════════════════════════════════════════
// CASCADE
// ═══════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn fast_guess_wins_and_later_precise_callback_is_ignored() {
    let rig = rig(
        Scenario::new()
            .fast_fix(1_200, 40.0, -73.9)
            .precise_fix(3_000, 41.0, -74.0),
    );
    let started = Instant::now();
    let before = Utc::now();

    let got = rig.controller.capture(CaptureOptions::default()).await.unwrap();
    assert_near(started.elapsed(), 1_200);
    assert_eq!((got.latitude, got.longitude), (40.0, -73.9));
    assert!(got.captured_at >= before);
    assert_eq!(rig.controller.state().strategy, Some(Strategy::FastGuess));

    let cached = cache_of(&rig.store).load().unwrap();
    assert_eq!(cached.geostamp, got);

    let updates = rig.controller.subscribe();
    tokio::time::sleep(secs(5)).await;

    assert!(!updates.has_changed().unwrap());
    assert_eq!(rig.controller.state().geostamp, Some(got));
    let stats = rig.provider.stats();
    assert_eq!(stats.ignored_callbacks, 1);
    assert_eq!(stats.watches_started, 0);
}

#[tokio::test(start_paused = true)]
async fn precise_can_beat_fast_guess() {
    let rig = rig(
        Scenario::new()
            .fast_fix(2_000, 1.0, 1.0)
            .precise_fix(800, 2.0, 2.0),
    );
    let got = rig.controller.capture(CaptureOptions::default()).await.unwrap();
    assert_eq!(got.latitude, 2.0);
    assert_eq!(rig.controller.state().strategy, Some(Strategy::Precise));
}

#[tokio::test(start_paused = true)]
async fn fast_guess_timeout_is_silent() {
    // Fast guess times out at 4s; the precise fix lands at 5s.
    let rig = rig(
        Scenario::new()
            .fast_fix(9_000, 1.0, 1.0)
            .precise_fix(5_000, 7.0, 8.0),
    );
    let started = Instant::now();
    let got = rig.controller.capture(CaptureOptions::default()).await.unwrap();
    assert_near(started.elapsed(), 5_000);
    assert_eq!(got.latitude, 7.0);
}

#[tokio::test(start_paused = true)]
async fn stalled_one_shots_arm_watch_once() {
    let rig = rig(Scenario::new().watch_fix(1_000, 5.0, 6.0));
    let started = Instant::now();

    let got = rig.controller.capture(CaptureOptions::default()).await.unwrap();
    assert_near(started.elapsed(), 7_000);
    assert_eq!((got.latitude, got.longitude), (5.0, 6.0));
    assert_eq!(rig.controller.state().strategy, Some(Strategy::Watch));

    let stats = rig.provider.stats();
    assert_eq!(stats.watches_started, 1);
    assert_eq!(stats.watches_cleared, 1);
    assert_eq!(stats.active_watches, 0);
}

#[tokio::test(start_paused = true)]
async fn hard_ceiling_times_out_and_releases_everything() {
    // Watch update would arrive at 13s, after the 12s ceiling.
    let rig = rig(Scenario::new().watch_fix(7_000, 1.0, 1.0));
    let started = Instant::now();

    let err = rig.controller.capture(CaptureOptions::default()).await.unwrap_err();
    assert!(matches!(err, GeoError::Timeout));
    assert_near(started.elapsed(), 12_000);

    let state = rig.controller.state();
    assert_eq!(state.phase, Phase::Failed);
    assert!(!state.loading);
    assert_eq!(state.error, Some(GeoError::Timeout.user_message()));

    let updates = rig.controller.subscribe();
    tokio::time::sleep(secs(10)).await;
    assert!(!updates.has_changed().unwrap());

    let stats = rig.provider.stats();
    assert_eq!(stats.watches_started, 1);
    assert_eq!(stats.active_watches, 0);
    assert!(cache_of(&rig.store).load().is_none());
}

#[tokio::test(start_paused = true)]
async fn precise_timeout_is_terminal() {
    let rig = rig(Scenario::new().precise_fix(15_000, 1.0, 1.0));
    let started = Instant::now();
    let err = rig.controller.capture(CaptureOptions::default()).await.unwrap_err();
    assert!(matches!(err, GeoError::Timeout));
    assert_near(started.elapsed(), 10_000);
    assert_eq!(rig.provider.stats().active_watches, 0);
}

#[tokio::test(start_paused = true)]
async fn permission_denied_everywhere_fails_immediately() {
    let rig = rig(
        Scenario::new()
            .fast_error(0, PositionErrorCode::PermissionDenied)
            .precise_error(0, PositionErrorCode::PermissionDenied),
    );
    let err = rig.controller.capture(CaptureOptions::default()).await.unwrap_err();
    assert!(matches!(err, GeoError::PermissionDenied));

    let state = rig.controller.state();
    assert!(!state.loading);
    assert_eq!(state.error, Some(GeoError::PermissionDenied.user_message()));
    assert_eq!(rig.provider.stats().watches_started, 0);
}

#[tokio::test(start_paused = true)]
async fn first_error_wins_over_later_fix() {
    let rig = rig(
        Scenario::new()
            .fast_fix(3_000, 1.0, 1.0)
            .precise_error(500, PositionErrorCode::PositionUnavailable),
    );
    let err = rig.controller.capture(CaptureOptions::default()).await.unwrap_err();
    assert!(matches!(err, GeoError::PositionUnavailable));

    tokio::time::sleep(secs(5)).await;
    let state = rig.controller.state();
    assert!(state.geostamp.is_none());
    assert_eq!(state.phase, Phase::Failed);
    assert_eq!(rig.provider.stats().ignored_callbacks, 1);
    assert!(cache_of(&rig.store).load().is_none());
}

#[tokio::test(start_paused = true)]
async fn watch_error_ends_session() {
    let rig = rig(Scenario::new().watch_error(500, PositionErrorCode::PositionUnavailable));
    let err = rig.controller.capture(CaptureOptions::default()).await.unwrap_err();
    assert!(matches!(err, GeoError::PositionUnavailable));
    assert_eq!(rig.provider.stats().active_watches, 0);
}

// ═══════════════════════════════════════════════════════
// SHORT CIRCUITS
// ═══════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn unsupported_device_never_issues_requests() {
    let rig = rig(Scenario::unsupported());
    let err = rig.controller.capture(CaptureOptions::default()).await.unwrap_err();
    assert!(matches!(err, GeoError::Unsupported));
    assert_eq!(rig.provider.stats().requests, 0);
    assert_eq!(
        rig.controller.state().error,
        Some(GeoError::Unsupported.user_message())
    );
}

#[tokio::test(start_paused = true)]
async fn synchronous_start_failure_is_reported() {
    let rig = rig(Scenario::new().with_start_failure("location service crashed"));
    let err = rig.controller.capture(CaptureOptions::default()).await.unwrap_err();
    assert!(matches!(err, GeoError::StartFailed(_)));
    let state = rig.controller.state();
    assert!(!state.loading);
    assert_eq!(state.phase, Phase::Failed);
}

// ═══════════════════════════════════════════════════════
// LIFECYCLE
// ═══════════════════════════════════════════════════════

#[tokio::test(start_paused = true)]
async fn teardown_mid_capture_cancels_and_freezes_state() {
    let rig = rig(Scenario::new().watch_fix(3_000, 1.0, 1.0));
    let controller = &rig.controller;

    let (result, _) = tokio::join!(controller.capture(CaptureOptions::default()), async {
        tokio::time::sleep(secs(7)).await;
        controller.teardown();
    });
    assert!(matches!(result, Err(GeoError::TornDown)));

    let frozen = controller.state();
    tokio::time::sleep(secs(10)).await;
    assert_eq!(controller.state(), frozen);
    assert!(frozen.error.is_none());

    let stats = rig.provider.stats();
    assert_eq!(stats.watches_started, 1);
    assert_eq!(stats.active_watches, 0);

    assert!(matches!(
        controller.capture(CaptureOptions::forced()).await,
        Err(GeoError::TornDown)
    ));
    controller.reset();
    assert_eq!(controller.state(), frozen);
}

#[tokio::test(start_paused = true)]
async fn teardown_while_persisting_reports_torn_down() {
    let store = Arc::new(TeardownOnWrite::default());
    let provider = Arc::new(ScriptedProvider::new(Scenario::new().fast_fix(100, 1.0, 2.0)));
    let controller = Arc::new(GeoController::new(
        provider,
        store.clone(),
        AcquisitionConfig::default(),
    ));
    *store.controller.lock().unwrap() = Arc::downgrade(&controller);

    let result = controller.capture(CaptureOptions::default()).await;
    assert!(matches!(result, Err(GeoError::TornDown)));
    assert!(controller.is_torn_down());

    let state = controller.state();
    assert_eq!(state.phase, Phase::Loading);
    assert!(state.geostamp.is_none());
}

#[tokio::test(start_paused = true)]
async fn stalled_captures_release_every_task() {
    let metrics = tokio::runtime::Handle::current().metrics();
    let rig = rig(Scenario::new());
    let baseline = metrics.num_alive_tasks();

    for _ in 0..3 {
        let err = rig.controller.capture(CaptureOptions::forced()).await.unwrap_err();
        assert!(matches!(err, GeoError::Timeout));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(metrics.num_alive_tasks(), baseline);
    }
    let stats = rig.provider.stats();
    assert_eq!(stats.requests, 6);
    assert_eq!(stats.watches_started, 3);
    assert_eq!(stats.active_watches, 0);
}

#[tokio::test(start_paused = true)]
async fn dropping_capture_future_clears_watch() {
    let rig = rig(Scenario::new());
    let timed = tokio::time::timeout(secs(8), rig.controller.capture(CaptureOptions::default()));
    assert!(timed.await.is_err());

    let stats = rig.provider.stats();
    assert_eq!(stats.watches_started, 1);
    assert_eq!(stats.active_watches, 0);
}

#[tokio::test(start_paused = true)]
async fn new_capture_supersedes_in_flight_one() {
    let rig = rig(Scenario::new().watch_fix(500, 3.0, 4.0));
    let controller = &rig.controller;

    let (first, second) = tokio::join!(controller.capture(CaptureOptions::forced()), async {
        tokio::time::sleep(secs(1)).await;
        controller.capture(CaptureOptions::forced()).await
    });
    assert!(matches!(first, Err(GeoError::Superseded)));
    let second = second.unwrap();
    assert_eq!(second.latitude, 3.0);

    let stats = rig.provider.stats();
    assert_eq!(stats.requests, 4);
    assert_eq!(stats.watches_started, 1);
    assert_eq!(stats.active_watches, 0);
    assert_eq!(controller.state().geostamp, Some(second));
}

#[tokio::test(start_paused = true)]
async fn loading_is_published_while_in_flight() {
    let rig = rig(Scenario::new().fast_fix(2_000, 1.0, 1.0));
    let controller = &rig.controller;

    let (_, mid) = tokio::join!(controller.capture(CaptureOptions::default()), async {
        tokio::time::sleep(secs(1)).await;
        controller.state()
    });
    assert!(mid.loading);
    assert_eq!(mid.phase, Phase::Loading);
    assert!(!controller.state().loading);
    assert_eq!(controller.state().phase, Phase::Succeeded);
}

#[tokio::test(start_paused = true)]
async fn reset_clears_state_but_keeps_cache() {
    let rig = rig(Scenario::new().fast_fix(100, 1.0, 2.0));
    rig.controller.capture(CaptureOptions::default()).await.unwrap();

    rig.controller.reset();
    let state = rig.controller.state();
    assert!(state.geostamp.is_none());
    assert!(state.error.is_none());
    assert_eq!(state.phase, Phase::Idle);

    assert!(cache_of(&rig.store).load().is_some());
    let again = rig.controller.capture(CaptureOptions::default()).await.unwrap();
    assert_eq!(again.longitude, 2.0);
    assert_eq!(rig.provider.stats().requests, 2);
}

#[tokio::test(start_paused = true)]
async fn retry_after_failure_needs_explicit_capture() {
    let rig = rig(Scenario::new().precise_error(100, PositionErrorCode::PermissionDenied));
    assert!(rig.controller.capture(CaptureOptions::default()).await.is_err());
    assert!(rig.controller.capture(CaptureOptions::forced()).await.is_err());
    assert_eq!(rig.provider.stats().requests, 4);
}
