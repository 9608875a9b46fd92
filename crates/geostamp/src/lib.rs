//! Cache-first, cascading geolocation capture for courier clients.

pub mod cache;
pub mod config;
pub mod controller;
pub mod proof;
pub mod provider;
pub mod session;
pub mod simulated;
pub mod types;

pub use cache::{CacheEntry, FileStore, GeostampCache, KeyValueStore, MemoryStore};
pub use config::{AcquisitionConfig, DEFAULT_CACHE_KEY};
pub use controller::{CaptureOptions, GeoController, GeoState, Phase};
pub use proof::{Attachment, JsonLinesSink, ProofCapture, ProofDraft, ProofOfDelivery, ProofSink};
pub use provider::{
    LocationProvider, PositionOptions, PositionOutcome, PositionRequest, PositionResponder,
    PositionWatch, WatchFeed, WatchId,
};
pub use session::{AcquisitionSession, Strategy};
pub use simulated::{ProviderStats, Scenario, ScriptedProvider};
pub use types::*;
