//! Acquisition budgets and cache settings.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{GeoError, GeoResult};

/// Storage key under which the last geostamp is cached.
pub const DEFAULT_CACHE_KEY: &str = "geostamp.last";

/// Timing budgets for one acquisition cycle.
///
/// All durations are serialized as integer milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Timeout of the low-accuracy "fast guess" request.
    #[serde(with = "millis")]
    pub fast_timeout: Duration,
    /// Oldest OS-cached fix the fast guess accepts.
    #[serde(with = "millis")]
    pub fast_maximum_age: Duration,
    /// Timeout of the high-accuracy request.
    #[serde(with = "millis")]
    pub precise_timeout: Duration,
    #[serde(with = "millis")]
    pub precise_maximum_age: Duration,
    /// Delay after which the continuous watch is armed if nothing settled.
    #[serde(with = "millis")]
    pub fallback_after: Duration,
    #[serde(with = "millis")]
    pub watch_timeout: Duration,
    #[serde(with = "millis")]
    pub watch_maximum_age: Duration,
    /// Hard ceiling; the session fails with a timeout when reached.
    #[serde(with = "millis")]
    pub hard_timeout: Duration,
    #[serde(with = "millis")]
    pub cache_ttl: Duration,
    pub cache_key: String,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            fast_timeout: Duration::from_secs(4),
            fast_maximum_age: Duration::from_secs(60),
            precise_timeout: Duration::from_secs(10),
            precise_maximum_age: Duration::ZERO,
            fallback_after: Duration::from_secs(6),
            watch_timeout: Duration::from_secs(20),
            watch_maximum_age: Duration::from_secs(30),
            hard_timeout: Duration::from_secs(12),
            cache_ttl: Duration::from_secs(15 * 60),
            cache_key: DEFAULT_CACHE_KEY.to_string(),
        }
    }
}

impl AcquisitionConfig {
    /// Load overrides from a JSON file. Missing fields keep their defaults.
    pub fn from_json_file(path: &Path) -> GeoResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject budgets that would make the cascade meaningless.
    pub fn validate(&self) -> GeoResult<()> {
        let budgets = [
            ("fast_timeout", self.fast_timeout),
            ("precise_timeout", self.precise_timeout),
            ("fallback_after", self.fallback_after),
            ("watch_timeout", self.watch_timeout),
            ("hard_timeout", self.hard_timeout),
            ("cache_ttl", self.cache_ttl),
        ];
        if let Some((name, _)) = budgets.iter().find(|(_, d)| d.is_zero()) {
            return Err(GeoError::InvalidConfig(format!("{name} must be non-zero")));
        }
        if self.hard_timeout <= self.fallback_after {
            return Err(GeoError::InvalidConfig(format!(
                "hard_timeout ({}ms) must exceed fallback_after ({}ms)",
                self.hard_timeout.as_millis(),
                self.fallback_after.as_millis()
            )));
        }
        if self.cache_key.trim().is_empty() {
            return Err(GeoError::InvalidConfig("cache_key must not be empty".to_string()));
        }
        Ok(())
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
