//! Core data types for geostamps, raw fixes, and acquisition errors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A best-effort location stamp produced by one successful capture.
///
/// Immutable once created; every capture yields a fresh value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Geostamp {
    pub latitude: f64,
    pub longitude: f64,
    pub captured_at: DateTime<Utc>,
}

impl Geostamp {
    pub fn new(latitude: f64, longitude: f64, captured_at: DateTime<Utc>) -> Self {
        Self {
            latitude,
            longitude,
            captured_at,
        }
    }

    /// Stamp a raw fix with the moment it was accepted.
    pub fn from_fix(fix: &Fix, captured_at: DateTime<Utc>) -> Self {
        Self::new(fix.latitude, fix.longitude, captured_at)
    }
}

/// A raw position as delivered by the host platform.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Fix {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub accuracy_m: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// Failure codes reported by the host location API.
///
/// Numeric values follow the W3C `GeolocationPositionError` codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionErrorCode {
    PermissionDenied = 1,
    PositionUnavailable = 2,
    Timeout = 3,
}

impl From<PositionErrorCode> for GeoError {
    fn from(code: PositionErrorCode) -> Self {
        match code {
            PositionErrorCode::PermissionDenied => GeoError::PermissionDenied,
            PositionErrorCode::PositionUnavailable => GeoError::PositionUnavailable,
            PositionErrorCode::Timeout => GeoError::Timeout,
        }
    }
}

/// Errors that can occur while acquiring or persisting a geostamp.
#[derive(thiserror::Error, Debug)]
pub enum GeoError {
    #[error("Geolocation is not supported on this device")]
    Unsupported,

    #[error("Location permission denied")]
    PermissionDenied,

    #[error("Location unavailable")]
    PositionUnavailable,

    #[error("Location request timed out")]
    Timeout,

    #[error("Failed to start location request: {0}")]
    StartFailed(String),

    #[error("Capture superseded by a newer request")]
    Superseded,

    #[error("Location controller was torn down")]
    TornDown,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Attachment too large: {size} bytes exceeds {max} bytes")]
    AttachmentTooLarge { size: u64, max: u64 },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GeoError {
    /// The message surfaced to the person holding the device.
    pub fn user_message(&self) -> String {
        match self {
            GeoError::Unsupported => "Geolocation is not supported by this device.".to_string(),
            GeoError::PermissionDenied => {
                "Location permission was denied. Enable location access and try again."
                    .to_string()
            }
            GeoError::PositionUnavailable => {
                "Your location is currently unavailable. Move to an open area and retry."
                    .to_string()
            }
            GeoError::Timeout => {
                "Getting your location took too long. Please try again.".to_string()
            }
            GeoError::StartFailed(_) => "Could not start a location request.".to_string(),
            other => other.to_string(),
        }
    }

    /// Whether this error ends an acquisition as a terminal, user-visible outcome.
    pub fn is_acquisition_failure(&self) -> bool {
        matches!(
            self,
            GeoError::Unsupported
                | GeoError::PermissionDenied
                | GeoError::PositionUnavailable
                | GeoError::Timeout
                | GeoError::StartFailed(_)
        )
    }
}

/// Convenience result type.
pub type GeoResult<T> = Result<T, GeoError>;
