//! Proof-of-delivery capture: a geostamp, an optional photo or document,
//! and the courier's form fields folded into one submittable record.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::KeyValueStore;
use crate::controller::{CaptureOptions, GeoController};
use crate::provider::LocationProvider;
use crate::types::{GeoError, GeoResult, Geostamp};

/// Largest attachment accepted, in bytes.
pub const MAX_ATTACHMENT_BYTES: u64 = 10 * 1024 * 1024;

/// Form input for a proof of delivery.
#[derive(Debug, Clone, Default)]
pub struct ProofDraft {
    pub order_id: String,
    pub recipient_name: Option<String>,
    pub notes: Option<String>,
    pub attachment: Option<PathBuf>,
    /// Bypass the cached geostamp.
    pub force_location: bool,
}

/// File attached to a proof, embedded as base64.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub file_name: String,
    pub mime: String,
    pub size_bytes: u64,
    pub data_base64: String,
}

impl Attachment {
    pub fn from_file(path: &Path) -> GeoResult<Self> {
        let size = std::fs::metadata(path)?.len();
        if size > MAX_ATTACHMENT_BYTES {
            return Err(GeoError::AttachmentTooLarge {
                size,
                max: MAX_ATTACHMENT_BYTES,
            });
        }
        let bytes = std::fs::read(path)?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| GeoError::InvalidInput(format!("Bad file name: {}", path.display())))?
            .to_string();

        Ok(Self {
            mime: mime_for(path).to_string(),
            size_bytes: bytes.len() as u64,
            data_base64: base64::engine::general_purpose::STANDARD.encode(&bytes),
            file_name,
        })
    }

    pub fn decode(&self) -> GeoResult<Vec<u8>> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.data_base64)
            .map_err(|e| GeoError::InvalidInput(format!("Invalid attachment data: {e}")))
    }
}

fn mime_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("heic") => "image/heic",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

/// A completed proof of delivery, ready for submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProofOfDelivery {
    pub id: Uuid,
    pub order_id: String,
    pub geostamp: Option<Geostamp>,
    /// Why no geostamp was attached.
    pub location_error: Option<String>,
    pub attachment: Option<Attachment>,
    pub recipient_name: Option<String>,
    pub notes: Option<String>,
    pub submitted_at: DateTime<Utc>,
}

/// Composes location, attachment, and form fields.
pub struct ProofCapture;

impl ProofCapture {
    /// Build a proof from a draft.
    ///
    /// The attachment is read before location is requested so a bad file
    /// fails fast. Location failures do not block the proof; the message is
    /// recorded in `location_error` instead.
    pub async fn capture<P, S>(
        controller: &GeoController<P, S>,
        draft: ProofDraft,
    ) -> GeoResult<ProofOfDelivery>
    where
        P: LocationProvider,
        S: KeyValueStore,
    {
        let order_id = draft.order_id.trim().to_string();
        if order_id.is_empty() {
            return Err(GeoError::InvalidInput("order_id must not be empty".to_string()));
        }

        let attachment = draft
            .attachment
            .as_deref()
            .map(Attachment::from_file)
            .transpose()?;

        let options = CaptureOptions {
            force: draft.force_location,
        };
        let (geostamp, location_error) = match controller.capture(options).await {
            Ok(stamp) => (Some(stamp), None),
            Err(e) if e.is_acquisition_failure() => {
                tracing::warn!(order_id = %order_id, "Proof captured without location: {e}");
                (None, Some(e.user_message()))
            }
            Err(e) => return Err(e),
        };

        Ok(ProofOfDelivery {
            id: Uuid::new_v4(),
            order_id,
            geostamp,
            location_error,
            attachment,
            recipient_name: non_blank(draft.recipient_name),
            notes: non_blank(draft.notes),
            submitted_at: Utc::now(),
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Destination for completed proofs.
pub trait ProofSink: Send + Sync {
    fn submit(&self, proof: &ProofOfDelivery) -> GeoResult<()>;
}

/// Appends each proof as one JSON line.
pub struct JsonLinesSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Read back every proof in the file.
    pub fn read_all(&self) -> GeoResult<Vec<ProofOfDelivery>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        raw.lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(GeoError::from))
            .collect()
    }
}

impl ProofSink for JsonLinesSink {
    fn submit(&self, proof: &ProofOfDelivery) -> GeoResult<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| GeoError::Storage("proof sink lock poisoned".to_string()))?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut line = serde_json::to_vec(proof)?;
        line.push(b'\n');
        file.write_all(&line)?;
        tracing::debug!(order_id = %proof.order_id, "Proof appended to {}", self.path.display());
        Ok(())
    }
}
