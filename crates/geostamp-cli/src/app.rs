//! Wiring of provider, store, and controller behind the CLI commands.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use geostamp::{
    AcquisitionConfig, CacheEntry, CaptureOptions, FileStore, GeoController, GeoState, Geostamp,
    GeostampCache, ProofCapture, ProofDraft, ProofOfDelivery, ProviderStats, Scenario,
    ScriptedProvider, Strategy,
};

use crate::error::{CliError, CliResult};

/// Where the answer to a capture came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureSource {
    Cache,
    Device,
}

/// Outcome of one capture, as printed by the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct CaptureReport {
    pub ok: bool,
    pub source: Option<CaptureSource>,
    /// Winning strategy for a device capture.
    pub strategy: Option<Strategy>,
    pub geostamp: Option<Geostamp>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
    pub provider: ProviderStats,
}

/// Options shared by every command.
#[derive(Debug, Clone, Default)]
pub struct AppOptions {
    pub cache_path: PathBuf,
    pub config: AcquisitionConfig,
    /// Without a scenario the host has no location capability.
    pub scenario: Option<Scenario>,
}

/// CLI application state.
pub struct App {
    controller: GeoController<ScriptedProvider, FileStore>,
    cache_path: PathBuf,
}

impl App {
    pub fn open(options: AppOptions) -> CliResult<Self> {
        options.config.validate()?;
        let provider = match options.scenario {
            Some(scenario) => ScriptedProvider::new(scenario),
            None => ScriptedProvider::unsupported(),
        };
        tracing::debug!("Cache store: {}", options.cache_path.display());
        let store = FileStore::new(&options.cache_path);
        Ok(Self {
            controller: GeoController::new(Arc::new(provider), store, options.config),
            cache_path: options.cache_path,
        })
    }

    pub fn controller(&self) -> &GeoController<ScriptedProvider, FileStore> {
        &self.controller
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    pub async fn capture(&self, force: bool) -> CaptureReport {
        let before = self.controller.provider().stats().requests;
        let started = tokio::time::Instant::now();
        let result = self.controller.capture(CaptureOptions { force }).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let provider = self.controller.provider().stats();
        let source = if provider.requests > before {
            CaptureSource::Device
        } else {
            CaptureSource::Cache
        };

        match result {
            Ok(stamp) => CaptureReport {
                ok: true,
                source: Some(source),
                strategy: self.controller.state().strategy,
                geostamp: Some(stamp),
                error: None,
                elapsed_ms,
                provider,
            },
            Err(e) => CaptureReport {
                ok: false,
                source: None,
                strategy: None,
                geostamp: None,
                error: Some(e.user_message()),
                elapsed_ms,
                provider,
            },
        }
    }

    pub async fn proof(&self, draft: ProofDraft) -> CliResult<ProofOfDelivery> {
        Ok(ProofCapture::capture(&self.controller, draft).await?)
    }

    pub fn state(&self) -> GeoState {
        self.controller.state()
    }

    pub fn reset(&self) {
        self.controller.reset();
    }

    pub fn cache(&self) -> &GeostampCache<FileStore> {
        self.controller.cache()
    }

    pub fn cached(&self) -> Option<CacheEntry> {
        self.controller.cache().load()
    }

    pub fn purge_cache(&self) -> CliResult<()> {
        self.controller.cache().purge()?;
        tracing::info!("Purged cached geostamp from {}", self.cache_path.display());
        Ok(())
    }
}

/// Load a scenario file, naming the file on failure.
pub fn load_scenario(path: &str) -> CliResult<Scenario> {
    Scenario::from_json_file(Path::new(path)).map_err(|e| CliError::Scenario {
        path: path.to_string(),
        reason: e.to_string(),
    })
}
