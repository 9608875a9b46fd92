//! Configuration loading and resolution.

use std::path::{Path, PathBuf};

use geostamp::AcquisitionConfig;

use crate::error::{CliError, CliResult};

pub const CACHE_ENV: &str = "GEOSTAMP_CACHE";
pub const CONFIG_ENV: &str = "GEOSTAMP_CONFIG";

const LOCAL_DIR: &str = ".geostamp";
const CACHE_FILE: &str = "cache.json";
const CONFIG_FILE: &str = "config.json";

/// Resolve the cache store path.
pub fn resolve_cache_path(explicit: Option<&str>) -> PathBuf {
    resolve(explicit, CACHE_ENV, CACHE_FILE)
}

/// Resolve the acquisition config path. The file need not exist.
pub fn resolve_config_path(explicit: Option<&str>) -> PathBuf {
    resolve(explicit, CONFIG_ENV, CONFIG_FILE)
}

fn resolve(explicit: Option<&str>, env_var: &str, file: &str) -> PathBuf {
    if let Some(path) = explicit {
        return PathBuf::from(path);
    }

    if let Ok(env_path) = std::env::var(env_var) {
        if !env_path.is_empty() {
            return PathBuf::from(env_path);
        }
    }

    let local = PathBuf::from(LOCAL_DIR).join(file);
    if local.exists() {
        return local;
    }

    default_dir().join(file)
}

fn default_dir() -> PathBuf {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string());

    PathBuf::from(home).join(LOCAL_DIR)
}

/// Load the acquisition config, falling back to defaults when the file is absent.
pub fn load_config(path: &Path) -> CliResult<AcquisitionConfig> {
    if !path.exists() {
        tracing::debug!("No config at {}, using defaults", path.display());
        return Ok(AcquisitionConfig::default());
    }
    AcquisitionConfig::from_json_file(path).map_err(|e| CliError::Config {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}
