//! Geostamp CLI: capture, simulate, and inspect courier geostamps.

pub mod app;
pub mod config;
pub mod error;
pub mod repl;

pub use app::{load_scenario, App, AppOptions, CaptureReport, CaptureSource};
pub use config::{load_config, resolve_cache_path, resolve_config_path};
pub use error::{CliError, CliResult};
