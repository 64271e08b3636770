// src/config.rs

//! Defines the configuration structures for the `rv-stream` driver.
//!
//! The structs can be deserialized from a JSON file and then adjusted from the
//! process environment. Every section carries defaults matching what a viewer
//! started with `-network` expects out of the box, so an empty file (or no file
//! at all) yields a working configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::color::ColorMode;

/// Default port a viewer listens on when started with `-network`.
pub const DEFAULT_PORT: u16 = 45124;

// --- Top-Level Configuration Structure ---

/// Represents the complete configuration for one driver instance.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct DriverConfig {
    /// Where the viewer lives and how hard to try reaching it.
    pub connection: ConnectionConfig,
    /// How to launch the viewer when nothing is listening.
    pub viewer: ViewerConfig,
    /// Naming of the image sequence inside the viewer.
    pub media: MediaConfig,
    /// Display color correction requested from the viewer.
    pub color: ColorConfig,
}

// --- Connection Configuration ---

/// Settings related to the socket connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    /// Spawn the viewer if the first connect attempt is refused.
    pub auto_launch: bool,
    /// Connect attempts made after an auto-launch.
    pub max_retries: u32,
    /// Delay between those attempts, in milliseconds.
    pub retry_delay_ms: u64,
    /// Route every write through a single queue drained by a writer thread.
    pub serialized_io: bool,
    /// How long `open` waits for the viewer to answer the registration script.
    pub reply_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            auto_launch: false,
            max_retries: 10,
            retry_delay_ms: 1000,
            serialized_io: false,
            reply_timeout_ms: 5000,
        }
    }
}

// --- Viewer Configuration ---

/// Settings used to build the viewer command line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ViewerConfig {
    /// Viewer executable, resolved through `PATH` when not absolute.
    pub executable: PathBuf,
    /// Extra arguments appended after the network flags.
    pub extra_args: Vec<String>,
    /// Mode-manager package preloaded when OCIO correction is requested.
    pub ocio_preload_package: String,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        ViewerConfig {
            executable: PathBuf::from("rv"),
            extra_args: Vec::new(),
            ocio_preload_package: "ocio_source_setup".to_string(),
        }
    }
}

// --- Media Configuration ---

/// Settings for the media identifier and handshake.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MediaConfig {
    /// Base name of the media. Empty means "render".
    pub name: String,
    /// Prefix the name with a timestamp so repeated sessions stay distinct.
    pub timestamp: bool,
    /// Text sent in the `NEWGREETING` handshake.
    pub greeting: String,
}

impl Default for MediaConfig {
    fn default() -> Self {
        MediaConfig {
            name: String::new(),
            timestamp: true,
            greeting: "rv-shell-1 rv-stream".to_string(),
        }
    }
}

// --- Color Configuration ---

/// Requested display color correction. Resources are validated at session open.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct ColorConfig {
    pub mode: ColorMode,
    /// Used by `ColorMode::Gamma`; falls back to `RV_STREAM_GAMMA`.
    pub gamma: Option<f32>,
    /// Used by `ColorMode::Lut`; falls back to `RV_STREAM_LUT`.
    pub lut: Option<PathBuf>,
    /// Used by `ColorMode::Ocio`; falls back to `OCIO`.
    pub ocio: Option<PathBuf>,
}

impl DriverConfig {
    /// Loads a configuration from a JSON file, or the defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            log::info!("No configuration file given, using defaults.");
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: DriverConfig = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        log::info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Applies `RV_STREAM_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from an arbitrary lookup, so tests need not touch the
    /// real environment.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("RV_STREAM_HOST").filter(|h| !h.is_empty()) {
            self.connection.host = host;
        }
        if let Some(port) = lookup("RV_STREAM_PORT") {
            match port.trim().parse::<u16>() {
                Ok(port) => self.connection.port = port,
                Err(e) => log::warn!("Ignoring RV_STREAM_PORT={:?}: {}", port, e),
            }
        }
        if let Some(name) = lookup("RV_STREAM_MEDIA") {
            self.media.name = name;
        }
        if let Some(flag) = lookup("RV_STREAM_AUTO_LAUNCH") {
            self.connection.auto_launch = parse_flag(&flag);
        }
        if let Some(flag) = lookup("RV_STREAM_SERIALIZED_IO") {
            self.connection.serialized_io = parse_flag(&flag);
        }
        if let Some(viewer) = lookup("RV_STREAM_VIEWER").filter(|v| !v.is_empty()) {
            self.viewer.executable = PathBuf::from(viewer);
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
