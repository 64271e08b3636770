// src/color.rs

//! Display color correction requested from the viewer.
//!
//! Pixels are always sent linear; correction is applied viewer-side by script
//! commands. This module only decides *which* correction applies, walking the
//! precedence chain explicit parameter -> environment variable -> no correction.

use log::{info, warn};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::config::ColorConfig;

/// Environment fallback for `ColorMode::Gamma`.
pub const GAMMA_ENV: &str = "RV_STREAM_GAMMA";
/// Environment fallback for `ColorMode::Lut`.
pub const LUT_ENV: &str = "RV_STREAM_LUT";
/// Environment variable read by OCIO-aware viewers.
pub const OCIO_ENV: &str = "OCIO";

/// Serialises writes to the process environment.
static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Color-correction mode as configured by the user.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ColorMode {
    #[default]
    None,
    Srgb,
    Rec709,
    Gamma22,
    Gamma24,
    /// Custom gamma from `ColorConfig::gamma` or the environment.
    Gamma,
    Lut,
    Ocio,
}

/// The correction actually in effect after resources were validated.
#[derive(Debug, Clone, PartialEq)]
pub enum ColorCorrection {
    None,
    Srgb,
    Rec709,
    Gamma(f32),
    Lut(PathBuf),
    Ocio(PathBuf),
}

impl ColorCorrection {
    /// Resolves the configured mode against the process environment.
    pub fn resolve(config: &ColorConfig) -> Self {
        Self::resolve_with(config, |key| std::env::var(key).ok())
    }

    /// Resolves the configured mode using `lookup` for environment fallbacks.
    pub fn resolve_with<F>(config: &ColorConfig, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        match config.mode {
            ColorMode::None => ColorCorrection::None,
            ColorMode::Srgb => ColorCorrection::Srgb,
            ColorMode::Rec709 => ColorCorrection::Rec709,
            ColorMode::Gamma22 => ColorCorrection::Gamma(2.2),
            ColorMode::Gamma24 => ColorCorrection::Gamma(2.4),
            ColorMode::Gamma => ColorCorrection::Gamma(resolve_gamma(config.gamma, &lookup)),
            ColorMode::Lut => {
                match resolve_file("LUT", config.lut.as_deref(), LUT_ENV, &lookup) {
                    Some(path) => ColorCorrection::Lut(path),
                    None => ColorCorrection::None,
                }
            }
            ColorMode::Ocio => {
                match resolve_file("OCIO config", config.ocio.as_deref(), OCIO_ENV, &lookup) {
                    Some(path) => ColorCorrection::Ocio(path),
                    None => ColorCorrection::None,
                }
            }
        }
    }

    /// True when the viewer must have been started with the OCIO mode package.
    pub fn requires_ocio_preload(&self) -> bool {
        matches!(self, ColorCorrection::Ocio(_))
    }

    /// Exports the OCIO config path so a viewer spawned from this process
    /// picks it up. No-op for every other correction.
    pub fn apply_environment(&self) {
        if let ColorCorrection::Ocio(path) = self {
            let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
            std::env::set_var(OCIO_ENV, path);
            info!("Set {}={}", OCIO_ENV, path.display());
        }
    }
}

fn resolve_gamma<F>(explicit: Option<f32>, lookup: &F) -> f32
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(gamma) = explicit.filter(|g| valid_gamma(*g)) {
        return gamma;
    }
    if let Some(value) = explicit {
        info!("Ignoring invalid gamma parameter {}", value);
    }
    match lookup(GAMMA_ENV).map(|v| v.trim().parse::<f32>()) {
        Some(Ok(gamma)) if valid_gamma(gamma) => {
            info!("Using gamma {} from {}", gamma, GAMMA_ENV);
            gamma
        }
        Some(_) => {
            info!("{} is not a valid gamma, defaulting to 1.0", GAMMA_ENV);
            1.0
        }
        None => {
            info!("No gamma given, defaulting to 1.0");
            1.0
        }
    }
}

fn valid_gamma(gamma: f32) -> bool {
    gamma.is_finite() && gamma > 0.0
}

fn resolve_file<F>(what: &str, explicit: Option<&Path>, env: &str, lookup: &F) -> Option<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = explicit {
        if path.is_file() {
            return Some(path.to_path_buf());
        }
        info!("{} {} does not exist, trying {}", what, path.display(), env);
    }
    match lookup(env).filter(|v| !v.is_empty()).map(PathBuf::from) {
        Some(path) if path.is_file() => {
            info!("Using {} {} from {}", what, path.display(), env);
            Some(path)
        }
        Some(path) => {
            warn!(
                "{} {} from {} does not exist, color correction disabled",
                what,
                path.display(),
                env
            );
            None
        }
        None => {
            info!("No {} available, color correction disabled", what);
            None
        }
    }
}
