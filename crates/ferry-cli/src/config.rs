//! Configuration file support.

use ferry_core::StuckWorkerPolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default CLI options.
    pub defaults: Defaults,
}

/// Default CLI options. Flags given on the command line take precedence.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Defaults {
    pub verbose: bool,
    pub quiet: bool,
    /// Per-phase deadline in seconds.
    pub timeout_secs: Option<u64>,
    pub strict: bool,
    /// Collector ids to attach when `--collectors` is not given.
    pub collectors: Vec<String>,
    pub ledger: Option<PathBuf>,
    pub exclusion_file: Option<PathBuf>,
    pub parallelism: Option<usize>,
    pub on_stuck_worker: Option<StuckWorkerPolicy>,
}

impl Config {
    /// Load config from the default location (~/.config/ferry/config.toml).
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from_path(&path),
            None => Self::default(),
        }
    }

    /// Load config from a specific path. Problems are reported, not fatal.
    pub fn load_from_path(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Warning: Failed to parse config file: {}", e);
                    Self::default()
                }
            },
            Err(e) => {
                eprintln!("Warning: Failed to read config file: {}", e);
                Self::default()
            }
        }
    }

    /// Get the default config file path.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("ferry").join("config.toml"))
    }
}
