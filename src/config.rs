//! Configuration management for tori
//!
//! Handles loading and saving configuration from `config.toml` next to the executable.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration file name
pub const CONFIG_FILE: &str = "config.toml";

/// Default listening port of the daemon
pub const DEFAULT_PORT: u16 = 8000;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Port the daemon listens on (0 picks an ephemeral port)
    pub port: u16,

    /// Hand stream URLs straight to the player instead of printing them
    pub auto_play: bool,

    /// File extensions (with leading dot) that are eligible for streaming
    pub filetypes: Vec<String>,

    /// Player command line; stream URLs are appended
    pub playback: Vec<String>,

    /// Application receiving URIs the daemon rejects
    pub fallback: Vec<String>,

    /// Engine storage directory, relative paths resolve against the executable directory
    pub storage_dir: PathBuf,

    /// Upper bound on waiting for torrent metadata in `/add` (0 waits forever)
    pub metadata_timeout_secs: u64,

    /// Daemon log file override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            auto_play: true,
            filetypes: vec![".mkv".to_string(), ".mp4".to_string()],
            playback: ["mpv", "--no-terminal", "--force-window", "--ytdl-format=best"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            fallback: vec!["qbittorrent".to_string()],
            storage_dir: PathBuf::from("downloads"),
            metadata_timeout_secs: 300,
            log_file: None,
        }
    }
}

impl Config {
    /// Load configuration from `path`
    ///
    /// Writes the defaults out when the file doesn't exist yet
    pub fn load_or_init(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            let config = Self::default();
            config.save(path)?;
            return Ok(config);
        }

        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to `path`
    ///
    /// Creates the parent directory if it doesn't exist
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir)?;
            }
        }

        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Allowed extensions as a set, matched exactly and case-sensitively
    pub fn allowed_extensions(&self) -> HashSet<String> {
        self.filetypes.iter().cloned().collect()
    }

    /// Resolve the storage directory against `base_dir`
    pub fn storage_dir_in(&self, base_dir: &Path) -> PathBuf {
        if self.storage_dir.is_absolute() {
            self.storage_dir.clone()
        } else {
            base_dir.join(&self.storage_dir)
        }
    }

    /// Metadata wait bound, `None` when disabled
    pub fn metadata_timeout(&self) -> Option<Duration> {
        match self.metadata_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

/// Format the configuration for display
pub fn format_config(config: &Config) -> String {
    let mut lines = Vec::new();

    lines.push("Current configuration:".to_string());
    lines.push(String::new());
    lines.push(format!("  port = {}", config.port));
    lines.push(format!("  auto_play = {}", config.auto_play));
    lines.push(format!("  filetypes = {:?}", config.filetypes));
    lines.push(format!("  playback = {:?}", config.playback));
    lines.push(format!("  fallback = {:?}", config.fallback));
    lines.push(format!("  storage_dir = {}", config.storage_dir.display()));

    match config.metadata_timeout_secs {
        0 => lines.push("  metadata_timeout_secs = 0 (unbounded)".to_string()),
        secs => lines.push(format!("  metadata_timeout_secs = {}", secs)),
    }

    lines.join("\n")
}
