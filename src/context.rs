//! Application context shared by the front-end and the daemon.
//!
//! Built once at process start and passed by reference; nothing here is a global.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{Config, ConfigResult, CONFIG_FILE};

/// Application name, used for the data directory
pub const APP_NAME: &str = "tori";

/// Handshake file name, next to the executable
pub const HANDSHAKE_FILE: &str = ".session";

/// Well-known locations derived from the executable directory
#[derive(Debug, Clone)]
pub struct AppPaths {
    /// Directory containing the executable
    pub base_dir: PathBuf,
    /// Executable used to respawn the daemon
    pub executable: PathBuf,
    pub config_file: PathBuf,
    pub handshake_file: PathBuf,
    pub storage_dir: PathBuf,
    pub log_file: PathBuf,
}

impl AppPaths {
    fn resolve(base_dir: &Path, executable: PathBuf, config: &Config) -> Self {
        let log_file = config
            .log_file
            .clone()
            .unwrap_or_else(|| default_data_dir().join("daemon.log"));

        Self {
            base_dir: base_dir.to_path_buf(),
            executable,
            config_file: base_dir.join(CONFIG_FILE),
            handshake_file: base_dir.join(HANDSHAKE_FILE),
            storage_dir: config.storage_dir_in(base_dir),
            log_file,
        }
    }
}

/// Everything a component needs to know about this installation
#[derive(Debug, Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub paths: AppPaths,
}

impl AppContext {
    /// Build the context for the running executable, loading (or initializing) its config
    pub fn load() -> anyhow::Result<Self> {
        let executable = std::env::current_exe()?;
        let base_dir = executable
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let config = Config::load_or_init(&base_dir.join(CONFIG_FILE))?;
        Ok(Self::from_parts(&base_dir, executable, config))
    }

    /// Build a context rooted at `base_dir` with an explicit config
    pub fn with_base_dir(base_dir: &Path, config: Config) -> Self {
        let executable = base_dir.join(APP_NAME);
        Self::from_parts(base_dir, executable, config)
    }

    /// Like [`AppContext::with_base_dir`] but reading `config.toml` from `base_dir`
    pub fn load_from(base_dir: &Path) -> ConfigResult<Self> {
        let config = Config::load_or_init(&base_dir.join(CONFIG_FILE))?;
        Ok(Self::with_base_dir(base_dir, config))
    }

    fn from_parts(base_dir: &Path, executable: PathBuf, config: Config) -> Self {
        let paths = AppPaths::resolve(base_dir, executable, &config);
        Self {
            config: Arc::new(config),
            paths,
        }
    }
}

/// Per-user data directory holding the daemon log
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_paths_relative_to_base_dir() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = AppContext::with_base_dir(temp_dir.path(), Config::default());

        assert_eq!(ctx.paths.handshake_file, temp_dir.path().join(".session"));
        assert_eq!(ctx.paths.config_file, temp_dir.path().join("config.toml"));
        assert_eq!(ctx.paths.storage_dir, temp_dir.path().join("downloads"));
        assert!(ctx.paths.log_file.ends_with("daemon.log"));
    }

    #[test]
    fn test_log_file_override() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config {
            log_file: Some(temp_dir.path().join("custom.log")),
            ..Config::default()
        };
        let ctx = AppContext::with_base_dir(temp_dir.path(), config);
        assert_eq!(ctx.paths.log_file, temp_dir.path().join("custom.log"));
    }

    #[test]
    fn test_load_from_initializes_config() {
        let temp_dir = TempDir::new().unwrap();
        let ctx = AppContext::load_from(temp_dir.path()).unwrap();
        assert!(temp_dir.path().join("config.toml").exists());
        assert_eq!(*ctx.config, Config::default());
    }
}
