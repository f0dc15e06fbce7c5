//! Persisted handshake between a running daemon and front-end processes
//!
//! The daemon publishes `{pid, url}` to a well-known file once it is listening.
//! Other processes locate it through that file and confirm it is alive with an
//! HTTP health check. A file whose daemon died is only detected by a failing check.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Health endpoint answered by a live daemon
pub const HEALTH_PATH: &str = "/tori";

/// Timeout for the health check
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

/// Interval between polls while waiting for a handshake to appear
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(33);

/// Errors that can occur reading or writing the handshake
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Malformed handshake file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Timed out after {0:?} waiting for the daemon handshake")]
    Timeout(Duration),
}

/// Where a running daemon can be reached
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub pid: u32,
    pub url: String,
}

impl Handshake {
    pub fn new(pid: u32, url: impl Into<String>) -> Self {
        Self {
            pid,
            url: url.into(),
        }
    }

    /// Both fields are filled in
    pub fn is_complete(&self) -> bool {
        self.pid != 0 && !self.url.is_empty()
    }

    /// URL of the daemon's health endpoint
    pub fn health_url(&self) -> String {
        format!("{}{}", self.url.trim_end_matches('/'), HEALTH_PATH)
    }

    /// Ask the daemon whether it is alive
    ///
    /// Network failures count as "not alive".
    pub async fn is_healthy(&self, client: &reqwest::Client) -> bool {
        match client.get(self.health_url()).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("Health check against {} failed: {}", self.url, e);
                false
            }
        }
    }
}

/// The handshake file at its fixed location
#[derive(Debug, Clone)]
pub struct HandshakeFile {
    path: PathBuf,
    client: reqwest::Client,
}

impl HandshakeFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(HEALTH_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            path: path.into(),
            client,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the record, `None` if there is no file
    pub fn load(&self) -> Result<Option<Handshake>, HandshakeError> {
        match std::fs::read(&self.path) {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a daemon is running and reachable through this file
    pub async fn exists(&self) -> bool {
        self.live().await.is_some()
    }

    /// The handshake of a live daemon, if there is one
    pub async fn live(&self) -> Option<Handshake> {
        let handshake = match self.load() {
            Ok(Some(h)) if h.is_complete() => h,
            Ok(_) => return None,
            Err(e) => {
                warn!("Ignoring unreadable handshake {:?}: {}", self.path, e);
                return None;
            }
        };

        if handshake.is_healthy(&self.client).await {
            Some(handshake)
        } else {
            None
        }
    }

    /// Poll until the file appears and parses, or `timeout` elapses
    pub async fn wait(&self, timeout: Duration) -> Result<Handshake, HandshakeError> {
        let start = Instant::now();
        loop {
            if self.path.exists() {
                match self.load() {
                    Ok(Some(handshake)) => return Ok(handshake),
                    Ok(None) => {}
                    // The writer may not have finished yet
                    Err(e) => debug!("Handshake not readable yet: {}", e),
                }
            }

            if start.elapsed() >= timeout {
                return Err(HandshakeError::Timeout(timeout));
            }

            let remaining = timeout.saturating_sub(start.elapsed());
            tokio::time::sleep(WAIT_POLL_INTERVAL.min(remaining)).await;
        }
    }

    /// Publish the record
    ///
    /// Written to a sibling file and renamed into place so readers never see a partial record.
    pub fn save(&self, handshake: &Handshake) -> Result<(), HandshakeError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let data = serde_json::to_vec(handshake)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!("Wrote handshake {:?} (pid={})", self.path, handshake.pid);
        Ok(())
    }

    /// Remove the record; a missing file is not an error
    pub fn delete(&self) -> Result<(), HandshakeError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn handshake_file(temp_dir: &TempDir) -> HandshakeFile {
        HandshakeFile::new(temp_dir.path().join(".session"))
    }

    #[test]
    fn test_load_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let file = handshake_file(&temp_dir);
        assert!(file.load().unwrap().is_none());
    }

    #[test]
    fn test_save_load_delete() {
        let temp_dir = TempDir::new().unwrap();
        let file = handshake_file(&temp_dir);
        let handshake = Handshake::new(4242, "http://localhost:8000");

        file.save(&handshake).unwrap();
        assert_eq!(file.load().unwrap(), Some(handshake));

        file.delete().unwrap();
        assert!(file.load().unwrap().is_none());
        // Deleting twice is fine
        file.delete().unwrap();
    }

    #[test]
    fn test_compact_wire_format() {
        let json = serde_json::to_string(&Handshake::new(7, "http://localhost:1")).unwrap();
        assert_eq!(json, r#"{"pid":7,"url":"http://localhost:1"}"#);
    }

    #[test]
    fn test_is_complete() {
        assert!(Handshake::new(1, "http://localhost:1").is_complete());
        assert!(!Handshake::new(0, "http://localhost:1").is_complete());
        assert!(!Handshake::new(1, "").is_complete());
    }

    #[test]
    fn test_health_url() {
        let handshake = Handshake::new(1, "http://localhost:8000/");
        assert_eq!(handshake.health_url(), "http://localhost:8000/tori");
    }

    #[tokio::test]
    async fn test_incomplete_record_does_not_exist() {
        let temp_dir = TempDir::new().unwrap();
        let file = handshake_file(&temp_dir);
        file.save(&Handshake::new(0, "")).unwrap();
        assert!(!file.exists().await);
    }

    #[tokio::test]
    async fn test_malformed_record_does_not_exist() {
        let temp_dir = TempDir::new().unwrap();
        let file = handshake_file(&temp_dir);
        std::fs::write(file.path(), "{not json").unwrap();
        assert!(!file.exists().await);
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let temp_dir = TempDir::new().unwrap();
        let file = handshake_file(&temp_dir);

        let start = Instant::now();
        let result = file.wait(Duration::from_millis(200)).await;
        let elapsed = start.elapsed();

        assert!(matches!(result, Err(HandshakeError::Timeout(_))));
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_secs(2), "wait took {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_wait_sees_late_writer() {
        let temp_dir = TempDir::new().unwrap();
        let file = handshake_file(&temp_dir);
        let writer = file.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            writer
                .save(&Handshake::new(99, "http://localhost:9999"))
                .unwrap();
        });

        let handshake = file.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(handshake.pid, 99);
    }
}
