//! Front-end coordination of the daemon
//!
//! Finds a live daemon through the handshake file, starts one when there is
//! none, and turns a URI into stream URLs for the player. URIs the daemon
//! refuses go to the configured fallback application instead.

use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::context::AppContext;
use crate::daemon::protocol::{ListResponse, MessageResponse};
use crate::daemon::{ClientError, DaemonClient};
use crate::handshake::{Handshake, HandshakeError, HandshakeFile};
use crate::process::{CommandLine, LaunchError, ProcessSupervisor};
use crate::registry::ContentId;

/// How long a freshly spawned daemon gets to publish its handshake
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors surfaced to the front-end user
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Daemon did not come up: {0}")]
    DaemonTimeout(#[source] HandshakeError),

    #[error("Daemon is not running")]
    NotRunning,

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// Result type for supervisor operations
pub type SupervisorResult<T> = Result<T, SupervisorError>;

/// What `start` did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    AlreadyRunning(Handshake),
    Started { pid: u32 },
}

/// What `stop` did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    Stopping(String),
    NotRunning,
}

/// What `start_or_play` did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayOutcome {
    /// The player was started with the stream URLs
    Playing { pid: u32, urls: Vec<String> },
    /// Auto-play is off; the URLs are for the user
    Printed { urls: Vec<String> },
    /// The daemon refused the URI and the fallback application got it
    Fallback { pid: u32 },
}

pub struct DaemonSupervisor<'a> {
    ctx: &'a AppContext,
    processes: &'a dyn ProcessSupervisor,
    handshake: HandshakeFile,
    startup_timeout: Duration,
}

impl<'a> DaemonSupervisor<'a> {
    pub fn new(ctx: &'a AppContext, processes: &'a dyn ProcessSupervisor) -> Self {
        Self {
            ctx,
            processes,
            handshake: HandshakeFile::new(&ctx.paths.handshake_file),
            startup_timeout: STARTUP_TIMEOUT,
        }
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Handshake of the live daemon, if any
    pub async fn status(&self) -> Option<Handshake> {
        self.handshake.live().await
    }

    async fn live_client(&self) -> SupervisorResult<DaemonClient> {
        let handshake = self.status().await.ok_or(SupervisorError::NotRunning)?;
        Ok(DaemonClient::from_handshake(&handshake))
    }

    fn spawn_daemon(&self) -> SupervisorResult<u32> {
        // A record left behind by a dead daemon would satisfy `wait` immediately
        self.handshake.delete()?;

        let command = CommandLine {
            program: self.ctx.paths.executable.to_string_lossy().into_owned(),
            args: vec!["serve".to_string()],
        };
        let pid = self.processes.spawn_detached(&command)?;
        info!("Started server with PID {}", pid);
        Ok(pid)
    }

    /// Start a daemon unless one is already live
    pub async fn start(&self) -> SupervisorResult<StartOutcome> {
        if let Some(handshake) = self.status().await {
            info!("Server already running at {}", handshake.url);
            return Ok(StartOutcome::AlreadyRunning(handshake));
        }

        let pid = self.spawn_daemon()?;
        Ok(StartOutcome::Started { pid })
    }

    /// Live daemon, spawning one and waiting for its handshake if needed
    pub async fn ensure_daemon(&self) -> SupervisorResult<Handshake> {
        if let Some(handshake) = self.status().await {
            return Ok(handshake);
        }

        self.spawn_daemon()?;
        self.handshake
            .wait(self.startup_timeout)
            .await
            .map_err(SupervisorError::DaemonTimeout)
    }

    /// Ask the live daemon to stop; clears a stale handshake when there is none
    pub async fn stop(&self, restart: bool) -> SupervisorResult<StopOutcome> {
        let Some(handshake) = self.status().await else {
            info!("Server not running");
            self.handshake.delete()?;
            return Ok(StopOutcome::NotRunning);
        };

        info!("Stopping server with PID {}", handshake.pid);
        let response = DaemonClient::from_handshake(&handshake).stop(restart).await?;
        Ok(StopOutcome::Stopping(response.message))
    }

    /// Point this installation at a daemon running elsewhere
    pub async fn connect(&self, url: &str) -> SupervisorResult<Handshake> {
        let client = DaemonClient::new(url);
        let health = client.health().await?;

        let handshake = Handshake::new(health.pid, client.base_url());
        self.handshake.save(&handshake)?;
        info!("Connected to daemon at {} (PID {})", handshake.url, handshake.pid);
        Ok(handshake)
    }

    /// Forget the recorded daemon without stopping it
    pub fn disconnect(&self) -> SupervisorResult<()> {
        self.handshake.delete()?;
        Ok(())
    }

    /// Add `uri` to the daemon (starting it if needed) and play or print the stream URLs
    pub async fn start_or_play(&self, uri: &str) -> SupervisorResult<PlayOutcome> {
        let handshake = self.ensure_daemon().await?;
        let client = DaemonClient::from_handshake(&handshake);
        let config = &self.ctx.config;

        match client.add(uri).await {
            Ok(response) => {
                let urls: Vec<String> = response
                    .ids
                    .iter()
                    .map(|id| client.stream_url(id))
                    .collect();
                debug!("{}: {:?}", response.message, urls);

                if !config.auto_play {
                    return Ok(PlayOutcome::Printed { urls });
                }

                let command = CommandLine::from_config(&config.playback, "playback")?
                    .with_args(urls.iter().cloned());
                let pid = self.processes.spawn_detached(&command)?;
                Ok(PlayOutcome::Playing { pid, urls })
            }
            Err(e) if e.is_client_error() => {
                warn!("Daemon refused {}: {}", uri, e);
                let command =
                    CommandLine::from_config(&config.fallback, "fallback")?.with_args([uri]);
                let pid = self.processes.spawn_detached(&command)?;
                Ok(PlayOutcome::Fallback { pid })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn list(&self) -> SupervisorResult<ListResponse> {
        Ok(self.live_client().await?.list().await?)
    }

    pub async fn remove(&self, id: &ContentId) -> SupervisorResult<MessageResponse> {
        Ok(self.live_client().await?.remove(id).await?)
    }

    /// Have the daemon start the player on an already added file
    pub async fn play(&self, id: &ContentId) -> SupervisorResult<MessageResponse> {
        Ok(self.live_client().await?.play(id).await?)
    }

    pub async fn download(&self, id: &ContentId) -> SupervisorResult<MessageResponse> {
        Ok(self.live_client().await?.download(id).await?)
    }
}
