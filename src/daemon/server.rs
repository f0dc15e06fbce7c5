//! Daemon lifecycle
//!
//! The daemon resets its storage directory, binds its port, publishes the
//! handshake and serves until its cancellation token fires (via `/stop` or an
//! OS signal). Shutdown removes the handshake, releases the engine, clears
//! storage again and, if asked, respawns a fresh daemon.

use std::future::IntoFuture;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::routes::{build_router, AppState};
use crate::context::AppContext;
use crate::engine::TorrentEngine;
use crate::handshake::{Handshake, HandshakeError, HandshakeFile};
use crate::process::{CommandLine, LaunchError, ProcessSupervisor};

/// How long open connections (streams, mostly) may linger after a stop request
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Errors that can occur in the daemon server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("Failed to prepare storage directory {path:?}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("A daemon is already running at {0}")]
    AlreadyRunning(String),

    #[error("Failed to respawn daemon: {0}")]
    Respawn(#[from] LaunchError),
}

/// How the serving loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Stopped,
    /// A replacement daemon was spawned
    Restarted,
}

/// Daemon server state
pub struct DaemonServer {
    ctx: AppContext,
    engine: Arc<dyn TorrentEngine>,
    processes: Arc<dyn ProcessSupervisor>,
    shutdown: CancellationToken,
}

impl DaemonServer {
    pub fn new(
        ctx: AppContext,
        engine: Arc<dyn TorrentEngine>,
        processes: Arc<dyn ProcessSupervisor>,
    ) -> Self {
        Self {
            ctx,
            engine,
            processes,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the daemon when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn handshake_file(&self) -> HandshakeFile {
        HandshakeFile::new(&self.ctx.paths.handshake_file)
    }

    /// Run the daemon until it is told to stop
    pub async fn run(self) -> Result<ShutdownOutcome, ServerError> {
        let handshake_file = self.handshake_file();
        if let Some(existing) = handshake_file.live().await {
            return Err(ServerError::AlreadyRunning(existing.url));
        }

        let storage_dir = self.ctx.paths.storage_dir.clone();
        reset_storage(&storage_dir)?;

        let port = self.ctx.config.port;
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|source| ServerError::Bind { port, source })?;
        let port = listener.local_addr()?.port();
        let url = format!("http://127.0.0.1:{}", port);

        let state = Arc::new(AppState::new(
            &self.ctx.config,
            Arc::clone(&self.engine),
            Arc::clone(&self.processes),
            url.clone(),
            self.shutdown.clone(),
        ));
        let app = build_router(Arc::clone(&state));

        handshake_file.save(&Handshake::new(std::process::id(), &url))?;
        info!("Server running at {}", url);

        let signal_token = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown_signal() => {
                    info!("Received OS signal, stopping daemon");
                    signal_token.cancel();
                }
                _ = signal_token.cancelled() => {}
            }
        });

        let graceful = self.shutdown.clone();
        let server = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { graceful.cancelled().await })
        .into_future();

        let drain = self.shutdown.clone();
        tokio::select! {
            result = server => {
                if let Err(e) = result {
                    error!("HTTP server error: {}", e);
                }
            }
            _ = async {
                drain.cancelled().await;
                tokio::time::sleep(SHUTDOWN_GRACE).await;
            } => {
                warn!("Connections still open after {:?}, closing them", SHUTDOWN_GRACE);
            }
        }

        info!("Received shutdown signal, stopping daemon");
        if let Err(e) = handshake_file.delete() {
            warn!("Failed to remove handshake file: {}", e);
        }
        self.engine.close().await;
        if let Err(e) = reset_storage(&storage_dir) {
            warn!("Failed to clear storage directory: {}", e);
        }

        if state.restart_requested() {
            let command = CommandLine {
                program: self.ctx.paths.executable.to_string_lossy().into_owned(),
                args: vec!["serve".to_string()],
            };
            let pid = self.processes.spawn_detached(&command)?;
            info!("Daemon restarted as PID {}", pid);
            return Ok(ShutdownOutcome::Restarted);
        }

        info!("Daemon stopped");
        Ok(ShutdownOutcome::Stopped)
    }
}

/// Wipe and recreate the storage directory
///
/// No daemon ever serves from another instance's partial downloads.
pub fn reset_storage(path: &Path) -> Result<(), ServerError> {
    let storage_err = |source| ServerError::Storage {
        path: path.to_path_buf(),
        source,
    };

    match std::fs::remove_dir_all(path) {
        Ok(()) => debug!("Cleared storage directory {:?}", path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(storage_err(e)),
    }
    std::fs::create_dir_all(path).map_err(storage_err)
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
