//! HTTP control and data plane of the daemon.

use axum::{
    extract::{ConnectInfo, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use super::protocol::{
    stream_url, AddParams, AddResponse, EntrySummary, FileParams, HealthResponse, ListResponse,
    MessageResponse, StopParams, ADD_PATH, DEL_PATH, DOWNLOAD_PATH, LIST_PATH, PLAY_PATH,
    STOP_PATH, STREAM_PATH,
};
use super::stream::{serve_range, StreamError};
use crate::config::Config;
use crate::engine::{EngineError, Priority, ReaderOptions, TorrentEngine, TorrentUri, UriError};
use crate::handshake::HEALTH_PATH;
use crate::process::{CommandLine, LaunchError, ProcessSupervisor};
use crate::registry::{ContentEntry, ContentId, ContentRegistry};
use crate::scheduler::{ReadinessScheduler, SchedulerError};

/// Errors a request handler can end with
///
/// All of them are answered to the caller; none of them stop the daemon.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("{0}")]
    BadUri(#[from] UriError),

    #[error("No valid files")]
    NoEligibleFiles,

    #[error("Failed to add torrent: {0}")]
    AddFailed(EngineError),

    #[error("Timed out after {0:?} waiting for torrent metadata")]
    MetadataTimeout(Duration),

    #[error("Missing file id")]
    MissingId,

    #[error("File not found")]
    NotFound(ContentId),

    #[error("Only local callers may use this endpoint")]
    Unauthorized,

    #[error("Engine error: {0}")]
    Engine(EngineError),

    #[error("Failed to start playback: {0}")]
    Launch(#[from] LaunchError),

    #[error("Failed to stream file: {0}")]
    Stream(#[from] StreamError),
}

impl From<SchedulerError> for ControlError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::NoEligibleFiles => ControlError::NoEligibleFiles,
            SchedulerError::Engine(e) => ControlError::AddFailed(e),
        }
    }
}

impl ControlError {
    pub fn status(&self) -> StatusCode {
        match self {
            ControlError::BadUri(_)
            | ControlError::NoEligibleFiles
            | ControlError::AddFailed(_)
            | ControlError::MissingId => StatusCode::BAD_REQUEST,
            ControlError::MetadataTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ControlError::NotFound(_) => StatusCode::NOT_FOUND,
            ControlError::Unauthorized => StatusCode::UNAUTHORIZED,
            ControlError::Engine(_) | ControlError::Launch(_) | ControlError::Stream(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!("Request failed: {}", self);
        } else {
            debug!("Request rejected: {}", self);
        }
        (status, Json(MessageResponse::new(self.to_string()))).into_response()
    }
}

/// Shared daemon state.
pub struct AppState {
    pub registry: ContentRegistry,
    pub scheduler: ReadinessScheduler,
    pub engine: Arc<dyn TorrentEngine>,
    pub processes: Arc<dyn ProcessSupervisor>,
    /// Player command line
    pub playback: Vec<String>,
    /// This daemon's own URL, used to build stream URLs
    pub base_url: String,
    pub metadata_timeout: Option<Duration>,
    pub shutdown: CancellationToken,
    restart: AtomicBool,
}

impl AppState {
    pub fn new(
        config: &Config,
        engine: Arc<dyn TorrentEngine>,
        processes: Arc<dyn ProcessSupervisor>,
        base_url: impl Into<String>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry: ContentRegistry::new(),
            scheduler: ReadinessScheduler::new(config.allowed_extensions()),
            engine,
            processes,
            playback: config.playback.clone(),
            base_url: base_url.into(),
            metadata_timeout: config.metadata_timeout(),
            shutdown,
            restart: AtomicBool::new(false),
        }
    }

    /// Ask the serving loop to stop, optionally respawning afterwards
    pub fn request_shutdown(&self, restart: bool) {
        if restart {
            self.restart.store(true, Ordering::SeqCst);
        }
        self.shutdown.cancel();
    }

    pub fn restart_requested(&self) -> bool {
        self.restart.load(Ordering::SeqCst)
    }

    fn entry(&self, params: &FileParams) -> Result<ContentEntry, ControlError> {
        let id = params.content_id().ok_or(ControlError::MissingId)?;
        self.registry.get(&id).ok_or(ControlError::NotFound(id))
    }
}

/// Whether `addr` is this machine, including IPv4-mapped IPv6 loopback
pub fn is_loopback(addr: &SocketAddr) -> bool {
    match addr.ip() {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map_or(v6.is_loopback(), |v4| v4.is_loopback()),
    }
}

fn require_loopback(addr: &SocketAddr) -> Result<(), ControlError> {
    if is_loopback(addr) {
        Ok(())
    } else {
        warn!("Rejected privileged request from {}", addr);
        Err(ControlError::Unauthorized)
    }
}

/// Build the router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(HEALTH_PATH, get(health_handler))
        .route(STOP_PATH, get(stop_handler))
        .route(ADD_PATH, get(add_handler))
        .route(DEL_PATH, get(del_handler))
        .route(PLAY_PATH, get(play_handler))
        .route(DOWNLOAD_PATH, get(download_handler))
        .route(STREAM_PATH, get(stream_handler))
        .route(LIST_PATH, get(list_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        message: "tori".to_string(),
        pid: std::process::id(),
    })
}

async fn stop_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<StopParams>,
) -> Result<Json<MessageResponse>, ControlError> {
    require_loopback(&addr)?;

    let restart = params.restart_requested();
    info!("Stop requested by {} (restart={})", addr, restart);
    state.request_shutdown(restart);

    let message = if restart {
        "Restarting server..."
    } else {
        "Stopping server..."
    };
    Ok(Json(MessageResponse::new(message)))
}

async fn add_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AddParams>,
) -> Result<Json<AddResponse>, ControlError> {
    let uri = TorrentUri::parse(params.uri.as_deref().unwrap_or_default())?;

    // Magnet resolution may itself fetch metadata, so one deadline covers both steps
    let deadline = state
        .metadata_timeout
        .map(|limit| (tokio::time::Instant::now() + limit, limit));

    let resolving = state.engine.resolve(&uri);
    let resolved = match deadline {
        Some((at, limit)) => tokio::time::timeout_at(at, resolving)
            .await
            .map_err(|_| ControlError::MetadataTimeout(limit))?,
        None => resolving.await,
    };
    let torrent = resolved.map_err(ControlError::AddFailed)?;

    info!("Loading torrent info for {}", torrent.info_hash);
    let metadata = state.engine.wait_for_metadata(&torrent);
    let waited = match deadline {
        Some((at, limit)) => tokio::time::timeout_at(at, metadata)
            .await
            .map_err(|_| limit),
        None => Ok(metadata.await),
    };

    match waited {
        Ok(result) => result.map_err(ControlError::AddFailed)?,
        Err(limit) => {
            if !state.registry.has_torrent(&torrent.info_hash) {
                if let Err(e) = state.engine.drop_torrent(&torrent, true).await {
                    warn!("Failed to drop stalled torrent {}: {}", torrent.info_hash, e);
                }
            }
            return Err(ControlError::MetadataTimeout(limit));
        }
    }

    let files = state
        .engine
        .files(&torrent)
        .map_err(ControlError::AddFailed)?;

    let existing = state.registry.find_existing(&torrent, &files);
    if !existing.is_empty() {
        debug!("Torrent {} already added", torrent.info_hash);
        return Ok(Json(AddResponse {
            message: "Torrent already added".to_string(),
            ids: existing,
        }));
    }

    let eligible = state
        .scheduler
        .prepare(state.engine.as_ref(), &torrent, &files)
        .await?;

    let ids: Vec<ContentId> = eligible
        .iter()
        .map(|file| state.registry.add(&torrent, file).id)
        .collect();

    info!(
        "Torrent added: {} ({} of {} files streamable)",
        torrent.name,
        ids.len(),
        files.len()
    );

    Ok(Json(AddResponse {
        message: "Torrent added".to_string(),
        ids,
    }))
}

/// Deprioritize the file and forget it; the torrent goes once none of its files remain
async fn del_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<FileParams>,
) -> Result<Json<MessageResponse>, ControlError> {
    let id = params.content_id().ok_or(ControlError::MissingId)?;
    let entry = state
        .registry
        .remove(&id)
        .ok_or_else(|| ControlError::NotFound(id.clone()))?;

    if let Err(e) = state
        .engine
        .set_file_priority(&entry.file, Priority::None)
        .await
    {
        warn!("Failed to deprioritize {}: {}", entry.display_name, e);
    }

    let torrent = &entry.file.torrent;
    if !state.registry.has_torrent(&torrent.info_hash) {
        info!("Last file of {} removed, dropping torrent", torrent.name);
        if let Err(e) = state.engine.drop_torrent(torrent, true).await {
            warn!("Failed to drop torrent {}: {}", torrent.info_hash, e);
        }
    }

    Ok(Json(MessageResponse::new(format!(
        "Removed {}",
        entry.display_name
    ))))
}

async fn play_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<FileParams>,
) -> Result<Json<MessageResponse>, ControlError> {
    require_loopback(&addr)?;
    let entry = state.entry(&params)?;

    let command = CommandLine::from_config(&state.playback, "playback")?
        .with_args([stream_url(&state.base_url, &entry.id)]);
    let pid = state.processes.spawn_detached(&command)?;

    Ok(Json(MessageResponse::new(format!(
        "Started playback of {} with PID {}",
        entry.display_name, pid
    ))))
}

async fn download_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<FileParams>,
) -> Result<Json<MessageResponse>, ControlError> {
    let entry = state.entry(&params)?;

    state
        .engine
        .set_file_priority(&entry.file, Priority::Normal)
        .await
        .map_err(ControlError::Engine)?;

    info!("Downloading {} in full", entry.display_name);
    Ok(Json(MessageResponse::new(format!(
        "Downloading {}",
        entry.display_name
    ))))
}

async fn stream_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<FileParams>,
    headers: HeaderMap,
) -> Result<Response, ControlError> {
    let entry = state.entry(&params)?;

    let reader = state
        .engine
        .open_reader(&entry.file, ReaderOptions::for_streaming(entry.length))
        .await
        .map_err(ControlError::Engine)?;

    let range = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
    debug!("Streaming {} (range {:?})", entry.display_name, range);

    Ok(serve_range(reader, &entry.display_name, entry.length, range).await?)
}

async fn list_handler(State(state): State<Arc<AppState>>) -> Json<ListResponse> {
    let entries: Vec<EntrySummary> = state
        .registry
        .list()
        .into_iter()
        .map(|entry| EntrySummary {
            url: stream_url(&state.base_url, &entry.id),
            id: entry.id,
            name: entry.display_name,
            added_at: entry.added_at,
            length: entry.length,
        })
        .collect();

    Json(ListResponse {
        message: format!("{} files", entries.len()),
        entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_loopback() {
        assert!(is_loopback(&"127.0.0.1:5000".parse().unwrap()));
        assert!(is_loopback(&"[::1]:5000".parse().unwrap()));
        assert!(is_loopback(&"[::ffff:127.0.0.1]:5000".parse().unwrap()));
        assert!(!is_loopback(&"192.168.1.20:5000".parse().unwrap()));
        assert!(!is_loopback(&"[::ffff:10.0.0.1]:5000".parse().unwrap()));
    }

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            ControlError::BadUri(UriError::Unsupported).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ControlError::NoEligibleFiles.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ControlError::NotFound(ContentId::from_param("x")).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(ControlError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            ControlError::MetadataTimeout(Duration::from_secs(1)).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_scheduler_error_conversion() {
        let err: ControlError = SchedulerError::NoEligibleFiles.into();
        assert!(matches!(err, ControlError::NoEligibleFiles));
    }

    #[test]
    fn test_request_shutdown() {
        let state = AppState::new(
            &Config::default(),
            Arc::new(crate::engine::MemoryEngine::new()),
            Arc::new(crate::process::RecordingProcesses::new()),
            "http://localhost:1",
            CancellationToken::new(),
        );
        assert!(!state.restart_requested());

        state.request_shutdown(true);
        assert!(state.shutdown.is_cancelled());
        assert!(state.restart_requested());
    }
}
