//! Tests for locating a daemon through the handshake file.
//!
//! A minimal axum app stands in for the daemon's health endpoint so the health check
//! can be flipped between healthy and failing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use tori::handshake::{Handshake, HandshakeError, HandshakeFile, HEALTH_PATH};

struct FakeDaemon {
    url: String,
    healthy: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl FakeDaemon {
    async fn start() -> Self {
        let healthy = Arc::new(AtomicBool::new(true));
        let app = Router::new()
            .route(
                HEALTH_PATH,
                get(|State(healthy): State<Arc<AtomicBool>>| async move {
                    if healthy.load(Ordering::SeqCst) {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                }),
            )
            .with_state(Arc::clone(&healthy));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
                .unwrap();
        });

        Self {
            url,
            healthy,
            shutdown,
        }
    }
}

impl Drop for FakeDaemon {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[tokio::test]
async fn test_exists_follows_daemon_health() {
    let temp_dir = TempDir::new().unwrap();
    let file = HandshakeFile::new(temp_dir.path().join(".session"));
    assert!(!file.exists().await);

    let daemon = FakeDaemon::start().await;
    let handshake = Handshake::new(4242, &daemon.url);
    file.save(&handshake).unwrap();

    assert!(file.exists().await);
    assert_eq!(file.live().await, Some(handshake.clone()));

    // The record stays on disk but no longer counts
    daemon.healthy.store(false, Ordering::SeqCst);
    assert!(!file.exists().await);
    assert_eq!(file.load().unwrap(), Some(handshake));

    daemon.healthy.store(true, Ordering::SeqCst);
    assert!(file.exists().await);

    file.delete().unwrap();
    assert!(!file.exists().await);
}

#[tokio::test]
async fn test_garbage_handshake_is_not_live() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join(".session");
    std::fs::write(&path, "{not json").unwrap();

    let file = HandshakeFile::new(&path);
    assert!(!file.exists().await);
    assert!(matches!(file.load(), Err(HandshakeError::Json(_))));
}

#[tokio::test]
async fn test_wait_sees_late_writer() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join(".session");
    let file = HandshakeFile::new(&path);

    let writer = HandshakeFile::new(&path);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        writer
            .save(&Handshake::new(77, "http://127.0.0.1:8000"))
            .unwrap();
    });

    let handshake = file.wait(Duration::from_secs(5)).await.unwrap();
    assert_eq!(handshake, Handshake::new(77, "http://127.0.0.1:8000"));
}

#[tokio::test]
async fn test_wait_is_bounded() {
    let temp_dir = TempDir::new().unwrap();
    let file = HandshakeFile::new(temp_dir.path().join(".session"));

    let start = Instant::now();
    let result = file.wait(Duration::from_millis(300)).await;

    assert!(matches!(result, Err(HandshakeError::Timeout(_))));
    assert!(start.elapsed() >= Duration::from_millis(300));
    assert!(start.elapsed() < Duration::from_secs(3));
}
