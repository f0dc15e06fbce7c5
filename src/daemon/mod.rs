//! The long-lived daemon process
//!
//! The daemon owns the torrent engine and the content registry, and exposes
//! them over a small HTTP control plane. Front-end invocations find it through
//! the handshake file and talk to it with [`client::DaemonClient`].

pub mod client;
pub mod protocol;
pub mod routes;
pub mod server;
pub mod stream;

pub use client::{ClientError, DaemonClient};
pub use routes::{build_router, AppState, ControlError};
pub use server::{DaemonServer, ServerError, ShutdownOutcome};
