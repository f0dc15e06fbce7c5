//! tori streams magnet links and torrent files into a media player.
//!
//! A long-lived daemon owns the torrent engine and serves files over HTTP while
//! they download. Short-lived front-end invocations locate (or start) the
//! daemon through a handshake file, ask it to add content and hand the stream
//! URLs to the configured player.

pub mod config;
pub mod context;
pub mod daemon;
pub mod engine;
pub mod handshake;
pub mod logging;
pub mod process;
pub mod registry;
pub mod scheduler;
pub mod supervisor;
