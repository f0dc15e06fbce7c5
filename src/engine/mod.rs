//! Torrent engine capability interface
//!
//! Fetching torrent content from peers is the engine's business. The daemon only
//! needs to resolve a URI, wait for metadata, enumerate files, steer fetch
//! priorities and read file bytes, so that is all this trait exposes.

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncSeek};

mod memory;
mod rqbit;

pub use memory::{MemoryEngine, MemoryTorrent};
pub use rqbit::RqbitEngine;

/// Error types for engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Unable to resolve torrent: {0}")]
    Unresolvable(String),

    #[error("Unknown torrent: {0}")]
    UnknownTorrent(String),

    #[error("Unknown file {index} in torrent {info_hash}")]
    UnknownFile { info_hash: String, index: usize },

    #[error("Torrent metadata is not available yet")]
    MetadataPending,

    #[error("Engine IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors from validating a user supplied URI
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UriError {
    #[error("Missing URI")]
    Missing,

    #[error("Unsupported URI format")]
    Unsupported,
}

/// A reference to torrent content the engine can resolve
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TorrentUri {
    /// `magnet:` link
    Magnet(String),
    /// Path or URL of a `.torrent` file
    TorrentFile(String),
}

impl TorrentUri {
    /// Validate a raw URI
    pub fn parse(raw: &str) -> Result<Self, UriError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(UriError::Missing);
        }

        if raw.starts_with("magnet:") {
            Ok(TorrentUri::Magnet(raw.to_string()))
        } else if raw.ends_with(".torrent") {
            Ok(TorrentUri::TorrentFile(raw.to_string()))
        } else {
            Err(UriError::Unsupported)
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            TorrentUri::Magnet(s) | TorrentUri::TorrentFile(s) => s,
        }
    }
}

impl fmt::Display for TorrentUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle to a torrent owned by the engine
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TorrentHandle {
    /// Hex encoded torrent identity
    pub info_hash: String,
    pub name: String,
}

/// Non-owning reference to one file of a torrent
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileRef {
    pub torrent: TorrentHandle,
    pub index: usize,
}

/// A file inside a torrent, as listed by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    pub index: usize,
    /// Path within the torrent, `/` separated
    pub path: String,
    pub length: u64,
    /// Piece holding the first byte
    pub first_piece: u32,
    /// One past the piece holding the last byte
    pub end_piece: u32,
}

impl TorrentFile {
    /// Piece holding the last byte
    pub fn last_piece(&self) -> u32 {
        self.end_piece.saturating_sub(1).max(self.first_piece)
    }

    pub fn file_ref(&self, torrent: &TorrentHandle) -> FileRef {
        FileRef {
            torrent: torrent.clone(),
            index: self.index,
        }
    }
}

/// Lay files out back to back over fixed-size pieces, in the given order
pub fn contiguous_layout(
    files: impl IntoIterator<Item = (String, u64)>,
    piece_length: u64,
) -> Vec<TorrentFile> {
    let piece_length = piece_length.max(1);
    let mut offset = 0u64;
    files
        .into_iter()
        .enumerate()
        .map(|(index, (path, length))| {
            let first_piece = (offset / piece_length) as u32;
            let end_piece = if length == 0 {
                first_piece
            } else {
                ((offset + length - 1) / piece_length) as u32 + 1
            };
            offset += length;
            TorrentFile {
                index,
                path,
                length,
                first_piece,
                end_piece,
            }
        })
        .collect()
}

/// Fetch priority levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Do not fetch
    None,
    Normal,
    /// Fetch before anything else
    Now,
}

/// How a reader should drive the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderOptions {
    /// Bytes to fetch ahead of the read position
    pub readahead: u64,
    /// Prefer latency over throughput for pieces under the reader
    pub responsive: bool,
}

impl ReaderOptions {
    /// Streaming defaults for a file of `length` bytes: 1% read-ahead, responsive
    pub fn for_streaming(length: u64) -> Self {
        Self {
            readahead: length / 100,
            responsive: true,
        }
    }
}

/// Random access reader over a torrent file
pub trait FileReader: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T: AsyncRead + AsyncSeek + Send + Unpin> FileReader for T {}

/// Capabilities the daemon needs from a torrent engine
#[async_trait]
pub trait TorrentEngine: Send + Sync {
    /// Add content by URI and return its handle
    async fn resolve(&self, uri: &TorrentUri) -> EngineResult<TorrentHandle>;

    /// Block until the torrent's metadata (file list, piece layout) is known
    async fn wait_for_metadata(&self, torrent: &TorrentHandle) -> EngineResult<()>;

    /// Files of a torrent whose metadata is known
    fn files(&self, torrent: &TorrentHandle) -> EngineResult<Vec<TorrentFile>>;

    async fn set_file_priority(&self, file: &FileRef, priority: Priority) -> EngineResult<()>;

    async fn set_piece_priority(
        &self,
        torrent: &TorrentHandle,
        piece: u32,
        priority: Priority,
    ) -> EngineResult<()>;

    /// Open a reader over a file's bytes
    async fn open_reader(
        &self,
        file: &FileRef,
        options: ReaderOptions,
    ) -> EngineResult<Box<dyn FileReader>>;

    /// Release a torrent, optionally deleting what was downloaded
    async fn drop_torrent(&self, torrent: &TorrentHandle, delete_data: bool) -> EngineResult<()>;

    /// Release every torrent and stop the engine
    async fn close(&self);
}
