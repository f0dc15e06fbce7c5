//! In-memory torrent engine.
//!
//! Torrents are registered up front under the URI that resolves them, with
//! their file contents held in memory. Every priority change, reader and drop
//! is recorded so callers can inspect what the daemon asked for.

use async_trait::async_trait;
use bytes::Bytes;
use md5::{Digest, Md5};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

use super::{
    contiguous_layout, EngineError, EngineResult, FileReader, FileRef, Priority, ReaderOptions, TorrentEngine,
    TorrentFile, TorrentHandle, TorrentUri,
};

/// Default piece length (256 KiB)
pub const DEFAULT_PIECE_LENGTH: u64 = 256 * 1024;

/// Content of one torrent
#[derive(Debug, Clone)]
pub struct MemoryTorrent {
    name: String,
    info_hash: String,
    files: Vec<(String, Bytes)>,
    metadata_ready: bool,
}

impl MemoryTorrent {
    /// Create an empty torrent; its identity is derived from the name
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let info_hash = hex::encode(Md5::digest(name.as_bytes()));
        Self {
            name,
            info_hash,
            files: Vec::new(),
            metadata_ready: true,
        }
    }

    /// Append a file
    pub fn file(mut self, path: impl Into<String>, data: impl Into<Bytes>) -> Self {
        self.files.push((path.into(), data.into()));
        self
    }

    /// Metadata for this torrent never arrives
    pub fn without_metadata(mut self) -> Self {
        self.metadata_ready = false;
        self
    }

    pub fn info_hash(&self) -> &str {
        &self.info_hash
    }

    fn handle(&self) -> TorrentHandle {
        TorrentHandle {
            info_hash: self.info_hash.clone(),
            name: self.name.clone(),
        }
    }

    fn layout(&self, piece_length: u64) -> Vec<TorrentFile> {
        contiguous_layout(
            self.files
                .iter()
                .map(|(path, data)| (path.clone(), data.len() as u64)),
            piece_length,
        )
    }
}

#[derive(Debug)]
struct ActiveTorrent {
    torrent: MemoryTorrent,
    file_priorities: HashMap<usize, Priority>,
    piece_priorities: HashMap<u32, Priority>,
}

/// Engine that serves registered torrents from memory
#[derive(Debug)]
pub struct MemoryEngine {
    piece_length: u64,
    catalog: Mutex<HashMap<String, MemoryTorrent>>,
    active: Mutex<HashMap<String, ActiveTorrent>>,
    readers: Mutex<Vec<(FileRef, ReaderOptions)>>,
    dropped: Mutex<Vec<(String, bool)>>,
    closed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::with_piece_length(DEFAULT_PIECE_LENGTH)
    }

    pub fn with_piece_length(piece_length: u64) -> Self {
        Self {
            piece_length: piece_length.max(1),
            catalog: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            readers: Mutex::new(Vec::new()),
            dropped: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Make `torrent` resolvable through `uri`
    pub fn insert(&self, uri: impl Into<String>, torrent: MemoryTorrent) {
        lock(&self.catalog).insert(uri.into(), torrent);
    }

    /// Last priority requested for a file
    pub fn file_priority(&self, file: &FileRef) -> Option<Priority> {
        lock(&self.active)
            .get(&file.torrent.info_hash)
            .and_then(|t| t.file_priorities.get(&file.index).copied())
    }

    /// Last priority requested for a piece
    pub fn piece_priority(&self, info_hash: &str, piece: u32) -> Option<Priority> {
        lock(&self.active)
            .get(info_hash)
            .and_then(|t| t.piece_priorities.get(&piece).copied())
    }

    /// Whether the torrent is currently held by the engine
    pub fn is_active(&self, info_hash: &str) -> bool {
        lock(&self.active).contains_key(info_hash)
    }

    /// Dropped torrents as `(info_hash, delete_data)`, in drop order
    pub fn dropped(&self) -> Vec<(String, bool)> {
        lock(&self.dropped).clone()
    }

    /// Options of every reader opened so far
    pub fn opened_readers(&self) -> Vec<(FileRef, ReaderOptions)> {
        lock(&self.readers).clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn with_active<R>(
        &self,
        info_hash: &str,
        f: impl FnOnce(&mut ActiveTorrent) -> EngineResult<R>,
    ) -> EngineResult<R> {
        let mut active = lock(&self.active);
        let torrent = active
            .get_mut(info_hash)
            .ok_or_else(|| EngineError::UnknownTorrent(info_hash.to_string()))?;
        f(torrent)
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TorrentEngine for MemoryEngine {
    async fn resolve(&self, uri: &TorrentUri) -> EngineResult<TorrentHandle> {
        let torrent = lock(&self.catalog)
            .get(uri.as_str())
            .cloned()
            .ok_or_else(|| EngineError::Unresolvable(uri.to_string()))?;

        let handle = torrent.handle();
        lock(&self.active)
            .entry(torrent.info_hash.clone())
            .or_insert_with(|| ActiveTorrent {
                torrent,
                file_priorities: HashMap::new(),
                piece_priorities: HashMap::new(),
            });

        debug!("Resolved {} to {}", uri, handle.info_hash);
        Ok(handle)
    }

    async fn wait_for_metadata(&self, torrent: &TorrentHandle) -> EngineResult<()> {
        let ready = self.with_active(&torrent.info_hash, |t| Ok(t.torrent.metadata_ready))?;
        if !ready {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    fn files(&self, torrent: &TorrentHandle) -> EngineResult<Vec<TorrentFile>> {
        let piece_length = self.piece_length;
        self.with_active(&torrent.info_hash, |t| {
            if !t.torrent.metadata_ready {
                return Err(EngineError::MetadataPending);
            }
            Ok(t.torrent.layout(piece_length))
        })
    }

    async fn set_file_priority(&self, file: &FileRef, priority: Priority) -> EngineResult<()> {
        self.with_active(&file.torrent.info_hash, |t| {
            if file.index >= t.torrent.files.len() {
                return Err(EngineError::UnknownFile {
                    info_hash: file.torrent.info_hash.clone(),
                    index: file.index,
                });
            }
            t.file_priorities.insert(file.index, priority);
            Ok(())
        })
    }

    async fn set_piece_priority(
        &self,
        torrent: &TorrentHandle,
        piece: u32,
        priority: Priority,
    ) -> EngineResult<()> {
        self.with_active(&torrent.info_hash, |t| {
            t.piece_priorities.insert(piece, priority);
            Ok(())
        })
    }

    async fn open_reader(
        &self,
        file: &FileRef,
        options: ReaderOptions,
    ) -> EngineResult<Box<dyn FileReader>> {
        let data = self.with_active(&file.torrent.info_hash, |t| {
            t.torrent
                .files
                .get(file.index)
                .map(|(_, data)| data.clone())
                .ok_or_else(|| EngineError::UnknownFile {
                    info_hash: file.torrent.info_hash.clone(),
                    index: file.index,
                })
        })?;

        lock(&self.readers).push((file.clone(), options));
        Ok(Box::new(Cursor::new(data)))
    }

    async fn drop_torrent(&self, torrent: &TorrentHandle, delete_data: bool) -> EngineResult<()> {
        lock(&self.active).remove(&torrent.info_hash);
        lock(&self.dropped).push((torrent.info_hash.clone(), delete_data));
        debug!("Dropped torrent {}", torrent.info_hash);
        Ok(())
    }

    async fn close(&self) {
        lock(&self.active).clear();
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncSeekExt};

    const URI: &str = "magnet:?xt=urn:btih:memory";

    fn engine_with_sample() -> MemoryEngine {
        let engine = MemoryEngine::with_piece_length(4);
        engine.insert(
            URI,
            MemoryTorrent::new("sample")
                .file("a.mkv", &b"0123456789"[..])
                .file("b.txt", &b"xy"[..]),
        );
        engine
    }

    #[tokio::test]
    async fn test_resolve_unknown_uri() {
        let engine = MemoryEngine::new();
        let uri = TorrentUri::parse("magnet:?xt=urn:btih:nope").unwrap();
        let result = engine.resolve(&uri).await;
        assert!(matches!(result, Err(EngineError::Unresolvable(_))));
    }

    #[tokio::test]
    async fn test_piece_layout() {
        let engine = engine_with_sample();
        let handle = engine.resolve(&TorrentUri::parse(URI).unwrap()).await.unwrap();
        engine.wait_for_metadata(&handle).await.unwrap();

        let files = engine.files(&handle).unwrap();
        assert_eq!(files.len(), 2);
        // bytes 0..10 -> pieces 0,1,2
        assert_eq!((files[0].first_piece, files[0].end_piece), (0, 3));
        // bytes 10..12 -> piece 2
        assert_eq!((files[1].first_piece, files[1].end_piece), (2, 3));
    }

    #[tokio::test]
    async fn test_reader_seeks() {
        let engine = engine_with_sample();
        let handle = engine.resolve(&TorrentUri::parse(URI).unwrap()).await.unwrap();
        let file = FileRef {
            torrent: handle,
            index: 0,
        };

        let mut reader = engine
            .open_reader(&file, ReaderOptions::for_streaming(10))
            .await
            .unwrap();
        reader.seek(std::io::SeekFrom::Start(6)).await.unwrap();
        let mut rest = String::new();
        reader.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "6789");
        assert_eq!(engine.opened_readers().len(), 1);
    }

    #[tokio::test]
    async fn test_pending_metadata() {
        let engine = MemoryEngine::new();
        engine.insert(URI, MemoryTorrent::new("slow").without_metadata());
        let handle = engine.resolve(&TorrentUri::parse(URI).unwrap()).await.unwrap();

        assert!(matches!(engine.files(&handle), Err(EngineError::MetadataPending)));
        let waited = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            engine.wait_for_metadata(&handle),
        )
        .await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_drop_and_close() {
        let engine = engine_with_sample();
        let handle = engine.resolve(&TorrentUri::parse(URI).unwrap()).await.unwrap();
        assert!(engine.is_active(&handle.info_hash));

        engine.drop_torrent(&handle, true).await.unwrap();
        assert!(!engine.is_active(&handle.info_hash));
        assert_eq!(engine.dropped(), vec![(handle.info_hash.clone(), true)]);

        engine.close().await;
        assert!(engine.is_closed());
    }
}
