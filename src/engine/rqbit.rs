//! Torrent engine backed by a librqbit session.
//!
//! One session rooted at the daemon's storage directory owns every torrent.
//! rqbit fetches the pieces its open streams are waiting on first, so piece
//! priorities are expressed by parking a one-byte read on the piece.

use async_trait::async_trait;
use librqbit::api::{Api, TorrentIdOrHash};
use librqbit::{AddTorrent, AddTorrentOptions, AddTorrentResponse, ManagedTorrent, Session};
use std::collections::{HashMap, HashSet};
use std::io::SeekFrom;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncReadExt, AsyncSeekExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    contiguous_layout, EngineError, EngineResult, FileReader, FileRef, Priority, ReaderOptions,
    TorrentEngine, TorrentFile, TorrentHandle, TorrentUri,
};

/// Smallest read-ahead buffer handed to a stream
const MIN_READAHEAD: u64 = 64 * 1024;

/// Largest read-ahead buffer handed to a stream
const MAX_READAHEAD: u64 = 16 * 1024 * 1024;

struct ActiveTorrent {
    id: usize,
    handle: Arc<ManagedTorrent>,
    /// Files rqbit should fetch; `None` until the first priority change
    selected: Option<HashSet<usize>>,
    /// Background reads holding prioritized pieces
    pullers: Vec<JoinHandle<()>>,
}

impl ActiveTorrent {
    fn abort_pullers(&mut self) {
        for puller in self.pullers.drain(..) {
            puller.abort();
        }
    }
}

/// Engine that downloads from the swarm through librqbit
pub struct RqbitEngine {
    session: Arc<Session>,
    api: Api,
    active: Mutex<HashMap<String, ActiveTorrent>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn backend(err: impl std::fmt::Display) -> EngineError {
    EngineError::Backend(anyhow::anyhow!("{:#}", err))
}

/// What rqbit is asked to add for a URI
fn add_source(uri: &TorrentUri) -> EngineResult<AddTorrent<'static>> {
    match uri {
        TorrentUri::Magnet(link) => Ok(AddTorrent::from_url(link.clone())),
        TorrentUri::TorrentFile(url)
            if url.starts_with("http://") || url.starts_with("https://") =>
        {
            Ok(AddTorrent::from_url(url.clone()))
        }
        TorrentUri::TorrentFile(path) => AddTorrent::from_local_filename(path)
            .map_err(|e| EngineError::Unresolvable(format!("{}: {:#}", path, e))),
    }
}

/// Torrent paths use `/` whatever the platform
fn torrent_path(name: &str) -> String {
    name.replace('\\', "/")
}

/// File and in-file byte offset where `piece` starts
///
/// Files that are not selected are skipped. A piece shared by two files maps
/// to the first selected file that overlaps it.
fn piece_position(
    files: &[TorrentFile],
    piece_length: u64,
    piece: u32,
    selected: Option<&HashSet<usize>>,
) -> Option<(usize, u64)> {
    let piece_start = u64::from(piece) * piece_length;
    let mut offset = 0u64;
    for file in files {
        let start = offset;
        offset += file.length;
        let wanted = selected.map_or(true, |s| s.contains(&file.index));
        if wanted && file.first_piece <= piece && piece < file.end_piece {
            return Some((file.index, piece_start.saturating_sub(start)));
        }
    }
    None
}

impl RqbitEngine {
    /// Start a session that stores downloads under `storage_dir`
    pub async fn new(storage_dir: &Path) -> EngineResult<Self> {
        tokio::fs::create_dir_all(storage_dir).await?;
        let session = Session::new(storage_dir.to_path_buf()).await?;
        let api = Api::new(session.clone(), None);
        info!("Torrent session started in {}", storage_dir.display());

        Ok(Self {
            session,
            api,
            active: Mutex::new(HashMap::new()),
        })
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

    /// Piece length and file list from the torrent's metadata
    fn layout(handle: &ManagedTorrent) -> EngineResult<(u64, Vec<TorrentFile>)> {
        let meta = handle.metadata.load();
        let meta = meta.as_ref().ok_or(EngineError::MetadataPending)?;
        let piece_length = u64::from(meta.lengths.default_piece_length());

        let details = meta.info.iter_file_details().map_err(backend)?;
        let files: Vec<(String, u64)> = details
            .enumerate()
            .map(|(index, file)| {
                let name = file
                    .filename
                    .to_string()
                    .unwrap_or_else(|_| format!("file-{}", index));
                (torrent_path(&name), file.len)
            })
            .collect();

        Ok((piece_length, contiguous_layout(files, piece_length)))
    }
}

#[async_trait]
impl TorrentEngine for RqbitEngine {
    async fn resolve(&self, uri: &TorrentUri) -> EngineResult<TorrentHandle> {
        let options = AddTorrentOptions {
            overwrite: true,
            ..Default::default()
        };
        let response = self
            .session
            .add_torrent(add_source(uri)?, Some(options))
            .await
            .map_err(|e| EngineError::Unresolvable(format!("{}: {:#}", uri, e)))?;

        let (id, handle) = match response {
            AddTorrentResponse::Added(id, handle) => (id, handle),
            AddTorrentResponse::AlreadyManaged(id, handle) => {
                debug!("Torrent {} is already managed", id);
                (id, handle)
            }
            AddTorrentResponse::ListOnly(_) => {
                return Err(EngineError::Unresolvable(format!(
                    "{}: session only listed the torrent",
                    uri
                )))
            }
        };

        let info_hash = handle.info_hash().as_string();
        let name = handle.name().unwrap_or_else(|| info_hash.clone());
        lock(&self.active)
            .entry(info_hash.clone())
            .or_insert_with(|| ActiveTorrent {
                id,
                handle,
                selected: None,
                pullers: Vec::new(),
            });

        debug!("Resolved {} to {} ({})", uri, info_hash, name);
        Ok(TorrentHandle { info_hash, name })
    }

    async fn wait_for_metadata(&self, torrent: &TorrentHandle) -> EngineResult<()> {
        let handle = self.with_active(&torrent.info_hash, |t| Ok(Arc::clone(&t.handle)))?;
        handle.wait_until_initialized().await?;
        Ok(())
    }

    fn files(&self, torrent: &TorrentHandle) -> EngineResult<Vec<TorrentFile>> {
        self.with_active(&torrent.info_hash, |t| {
            Self::layout(&t.handle).map(|(_, files)| files)
        })
    }

    async fn set_file_priority(&self, file: &FileRef, priority: Priority) -> EngineResult<()> {
        let (handle, selected) = self.with_active(&file.torrent.info_hash, |t| {
            let (_, files) = Self::layout(&t.handle)?;
            if file.index >= files.len() {
                return Err(EngineError::UnknownFile {
                    info_hash: file.torrent.info_hash.clone(),
                    index: file.index,
                });
            }

            let selected = t
                .selected
                .get_or_insert_with(|| files.iter().map(|f| f.index).collect());
            match priority {
                Priority::None => selected.remove(&file.index),
                Priority::Normal | Priority::Now => selected.insert(file.index),
            };
            Ok((Arc::clone(&t.handle), selected.clone()))
        })?;

        // rqbit needs at least one file; a torrent with none left is about to be dropped
        if selected.is_empty() {
            debug!("No files of {} left selected", file.torrent.info_hash);
            return Ok(());
        }
        self.session.update_only_files(&handle, &selected).await?;
        Ok(())
    }

    async fn set_piece_priority(
        &self,
        torrent: &TorrentHandle,
        piece: u32,
        priority: Priority,
    ) -> EngineResult<()> {
        if priority != Priority::Now {
            debug!("Piece {} of {} left at default priority", piece, torrent.info_hash);
            return Ok(());
        }

        let (id, position) = self.with_active(&torrent.info_hash, |t| {
            let (piece_length, files) = Self::layout(&t.handle)?;
            let position = piece_position(&files, piece_length, piece, t.selected.as_ref());
            Ok((t.id, position))
        })?;
        let Some((index, offset)) = position else {
            debug!("Piece {} of {} belongs to no selected file", piece, torrent.info_hash);
            return Ok(());
        };

        let mut stream = self
            .api
            .api_stream(TorrentIdOrHash::Id(id), index)
            .map_err(backend)?;
        let info_hash = torrent.info_hash.clone();
        let puller = tokio::spawn(async move {
            let mut byte = [0u8; 1];
            let pulled = match stream.seek(SeekFrom::Start(offset)).await {
                Ok(_) => stream.read(&mut byte).await,
                Err(e) => Err(e),
            };
            match pulled {
                Ok(_) => debug!("Piece {} of {} is available", piece, info_hash),
                Err(e) => debug!("Stopped waiting for piece {} of {}: {}", piece, info_hash, e),
            }
        });

        self.with_active(&torrent.info_hash, |t| {
            t.pullers.retain(|p| !p.is_finished());
            t.pullers.push(puller);
            Ok(())
        })
    }

    async fn open_reader(
        &self,
        file: &FileRef,
        options: ReaderOptions,
    ) -> EngineResult<Box<dyn FileReader>> {
        let id = self.with_active(&file.torrent.info_hash, |t| Ok(t.id))?;
        let stream = self
            .api
            .api_stream(TorrentIdOrHash::Id(id), file.index)
            .map_err(backend)?;

        // rqbit streams always favour the pieces under the cursor
        let capacity = options.readahead.clamp(MIN_READAHEAD, MAX_READAHEAD) as usize;
        debug!(
            "Opened stream for file {} of {} ({} byte buffer)",
            file.index, file.torrent.info_hash, capacity
        );
        Ok(Box::new(BufReader::with_capacity(capacity, stream)))
    }

    async fn drop_torrent(&self, torrent: &TorrentHandle, delete_data: bool) -> EngineResult<()> {
        let Some(mut active) = lock(&self.active).remove(&torrent.info_hash) else {
            return Err(EngineError::UnknownTorrent(torrent.info_hash.clone()));
        };
        active.abort_pullers();

        self.session
            .delete(TorrentIdOrHash::Id(active.id), delete_data)
            .await?;
        debug!("Dropped torrent {}", torrent.info_hash);
        Ok(())
    }

    async fn close(&self) {
        let dropped: Vec<ActiveTorrent> = lock(&self.active).drain().map(|(_, t)| t).collect();
        for mut torrent in dropped {
            torrent.abort_pullers();
            if let Err(e) = self
                .session
                .delete(TorrentIdOrHash::Id(torrent.id), true)
                .await
            {
                warn!("Failed to release torrent {}: {:#}", torrent.id, e);
            }
        }
        info!("Torrent session released");
    }
}
