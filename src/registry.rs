//! Registry of streamable content
//!
//! Maps a stable content id to the torrent file it stands for. Ids are an MD5
//! fingerprint of the torrent identity and the file's path inside the torrent,
//! so re-adding the same content yields the same id.

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::engine::{FileRef, TorrentFile, TorrentHandle};

/// Stable identifier of a file inside a torrent
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentId(String);

impl ContentId {
    /// Fingerprint `(torrent identity, file path)`
    pub fn compute(info_hash: &str, file_path: &str) -> Self {
        let mut hasher = Md5::new();
        hasher.update(info_hash.as_bytes());
        hasher.update(file_path.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    /// Take an id as received from a client, dropping stray whitespace and newlines
    pub fn from_param(raw: &str) -> Self {
        Self(raw.chars().filter(|c| !c.is_whitespace()).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A registered file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentEntry {
    pub id: ContentId,
    pub display_name: String,
    pub added_at: DateTime<Utc>,
    pub length: u64,
    /// Engine handle; the engine owns the torrent
    pub file: FileRef,
}

/// Concurrency-safe id -> entry map
///
/// Every operation holds the lock only for the map access itself.
#[derive(Debug, Default)]
pub struct ContentRegistry {
    entries: Mutex<HashMap<ContentId, ContentEntry>>,
}

impl ContentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ContentId, ContentEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a file, returning the existing entry if it is already known
    pub fn add(&self, torrent: &TorrentHandle, file: &TorrentFile) -> ContentEntry {
        let id = ContentId::compute(&torrent.info_hash, &file.path);
        let mut entries = self.lock();
        entries
            .entry(id.clone())
            .or_insert_with(|| ContentEntry {
                id,
                display_name: file.path.clone(),
                added_at: Utc::now(),
                length: file.length,
                file: file.file_ref(torrent),
            })
            .clone()
    }

    pub fn get(&self, id: &ContentId) -> Option<ContentEntry> {
        self.lock().get(id).cloned()
    }

    /// Remove an entry, returning it if it was present
    pub fn remove(&self, id: &ContentId) -> Option<ContentEntry> {
        self.lock().remove(id)
    }

    /// Ids of `files` that are already registered for `torrent`
    pub fn find_existing(&self, torrent: &TorrentHandle, files: &[TorrentFile]) -> Vec<ContentId> {
        let ids: Vec<ContentId> = files
            .iter()
            .map(|f| ContentId::compute(&torrent.info_hash, &f.path))
            .collect();

        let entries = self.lock();
        ids.into_iter().filter(|id| entries.contains_key(id)).collect()
    }

    /// Whether any file of the torrent is still registered
    pub fn has_torrent(&self, info_hash: &str) -> bool {
        self.lock()
            .values()
            .any(|e| e.file.torrent.info_hash == info_hash)
    }

    /// All entries, oldest first
    pub fn list(&self) -> Vec<ContentEntry> {
        let mut entries: Vec<ContentEntry> = self.lock().values().cloned().collect();
        entries.sort_by(|a, b| a.added_at.cmp(&b.added_at).then(a.id.cmp(&b.id)));
        entries
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn torrent(info_hash: &str) -> TorrentHandle {
        TorrentHandle {
            info_hash: info_hash.to_string(),
            name: "sample".to_string(),
        }
    }

    fn file(index: usize, path: &str) -> TorrentFile {
        TorrentFile {
            index,
            path: path.to_string(),
            length: 1024,
            first_piece: 0,
            end_piece: 1,
        }
    }

    #[test]
    fn test_compute_id_deterministic() {
        let a = ContentId::compute("abcdef", "movie/a.mkv");
        let b = ContentId::compute("abcdef", "movie/a.mkv");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 32);
        assert_ne!(a, ContentId::compute("abcdef", "movie/b.mkv"));
        assert_ne!(a, ContentId::compute("abcdeg", "movie/a.mkv"));
    }

    #[test]
    fn test_compute_id_no_collisions() {
        let mut seen = HashSet::new();
        for t in 0..100 {
            for f in 0..100 {
                let id = ContentId::compute(&format!("{:040x}", t), &format!("dir/file-{}.mkv", f));
                assert!(seen.insert(id), "collision at torrent {} file {}", t, f);
            }
        }
        assert_eq!(seen.len(), 10_000);
    }

    #[test]
    fn test_from_param_strips_whitespace() {
        let id = ContentId::from_param(" abc\ndef \n");
        assert_eq!(id.as_str(), "abcdef");
    }

    #[test]
    fn test_add_is_idempotent() {
        let registry = ContentRegistry::new();
        let t = torrent("hash");
        let first = registry.add(&t, &file(0, "a.mkv"));
        let second = registry.add(&t, &file(0, "a.mkv"));

        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_get_and_remove() {
        let registry = ContentRegistry::new();
        let entry = registry.add(&torrent("hash"), &file(0, "a.mkv"));

        assert_eq!(registry.get(&entry.id).unwrap().display_name, "a.mkv");
        assert_eq!(registry.remove(&entry.id), Some(entry.clone()));
        assert!(registry.get(&entry.id).is_none());
        assert!(registry.remove(&entry.id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_find_existing() {
        let registry = ContentRegistry::new();
        let t = torrent("hash");
        let files = vec![file(0, "a.mkv"), file(1, "b.txt"), file(2, "c.mp4")];

        assert!(registry.find_existing(&t, &files).is_empty());

        let a = registry.add(&t, &files[0]);
        let c = registry.add(&t, &files[2]);
        let existing = registry.find_existing(&t, &files);
        assert_eq!(existing, vec![a.id, c.id]);

        // Same paths in another torrent are different content
        assert!(registry.find_existing(&torrent("other"), &files).is_empty());
    }

    #[test]
    fn test_has_torrent() {
        let registry = ContentRegistry::new();
        let entry = registry.add(&torrent("hash"), &file(0, "a.mkv"));
        assert!(registry.has_torrent("hash"));
        assert!(!registry.has_torrent("other"));

        registry.remove(&entry.id);
        assert!(!registry.has_torrent("hash"));
    }

    #[test]
    fn test_concurrent_adds() {
        let registry = Arc::new(ContentRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|n| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let t = torrent(&format!("hash-{}", n % 2));
                    for i in 0..50 {
                        registry.add(&t, &file(i, &format!("{}.mkv", i)));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.len(), 100);
    }
}
