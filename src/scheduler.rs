//! Stream readiness scheduling
//!
//! Decides which files of a freshly resolved torrent can be streamed and biases
//! the engine towards the bytes a player needs first: the start of the file and
//! the trailing index many containers keep at the end. Everything else is skipped.

use std::collections::HashSet;
use thiserror::Error;
use tracing::debug;

use crate::engine::{EngineError, Priority, TorrentEngine, TorrentFile, TorrentHandle};

/// Errors from preparing a torrent for streaming
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("No valid files")]
    NoEligibleFiles,

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// Extension of a torrent path including the dot, `""` when there is none
pub fn extension(path: &str) -> &str {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rfind('.') {
        Some(idx) => &name[idx..],
        None => "",
    }
}

#[derive(Debug, Clone)]
pub struct ReadinessScheduler {
    allowed: HashSet<String>,
}

impl ReadinessScheduler {
    pub fn new(allowed: HashSet<String>) -> Self {
        Self { allowed }
    }

    /// Exact, case-sensitive extension match
    pub fn is_eligible(&self, file: &TorrentFile) -> bool {
        self.allowed.contains(extension(&file.path))
    }

    /// Prioritize eligible files and silence the rest
    ///
    /// Returns the eligible files. A torrent with none is dropped from the engine.
    pub async fn prepare(
        &self,
        engine: &dyn TorrentEngine,
        torrent: &TorrentHandle,
        files: &[TorrentFile],
    ) -> Result<Vec<TorrentFile>, SchedulerError> {
        let mut eligible = Vec::new();

        for file in files {
            if self.is_eligible(file) {
                engine
                    .set_piece_priority(torrent, file.first_piece, Priority::Now)
                    .await?;
                engine
                    .set_piece_priority(torrent, file.last_piece(), Priority::Now)
                    .await?;
                debug!(
                    "Prioritized pieces {} and {} of {}",
                    file.first_piece,
                    file.last_piece(),
                    file.path
                );
                eligible.push(file.clone());
            } else {
                engine
                    .set_file_priority(&file.file_ref(torrent), Priority::None)
                    .await?;
            }
        }

        if eligible.is_empty() {
            engine.drop_torrent(torrent, true).await?;
            return Err(SchedulerError::NoEligibleFiles);
        }

        Ok(eligible)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MemoryEngine, MemoryTorrent, TorrentUri};

    fn allowed(exts: &[&str]) -> HashSet<String> {
        exts.iter().map(|s| s.to_string()).collect()
    }

    async fn resolved(engine: &MemoryEngine, torrent: MemoryTorrent) -> (TorrentHandle, Vec<TorrentFile>) {
        let uri = "magnet:?xt=urn:btih:scheduler";
        engine.insert(uri, torrent);
        let handle = engine.resolve(&TorrentUri::parse(uri).unwrap()).await.unwrap();
        let files = engine.files(&handle).unwrap();
        (handle, files)
    }

    #[test]
    fn test_extension() {
        assert_eq!(extension("a.mkv"), ".mkv");
        assert_eq!(extension("dir.v2/a.tar.gz"), ".gz");
        assert_eq!(extension("dir.v2/README"), "");
        assert_eq!(extension("noext"), "");
    }

    #[test]
    fn test_eligibility_is_case_sensitive() {
        let scheduler = ReadinessScheduler::new(allowed(&[".mkv"]));
        let mut file = TorrentFile {
            index: 0,
            path: "a.mkv".to_string(),
            length: 1,
            first_piece: 0,
            end_piece: 1,
        };
        assert!(scheduler.is_eligible(&file));
        file.path = "A.MKV".to_string();
        assert!(!scheduler.is_eligible(&file));
    }

    #[tokio::test]
    async fn test_prepare_filters_and_prioritizes() {
        let engine = MemoryEngine::with_piece_length(4);
        let (handle, files) = resolved(
            &engine,
            MemoryTorrent::new("mixed")
                .file("a.mkv", vec![0u8; 10])
                .file("b.txt", vec![0u8; 3])
                .file("c.mp4", vec![0u8; 7]),
        )
        .await;

        let scheduler = ReadinessScheduler::new(allowed(&[".mkv", ".mp4"]));
        let eligible = scheduler.prepare(&engine, &handle, &files).await.unwrap();

        let paths: Vec<&str> = eligible.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["a.mkv", "c.mp4"]);

        // a.mkv spans pieces 0..=2, c.mp4 spans bytes 13..20 -> pieces 3..=4
        for piece in [0, 2, 3, 4] {
            assert_eq!(
                engine.piece_priority(&handle.info_hash, piece),
                Some(Priority::Now)
            );
        }
        assert_eq!(engine.piece_priority(&handle.info_hash, 1), None);
        assert_eq!(
            engine.file_priority(&files[1].file_ref(&handle)),
            Some(Priority::None)
        );
        assert!(engine.is_active(&handle.info_hash));
    }

    #[tokio::test]
    async fn test_prepare_drops_torrent_without_eligible_files() {
        let engine = MemoryEngine::new();
        let (handle, files) = resolved(
            &engine,
            MemoryTorrent::new("docs")
                .file("readme.txt", vec![1u8; 4])
                .file("cover.jpg", vec![2u8; 4]),
        )
        .await;

        let scheduler = ReadinessScheduler::new(allowed(&[".mkv"]));
        let result = scheduler.prepare(&engine, &handle, &files).await;

        assert!(matches!(result, Err(SchedulerError::NoEligibleFiles)));
        assert!(!engine.is_active(&handle.info_hash));
        assert_eq!(engine.dropped(), vec![(handle.info_hash.clone(), true)]);
    }
}
