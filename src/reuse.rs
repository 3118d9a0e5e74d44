use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use thiserror::Error;
use tracing::{debug, warn};

use crate::hasher::ContentLayout;
use crate::metadata::bencode::{self, BencodeError};
use crate::metadata::file::{InfoDict, TorrentError};

/// Torrent files are small; anything past this is not worth reading.
const MAX_CANDIDATE_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum NotReusable {
    #[error("{0} is not a file")]
    Missing(PathBuf),
    #[error("{path} is too large ({size} bytes) to be a torrent")]
    TooLarge { path: PathBuf, size: u64 },
    #[error("unable to read {path}: {source}")]
    Unreadable { path: PathBuf, source: io::Error },
    #[error("{path} is not valid bencode: {source}")]
    Undecodable { path: PathBuf, source: BencodeError },
    #[error("{path} cannot be reused: {source}")]
    Incompatible { path: PathBuf, source: TorrentError },
}

/// Torrent files next to `target` whose names end in `<stem>.torrent`,
/// most recently modified first.
pub fn find_candidates(target: &Path, stem: &str) -> Vec<PathBuf> {
    let Some(parent) = target.parent() else {
        return Vec::new();
    };
    let entries = match fs::read_dir(parent) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("unable to list {}: {}", parent.display(), e);
            return Vec::new();
        }
    };

    let suffix = format!("{stem}.torrent");
    let mut candidates: Vec<(SystemTime, PathBuf)> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_str().is_some_and(|name| name.ends_with(&suffix)))
        .filter_map(|entry| {
            let metadata = fs::metadata(entry.path()).ok()?;
            if !metadata.is_file() {
                return None;
            }
            Some((metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH), entry.path()))
        })
        .collect();
    candidates.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    candidates.into_iter().map(|(_, path)| path).collect()
}

/// Reads and decodes the info dictionary of a prior torrent.
pub fn read_candidate(path: &Path) -> Result<InfoDict, NotReusable> {
    let metadata = fs::metadata(path).map_err(|_| NotReusable::Missing(path.to_path_buf()))?;
    if !metadata.is_file() {
        return Err(NotReusable::Missing(path.to_path_buf()));
    }
    if metadata.len() > MAX_CANDIDATE_SIZE {
        return Err(NotReusable::TooLarge { path: path.to_path_buf(), size: metadata.len() });
    }
    let bytes = fs::read(path).map_err(|source| NotReusable::Unreadable { path: path.to_path_buf(), source })?;
    let value = bencode::decode(&bytes).map_err(|source| NotReusable::Undecodable { path: path.to_path_buf(), source })?;
    InfoDict::from_torrent(&value).map_err(|source| NotReusable::Incompatible { path: path.to_path_buf(), source })
}

/// Carries the candidate's hashes and layout into a fresh private info
/// dictionary. Mismatches with the target only produce warnings: a renamed
/// directory is the common case and the hashes are still valid for it.
pub fn splice(candidate: InfoDict, target: &ContentLayout) -> InfoDict {
    if candidate.name != target.name {
        warn!(
            "reused torrent is probably for different content: it names '{}' but the target is '{}'",
            candidate.name, target.name
        );
    }
    if candidate.layout != target.file_mode_info() {
        warn!(
            "reused torrent layout ({} bytes) differs from {} ({} bytes on disk)",
            candidate.layout.total_length(),
            target.root.display(),
            target.total_length()
        );
    }
    InfoDict {
        name: candidate.name,
        piece_length: candidate.piece_length,
        pieces: candidate.pieces,
        layout: candidate.layout,
        private: true,
    }
}

pub fn resolve(candidate: &Path, target: &ContentLayout) -> Result<InfoDict, NotReusable> {
    let info = read_candidate(candidate)?;
    Ok(splice(info, target))
}
