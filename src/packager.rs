use std::fs;
use std::io;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::hasher::{self, ContentLayout, HashError, PieceLength, Progress};
use crate::metadata::file::{InfoDict, TorrentFile};
use crate::reuse;
use crate::util::io::write_atomically;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Everything one packaging run needs. Callers keep and reuse this value
/// across runs; nothing is cached between calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageOptions {
    pub tracker: String,
    pub prefix: Option<String>,
    pub reuse: bool,
    pub reuse_from: Option<PathBuf>,
    pub piece_length: PieceLength,
    pub comment: String,
    pub created_by: String,
}

impl PackageOptions {
    pub fn new(tracker: &str) -> Self {
        PackageOptions {
            tracker: tracker.to_owned(),
            prefix: None,
            reuse: true,
            reuse_from: None,
            piece_length: PieceLength::Auto,
            comment: format!("Generated by reseed {VERSION}"),
            created_by: format!("reseed {VERSION}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PackagedTorrent {
    pub path: PathBuf,
    pub bytes: Vec<u8>,
    pub info_hash: [u8; 20],
    pub reused_from: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum PackagingError {
    #[error("tracker url '{url}' is invalid: {source}")]
    InvalidTracker { url: String, source: url::ParseError },
    #[error("unable to resolve target {path}: {source}")]
    InvalidTarget { path: PathBuf, source: io::Error },
    #[error("unable to write {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error(transparent)]
    Hash(HashError),
    #[error("torrent creation was cancelled")]
    Cancelled,
}

impl From<HashError> for PackagingError {
    fn from(e: HashError) -> Self {
        match e {
            HashError::Cancelled => PackagingError::Cancelled,
            other => PackagingError::Hash(other),
        }
    }
}

type Result<T> = std::result::Result<T, PackagingError>;

/// `<stem>.torrent`, or `[<prefix>].<stem>.torrent`, next to the target.
/// The stem drops the extension of files but keeps directory names whole.
pub fn torrent_path(layout: &ContentLayout, prefix: Option<&str>) -> PathBuf {
    let stem = target_stem(layout);
    let file_name = match prefix.filter(|p| !p.is_empty()) {
        Some(prefix) => format!("[{prefix}].{stem}.torrent"),
        None => format!("{stem}.torrent"),
    };
    layout.root.parent().unwrap_or(Path::new("")).join(file_name)
}

fn target_stem(layout: &ContentLayout) -> &str {
    if layout.is_dir {
        return &layout.name;
    }
    Path::new(&layout.name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(layout.name.as_str())
}

/// Makes `target` absolute without following it, so a symlinked payload
/// keeps its own name and directory. Only the parent is resolved.
fn resolve_target(target: &Path) -> io::Result<PathBuf> {
    let root = match (target.parent(), target.file_name()) {
        (Some(parent), Some(name)) => {
            let parent = if parent.as_os_str().is_empty() { Path::new(".") } else { parent };
            parent.canonicalize()?.join(name)
        },
        _ => target.canonicalize()?,
    };
    fs::metadata(&root)?;
    Ok(root)
}

fn try_reuse(options: &PackageOptions, layout: &ContentLayout) -> Option<(InfoDict, PathBuf)> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(source) = &options.reuse_from {
        candidates.push(source.clone());
    }
    if options.reuse {
        candidates.extend(reuse::find_candidates(&layout.root, target_stem(layout)));
    }

    for candidate in candidates {
        info!("building torrent from {}", candidate.display());
        match reuse::resolve(&candidate, layout) {
            Ok(info) => return Some((info, candidate)),
            Err(e) => debug!("not reusing {}: {}", candidate.display(), e),
        }
    }
    None
}

/// Produces a private torrent for `target` and writes it next to the
/// target. Piece hashes are taken from an earlier torrent when one can be
/// reused, otherwise the content is hashed and `on_progress` is told about
/// every piece. Returning `ControlFlow::Break` from it aborts the run
/// without writing anything.
pub fn package<F>(target: &Path, options: &PackageOptions, on_progress: F) -> Result<PackagedTorrent>
where
    F: FnMut(Progress) -> ControlFlow<()>,
{
    Url::parse(&options.tracker)
        .map_err(|source| PackagingError::InvalidTracker { url: options.tracker.clone(), source })?;
    let root = resolve_target(target)
        .map_err(|source| PackagingError::InvalidTarget { path: target.to_path_buf(), source })?;
    let layout = ContentLayout::scan(&root)?;
    let path = torrent_path(&layout, options.prefix.as_deref());

    let (info, reused_from) = match try_reuse(options, &layout) {
        Some((info, candidate)) => (info, Some(candidate)),
        None => {
            info!("generating torrent for {}", root.display());
            (hasher::build_info(&layout, options.piece_length, on_progress)?, None)
        }
    };

    let torrent = TorrentFile::new(&options.tracker, &options.comment, &options.created_by, info);
    let bytes = torrent.to_bytes();
    let info_hash = torrent.info.info_hash();
    write_atomically(&path, &bytes).map_err(|source| PackagingError::Io { path: path.clone(), source })?;
    info!("torrent written to {} (info hash {})", path.display(), hex::encode(info_hash));

    Ok(PackagedTorrent { path, bytes, info_hash, reused_from })
}

/// Same as [`package`], returning only the encoded torrent.
pub fn build_torrent<F>(target: &Path, options: &PackageOptions, on_progress: F) -> Result<Vec<u8>>
where
    F: FnMut(Progress) -> ControlFlow<()>,
{
    package(target, options, on_progress).map(|packaged| packaged.bytes)
}
