use std::fs::File;
use std::io::{self, Read};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use indicatif::HumanBytes;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::metadata::file::{DIGEST_LEN, FileModeInfo, InfoDict, MultiFileInfo};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// Upper bound on payload size for each piece length, smallest first.
const PIECE_LENGTH_TABLE: &[(u64, u64)] = &[
    (50 * MIB, 32 * KIB),
    (150 * MIB, 64 * KIB),
    (350 * MIB, 128 * KIB),
    (512 * MIB, 256 * KIB),
    (GIB, 512 * KIB),
    (2 * GIB, MIB),
    (4 * GIB, 2 * MIB),
    (8 * GIB, 4 * MIB),
    (16 * GIB, 8 * MIB),
];
const MAX_AUTO_PIECE_LENGTH: u64 = 16 * MIB;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("unable to read {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("{0} has no file name")]
    InvalidTarget(PathBuf),
    #[error("{0} is not valid UTF-8")]
    NonUtf8Path(PathBuf),
    #[error("{0} contains no data to hash")]
    EmptyContent(PathBuf),
    #[error("piece length {0} is not a power of two below 2^63")]
    InvalidPieceLength(u64),
    #[error("hashing was cancelled")]
    Cancelled,
}

type Result<T> = std::result::Result<T, HashError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PieceLength {
    #[default]
    Auto,
    Fixed(u64),
}

impl PieceLength {
    pub fn resolve(self, total_length: u64) -> Result<u64> {
        match self {
            PieceLength::Auto => Ok(auto_piece_length(total_length)),
            PieceLength::Fixed(n) if n.is_power_of_two() && i64::try_from(n).is_ok() => Ok(n),
            PieceLength::Fixed(n) => Err(HashError::InvalidPieceLength(n)),
        }
    }
}

/// Picks a piece length that keeps piece counts in the low thousands.
pub fn auto_piece_length(total_length: u64) -> u64 {
    PIECE_LENGTH_TABLE
        .iter()
        .find(|(limit, _)| total_length <= *limit)
        .map_or(MAX_AUTO_PIECE_LENGTH, |(_, piece_length)| *piece_length)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub pieces_done: usize,
    pub pieces_total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentFile {
    pub path: PathBuf,
    pub components: Vec<String>,
    pub length: u64,
}

/// What a target looks like on disk, gathered from metadata only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentLayout {
    pub name: String,
    pub root: PathBuf,
    pub is_dir: bool,
    pub files: Vec<ContentFile>,
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> HashError + '_ {
    move |source| HashError::Io { path: path.to_path_buf(), source }
}

fn utf8_name(path: &Path, name: &std::ffi::OsStr) -> Result<String> {
    name.to_str().map(str::to_owned).ok_or_else(|| HashError::NonUtf8Path(path.to_path_buf()))
}

impl ContentLayout {
    /// Stats `root` and, for directories, every regular file beneath it.
    /// Files are ordered component by component, so `a/b` sorts before
    /// `a.txt` even though `.` is the smaller byte.
    pub fn scan(root: &Path) -> Result<Self> {
        let file_name = root.file_name().ok_or_else(|| HashError::InvalidTarget(root.to_path_buf()))?;
        let name = utf8_name(root, file_name)?;
        let metadata = std::fs::metadata(root).map_err(io_error(root))?;

        if !metadata.is_dir() {
            let files = vec![ContentFile { path: root.to_path_buf(), components: vec![name.clone()], length: metadata.len() }];
            return Ok(ContentLayout { name, root: root.to_path_buf(), is_dir: false, files });
        }

        let mut files: Vec<ContentFile> = Vec::new();
        for entry in WalkDir::new(root).follow_links(true) {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(root).to_path_buf();
                HashError::Io { path, source: e.into() }
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
            let components = relative
                .iter()
                .map(|c| utf8_name(entry.path(), c))
                .collect::<Result<Vec<String>>>()?;
            let length = entry.metadata().map_err(|e| HashError::Io { path: entry.path().to_path_buf(), source: e.into() })?.len();
            files.push(ContentFile { path: entry.path().to_path_buf(), components, length });
        }
        files.sort_by(|a, b| a.components.cmp(&b.components));
        debug!("found {} files under {}", files.len(), root.display());
        Ok(ContentLayout { name, root: root.to_path_buf(), is_dir: true, files })
    }

    pub fn total_length(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }

    pub fn file_mode_info(&self) -> FileModeInfo {
        if self.is_dir {
            let files = self
                .files
                .iter()
                .map(|f| MultiFileInfo { length: f.length, path: f.components.clone() })
                .collect();
            FileModeInfo::Multiple { files }
        } else {
            FileModeInfo::Single { length: self.total_length() }
        }
    }
}

/// Hashes the concatenation of every file in `layout` in windows of
/// `piece_length` bytes. Only one piece is held in memory at a time.
pub fn hash_pieces<F>(layout: &ContentLayout, piece_length: u64, mut on_progress: F) -> Result<Vec<u8>>
where
    F: FnMut(Progress) -> ControlFlow<()>,
{
    if piece_length == 0 {
        return Err(HashError::InvalidPieceLength(piece_length));
    }
    let total = layout.total_length();
    let pieces_total = usize::try_from(total.div_ceil(piece_length)).map_err(|_| HashError::InvalidPieceLength(piece_length))?;
    let buffer_len = usize::try_from(piece_length).map_err(|_| HashError::InvalidPieceLength(piece_length))?;

    let mut pieces: Vec<u8> = Vec::with_capacity(pieces_total * DIGEST_LEN);
    let mut buffer = vec![0u8; buffer_len];
    let mut filled: usize = 0;
    let mut pieces_done: usize = 0;

    let mut finish_piece = |data: &[u8], pieces: &mut Vec<u8>| -> Result<()> {
        pieces.extend_from_slice(&Sha1::digest(data));
        pieces_done += 1;
        match on_progress(Progress { pieces_done, pieces_total }) {
            ControlFlow::Continue(()) => Ok(()),
            ControlFlow::Break(()) => Err(HashError::Cancelled),
        }
    };

    for file in &layout.files {
        let mut reader = File::open(&file.path).map_err(io_error(&file.path))?;
        let mut remaining = file.length;
        while remaining > 0 {
            let space = buffer_len - filled;
            let read_len = space.min(usize::try_from(remaining).unwrap_or(usize::MAX));
            reader.read_exact(&mut buffer[filled..filled + read_len]).map_err(io_error(&file.path))?;
            filled += read_len;
            remaining -= read_len as u64;

            if filled == buffer_len {
                finish_piece(&buffer, &mut pieces)?;
                filled = 0;
            }
        }
    }
    if filled > 0 {
        finish_piece(&buffer[..filled], &mut pieces)?;
    }

    Ok(pieces)
}

/// Hashes `layout` from scratch and assembles its info dictionary.
pub fn build_info<F>(layout: &ContentLayout, piece_length: PieceLength, on_progress: F) -> Result<InfoDict>
where
    F: FnMut(Progress) -> ControlFlow<()>,
{
    let total = layout.total_length();
    if total == 0 {
        return Err(HashError::EmptyContent(layout.root.clone()));
    }
    let piece_length = piece_length.resolve(total)?;
    info!(
        "hashing {} ({} in {} file(s)) with {} pieces",
        layout.name,
        HumanBytes(total),
        layout.files.len(),
        HumanBytes(piece_length)
    );
    let pieces = hash_pieces(layout, piece_length, on_progress)?;
    Ok(InfoDict {
        name: layout.name.clone(),
        piece_length,
        pieces,
        layout: layout.file_mode_info(),
        private: true,
    })
}
