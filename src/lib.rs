use std::path::Path;

mod hasher;
mod metadata;
mod packager;
mod reuse;
mod util;

pub use hasher::{HashError, PieceLength, Progress, auto_piece_length};
pub use metadata::bencode::{BencodeError, BencodeValue, decode, encode};
pub use metadata::file::{FileModeInfo, InfoDict, MultiFileInfo, TorrentError, TorrentFile};
pub use packager::{PackageOptions, PackagedTorrent, PackagingError, VERSION, build_torrent, package};

pub fn parse_torrent<P: AsRef<Path>>(path: P) -> std::result::Result<TorrentFile, Box<dyn std::error::Error>> {
    let bytes = std::fs::read(path.as_ref())?;
    let value = decode(&bytes)?;
    let torrent_file = TorrentFile::try_from(&value)?;
    Ok(torrent_file)
}
