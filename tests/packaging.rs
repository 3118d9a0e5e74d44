use std::fs::{self, File};
use std::io::Write;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};
use tempfile::TempDir;

use reseed::{
    FileModeInfo, MultiFileInfo, PackageOptions, PackagingError, PieceLength, Progress, TorrentFile,
    build_torrent, decode, package,
};

const MIB: u64 = 1024 * 1024;
const TRACKER: &str = "https://tracker.example.org/announce.php?passkey=abc";

fn write_pattern(path: &Path, length: u64, seed: u8) -> Vec<u8> {
    let content: Vec<u8> = (0..length).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect();
    let mut file = File::create(path).unwrap();
    file.write_all(&content).unwrap();
    content
}

fn parse(bytes: &[u8]) -> TorrentFile {
    TorrentFile::try_from(&decode(bytes).unwrap()).unwrap()
}

fn reference_pieces(content: &[u8], piece_length: u64) -> Vec<u8> {
    content
        .chunks(piece_length as usize)
        .flat_map(|chunk| Sha1::digest(chunk).to_vec())
        .collect()
}

fn options(piece_length: u64) -> PackageOptions {
    let mut options = PackageOptions::new(TRACKER);
    options.piece_length = PieceLength::Fixed(piece_length);
    options
}

fn counting(calls: &mut usize) -> impl FnMut(Progress) -> ControlFlow<()> + '_ {
    move |_| {
        *calls += 1;
        ControlFlow::Continue(())
    }
}

fn hash_fresh(target: &Path, piece_length: u64) -> (Vec<u8>, PathBuf) {
    let mut options = options(piece_length);
    options.reuse = false;
    let packaged = package(target, &options, |_| ControlFlow::Continue(())).unwrap();
    (packaged.bytes, packaged.path)
}

#[test]
fn single_large_file_is_hashed_per_mebibyte() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("Movie.2021.mkv");
    let content = write_pattern(&target, 64 * MIB, 1);

    let mut calls = 0;
    let bytes = build_torrent(&target, &options(MIB), counting(&mut calls)).unwrap();
    let torrent = parse(&bytes);

    assert_eq!(calls, 64);
    assert_eq!(torrent.announce, TRACKER);
    assert_eq!(torrent.info.name, "Movie.2021.mkv");
    assert_eq!(torrent.info.piece_length, MIB);
    assert_eq!(torrent.info.pieces.len(), 1280);
    assert_eq!(torrent.info.pieces, reference_pieces(&content, MIB));
    assert_eq!(torrent.info.layout, FileModeInfo::Single { length: 67108864 });
    assert!(torrent.info.private);

    let written = dir.path().join("Movie.2021.torrent");
    assert_eq!(fs::read(written).unwrap(), bytes);
}

#[test]
fn explicit_reuse_skips_hashing_even_when_names_differ() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("Movie.2021.mkv");
    write_pattern(&target, 64 * MIB, 2);
    let (fresh, written) = hash_fresh(&target, MIB);
    let old = dir.path().join("old.torrent");
    fs::rename(&written, &old).unwrap();

    let mut options = options(MIB);
    options.reuse = false;
    options.reuse_from = Some(old.clone());
    let mut calls = 0;
    let reused = parse(&build_torrent(&target, &options, counting(&mut calls)).unwrap());
    assert_eq!(calls, 0);
    assert_eq!(reused.info.pieces, parse(&fresh).info.pieces);

    let mut renamed = parse(&fresh);
    renamed.info.name = "Some.Other.Name.mkv".to_owned();
    fs::write(&old, renamed.to_bytes()).unwrap();

    let mut calls = 0;
    let spliced = parse(&build_torrent(&target, &options, counting(&mut calls)).unwrap());
    assert_eq!(calls, 0);
    assert_eq!(spliced.info.name, "Some.Other.Name.mkv");
    assert_eq!(spliced.info.pieces, parse(&fresh).info.pieces);
}

#[test]
fn directory_files_are_listed_in_path_order() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("Show.S01");
    fs::create_dir_all(root.join("Extras")).unwrap();
    let b = write_pattern(&root.join("b.mkv"), 10 * MIB, 3);
    let a = write_pattern(&root.join("a.mkv"), 20 * MIB, 4);
    let c = write_pattern(&root.join("Extras").join("c.mkv"), 5 * MIB, 5);

    let piece_length = 4 * MIB;
    let torrent = parse(&build_torrent(&root, &options(piece_length), |_| ControlFlow::Continue(())).unwrap());

    assert_eq!(torrent.info.name, "Show.S01");
    assert_eq!(torrent.info.layout, FileModeInfo::Multiple { files: vec![
        MultiFileInfo { length: 5 * MIB, path: vec!["Extras".to_owned(), "c.mkv".to_owned()] },
        MultiFileInfo { length: 20 * MIB, path: vec!["a.mkv".to_owned()] },
        MultiFileInfo { length: 10 * MIB, path: vec!["b.mkv".to_owned()] },
    ]});
    assert_eq!(torrent.info.pieces.len() as u64, 20 * (35 * MIB).div_ceil(piece_length));

    let mut content = c;
    content.extend(a);
    content.extend(b);
    assert_eq!(torrent.info.pieces, reference_pieces(&content, piece_length));
    assert!(dir.path().join("Show.S01.torrent").is_file());
}

#[test]
fn discovered_torrent_matches_fresh_hash() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("Album");
    fs::create_dir(&target).unwrap();
    write_pattern(&target.join("01.flac"), 300_000, 6);
    write_pattern(&target.join("02.flac"), 123_457, 7);
    let (fresh, written) = hash_fresh(&target, 32 * 1024);

    let mut options = options(32 * 1024);
    options.prefix = Some("SiteB".to_owned());
    options.tracker = "https://other.example.net/announce".to_owned();
    let mut calls = 0;
    let packaged = package(&target, &options, counting(&mut calls)).unwrap();

    assert_eq!(calls, 0);
    assert_eq!(packaged.reused_from, Some(written));
    assert_eq!(packaged.path, dir.path().canonicalize().unwrap().join("[SiteB].Album.torrent"));
    let reused = parse(&packaged.bytes);
    let fresh = parse(&fresh);
    assert_eq!(reused.info, fresh.info);
    assert_eq!(reused.info.info_hash(), fresh.info.info_hash());
    assert_eq!(reused.announce, "https://other.example.net/announce");
}

#[test]
fn corrupted_candidates_fall_back_to_hashing() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("clip.mp4");
    let content = write_pattern(&target, 100_000, 8);
    fs::write(dir.path().join("[X].clip.torrent"), b"d8:announce40:http://t/").unwrap();
    let explicit = dir.path().join("broken.torrent");
    fs::write(&explicit, b"d4:infod4:name8:clip.mp46:pieces999").unwrap();

    let mut options = options(16 * 1024);
    options.reuse_from = Some(explicit);
    let mut calls = 0;
    let packaged = package(&target, &options, counting(&mut calls)).unwrap();

    assert_eq!(calls, 7);
    assert_eq!(packaged.reused_from, None);
    let torrent = parse(&packaged.bytes);
    assert_eq!(torrent.info.pieces, reference_pieces(&content, 16 * 1024));
}

#[test]
fn cancelling_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("big.iso");
    write_pattern(&target, 200_000, 9);

    let mut options = options(16 * 1024);
    options.reuse = false;
    let result = build_torrent(&target, &options, |p| {
        if p.pieces_done == 2 { ControlFlow::Break(()) } else { ControlFlow::Continue(()) }
    });

    assert!(matches!(result, Err(PackagingError::Cancelled)));
    let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().map(|e| e.unwrap().file_name().into_string().unwrap()).collect();
    assert_eq!(entries, vec!["big.iso"]);
}

#[test]
fn existing_output_is_overwritten() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("notes.txt");
    write_pattern(&target, 5_000, 10);
    let output = dir.path().join("notes.torrent");
    fs::write(&output, b"not a torrent").unwrap();

    let bytes = build_torrent(&target, &options(1024), |_| ControlFlow::Continue(())).unwrap();

    assert_eq!(fs::read(&output).unwrap(), bytes);
    assert_eq!(parse(&bytes).info.num_pieces(), 5);
}

#[test]
fn candidate_with_overflowing_lengths_falls_back_to_hashing() {
    let dir = TempDir::new().unwrap();
    let target = dir.path().join("clip.mp4");
    let content = write_pattern(&target, 40_000, 11);
    let big = "d6:lengthi9223372036854775807e4:pathl1:xee";
    let candidate = format!("d4:infod5:filesl{big}{big}{big}e4:name8:clip.mp412:piece lengthi16384e6:pieces0:ee");
    fs::write(dir.path().join("old.clip.torrent"), candidate).unwrap();

    let mut calls = 0;
    let packaged = package(&target, &options(16 * 1024), counting(&mut calls)).unwrap();

    assert_eq!(calls, 3);
    assert_eq!(packaged.reused_from, None);
    let torrent = parse(&packaged.bytes);
    assert_eq!(torrent.info.pieces, reference_pieces(&content, 16 * 1024));
}

#[cfg(unix)]
#[test]
fn symlinked_target_keeps_its_own_name_and_directory() {
    let dir = TempDir::new().unwrap();
    let store = dir.path().join("store");
    let downloads = dir.path().join("dl");
    fs::create_dir(&store).unwrap();
    fs::create_dir(&downloads).unwrap();
    let stored = store.join("abc123.mkv");
    let content = write_pattern(&stored, 30_000, 12);
    let link = downloads.join("Movie.2020.mkv");
    std::os::unix::fs::symlink(&stored, &link).unwrap();

    let mut options = options(16 * 1024);
    options.reuse = false;
    let packaged = package(&link, &options, |_| ControlFlow::Continue(())).unwrap();

    assert_eq!(packaged.path, downloads.canonicalize().unwrap().join("Movie.2020.torrent"));
    assert!(!store.join("abc123.torrent").exists());
    let torrent = parse(&packaged.bytes);
    assert_eq!(torrent.info.name, "Movie.2020.mkv");
    assert_eq!(torrent.info.layout, FileModeInfo::Single { length: 30_000 });
    assert_eq!(torrent.info.pieces, reference_pieces(&content, 16 * 1024));
}

#[cfg(unix)]
#[test]
fn symlinked_target_discovers_torrents_beside_the_link() {
    let dir = TempDir::new().unwrap();
    let store = dir.path().join("store");
    let downloads = dir.path().join("dl");
    fs::create_dir(&store).unwrap();
    fs::create_dir(&downloads).unwrap();
    let stored = store.join("abc123.mkv");
    write_pattern(&stored, 30_000, 13);
    let link = downloads.join("Movie.2020.mkv");
    std::os::unix::fs::symlink(&stored, &link).unwrap();

    let mut fresh = options(16 * 1024);
    fresh.reuse = false;
    fresh.prefix = Some("SiteA".to_owned());
    let first = package(&link, &fresh, |_| ControlFlow::Continue(())).unwrap();

    let mut calls = 0;
    let second = package(&link, &options(16 * 1024), counting(&mut calls)).unwrap();

    assert_eq!(calls, 0);
    assert_eq!(second.reused_from, Some(first.path));
    assert_eq!(parse(&second.bytes).info, parse(&first.bytes).info);
}
