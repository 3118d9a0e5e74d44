use std::collections::BTreeMap;
use std::fmt;

use indicatif::HumanBytes;
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::metadata::bencode::{self, BencodeValue};

pub const DIGEST_LEN: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    pub announce: String,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub creation_date: Option<u64>,
    pub info: InfoDict,
}

/// The content-addressed part of a torrent. Its encoding is what the
/// info-hash is computed over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoDict {
    pub name: String,
    pub piece_length: u64,
    pub pieces: Vec<u8>,
    pub layout: FileModeInfo,
    pub private: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileModeInfo {
    Single { length: u64 },
    Multiple { files: Vec<MultiFileInfo> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiFileInfo {
    pub length: u64,
    pub path: Vec<String>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TorrentError {
    #[error("torrent is not a dictionary")]
    FileIsNotDictionary,
    #[error("missing required key `{0}`")]
    MissingRequiredKey(&'static str),
    #[error("`{0}` is not a UTF-8 string")]
    KeyDoesNotMapToString(&'static str),
    #[error("`{0}` is not an integer")]
    KeyDoesNotMapToInteger(&'static str),
    #[error("`{0}` is not a dictionary")]
    KeyDoesNotMapToDictionary(&'static str),
    #[error("`{0}` is not a list")]
    KeyDoesNotMapToList(&'static str),
    #[error("`{key}` is negative ({value})")]
    NegativeInteger { key: &'static str, value: i64 },
    #[error("`{0}` is an empty list")]
    KeyMapsToAnEmptyList(&'static str),
    #[error("private flag must be 0 or 1, got {0}")]
    InvalidPrivateValue(u64),
    #[error("piece length must be positive")]
    InvalidPieceLength,
    #[error("pieces blob of {0} bytes is not a whole number of digests")]
    InvalidPiecesLength(usize),
    #[error("{total} bytes in pieces of {piece_length} need {expected} digests but {actual} are present")]
    PieceCountMismatch { total: u64, piece_length: u64, expected: u64, actual: u64 },
    #[error("info has both `length` and `files`")]
    AmbiguousLayout,
    #[error("file lengths add up to more than 2^64 bytes")]
    LengthOverflow,
}

type Result<T> = std::result::Result<T, TorrentError>;
type Dictionary = BTreeMap<Vec<u8>, BencodeValue>;

/// A logical field and the keys it may be stored under, most preferred
/// first. `name` is also the key written on output.
struct Field {
    name: &'static str,
    keys: &'static [&'static [u8]],
}

impl Field {
    const fn plain(name: &'static str) -> Self {
        Field { name, keys: &[] }
    }

    fn lookup<'a>(&self, items: &'a Dictionary) -> Option<&'a BencodeValue> {
        self.keys
            .iter()
            .find_map(|key| items.get(*key))
            .or_else(|| items.get(self.name.as_bytes()))
    }

    fn key(&self) -> Vec<u8> {
        self.name.as_bytes().to_vec()
    }
}

const ANNOUNCE: Field = Field::plain("announce");
const COMMENT: Field = Field { name: "comment", keys: &[b"comment.utf-8"] };
const CREATED_BY: Field = Field::plain("created by");
const CREATION_DATE: Field = Field::plain("creation date");
const INFO: Field = Field::plain("info");
const NAME: Field = Field { name: "name", keys: &[b"name.utf-8"] };
const PIECE_LENGTH: Field = Field::plain("piece length");
const PIECES: Field = Field::plain("pieces");
const PRIVATE: Field = Field::plain("private");
const LENGTH: Field = Field::plain("length");
const FILES: Field = Field::plain("files");
const PATH: Field = Field { name: "path", keys: &[b"path.utf-8"] };

fn integer(num: u64) -> BencodeValue {
    // every value written here came from file metadata or a decoded i64
    debug_assert!(num <= i64::MAX as u64, "{num} does not fit a bencode integer");
    BencodeValue::Integer(i64::try_from(num).unwrap_or(i64::MAX))
}

fn extract<'a>(items: &'a Dictionary, field: &Field) -> Result<&'a BencodeValue> {
    field.lookup(items).ok_or(TorrentError::MissingRequiredKey(field.name))
}

fn convert_string(value: &BencodeValue, field: &Field) -> Result<String> {
    value
        .as_bytes()
        .and_then(|bytes| std::str::from_utf8(bytes).ok())
        .map(str::to_owned)
        .ok_or(TorrentError::KeyDoesNotMapToString(field.name))
}

fn extract_string(items: &Dictionary, field: &Field) -> Result<String> {
    convert_string(extract(items, field)?, field)
}

fn extract_optional_string(items: &Dictionary, field: &Field) -> Result<Option<String>> {
    field.lookup(items).map(|v| convert_string(v, field)).transpose()
}

fn convert_uint(value: &BencodeValue, field: &Field) -> Result<u64> {
    match value {
        BencodeValue::Integer(num) => u64::try_from(*num)
            .map_err(|_| TorrentError::NegativeInteger { key: field.name, value: *num }),
        _ => Err(TorrentError::KeyDoesNotMapToInteger(field.name)),
    }
}

fn extract_uint(items: &Dictionary, field: &Field) -> Result<u64> {
    convert_uint(extract(items, field)?, field)
}

fn extract_optional_uint(items: &Dictionary, field: &Field) -> Result<Option<u64>> {
    field.lookup(items).map(|v| convert_uint(v, field)).transpose()
}

fn extract_list<'a>(items: &'a Dictionary, field: &Field) -> Result<&'a [BencodeValue]> {
    match extract(items, field)? {
        BencodeValue::List(elements) if elements.is_empty() => Err(TorrentError::KeyMapsToAnEmptyList(field.name)),
        BencodeValue::List(elements) => Ok(elements.as_slice()),
        _ => Err(TorrentError::KeyDoesNotMapToList(field.name)),
    }
}

fn extract_multi_file_info(value: &BencodeValue) -> Result<MultiFileInfo> {
    let items = value.as_dictionary().ok_or(TorrentError::KeyDoesNotMapToDictionary(FILES.name))?;
    let length = extract_uint(items, &LENGTH)?;
    let path = extract_list(items, &PATH)?
        .iter()
        .map(|component| convert_string(component, &PATH))
        .collect::<Result<Vec<String>>>()?;
    Ok(MultiFileInfo { length, path })
}

fn extract_pieces(items: &Dictionary) -> Result<Vec<u8>> {
    let pieces = extract(items, &PIECES)?
        .as_bytes()
        .ok_or(TorrentError::KeyDoesNotMapToString(PIECES.name))?;
    if pieces.len() % DIGEST_LEN != 0 {
        return Err(TorrentError::InvalidPiecesLength(pieces.len()));
    }
    Ok(pieces.to_vec())
}

impl FileModeInfo {
    /// Sum of all file lengths, or `None` if it does not fit in a `u64`.
    pub fn checked_total_length(&self) -> Option<u64> {
        match self {
            FileModeInfo::Single { length } => Some(*length),
            FileModeInfo::Multiple { files } => files.iter().try_fold(0u64, |total, f| total.checked_add(f.length)),
        }
    }

    /// Saturates instead of overflowing. Decoded records never saturate
    /// since `check_piece_count` rejects them first.
    pub fn total_length(&self) -> u64 {
        self.checked_total_length().unwrap_or(u64::MAX)
    }
}

impl InfoDict {
    pub fn num_pieces(&self) -> usize {
        self.pieces.len() / DIGEST_LEN
    }

    pub fn piece_hashes(&self) -> impl Iterator<Item = &[u8]> {
        self.pieces.chunks_exact(DIGEST_LEN)
    }

    /// SHA-1 of the encoded info dictionary.
    pub fn info_hash(&self) -> [u8; 20] {
        let encoded = bencode::encode(&BencodeValue::from(self));
        Sha1::digest(&encoded).into()
    }

    /// Pulls just the info dictionary out of a decoded torrent, ignoring
    /// whatever else the top level carries.
    pub fn from_torrent(value: &BencodeValue) -> Result<Self> {
        let items = value.as_dictionary().ok_or(TorrentError::FileIsNotDictionary)?;
        InfoDict::try_from(extract(items, &INFO)?)
    }

    fn check_piece_count(&self) -> Result<()> {
        let total = self.layout.checked_total_length().ok_or(TorrentError::LengthOverflow)?;
        let expected = total.div_ceil(self.piece_length);
        let actual = self.num_pieces() as u64;
        if expected != actual {
            return Err(TorrentError::PieceCountMismatch { total, piece_length: self.piece_length, expected, actual });
        }
        Ok(())
    }
}

impl TryFrom<&BencodeValue> for InfoDict {
    type Error = TorrentError;

    fn try_from(value: &BencodeValue) -> Result<Self> {
        let items = value.as_dictionary().ok_or(TorrentError::KeyDoesNotMapToDictionary(INFO.name))?;
        let name = extract_string(items, &NAME)?;
        let piece_length = extract_uint(items, &PIECE_LENGTH)?;
        if piece_length == 0 {
            return Err(TorrentError::InvalidPieceLength);
        }
        let pieces = extract_pieces(items)?;
        let private = match extract_optional_uint(items, &PRIVATE)? {
            None | Some(0) => false,
            Some(1) => true,
            Some(v) => return Err(TorrentError::InvalidPrivateValue(v)),
        };
        let layout = match (LENGTH.lookup(items), FILES.lookup(items)) {
            (Some(_), Some(_)) => return Err(TorrentError::AmbiguousLayout),
            (None, Some(_)) => {
                let files = extract_list(items, &FILES)?
                    .iter()
                    .map(extract_multi_file_info)
                    .collect::<Result<Vec<MultiFileInfo>>>()?;
                FileModeInfo::Multiple { files }
            },
            _ => FileModeInfo::Single { length: extract_uint(items, &LENGTH)? },
        };

        let info = InfoDict { name, piece_length, pieces, layout, private };
        info.check_piece_count()?;
        Ok(info)
    }
}

impl From<&InfoDict> for BencodeValue {
    fn from(info: &InfoDict) -> Self {
        let mut items = Dictionary::new();
        items.insert(NAME.key(), BencodeValue::from(info.name.as_str()));
        items.insert(PIECE_LENGTH.key(), integer(info.piece_length));
        items.insert(PIECES.key(), BencodeValue::ByteString(info.pieces.clone()));
        items.insert(PRIVATE.key(), BencodeValue::Integer(i64::from(info.private)));
        match &info.layout {
            FileModeInfo::Single { length } => {
                items.insert(LENGTH.key(), integer(*length));
            },
            FileModeInfo::Multiple { files } => {
                let files = files
                    .iter()
                    .map(|file| {
                        let mut entry = Dictionary::new();
                        entry.insert(LENGTH.key(), integer(file.length));
                        entry.insert(
                            PATH.key(),
                            BencodeValue::List(file.path.iter().map(|c| BencodeValue::from(c.as_str())).collect()),
                        );
                        BencodeValue::Dictionary(entry)
                    })
                    .collect();
                items.insert(FILES.key(), BencodeValue::List(files));
            },
        }
        BencodeValue::Dictionary(items)
    }
}

impl TryFrom<&BencodeValue> for TorrentFile {
    type Error = TorrentError;

    fn try_from(value: &BencodeValue) -> Result<Self> {
        let items = value.as_dictionary().ok_or(TorrentError::FileIsNotDictionary)?;
        Ok(TorrentFile {
            announce: extract_string(items, &ANNOUNCE)?,
            comment: extract_optional_string(items, &COMMENT)?,
            created_by: extract_optional_string(items, &CREATED_BY)?,
            creation_date: extract_optional_uint(items, &CREATION_DATE)?,
            info: InfoDict::try_from(extract(items, &INFO)?)?,
        })
    }
}

impl From<&TorrentFile> for BencodeValue {
    fn from(file: &TorrentFile) -> Self {
        let mut items = Dictionary::new();
        items.insert(ANNOUNCE.key(), BencodeValue::from(file.announce.as_str()));
        if let Some(comment) = &file.comment {
            items.insert(COMMENT.key(), BencodeValue::from(comment.as_str()));
        }
        if let Some(author) = &file.created_by {
            items.insert(CREATED_BY.key(), BencodeValue::from(author.as_str()));
        }
        if let Some(date) = file.creation_date {
            items.insert(CREATION_DATE.key(), integer(date));
        }
        items.insert(INFO.key(), BencodeValue::from(&file.info));
        BencodeValue::Dictionary(items)
    }
}

impl TorrentFile {
    pub fn new(announce: &str, comment: &str, created_by: &str, info: InfoDict) -> Self {
        TorrentFile {
            announce: announce.to_owned(),
            comment: Some(comment.to_owned()),
            created_by: Some(created_by.to_owned()),
            creation_date: None,
            info,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        bencode::encode(&BencodeValue::from(self))
    }
}

impl fmt::Display for FileModeInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FileModeInfo::Single { length } => write!(f, "single file ({})", HumanBytes(*length)),
            FileModeInfo::Multiple { files } => {
                let file_list = files
                    .iter()
                    .map(|i| format!("{} ({})", i.path.join("/"), HumanBytes(i.length)))
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "[{}]", file_list)
            }
        }
    }
}

impl fmt::Display for TorrentFile {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "announce: {}", self.announce)?;
        if let Some(date) = &self.creation_date {
            writeln!(f, "created: {} seconds since epoch", date)?;
        }
        if let Some(text) = &self.comment {
            writeln!(f, "comment: {}", text)?;
        }
        if let Some(author) = &self.created_by {
            writeln!(f, "created by: {}", author)?;
        }
        writeln!(f, "name: {}", self.info.name)?;
        writeln!(f, "info hash: {}", hex::encode(self.info.info_hash()))?;
        writeln!(f, "private: {}", self.info.private)?;
        writeln!(f, "size: {} ({} pieces of {} each)",
            HumanBytes(self.info.layout.total_length()),
            self.info.num_pieces(),
            HumanBytes(self.info.piece_length))?;
        writeln!(f, "file(s): {}", self.info.layout)
    }
}
