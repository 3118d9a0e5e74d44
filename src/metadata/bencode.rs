use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

const MAX_DEPTH: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BencodeValue {
    Integer(i64),
    ByteString(Vec<u8>),
    List(Vec<BencodeValue>),
    Dictionary(BTreeMap<Vec<u8>, BencodeValue>),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BencodeError {
    #[error("input ended before the value was complete")]
    UnexpectedEof,
    #[error("byte string length at {pos} is malformed")]
    InvalidLength { pos: usize },
    #[error("integer at {pos} is malformed")]
    InvalidInteger { pos: usize },
    #[error("number at {pos} does not fit in 64 bits")]
    IntegerOverflow { pos: usize },
    #[error("value at {pos} is missing its terminator")]
    UnterminatedValue { pos: usize },
    #[error("dictionary key at {pos} is not strictly greater than the previous key")]
    UnsortedKeys { pos: usize },
    #[error("unknown type specifier {value:#04x} at {pos}")]
    UnknownType { pos: usize, value: u8 },
    #[error("{remaining} bytes left over after the top-level value")]
    TrailingData { remaining: usize },
    #[error("values nested too deeply at {pos}")]
    NestingTooDeep { pos: usize },
}

type Result<T> = std::result::Result<T, BencodeError>;

struct BencodeParser<'a> {
    contents: &'a [u8],
    pos: usize,
    depth: usize,
}

fn write_bytes(bytes: &[u8], f: &mut fmt::Formatter) -> fmt::Result {
    for byte in bytes {
        write!(f, "{:02X}", byte)?;
    }
    Ok(())
}

fn write_byte_string(bytes: &[u8], f: &mut fmt::Formatter) -> fmt::Result {
    match std::str::from_utf8(bytes) {
        Ok(s) if !s.chars().any(char::is_control) => write!(f, "{}", s),
        _ => write_bytes(bytes, f),
    }
}

impl fmt::Display for BencodeValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BencodeValue::Integer(num) => write!(f, "{}", num),
            BencodeValue::ByteString(bytes) => write_byte_string(bytes, f),
            BencodeValue::List(elements) => {
                write!(f, "[")?;
                for (i, element) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", element)?;
                }
                write!(f, "]")
            },
            BencodeValue::Dictionary(items) => {
                write!(f, "{{")?;
                for (i, (key, value)) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write_byte_string(key, f)?;
                    write!(f, " => {}", value)?;
                }
                write!(f, "}}")
            },
        }
    }
}

impl TryFrom<&[u8]> for BencodeValue {
    type Error = BencodeError;
    fn try_from(bytes: &[u8]) -> Result<Self> {
        decode(bytes)
    }
}

impl From<&BencodeValue> for Vec<u8> {
    fn from(value: &BencodeValue) -> Vec<u8> {
        encode(value)
    }
}

impl From<&str> for BencodeValue {
    fn from(s: &str) -> Self {
        BencodeValue::ByteString(s.as_bytes().to_vec())
    }
}

impl BencodeValue {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::ByteString(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_dictionary(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            BencodeValue::Dictionary(items) => Some(items),
            _ => None,
        }
    }
}

/// Parses exactly one value spanning all of `bytes`.
pub fn decode(bytes: &[u8]) -> Result<BencodeValue> {
    let mut parser = BencodeParser { contents: bytes, pos: 0, depth: 0 };
    parser.deserialize()
}

/// Serializes `value`. Dictionary keys come out in ascending byte order
/// because the map keeps them sorted.
pub fn encode(value: &BencodeValue) -> Vec<u8> {
    let mut v: Vec<u8> = Vec::new();
    encode_into(value, &mut v);
    v
}

pub fn encode_into(value: &BencodeValue, v: &mut Vec<u8>) {
    match value {
        BencodeValue::Integer(i) => {
            v.push(b'i');
            v.extend(i.to_string().as_bytes());
            v.push(b'e');
        },
        BencodeValue::ByteString(bytes) => write_string(bytes, v),
        BencodeValue::List(elements) => {
            v.push(b'l');
            for element in elements {
                encode_into(element, v);
            }
            v.push(b'e');
        },
        BencodeValue::Dictionary(items) => {
            v.push(b'd');
            for (key, value) in items {
                write_string(key, v);
                encode_into(value, v);
            }
            v.push(b'e');
        }
    }
}

fn write_string(bytes: &[u8], v: &mut Vec<u8>) {
    v.reserve(20 + 1 + bytes.len());
    v.extend(bytes.len().to_string().as_bytes());
    v.push(b':');
    v.extend_from_slice(bytes);
}

impl<'a> BencodeParser<'a> {

    fn deserialize(&mut self) -> Result<BencodeValue> {
        let value: BencodeValue = self.parse_value()?;
        if self.pos != self.contents.len() {
            Err(BencodeError::TrailingData { remaining: self.contents.len() - self.pos })
        } else {
            Ok(value)
        }
    }

    fn parse_value(&mut self) -> Result<BencodeValue> {
        let first: u8 = self.peek()?;
        match first {
            b'i' => self.parse_integer(),
            b'l' => self.nested(Self::parse_list),
            b'd' => self.nested(Self::parse_dictionary),
            b'0'..=b'9' => self.parse_string().map(BencodeValue::ByteString),
            _ => Err(BencodeError::UnknownType { pos: self.pos, value: first })
        }
    }

    fn nested(&mut self, parse: fn(&mut Self) -> Result<BencodeValue>) -> Result<BencodeValue> {
        if self.depth >= MAX_DEPTH {
            return Err(BencodeError::NestingTooDeep { pos: self.pos });
        }
        self.depth += 1;
        let value = parse(self);
        self.depth -= 1;
        value
    }

    /// Consumes a run of ASCII digits and returns their position range.
    fn scan_digits(&mut self) -> Result<(usize, usize)> {
        let start = self.pos;
        while self.peek()?.is_ascii_digit() {
            self.pos += 1;
        }
        Ok((start, self.pos))
    }

    fn parse_integer(&mut self) -> Result<BencodeValue> {
        let start = self.pos;
        self.pos += 1;
        let negative = self.peek()? == b'-';
        if negative {
            self.pos += 1;
        }
        let (digits_start, digits_end) = self.scan_digits()?;
        let digits = &self.contents[digits_start..digits_end];
        if digits.is_empty() {
            return Err(self.unterminated_or(start, BencodeError::InvalidInteger { pos: start }));
        }
        if digits[0] == b'0' && (digits.len() > 1 || negative) {
            return Err(BencodeError::InvalidInteger { pos: start });
        }
        self.expect_end(start)?;
        self.pos += 1;

        let mut value: i64 = 0;
        for &digit in digits {
            let d = i64::from(digit - b'0');
            value = value
                .checked_mul(10)
                .and_then(|v| if negative { v.checked_sub(d) } else { v.checked_add(d) })
                .ok_or(BencodeError::IntegerOverflow { pos: start })?;
        }
        Ok(BencodeValue::Integer(value))
    }

    fn parse_string(&mut self) -> Result<Vec<u8>> {
        let start = self.pos;
        let (digits_start, digits_end) = self.scan_digits()?;
        let digits = &self.contents[digits_start..digits_end];
        if digits.is_empty() || (digits[0] == b'0' && digits.len() > 1) {
            return Err(BencodeError::InvalidLength { pos: start });
        }
        if self.peek()? != b':' {
            return Err(BencodeError::InvalidLength { pos: start });
        }
        self.pos += 1;

        let mut length: usize = 0;
        for &digit in digits {
            length = length
                .checked_mul(10)
                .and_then(|v| v.checked_add(usize::from(digit - b'0')))
                .ok_or(BencodeError::IntegerOverflow { pos: start })?;
        }
        let end = self.pos.checked_add(length).ok_or(BencodeError::IntegerOverflow { pos: start })?;
        if end > self.contents.len() {
            return Err(BencodeError::UnexpectedEof);
        }
        let bytes = self.contents[self.pos..end].to_vec();
        self.pos = end;
        Ok(bytes)
    }

    fn parse_list(&mut self) -> Result<BencodeValue> {
        self.pos += 1;
        let mut values: Vec<BencodeValue> = Vec::new();
        while self.peek()? != b'e' {
            values.push(self.parse_value()?);
        }
        self.pos += 1;
        Ok(BencodeValue::List(values))
    }

    fn parse_dictionary(&mut self) -> Result<BencodeValue> {
        self.pos += 1;
        let mut map: BTreeMap<Vec<u8>, BencodeValue> = BTreeMap::new();
        while self.peek()? != b'e' {
            let key_pos = self.pos;
            if !self.peek()?.is_ascii_digit() {
                return Err(BencodeError::InvalidLength { pos: key_pos });
            }
            let key = self.parse_string()?;
            if let Some((last, _)) = map.last_key_value() {
                if key <= *last {
                    return Err(BencodeError::UnsortedKeys { pos: key_pos });
                }
            }
            let value: BencodeValue = self.parse_value()?;
            map.insert(key, value);
        }
        self.pos += 1;
        Ok(BencodeValue::Dictionary(map))
    }

    fn peek(&self) -> Result<u8> {
        self.contents.get(self.pos).copied().ok_or(BencodeError::UnexpectedEof)
    }

    fn expect_end(&self, start: usize) -> Result<()> {
        if self.peek()? != b'e' {
            Err(BencodeError::UnterminatedValue { pos: start })
        } else {
            Ok(())
        }
    }

    fn unterminated_or(&self, start: usize, err: BencodeError) -> BencodeError {
        match self.peek() {
            Ok(b'e') => err,
            Ok(_) => BencodeError::UnterminatedValue { pos: start },
            Err(eof) => eof,
        }
    }
}
