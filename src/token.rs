// https://redis.io/docs/reference/protocol-spec

use std::fmt;
use std::io::Cursor;
use std::str;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use strum_macros::{Display, EnumIter};
use thiserror::Error as ThisError;

static CRLF: &[u8; 2] = b"\r\n";

/// Deepest aggregate nesting accepted from a peer. Parsing is recursive, so this bounds the stack
/// a single request can consume.
pub const MAX_DEPTH: usize = 128;

#[derive(Debug, ThisError)]
pub enum ProtocolError {
    #[error("not enough data is available to parse an entire token")]
    Incomplete,
    #[error("protocol error; invalid data type byte {0:#04x}")]
    InvalidDataType(u8),
    #[error("protocol error; invalid integer {0:?}")]
    InvalidInteger(String),
    #[error("protocol error; invalid {kind} length {length}")]
    InvalidLength { kind: Kind, length: i64 },
    #[error("protocol error; missing CRLF after {0} payload")]
    MissingCrlf(Kind),
    #[error("protocol error; null must not carry a payload")]
    InvalidNull,
    #[error("protocol error; invalid boolean {0:?}, expected 't' or 'f'")]
    InvalidBoolean(String),
    #[error("protocol error; invalid double {0:?}")]
    InvalidDouble(String),
    #[error("protocol error; invalid big number {0:?}")]
    InvalidBigNumber(String),
    #[error("protocol error; verbatim string must start with a 3 byte format and ':'")]
    InvalidVerbatim,
    #[error("protocol error; invalid UTF-8 in {0}")]
    InvalidUtf8(Kind),
    #[error("protocol error; {0} must not contain CR or LF")]
    InvalidText(Kind),
    #[error("protocol error; aggregates nested deeper than {} levels", MAX_DEPTH)]
    TooDeep,
    #[error("protocol error; {size} buffered bytes exceed the frame size limit of {max}")]
    FrameTooLarge { size: usize, max: usize },
    #[error("protocol error; stream ended with {0} bytes of an incomplete token")]
    Truncated(usize),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, ThisError, PartialEq)]
pub enum EncodeError {
    #[error("{kind} payload must not contain CR or LF: {text:?}")]
    InvalidText { kind: Kind, text: String },
    #[error("invalid big number {0:?}")]
    InvalidBigNumber(String),
}

/// One RESP value. Every variant carries exactly the payload its type allows, so a simple string
/// can never hold bytes and an integer can never hold text.
#[derive(Clone, Debug, PartialEq)]
pub enum Token {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    /// `$-1\r\n`, the RESP2 null bulk string.
    NullBulk,
    Array(Vec<Token>),
    /// `*-1\r\n`, the RESP2 null array.
    NullArray,
    Null,
    Boolean(bool),
    Double(f64),
    BigNumber(String),
    BulkError(Bytes),
    Verbatim { format: [u8; 3], text: Bytes },
    Map(Vec<(Token, Token)>),
    Set(Vec<Token>),
    Push(Vec<Token>),
}

// Protocol specification: https://redis.io/docs/reference/protocol-spec/
impl Token {
    pub fn simple(s: impl Into<String>) -> Token {
        Token::Simple(s.into())
    }

    pub fn error(s: impl Into<String>) -> Token {
        Token::Error(s.into())
    }

    pub fn bulk(data: impl Into<Bytes>) -> Token {
        Token::Bulk(data.into())
    }

    pub fn kind(&self) -> Kind {
        match self {
            Token::Simple(_) => Kind::SimpleString,
            Token::Error(_) => Kind::SimpleError,
            Token::Integer(_) => Kind::Integer,
            Token::Bulk(_) | Token::NullBulk => Kind::BulkString,
            Token::Array(_) | Token::NullArray => Kind::Array,
            Token::Null => Kind::Null,
            Token::Boolean(_) => Kind::Boolean,
            Token::Double(_) => Kind::Double,
            Token::BigNumber(_) => Kind::BigNumber,
            Token::BulkError(_) => Kind::BulkError,
            Token::Verbatim { .. } => Kind::VerbatimString,
            Token::Map(_) => Kind::Map,
            Token::Set(_) => Kind::Set,
            Token::Push(_) => Kind::Push,
        }
    }

    /// Parses exactly one token starting at the cursor position. On success the cursor sits right
    /// after the token. `ProtocolError::Incomplete` means the buffer ends before the token does
    /// and the caller should retry once more data has arrived.
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Self, ProtocolError> {
        parse_token(src, 0)
    }

    /// Reads an array header. Anything else at the cursor, the null array included, yields
    /// `None` and leaves the cursor where it was.
    pub(crate) fn parse_array_header(
        src: &mut Cursor<&[u8]>,
    ) -> Result<Option<usize>, ProtocolError> {
        let start = src.position();
        if get_byte(src)? == u8::from(Kind::Array) {
            if let Some(length) = get_length(src, Kind::Array)? {
                return Ok(Some(length));
            }
        }
        src.set_position(start);
        Ok(None)
    }

    /// Parses one element of an array whose header was read with `parse_array_header`.
    pub(crate) fn parse_array_element(src: &mut Cursor<&[u8]>) -> Result<Self, ProtocolError> {
        parse_nested(src, 0)
    }

    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), EncodeError> {
        match self {
            Token::Simple(s) => put_text(dst, Kind::SimpleString, s),
            Token::Error(s) => put_text(dst, Kind::SimpleError, s),
            Token::Integer(i) => {
                put_header(dst, Kind::Integer, i);
                Ok(())
            }
            Token::Bulk(data) => {
                put_blob(dst, Kind::BulkString, data);
                Ok(())
            }
            Token::NullBulk => {
                put_header(dst, Kind::BulkString, -1);
                Ok(())
            }
            Token::Array(items) => {
                put_header(dst, Kind::Array, items.len());
                items.iter().try_for_each(|item| item.encode(dst))
            }
            Token::NullArray => {
                put_header(dst, Kind::Array, -1);
                Ok(())
            }
            Token::Null => {
                dst.put_u8(u8::from(Kind::Null));
                dst.extend_from_slice(CRLF);
                Ok(())
            }
            Token::Boolean(b) => {
                put_header(dst, Kind::Boolean, if *b { 't' } else { 'f' });
                Ok(())
            }
            Token::Double(d) => {
                put_header(dst, Kind::Double, format_double(*d));
                Ok(())
            }
            Token::BigNumber(n) => {
                if !is_big_number(n) {
                    return Err(EncodeError::InvalidBigNumber(n.clone()));
                }
                put_header(dst, Kind::BigNumber, n);
                Ok(())
            }
            Token::BulkError(data) => {
                put_blob(dst, Kind::BulkError, data);
                Ok(())
            }
            // =<length>\r\n<format>:<data>\r\n
            Token::Verbatim { format, text } => {
                put_header(dst, Kind::VerbatimString, format.len() + 1 + text.len());
                dst.extend_from_slice(format);
                dst.put_u8(b':');
                dst.extend_from_slice(text);
                dst.extend_from_slice(CRLF);
                Ok(())
            }
            Token::Map(pairs) => {
                put_header(dst, Kind::Map, pairs.len());
                pairs.iter().try_for_each(|(key, value)| {
                    key.encode(dst)?;
                    value.encode(dst)
                })
            }
            Token::Set(items) => {
                put_header(dst, Kind::Set, items.len());
                items.iter().try_for_each(|item| item.encode(dst))
            }
            Token::Push(items) => {
                put_header(dst, Kind::Push, items.len());
                items.iter().try_for_each(|item| item.encode(dst))
            }
        }
    }

    pub fn serialize(&self) -> Result<Bytes, EncodeError> {
        let mut dst = BytesMut::new();
        self.encode(&mut dst)?;
        Ok(dst.freeze())
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Simple(s) => write!(f, "{}", s),
            Token::Error(s) => write!(f, "(error) {}", s),
            Token::Integer(i) => write!(f, "(integer) {}", i),
            Token::Bulk(bytes) => write!(f, "{:?}", String::from_utf8_lossy(bytes)),
            Token::NullBulk | Token::NullArray | Token::Null => write!(f, "(nil)"),
            Token::Boolean(b) => write!(f, "(boolean) {}", b),
            Token::Double(d) => write!(f, "(double) {}", format_double(*d)),
            Token::BigNumber(n) => write!(f, "(big number) {}", n),
            Token::BulkError(bytes) => write!(f, "(error) {}", String::from_utf8_lossy(bytes)),
            Token::Verbatim { format, text } => write!(
                f,
                "{}:{}",
                String::from_utf8_lossy(format),
                String::from_utf8_lossy(text)
            ),
            Token::Array(items) | Token::Set(items) | Token::Push(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Token::Map(pairs) => {
                write!(f, "{{")?;
                for (i, (key, value)) in pairs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", key, value)?;
                }
                write!(f, "}}")
            }
        }
    }
}

fn parse_token(src: &mut Cursor<&[u8]>, depth: usize) -> Result<Token, ProtocolError> {
    // The first byte in an RESP-serialized payload always identifies its type.
    // Subsequent bytes constitute the type's contents.
    let kind = Kind::try_from(get_byte(src)?)?;

    match kind {
        Kind::SimpleString => get_text(src, kind).map(Token::Simple),
        Kind::SimpleError => get_text(src, kind).map(Token::Error),
        Kind::Integer => get_integer(src).map(Token::Integer),
        // $<length>\r\n<data>\r\n
        Kind::BulkString => match get_length(src, kind)? {
            Some(length) => get_payload(src, length, kind).map(Token::Bulk),
            None => Ok(Token::NullBulk),
        },
        // !<length>\r\n<error>\r\n
        Kind::BulkError => {
            // The protocol does not define a null bulk error.
            let length = get_required_length(src, kind)?;
            get_payload(src, length, kind).map(Token::BulkError)
        }
        // =<length>\r\n<format>:<data>\r\n
        Kind::VerbatimString => {
            let length = get_required_length(src, kind)?;
            let payload = get_payload(src, length, kind)?;
            if payload.len() < 4 || payload[3] != b':' {
                return Err(ProtocolError::InvalidVerbatim);
            }
            let format = [payload[0], payload[1], payload[2]];
            Ok(Token::Verbatim {
                format,
                text: payload.slice(4..),
            })
        }
        // *<number-of-elements>\r\n<element-1>...<element-n>
        Kind::Array => match get_length(src, kind)? {
            Some(length) => parse_items(src, length, depth).map(Token::Array),
            None => Ok(Token::NullArray),
        },
        Kind::Set => {
            let length = get_required_length(src, kind)?;
            parse_items(src, length, depth).map(Token::Set)
        }
        Kind::Push => {
            let length = get_required_length(src, kind)?;
            parse_items(src, length, depth).map(Token::Push)
        }
        // %<number-of-entries>\r\n<key-1><value-1>...<key-n><value-n>
        Kind::Map => {
            let length = get_required_length(src, kind)?;
            let mut pairs = Vec::with_capacity(length.min(src.remaining()));
            for _ in 0..length {
                let key = parse_nested(src, depth)?;
                let value = parse_nested(src, depth)?;
                pairs.push((key, value));
            }
            Ok(Token::Map(pairs))
        }
        Kind::Null => {
            if !get_line(src)?.is_empty() {
                return Err(ProtocolError::InvalidNull);
            }
            Ok(Token::Null)
        }
        Kind::Boolean => match get_line(src)? {
            b"t" => Ok(Token::Boolean(true)),
            b"f" => Ok(Token::Boolean(false)),
            line => Err(ProtocolError::InvalidBoolean(
                String::from_utf8_lossy(line).into_owned(),
            )),
        },
        Kind::Double => {
            let text = get_text(src, kind)?;
            parse_double(&text)
                .map(Token::Double)
                .ok_or(ProtocolError::InvalidDouble(text))
        }
        Kind::BigNumber => {
            let text = get_text(src, kind)?;
            if !is_big_number(&text) {
                return Err(ProtocolError::InvalidBigNumber(text));
            }
            Ok(Token::BigNumber(text))
        }
    }
}

fn parse_items(
    src: &mut Cursor<&[u8]>,
    length: usize,
    depth: usize,
) -> Result<Vec<Token>, ProtocolError> {
    // A peer can declare any count; only reserve what the buffer could possibly hold.
    let mut items = Vec::with_capacity(length.min(src.remaining()));
    for _ in 0..length {
        items.push(parse_nested(src, depth)?);
    }
    Ok(items)
}

fn parse_nested(src: &mut Cursor<&[u8]>, depth: usize) -> Result<Token, ProtocolError> {
    let depth = depth + 1;
    if depth > MAX_DEPTH {
        return Err(ProtocolError::TooDeep);
    }
    parse_token(src, depth)
}

/// Returns the line starting at the cursor without its CRLF terminator, and moves the cursor past
/// the terminator.
fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], ProtocolError> {
    let start = src.position() as usize;
    let end = src.get_ref().len();

    let line_end = src.get_ref()[start..end]
        .windows(2)
        .position(|window| window == CRLF)
        .map(|index| start + index)
        .ok_or(ProtocolError::Incomplete)?;

    src.set_position((line_end + CRLF.len()) as u64);

    Ok(&src.get_ref()[start..line_end])
}

fn get_text(src: &mut Cursor<&[u8]>, kind: Kind) -> Result<String, ProtocolError> {
    let line = get_line(src)?;
    // Simple text may not carry a CR or LF of its own.
    if line.iter().any(|b| matches!(b, b'\r' | b'\n')) {
        return Err(ProtocolError::InvalidText(kind));
    }
    str::from_utf8(line)
        .map(str::to_string)
        .map_err(|_| ProtocolError::InvalidUtf8(kind))
}

fn get_integer(src: &mut Cursor<&[u8]>) -> Result<i64, ProtocolError> {
    let line = get_line(src)?;
    str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| ProtocolError::InvalidInteger(String::from_utf8_lossy(line).into_owned()))
}

/// Reads a length header. `None` is the `-1` null marker.
fn get_length(src: &mut Cursor<&[u8]>, kind: Kind) -> Result<Option<usize>, ProtocolError> {
    let length = get_integer(src)?;
    if length == -1 {
        return Ok(None);
    }
    usize::try_from(length)
        .map(Some)
        .map_err(|_| ProtocolError::InvalidLength { kind, length })
}

fn get_required_length(src: &mut Cursor<&[u8]>, kind: Kind) -> Result<usize, ProtocolError> {
    get_length(src, kind)?.ok_or(ProtocolError::InvalidLength { kind, length: -1 })
}

/// Reads exactly `length` raw bytes followed by CRLF. The payload may itself contain CR, LF or
/// NUL bytes.
fn get_payload(
    src: &mut Cursor<&[u8]>,
    length: usize,
    kind: Kind,
) -> Result<Bytes, ProtocolError> {
    if src.remaining() < length.saturating_add(CRLF.len()) {
        return Err(ProtocolError::Incomplete);
    }

    let start = src.position() as usize;
    let end = start + length;
    let data = &src.get_ref()[start..end];
    if &src.get_ref()[end..end + CRLF.len()] != CRLF {
        return Err(ProtocolError::MissingCrlf(kind));
    }

    let data = Bytes::copy_from_slice(data);
    src.advance(length + CRLF.len());
    Ok(data)
}

fn get_byte(src: &mut Cursor<&[u8]>) -> Result<u8, ProtocolError> {
    if !src.has_remaining() {
        return Err(ProtocolError::Incomplete);
    }
    Ok(src.get_u8())
}

fn put_header(dst: &mut BytesMut, kind: Kind, value: impl fmt::Display) {
    dst.put_u8(u8::from(kind));
    dst.extend_from_slice(value.to_string().as_bytes());
    dst.extend_from_slice(CRLF);
}

fn put_text(dst: &mut BytesMut, kind: Kind, text: &str) -> Result<(), EncodeError> {
    if text.contains(['\r', '\n']) {
        return Err(EncodeError::InvalidText {
            kind,
            text: text.to_string(),
        });
    }
    put_header(dst, kind, text);
    Ok(())
}

fn put_blob(dst: &mut BytesMut, kind: Kind, data: &[u8]) {
    put_header(dst, kind, data.len());
    dst.extend_from_slice(data);
    dst.extend_from_slice(CRLF);
}

fn format_double(d: f64) -> String {
    if d.is_nan() {
        "nan".to_string()
    } else if d.is_infinite() {
        if d.is_sign_positive() { "inf" } else { "-inf" }.to_string()
    } else {
        d.to_string()
    }
}

/// `inf`, `-inf`, `nan` or a plain decimal with an optional exponent. Other spellings Rust
/// accepts, such as `Infinity` or `NaN`, are not RESP.
fn parse_double(text: &str) -> Option<f64> {
    match text {
        "inf" => Some(f64::INFINITY),
        "-inf" => Some(f64::NEG_INFINITY),
        "nan" => Some(f64::NAN),
        _ if text
            .bytes()
            .all(|b| b.is_ascii_digit() || matches!(b, b'.' | b'e' | b'E' | b'+' | b'-')) =>
        {
            text.parse().ok()
        }
        _ => None,
    }
}

fn is_big_number(s: &str) -> bool {
    let digits = s.strip_prefix(['+', '-']).unwrap_or(s);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumIter)]
pub enum Kind {
    SimpleString,   // '+'
    SimpleError,    // '-'
    Integer,        // ':'
    BulkString,     // '$'
    Array,          // '*'
    // Due to historical reasons, RESP2 features two specially crafted values for representing null
    // values of bulk strings and arrays. The null type, introduced in RESP3, aims to fix this.
    Null,           // '_'
    Boolean,        // '#'
    Double,         // ','
    BigNumber,      // '('
    BulkError,      // '!'
    VerbatimString, // '='
    Map,            // '%'
    Set,            // '~'
    Push,           // '>'
}

impl TryFrom<u8> for Kind {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            b'+' => Ok(Self::SimpleString),
            b'-' => Ok(Self::SimpleError),
            b':' => Ok(Self::Integer),
            b'$' => Ok(Self::BulkString),
            b'*' => Ok(Self::Array),
            b'_' => Ok(Self::Null),
            b'#' => Ok(Self::Boolean),
            b',' => Ok(Self::Double),
            b'(' => Ok(Self::BigNumber),
            b'!' => Ok(Self::BulkError),
            b'=' => Ok(Self::VerbatimString),
            b'%' => Ok(Self::Map),
            b'~' => Ok(Self::Set),
            b'>' => Ok(Self::Push),
            _ => Err(ProtocolError::InvalidDataType(byte)),
        }
    }
}

impl From<Kind> for u8 {
    fn from(value: Kind) -> Self {
        match value {
            Kind::SimpleString => b'+',
            Kind::SimpleError => b'-',
            Kind::Integer => b':',
            Kind::BulkString => b'$',
            Kind::Array => b'*',
            Kind::Null => b'_',
            Kind::Boolean => b'#',
            Kind::Double => b',',
            Kind::BigNumber => b'(',
            Kind::BulkError => b'!',
            Kind::VerbatimString => b'=',
            Kind::Map => b'%',
            Kind::Set => b'~',
            Kind::Push => b'>',
        }
    }
}
