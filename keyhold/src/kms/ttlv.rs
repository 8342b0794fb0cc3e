//! TTLV encoding, the KMIP wire primitive.
//!
//! An item is a 3-byte tag, a 1-byte type, a 4-byte big-endian length, then
//! the value. Integers and enumerations carry 4 value bytes padded with 4
//! zero bytes; strings and byte strings are padded with zeros to an 8-byte
//! boundary; structures nest items with no padding of their own. A complete
//! message is a single (structure) item; anything longer than
//! [`MAX_MESSAGE_LEN`] is refused by readers and writers alike.

use byteorder::{BigEndian, ByteOrder};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{CResult, Error};

/// Upper bound on one TTLV message, per the structure-length limit.
pub const MAX_MESSAGE_LEN: usize = 65_536;

const TYPE_STRUCTURE: u8 = 0x01;
const TYPE_INTEGER: u8 = 0x02;
const TYPE_LONG_INTEGER: u8 = 0x03;
const TYPE_ENUMERATION: u8 = 0x05;
const TYPE_TEXT_STRING: u8 = 0x07;
const TYPE_BYTE_STRING: u8 = 0x08;
const TYPE_DATE_TIME: u8 = 0x09;

/// A decoded TTLV value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Structure(Vec<Item>),
    Integer(i32),
    LongInteger(i64),
    Enumeration(u32),
    TextString(String),
    ByteString(Vec<u8>),
    /// Seconds since epoch; same wire shape as LongInteger.
    DateTime(i64),
}

/// One tagged item.
#[derive(Clone, Debug, PartialEq)]
pub struct Item {
    pub tag: u32,
    pub value: Value,
}

impl Item {
    pub fn structure(tag: u32, items: Vec<Item>) -> Self {
        Item { tag, value: Value::Structure(items) }
    }

    pub fn integer(tag: u32, value: i32) -> Self {
        Item { tag, value: Value::Integer(value) }
    }

    pub fn enumeration(tag: u32, value: u32) -> Self {
        Item { tag, value: Value::Enumeration(value) }
    }

    pub fn text(tag: u32, value: &str) -> Self {
        Item { tag, value: Value::TextString(value.to_string()) }
    }

    pub fn bytes(tag: u32, value: Vec<u8>) -> Self {
        Item { tag, value: Value::ByteString(value) }
    }

    pub fn date_time(tag: u32, value: i64) -> Self {
        Item { tag, value: Value::DateTime(value) }
    }

    /// First child with the given tag, for structure items.
    pub fn child(&self, tag: u32) -> CResult<&Item> {
        match &self.value {
            Value::Structure(items) => items
                .iter()
                .find(|item| item.tag == tag)
                .ok_or_else(|| Error::Protocol(format!("TTLV structure lacks tag {:#08x}", tag))),
            _ => Err(Error::Protocol(format!("TTLV item {:#08x} is not a structure", self.tag))),
        }
    }

    /// All children with the given tag, empty for non-structures.
    pub fn children(&self, tag: u32) -> Vec<&Item> {
        match &self.value {
            Value::Structure(items) => items.iter().filter(|item| item.tag == tag).collect(),
            _ => Vec::new(),
        }
    }

    pub fn as_text(&self) -> CResult<&str> {
        match &self.value {
            Value::TextString(s) => Ok(s),
            _ => Err(Error::Protocol(format!("TTLV item {:#08x} is not a text string", self.tag))),
        }
    }

    pub fn as_bytes(&self) -> CResult<&[u8]> {
        match &self.value {
            Value::ByteString(b) => Ok(b),
            _ => Err(Error::Protocol(format!("TTLV item {:#08x} is not a byte string", self.tag))),
        }
    }

    pub fn as_enumeration(&self) -> CResult<u32> {
        match &self.value {
            Value::Enumeration(v) => Ok(*v),
            _ => Err(Error::Protocol(format!("TTLV item {:#08x} is not an enumeration", self.tag))),
        }
    }

    pub fn as_integer(&self) -> CResult<i32> {
        match &self.value {
            Value::Integer(v) => Ok(*v),
            _ => Err(Error::Protocol(format!("TTLV item {:#08x} is not an integer", self.tag))),
        }
    }
}

/// Encodes one item, appending to `out`.
fn encode_item(item: &Item, out: &mut Vec<u8>) {
    let mut tag = [0u8; 4];
    BigEndian::write_u32(&mut tag, item.tag);
    out.extend_from_slice(&tag[1..4]);

    match &item.value {
        Value::Structure(items) => {
            out.push(TYPE_STRUCTURE);
            let len_at = out.len();
            out.extend_from_slice(&[0; 4]);
            let start = out.len();
            for child in items {
                encode_item(child, out);
            }
            let len = (out.len() - start) as u32;
            BigEndian::write_u32(&mut out[len_at..len_at + 4], len);
        }
        Value::Integer(v) => {
            out.push(TYPE_INTEGER);
            out.extend_from_slice(&4u32.to_be_bytes());
            out.extend_from_slice(&v.to_be_bytes());
            out.extend_from_slice(&[0; 4]);
        }
        Value::LongInteger(v) => {
            out.push(TYPE_LONG_INTEGER);
            out.extend_from_slice(&8u32.to_be_bytes());
            out.extend_from_slice(&v.to_be_bytes());
        }
        Value::Enumeration(v) => {
            out.push(TYPE_ENUMERATION);
            out.extend_from_slice(&4u32.to_be_bytes());
            out.extend_from_slice(&v.to_be_bytes());
            out.extend_from_slice(&[0; 4]);
        }
        Value::TextString(s) => {
            out.push(TYPE_TEXT_STRING);
            out.extend_from_slice(&(s.len() as u32).to_be_bytes());
            out.extend_from_slice(s.as_bytes());
            out.extend_from_slice(&padding(s.len()));
        }
        Value::ByteString(b) => {
            out.push(TYPE_BYTE_STRING);
            out.extend_from_slice(&(b.len() as u32).to_be_bytes());
            out.extend_from_slice(b);
            out.extend_from_slice(&padding(b.len()));
        }
        Value::DateTime(v) => {
            out.push(TYPE_DATE_TIME);
            out.extend_from_slice(&8u32.to_be_bytes());
            out.extend_from_slice(&v.to_be_bytes());
        }
    }
}

fn padding(len: usize) -> Vec<u8> {
    vec![0; (8 - len % 8) % 8]
}

/// Encodes a complete message, refusing oversized ones.
pub fn encode_message(item: &Item) -> CResult<Vec<u8>> {
    let mut out = Vec::new();
    encode_item(item, &mut out);
    if out.len() > MAX_MESSAGE_LEN {
        return Err(Error::Protocol(format!("TTLV message of {} bytes exceeds limit", out.len())));
    }
    Ok(out)
}

/// Decodes one item from the front of `bytes`, returning it and the number
/// of bytes consumed.
fn decode_item(bytes: &[u8]) -> CResult<(Item, usize)> {
    if bytes.len() < 8 {
        return Err(Error::Protocol("truncated TTLV header".to_string()));
    }
    let tag = BigEndian::read_u32(&[0, bytes[0], bytes[1], bytes[2]]);
    let ty = bytes[3];
    let len = BigEndian::read_u32(&bytes[4..8]) as usize;
    let body = &bytes[8..];

    let padded = |n: usize| n + (8 - n % 8) % 8;
    let need = match ty {
        TYPE_STRUCTURE => len,
        TYPE_INTEGER | TYPE_ENUMERATION => 8,
        TYPE_LONG_INTEGER | TYPE_DATE_TIME => 8,
        TYPE_TEXT_STRING | TYPE_BYTE_STRING => padded(len),
        other => return Err(Error::Protocol(format!("unknown TTLV type {:#04x}", other))),
    };
    if body.len() < need {
        return Err(Error::Protocol("truncated TTLV value".to_string()));
    }

    let value = match ty {
        TYPE_STRUCTURE => {
            let mut items = Vec::new();
            let mut rest = &body[..len];
            while !rest.is_empty() {
                let (item, used) = decode_item(rest)?;
                items.push(item);
                rest = &rest[used..];
            }
            Value::Structure(items)
        }
        TYPE_INTEGER => {
            if len != 4 {
                return Err(Error::Protocol("integer length must be 4".to_string()));
            }
            Value::Integer(BigEndian::read_i32(&body[..4]))
        }
        TYPE_ENUMERATION => {
            if len != 4 {
                return Err(Error::Protocol("enumeration length must be 4".to_string()));
            }
            Value::Enumeration(BigEndian::read_u32(&body[..4]))
        }
        TYPE_LONG_INTEGER => {
            if len != 8 {
                return Err(Error::Protocol("long integer length must be 8".to_string()));
            }
            Value::LongInteger(BigEndian::read_i64(&body[..8]))
        }
        TYPE_DATE_TIME => {
            if len != 8 {
                return Err(Error::Protocol("date-time length must be 8".to_string()));
            }
            Value::DateTime(BigEndian::read_i64(&body[..8]))
        }
        TYPE_TEXT_STRING => {
            let s = std::str::from_utf8(&body[..len])
                .map_err(|err| Error::Protocol(format!("bad TTLV text: {}", err)))?;
            Value::TextString(s.to_string())
        }
        TYPE_BYTE_STRING => Value::ByteString(body[..len].to_vec()),
        _ => unreachable!(),
    };
    Ok((Item { tag, value }, 8 + need))
}

/// Decodes a complete message, refusing trailing bytes.
pub fn decode_message(bytes: &[u8]) -> CResult<Item> {
    if bytes.len() > MAX_MESSAGE_LEN {
        return Err(Error::Protocol(format!("TTLV message of {} bytes exceeds limit", bytes.len())));
    }
    let (item, used) = decode_item(bytes)?;
    if used != bytes.len() {
        return Err(Error::Protocol("trailing bytes after TTLV message".to_string()));
    }
    Ok(item)
}

/// Writes one message to the stream.
pub async fn write_message<S: AsyncWrite + Unpin>(stream: &mut S, item: &Item) -> CResult<()> {
    let bytes = encode_message(item)?;
    stream.write_all(&bytes).await.map_err(|err| Error::Protocol(err.to_string()))?;
    stream.flush().await.map_err(|err| Error::Protocol(err.to_string()))?;
    Ok(())
}

/// Reads one message off the stream: 8-byte item header first (which fixes
/// the total length), then the remainder.
pub async fn read_message<S: AsyncRead + Unpin>(stream: &mut S) -> CResult<Item> {
    let mut header = [0u8; 8];
    stream.read_exact(&mut header).await.map_err(|err| Error::Protocol(err.to_string()))?;
    let ty = header[3];
    let len = BigEndian::read_u32(&header[4..8]) as usize;
    let padded = |n: usize| n + (8 - n % 8) % 8;
    let body_len = match ty {
        TYPE_STRUCTURE => len,
        TYPE_INTEGER | TYPE_ENUMERATION | TYPE_LONG_INTEGER | TYPE_DATE_TIME => 8,
        TYPE_TEXT_STRING | TYPE_BYTE_STRING => padded(len),
        other => return Err(Error::Protocol(format!("unknown TTLV type {:#04x}", other))),
    };
    if 8 + body_len > MAX_MESSAGE_LEN {
        return Err(Error::Protocol(format!("TTLV message of {} bytes exceeds limit", 8 + body_len)));
    }
    let mut bytes = header.to_vec();
    bytes.resize(8 + body_len, 0);
    stream
        .read_exact(&mut bytes[8..])
        .await
        .map_err(|err| Error::Protocol(err.to_string()))?;
    decode_message(&bytes)
}
