//! Decoded storage values
//!
//! Values arrive from the source already decoded. The crate treats them as
//! opaque apart from equality (for query keys and duplicate suppression) and
//! a canonical byte encoding used to build storage request keys.

use bytes::{BufMut, Bytes, BytesMut};

/// A decoded storage value or query argument
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Value {
    /// Empty storage slot with no declared default
    Null,
    Bool(bool),
    Uint(u128),
    Text(String),
    /// Raw bytes (account ids, hashes)
    Bytes(Bytes),
    List(Vec<Value>),
}

impl Value {
    /// Create a bytes value from a static slice
    pub fn from_static(data: &'static [u8]) -> Self {
        Value::Bytes(Bytes::from_static(data))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_uint(&self) -> Option<u128> {
        match self {
            Value::Uint(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Append the canonical encoding of this value
    ///
    /// Layout is a one-byte tag followed by the payload. Variable-length
    /// payloads are prefixed with a little-endian `u32` length.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Value::Null => buf.put_u8(0x00),
            Value::Bool(b) => {
                buf.put_u8(0x01);
                buf.put_u8(u8::from(*b));
            }
            Value::Uint(n) => {
                buf.put_u8(0x02);
                buf.put_u128_le(*n);
            }
            Value::Text(s) => {
                buf.put_u8(0x03);
                buf.put_u32_le(s.len() as u32);
                buf.put_slice(s.as_bytes());
            }
            Value::Bytes(b) => {
                buf.put_u8(0x04);
                buf.put_u32_le(b.len() as u32);
                buf.put_slice(b);
            }
            Value::List(items) => {
                buf.put_u8(0x05);
                buf.put_u32_le(items.len() as u32);
                for item in items {
                    item.encode_into(buf);
                }
            }
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Uint(n) => write!(f, "{}", n),
            Value::Text(s) => write!(f, "{:?}", s),
            Value::Bytes(b) => write!(f, "0x{}", hex::encode(b)),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Uint(n.into())
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Uint(n.into())
    }
}

impl From<u128> for Value {
    fn from(n: u128) -> Self {
        Value::Uint(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}
