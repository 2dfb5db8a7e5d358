//! Method descriptors
//!
//! A descriptor records what a storage method expects as arguments, how to
//! build its request key and how to fill an empty storage slot.

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::value::Value;

/// Account ids and hashes are 32 bytes
const FIXED_HASH_LEN: usize = 32;

/// Declared kind of a single method argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgKind {
    Bool,
    U32,
    U64,
    U128,
    Text,
    Bytes,
    /// 32-byte account identifier
    AccountId,
    /// 32-byte hash
    Hash,
    List(Box<ArgKind>),
    /// Type the crate does not interpret; any non-null value is accepted
    Opaque(String),
}

impl ArgKind {
    /// Parse a metadata type name
    pub fn parse(name: &str) -> Self {
        let name = name.trim();
        if name == "Vec<u8>" {
            return ArgKind::Bytes;
        }
        if let Some(inner) = name
            .strip_prefix("Vec<")
            .and_then(|rest| rest.strip_suffix('>'))
        {
            return ArgKind::List(Box::new(ArgKind::parse(inner)));
        }

        match name {
            "bool" => ArgKind::Bool,
            "u8" | "u16" | "u32" | "ReferendumIndex" | "PropIndex" | "BlockNumber" => ArgKind::U32,
            "u64" | "Moment" | "Index" => ArgKind::U64,
            "u128" | "Balance" => ArgKind::U128,
            "Text" | "String" => ArgKind::Text,
            "Bytes" => ArgKind::Bytes,
            "AccountId" => ArgKind::AccountId,
            "Hash" => ArgKind::Hash,
            other => ArgKind::Opaque(other.to_string()),
        }
    }

    /// Check whether a value fits this kind
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (ArgKind::Bool, Value::Bool(_)) => true,
            (ArgKind::U32, Value::Uint(n)) => *n <= u128::from(u32::MAX),
            (ArgKind::U64, Value::Uint(n)) => *n <= u128::from(u64::MAX),
            (ArgKind::U128, Value::Uint(_)) => true,
            (ArgKind::Text, Value::Text(_)) => true,
            (ArgKind::Bytes, Value::Bytes(_)) => true,
            (ArgKind::AccountId | ArgKind::Hash, Value::Bytes(b)) => b.len() == FIXED_HASH_LEN,
            (ArgKind::List(inner), Value::List(items)) => items.iter().all(|v| inner.accepts(v)),
            (ArgKind::Opaque(_), v) => !v.is_null(),
            _ => false,
        }
    }
}

impl std::fmt::Display for ArgKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArgKind::Bool => write!(f, "bool"),
            ArgKind::U32 => write!(f, "u32"),
            ArgKind::U64 => write!(f, "u64"),
            ArgKind::U128 => write!(f, "u128"),
            ArgKind::Text => write!(f, "Text"),
            ArgKind::Bytes => write!(f, "Bytes"),
            ArgKind::AccountId => write!(f, "AccountId"),
            ArgKind::Hash => write!(f, "Hash"),
            ArgKind::List(inner) => write!(f, "Vec<{}>", inner),
            ArgKind::Opaque(name) => write!(f, "{}", name),
        }
    }
}

/// Immutable description of one storage method
#[derive(Debug, Clone, PartialEq)]
pub struct MethodDescriptor {
    /// Module name (e.g., "democracy")
    pub module: String,
    /// Method name (e.g., "voteOf")
    pub method: String,
    /// Declared argument kinds, in order
    pub args: Vec<ArgKind>,
    /// Declared return type name
    pub returns: String,
    /// Value reported for an empty storage slot
    pub default: Option<Value>,
}

impl MethodDescriptor {
    pub fn arity(&self) -> usize {
        self.args.len()
    }

    /// Validate arguments against the declared shape
    pub fn check_args(&self, args: &[Value]) -> Result<()> {
        if args.len() != self.args.len() {
            return Err(Error::ArgumentMismatch {
                query: self.qualified_name(),
                reason: format!("expected {} arguments, got {}", self.args.len(), args.len()),
            });
        }

        for (index, (kind, value)) in self.args.iter().zip(args).enumerate() {
            if !kind.accepts(value) {
                return Err(Error::ArgumentMismatch {
                    query: self.qualified_name(),
                    reason: format!("argument {} is not a valid {}: {}", index, kind, value),
                });
            }
        }

        Ok(())
    }

    /// Build the storage request key for the given arguments
    pub fn encode_request(&self, args: &[Value]) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        Value::Text(self.module.clone()).encode_into(&mut buf);
        Value::Text(self.method.clone()).encode_into(&mut buf);
        for arg in args {
            arg.encode_into(&mut buf);
        }
        buf.freeze()
    }

    /// Turn a raw storage read into the value handed to subscribers
    ///
    /// An empty slot yields the declared default, or `Value::Null`.
    pub fn decode(&self, raw: Option<Value>) -> Value {
        match raw {
            Some(value) => value,
            None => self.default.clone().unwrap_or(Value::Null),
        }
    }

    /// `module.method` form used in errors and logs
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.module, self.method)
    }
}
