//! Byte encodings for L2 entries and invalidation messages

use std::str::FromStr;

use serde::{Serialize, de::DeserializeOwned};

use crate::CacheError;

/// MessagePack encoding of `nil`.
const MSGPACK_NIL: u8 = 0xc0;

/// Serializer implementations, selected by name at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Serializer {
    Json,
    MessagePack,
}

impl Serializer {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::MessagePack => "msgpack",
        }
    }

    /// Encode a value. Values that encode to null are rejected.
    pub fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CacheError> {
        let bytes = match self {
            Self::Json => serde_json::to_vec(value)?,
            Self::MessagePack => rmp_serde::to_vec_named(value)?,
        };
        let is_null = match self {
            Self::Json => bytes == b"null",
            Self::MessagePack => bytes == [MSGPACK_NIL],
        };
        if is_null {
            return Err(CacheError::serialization("cannot serialize a null value"));
        }
        Ok(bytes)
    }

    /// Decode a value. Empty input is rejected.
    pub fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CacheError> {
        if bytes.is_empty() {
            return Err(CacheError::serialization("cannot deserialize empty input"));
        }
        let value = match self {
            Self::Json => serde_json::from_slice(bytes)?,
            Self::MessagePack => rmp_serde::from_slice(bytes)?,
        };
        Ok(value)
    }
}

impl FromStr for Serializer {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "msgpack" | "messagepack" => Ok(Self::MessagePack),
            other => Err(CacheError::config(format!("unknown serializer '{other}'"))),
        }
    }
}
