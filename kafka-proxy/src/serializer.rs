use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SerializerError {
    #[error("{field} is not valid utf-8: {source}")]
    Utf8 {
        field: &'static str,
        source: std::str::Utf8Error,
    },
    #[error("{field} is not valid json: {source}")]
    Json {
        field: &'static str,
        source: serde_json::Error,
    },
    #[error("unknown serializer: {0}")]
    Unknown(String),
}

/// How the key or value bytes of a record are expected to be encoded.
///
/// Records always carry raw bytes; the serializer only checks them before
/// dispatch so that a malformed record is handled as a poison pill instead of
/// reaching a listener or a remote client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Serializer {
    #[default]
    ByteArray,
    String,
    Json,
}

impl Serializer {
    pub fn validate(&self, field: &'static str, bytes: Option<&[u8]>) -> Result<(), SerializerError> {
        let Some(bytes) = bytes else {
            return Ok(());
        };

        match self {
            Serializer::ByteArray => Ok(()),
            Serializer::String => std::str::from_utf8(bytes)
                .map(|_| ())
                .map_err(|source| SerializerError::Utf8 { field, source }),
            Serializer::Json => serde_json::from_slice::<serde::de::IgnoredAny>(bytes)
                .map(|_| ())
                .map_err(|source| SerializerError::Json { field, source }),
        }
    }
}

impl FromStr for Serializer {
    type Err = SerializerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bytes" | "byte_array" | "bytearray" => Ok(Serializer::ByteArray),
            "string" | "utf8" => Ok(Serializer::String),
            "json" => Ok(Serializer::Json),
            other => Err(SerializerError::Unknown(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(Serializer::ByteArray, &[0xff, 0x00], true ; "bytes accept anything")]
    #[test_case(Serializer::String, b"hello", true ; "string accepts utf8")]
    #[test_case(Serializer::String, &[0xff, 0xfe], false ; "string rejects invalid utf8")]
    #[test_case(Serializer::Json, br#"{"a":1}"#, true ; "json accepts object")]
    #[test_case(Serializer::Json, b"{not json", false ; "json rejects garbage")]
    fn test_validate(serializer: Serializer, bytes: &[u8], ok: bool) {
        assert_eq!(serializer.validate("value", Some(bytes)).is_ok(), ok);
    }

    #[test]
    fn test_missing_bytes_are_valid() {
        assert!(Serializer::Json.validate("key", None).is_ok());
    }

    #[test]
    fn test_from_str() {
        assert_eq!("JSON".parse::<Serializer>().unwrap(), Serializer::Json);
        assert_eq!("bytes".parse::<Serializer>().unwrap(), Serializer::ByteArray);
        assert!("avro".parse::<Serializer>().is_err());
    }
}
