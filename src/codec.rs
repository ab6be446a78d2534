// Byte field encoding shared by the registry wire types and the helper envelope
//
// Opaque byte fields travel as base64 strings in JSON. Decoding also accepts a
// plain array of numbers so older producers that emit raw byte arrays still work.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserializer, Serializer};
use std::fmt;

pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(text)
}

/// `#[serde(with = "crate::codec::base64_bytes")]`
pub mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        deserializer.deserialize_any(BytesVisitor)
    }
}

struct BytesVisitor;

impl<'de> Visitor<'de> for BytesVisitor {
    type Value = Vec<u8>;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a base64 string or an array of bytes")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
        decode(v).map_err(E::custom)
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
        Ok(v.to_vec())
    }

    fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(Vec::new())
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let mut out = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(b) = seq.next_element::<u8>()? {
            out.push(b);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Envelope {
        #[serde(with = "super::base64_bytes", default)]
        data: Vec<u8>,
    }

    #[test]
    fn test_accepts_base64_and_arrays() {
        let from_b64: Envelope = serde_json::from_str(r#"{"data":"aGk="}"#).unwrap();
        assert_eq!(from_b64.data, b"hi");

        let from_array: Envelope = serde_json::from_str(r#"{"data":[104,105]}"#).unwrap();
        assert_eq!(from_array.data, b"hi");

        let missing: Envelope = serde_json::from_str(r#"{}"#).unwrap();
        assert!(missing.data.is_empty());
    }

    #[test]
    fn test_serializes_as_base64() {
        let json = serde_json::to_string(&Envelope { data: b"hi".to_vec() }).unwrap();
        assert_eq!(json, r#"{"data":"aGk="}"#);
    }
}
