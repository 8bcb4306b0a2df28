//! Serde adapter encoding raw bytes as standard padded base64 strings.

use data_encoding::BASE64;
use serde::{Deserialize, Deserializer, Serializer};

pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&BASE64.encode(bytes))
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let s = String::deserialize(deserializer)?;
    BASE64
        .decode(s.as_bytes())
        .map_err(serde::de::Error::custom)
}
