// Copyright 2025 CounterMesh Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Wire codecs and content negotiation. Two codecs ship: JSON for
//! human/debug use and a compact binary codec (`bincode`, standing in
//! for the original's bond-compact-binary) as the default.

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("json decode failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("binary decode failed: {0}")]
    Binary(#[from] bincode::Error),
}

pub trait Encoder {
    fn content_type(&self) -> &'static str;
    fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes, CodecError>;
    /// Serialize directly into a caller-supplied buffer (typically a
    /// pooled one) instead of allocating a fresh `Vec` per call.
    fn encode_into<T: Serialize>(&self, buf: &mut Vec<u8>, value: &T) -> Result<(), CodecError>;
}

pub trait Decoder {
    fn decode<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T, CodecError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Encoder for JsonCodec {
    fn content_type(&self) -> &'static str {
        "application/json"
    }
    fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }
    fn encode_into<T: Serialize>(&self, buf: &mut Vec<u8>, value: &T) -> Result<(), CodecError> {
        serde_json::to_writer(buf, value)?;
        Ok(())
    }
}

impl Decoder for JsonCodec {
    fn decode<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T, CodecError> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// Default wire codec: `bincode`, identified on the wire as
/// `application/bond-compact-binary` (matching the original's codec
/// name even though the encoding itself is `bincode`).
#[derive(Debug, Clone, Copy, Default)]
pub struct BondCompactCodec;

impl Encoder for BondCompactCodec {
    fn content_type(&self) -> &'static str {
        "application/bond-compact-binary"
    }
    fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes, CodecError> {
        Ok(Bytes::from(bincode::serialize(value)?))
    }
    fn encode_into<T: Serialize>(&self, buf: &mut Vec<u8>, value: &T) -> Result<(), CodecError> {
        bincode::serialize_into(buf, value)?;
        Ok(())
    }
}

impl Decoder for BondCompactCodec {
    fn decode<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T, CodecError> {
        Ok(bincode::deserialize(body)?)
    }
}

/// One parsed `Accept`/`Accept-Encoding` entry: `name;q=value`.
#[derive(Debug, Clone, PartialEq)]
struct QualifiedValue {
    name: String,
    q: f32,
}

fn parse_qualified_list(header: &str) -> Vec<QualifiedValue> {
    header
        .split(',')
        .filter_map(|entry| {
            let entry = entry.trim();
            if entry.is_empty() {
                return None;
            }
            let mut parts = entry.split(';');
            let name = parts.next()?.trim().to_ascii_lowercase();
            let mut q = 1.0f32;
            for param in parts {
                let param = param.trim();
                if let Some(value) = param.strip_prefix("q=") {
                    q = value.trim().parse().unwrap_or(1.0);
                }
            }
            Some(QualifiedValue { name, q })
        })
        .filter(|v| v.q > 0.0)
        .collect()
}

/// The result of content negotiation. `Encoder`/`Decoder` take a generic
/// type parameter per call, which rules out a `Box<dyn Encoder>` (the
/// trait wouldn't be object-safe); a two-variant enum gets the same
/// "pick one codec at request time" behavior without that constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiatedCodec {
    Json,
    BondCompact,
}

impl NegotiatedCodec {
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Json => JsonCodec.content_type(),
            Self::BondCompact => BondCompactCodec.content_type(),
        }
    }

    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Bytes, CodecError> {
        match self {
            Self::Json => JsonCodec.encode(value),
            Self::BondCompact => BondCompactCodec.encode(value),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, body: &[u8]) -> Result<T, CodecError> {
        match self {
            Self::Json => JsonCodec.decode(body),
            Self::BondCompact => BondCompactCodec.decode(body),
        }
    }

    pub fn encode_into<T: Serialize>(&self, buf: &mut Vec<u8>, value: &T) -> Result<(), CodecError> {
        match self {
            Self::Json => JsonCodec.encode_into(buf, value),
            Self::BondCompact => BondCompactCodec.encode_into(buf, value),
        }
    }
}

/// Pick `application/json` vs the compact binary codec from an `Accept`
/// header. Binary is the default absent an explicit, higher-preference
/// `application/json`.
pub fn negotiate_request_codec(accept_header: Option<&str>) -> NegotiatedCodec {
    let Some(header) = accept_header else {
        return NegotiatedCodec::BondCompact;
    };
    let mut entries = parse_qualified_list(header);
    entries.sort_by(|a, b| b.q.partial_cmp(&a.q).unwrap_or(std::cmp::Ordering::Equal));

    for entry in entries {
        if entry.name == "application/json" {
            return NegotiatedCodec::Json;
        }
        if entry.name == "application/bond-compact-binary" || entry.name == "*/*" {
            return NegotiatedCodec::BondCompact;
        }
    }
    NegotiatedCodec::BondCompact
}

/// Sorted, q>0 encodings from an `Accept-Encoding` header, highest
/// preference first. `*` matches anything not explicitly listed.
pub fn parse_accept_encoding(header: &str) -> Vec<String> {
    let mut entries = parse_qualified_list(header);
    entries.sort_by(|a, b| b.q.partial_cmp(&a.q).unwrap_or(std::cmp::Ordering::Equal));
    entries.into_iter().map(|e| e.name).collect()
}

pub fn accepts_gzip(header: &str) -> bool {
    let encodings = parse_accept_encoding(header);
    encodings.iter().any(|e| e == "gzip" || e == "*")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trips() {
        let codec = JsonCodec;
        let encoded = codec.encode(&vec![1, 2, 3]).unwrap();
        let decoded: Vec<i32> = codec.decode(&encoded).unwrap();
        assert_eq!(decoded, vec![1, 2, 3]);
    }

    #[test]
    fn bond_compact_round_trips() {
        let codec = BondCompactCodec;
        let encoded = codec.encode(&vec![1, 2, 3]).unwrap();
        let decoded: Vec<i32> = codec.decode(&encoded).unwrap();
        assert_eq!(decoded, vec![1, 2, 3]);
    }

    #[test]
    fn negotiate_prefers_explicit_json() {
        let codec = negotiate_request_codec(Some("application/json"));
        assert_eq!(codec.content_type(), "application/json");
    }

    #[test]
    fn negotiate_defaults_to_binary_when_absent() {
        let codec = negotiate_request_codec(None);
        assert_eq!(codec.content_type(), "application/bond-compact-binary");
    }

    #[test]
    fn negotiate_respects_q_value_ordering() {
        let codec = negotiate_request_codec(Some(
            "application/json;q=0.1, application/bond-compact-binary;q=0.9",
        ));
        assert_eq!(codec.content_type(), "application/bond-compact-binary");
    }

    #[test]
    fn accept_encoding_excludes_q_zero() {
        let encodings = parse_accept_encoding("gzip;q=0, deflate;q=0.5");
        assert_eq!(encodings, vec!["deflate".to_string()]);
    }

    #[test]
    fn accept_encoding_wildcard_counts_as_gzip() {
        assert!(accepts_gzip("*"));
        assert!(accepts_gzip("gzip"));
        assert!(!accepts_gzip("deflate;q=1.0, gzip;q=0"));
    }

    #[test]
    fn empty_accept_encoding_header_yields_nothing() {
        assert!(parse_accept_encoding("").is_empty());
    }
}
