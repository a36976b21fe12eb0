//! Typed cache envelope shared by both tiers.

use super::codec::Codec;
use super::key::CacheKey;
use crate::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One cached response.
///
/// The payload is immutable once written; refreshing a key writes a new entry.
/// `access_count` is bookkeeping and may be bumped in place by the hot tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    #[serde(with = "base64_bytes")]
    pub payload: Bytes,
    pub compressed: bool,
    pub original_size: usize,
    pub stored_size: usize,
    pub request_class: String,
    #[serde(default)]
    pub requester: String,
    /// Unix milliseconds.
    pub created_at: u64,
    /// Unix milliseconds.
    pub expires_at: u64,
    #[serde(default)]
    pub access_count: u64,
}

impl CacheEntry {
    /// Build an entry from a raw origin response, compressing it if the codec says so.
    pub fn build(
        key: CacheKey,
        response: Bytes,
        codec: &Codec,
        request_class: impl Into<String>,
        requester: impl Into<String>,
        now_ms: u64,
        ttl: Duration,
    ) -> Self {
        let original_size = response.len();
        let (payload, compressed) = codec.maybe_compress(response);
        Self {
            key,
            stored_size: payload.len(),
            payload,
            compressed,
            original_size,
            request_class: request_class.into(),
            requester: requester.into(),
            created_at: now_ms,
            expires_at: now_ms.saturating_add(ttl.as_millis() as u64),
            access_count: 0,
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at
    }

    /// Time left before expiry, `None` once expired.
    pub fn remaining_ttl(&self, now_ms: u64) -> Option<Duration> {
        if self.is_expired(now_ms) {
            None
        } else {
            Some(Duration::from_millis(self.expires_at - now_ms))
        }
    }

    /// The original response bytes.
    pub fn response(&self, codec: &Codec) -> Result<Bytes> {
        if self.compressed {
            codec.decompress(&self.payload, self.original_size)
        } else {
            Ok(self.payload.clone())
        }
    }

    /// Same stored value, ignoring bookkeeping fields.
    pub fn same_value(&self, other: &CacheEntry) -> bool {
        self.key == other.key
            && self.compressed == other.compressed
            && self.created_at == other.created_at
            && self.payload == other.payload
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD
            .decode(text.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
