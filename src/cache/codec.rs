//! Payload encoding for both cache tiers
//!
//! Values are serialized to JSON. Payloads above the configured threshold are
//! zlib-compressed, and the compressed form is kept only when it is smaller
//! than `COMPRESSION_MAX_RATIO` of the original. The distributed tier wraps the
//! encoded bytes in a MessagePack [`Envelope`] carrying the metadata needed to
//! promote the value back into memory.

use bytes::Bytes;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::time::Duration;

use super::error::CacheError;

/// Compressed output must be below this fraction of the input to be kept
pub const COMPRESSION_MAX_RATIO: f64 = 0.9;

/// Encoded payload as stored in a tier
#[derive(Debug, Clone)]
pub struct Encoded {
  pub bytes: Bytes,
  pub compressed: bool,
  pub original_len: usize,
}

#[derive(Debug, Clone)]
pub struct Codec {
  threshold: usize,
}

impl Codec {
  pub fn new(compression_threshold_bytes: usize) -> Self {
    Self {
      threshold: compression_threshold_bytes,
    }
  }

  pub fn threshold(&self) -> usize {
    self.threshold
  }

  /// Serialize a value, compressing it when that pays off
  pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Encoded, CacheError> {
    let raw = serde_json::to_vec(value)?;
    Ok(self.pack(raw))
  }

  /// Apply the compression guard to already serialized bytes
  pub fn pack(&self, raw: Vec<u8>) -> Encoded {
    let original_len = raw.len();
    if original_len > self.threshold {
      match compress(&raw) {
        Ok(compressed) if (compressed.len() as f64) < original_len as f64 * COMPRESSION_MAX_RATIO => {
          return Encoded {
            bytes: Bytes::from(compressed),
            compressed: true,
            original_len,
          };
        }
        Ok(compressed) => {
          tracing::trace!(
            original = original_len,
            compressed = compressed.len(),
            "compression not worthwhile, storing raw"
          );
        }
        Err(e) => {
          tracing::warn!("compression failed, storing raw: {}", e);
        }
      }
    }
    Encoded {
      bytes: Bytes::from(raw),
      compressed: false,
      original_len,
    }
  }

  /// Recover the serialized bytes of a stored payload
  pub fn unpack(bytes: &Bytes, compressed: bool) -> Result<Bytes, CacheError> {
    if compressed {
      decompress(bytes).map(Bytes::from)
    } else {
      Ok(bytes.clone())
    }
  }

  pub fn decode<T: DeserializeOwned>(raw: &[u8]) -> Result<T, CacheError> {
    Ok(serde_json::from_slice(raw)?)
  }
}

fn compress(data: &[u8]) -> std::io::Result<Vec<u8>> {
  let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
  encoder.write_all(data)?;
  encoder.finish()
}

fn decompress(data: &[u8]) -> Result<Vec<u8>, CacheError> {
  let mut decoder = ZlibDecoder::new(data);
  let mut out = Vec::new();
  decoder
    .read_to_end(&mut out)
    .map_err(|e| CacheError::Serialization(format!("corrupt compressed payload: {}", e)))?;
  Ok(out)
}

/// Distributed-tier record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
  pub scope: String,
  pub compressed: bool,
  pub created_at_ms: i64,
  /// `None` = no expiry
  pub ttl_ms: Option<u64>,
  pub data: Bytes,
}

impl Envelope {
  pub fn new(scope: &str, encoded: &Encoded, ttl: Option<Duration>) -> Self {
    Self {
      scope: scope.to_string(),
      compressed: encoded.compressed,
      created_at_ms: chrono::Utc::now().timestamp_millis(),
      ttl_ms: ttl.map(|d| d.as_millis() as u64),
      data: encoded.bytes.clone(),
    }
  }

  pub fn to_vec(&self) -> Result<Vec<u8>, CacheError> {
    rmp_serde::to_vec_named(self).map_err(|e| CacheError::Serialization(e.to_string()))
  }

  pub fn from_slice(bytes: &[u8]) -> Result<Self, CacheError> {
    rmp_serde::from_slice(bytes).map_err(|e| CacheError::Serialization(e.to_string()))
  }

  fn expires_at_ms(&self) -> Option<i64> {
    self
      .ttl_ms
      .map(|ttl| self.created_at_ms.saturating_add(ttl as i64))
  }

  pub fn is_expired(&self) -> bool {
    self
      .expires_at_ms()
      .map(|exp| chrono::Utc::now().timestamp_millis() >= exp)
      .unwrap_or(false)
  }

  /// Time left before expiry, `None` when the record never expires
  pub fn remaining_ttl(&self) -> Option<Duration> {
    self.expires_at_ms().map(|exp| {
      let left = exp - chrono::Utc::now().timestamp_millis();
      Duration::from_millis(left.max(0) as u64)
    })
  }
}
