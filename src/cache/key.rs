//! Deterministic cache key derivation
//!
//! A key is `{scope}:{digest}` where the digest is the SHA-256 of a canonical
//! JSON document built from the subject, the payload and the context pairs the
//! caller declares relevant. `serde_json` maps are ordered, so two logically
//! identical payloads always serialize to the same bytes regardless of field
//! insertion order.
//!
//! In storage, `%` and `:` inside the scope and the id are percent-encoded.
//! A storage key therefore has exactly one separator after the prefix, and
//! `("user", "1:profile")` and `("user:1", "profile")` stay distinct.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use super::error::CacheError;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
  scope: String,
  id: String,
}

#[derive(Serialize)]
struct KeyMaterial<'a> {
  subject: &'a str,
  payload: serde_json::Value,
  context: BTreeMap<&'a str, &'a str>,
}

impl CacheKey {
  /// Key with an explicit identifier, for callers that already have a
  /// stable natural id (e.g. `CacheKey::new("user:42", "profile")`).
  pub fn new(scope: impl Into<String>, id: impl Into<String>) -> Self {
    Self {
      scope: scope.into(),
      id: id.into(),
    }
  }

  /// Derives a key from the logical request.
  ///
  /// Only `context` pairs passed here take part in the digest; anything the
  /// caller leaves out (auth tokens, request ids, timestamps) cannot change
  /// the key. Duplicate context names keep the last value.
  pub fn derive<P: Serialize + ?Sized>(
    scope: &str,
    subject: &str,
    payload: &P,
    context: &[(&str, &str)],
  ) -> Result<Self, CacheError> {
    let material = KeyMaterial {
      subject,
      payload: serde_json::to_value(payload)?,
      context: context.iter().copied().collect(),
    };
    let canonical = serde_json::to_vec(&material)?;
    let digest = Sha256::digest(&canonical);
    Ok(Self::new(scope, hex::encode(digest)))
  }

  pub fn scope(&self) -> &str {
    &self.scope
  }

  pub fn id(&self) -> &str {
    &self.id
  }

  /// Storage key under the given namespace prefix
  pub fn to_storage_key(&self, prefix: &str) -> String {
    let scope = encode_segment(&self.scope);
    let id = encode_segment(&self.id);
    if prefix.is_empty() {
      format!("{}:{}", scope, id)
    } else {
      format!("{}:{}:{}", prefix, scope, id)
    }
  }
}

/// Percent-encode the key separator (and `%` itself) in one key segment
pub fn encode_segment(segment: &str) -> Cow<'_, str> {
  if !segment.contains([':', '%']) {
    return Cow::Borrowed(segment);
  }
  let mut out = String::with_capacity(segment.len() + 8);
  for c in segment.chars() {
    match c {
      '%' => out.push_str("%25"),
      ':' => out.push_str("%3A"),
      other => out.push(other),
    }
  }
  Cow::Owned(out)
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}:{}", self.scope, self.id)
  }
}
