//! Stable content fingerprints.
//!
//! Every identity and cache key in the crate is a SHA-256 digest over a
//! canonical byte encoding, so a fingerprint computed today names the same
//! artifact on disk tomorrow (unlike `DefaultHasher`, whose output may change
//! between Rust releases).

use crate::core::data::{DataValue, Params};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// A SHA-256 digest rendered as 64 lowercase hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint of raw bytes.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Fingerprint(hex::encode(Sha256::digest(bytes)))
    }

    /// Fingerprint of the canonical JSON encoding of `value`.
    pub fn of_value(value: &DataValue) -> Self {
        Self::of_bytes(&canonical_bytes(value))
    }

    /// Fingerprint of the data handed to a block together with the
    /// arguments routed to it. This is the input half of every cache key.
    pub fn of_input(data: &DataValue, params: &Params) -> Self {
        Hasher::new("input").value(data).params(params).finish()
    }

    /// Input fingerprint of a prediction: the data and arguments plus the
    /// identity of the fitted state that produces it.
    pub fn of_fitted_input(fitted: &Fingerprint, data: &DataValue, params: &Params) -> Self {
        Hasher::new("fitted-input")
            .fingerprint(fitted)
            .value(data)
            .params(params)
            .finish()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The first twelve characters, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..self.0.len().min(12)]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Incremental builder for fingerprints made of several parts.
///
/// Each part is length-prefixed, so `("ab", "c")` and `("a", "bc")` never
/// collide. The domain string keeps fingerprints of different kinds of
/// things apart.
pub struct Hasher(Sha256);

impl Hasher {
    pub fn new(domain: &str) -> Self {
        let mut hasher = Hasher(Sha256::new());
        hasher.update(domain.as_bytes());
        hasher
    }

    fn update(&mut self, bytes: &[u8]) {
        self.0.update((bytes.len() as u64).to_le_bytes());
        self.0.update(bytes);
    }

    pub fn field(mut self, part: impl AsRef<[u8]>) -> Self {
        self.update(part.as_ref());
        self
    }

    pub fn fingerprint(self, part: &Fingerprint) -> Self {
        self.field(part.as_str())
    }

    pub fn value(mut self, value: &DataValue) -> Self {
        self.update(&canonical_bytes(value));
        self
    }

    pub fn optional_value(self, value: Option<&DataValue>) -> Self {
        match value {
            Some(v) => self.field("some").value(v),
            None => self.field("none"),
        }
    }

    pub fn params(self, params: &Params) -> Self {
        let object: serde_json::Map<String, DataValue> = params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        self.value(&DataValue::Object(object))
    }

    pub fn finish(self) -> Fingerprint {
        Fingerprint(hex::encode(self.0.finalize()))
    }
}

/// Canonical JSON: object keys sorted at every depth, no whitespace.
///
/// `serde_json` only sorts keys when the `preserve_order` feature is off,
/// and any crate in the build may switch it on, so the ordering is done here.
pub fn canonical_bytes(value: &DataValue) -> Vec<u8> {
    let mut out = Vec::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &DataValue, out: &mut Vec<u8>) {
    match value {
        DataValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push(b'{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                out.extend_from_slice(DataValue::String(key.clone()).to_string().as_bytes());
                out.push(b':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push(b'}');
        }
        DataValue::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        scalar => out.extend_from_slice(scalar.to_string().as_bytes()),
    }
}
