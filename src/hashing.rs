//! Hashing System - SHA-256 over canonical content
//!
//! Artifact hashes are computed over canonical JSON (sorted keys, no
//! whitespace) and are streamed through the hasher in fixed-size chunks.
//! Nothing time- or machine-dependent enters hashed content.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::io::{self, BufWriter, Write};

pub const HASH_ALGORITHM: &str = "sha256";
/// Chunk size used when streaming content into the hasher.
pub const HASH_CHUNK_SIZE: usize = 64 * 1024;
/// Hex characters kept from the digest in derived ids.
pub const DERIVED_ID_HEX_LEN: usize = 15;

/// Compute SHA-256 hash of bytes, return hex string
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Convert to canonical JSON (sorted keys, no whitespace)
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let v: Value = serde_json::to_value(value)?;
    let mut buf = Vec::new();
    write_canonical(&v, &mut buf).map_err(serde::ser::Error::custom)?;
    String::from_utf8(buf).map_err(serde::ser::Error::custom)
}

/// Write canonical JSON for `v` without materialising a sorted copy.
pub fn write_canonical<W: Write>(v: &Value, w: &mut W) -> io::Result<()> {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            w.write_all(b"{")?;
            for (i, k) in keys.into_iter().enumerate() {
                if i > 0 {
                    w.write_all(b",")?;
                }
                serde_json::to_writer(&mut *w, k).map_err(io::Error::from)?;
                w.write_all(b":")?;
                write_canonical(&map[k], w)?;
            }
            w.write_all(b"}")
        }
        Value::Array(items) => {
            w.write_all(b"[")?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    w.write_all(b",")?;
                }
                write_canonical(item, w)?;
            }
            w.write_all(b"]")
        }
        scalar => serde_json::to_writer(&mut *w, scalar).map_err(io::Error::from),
    }
}

/// Content hash of one artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArtifactHash {
    pub algorithm: String,
    pub hash: String,
    pub size: u64,
}

/// Writer adapter that hashes and counts every byte on its way to `inner`.
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    bytes: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    /// Returns the inner writer, the hex digest and the byte count.
    pub fn finish(self) -> (W, String, u64) {
        (self.inner, hex::encode(self.hasher.finalize()), self.bytes)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Hash the canonical form of `value`, streaming in fixed-size chunks.
pub fn hash_canonical(value: &Value) -> io::Result<ArtifactHash> {
    let mut chunked = BufWriter::with_capacity(HASH_CHUNK_SIZE, HashingWriter::new(io::sink()));
    write_canonical(value, &mut chunked)?;
    let hashing = chunked.into_inner().map_err(|e| e.into_error())?;
    let (_, hash, size) = hashing.finish();
    Ok(ArtifactHash {
        algorithm: HASH_ALGORITHM.to_string(),
        hash,
        size,
    })
}

/// Compute content hash for any serializable value
pub fn compute_content_hash<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let v = serde_json::to_value(value)?;
    hash_canonical(&v)
        .map(|h| h.hash)
        .map_err(serde::ser::Error::custom)
}

/// Deterministic identifier: `prefix[0] + sha256(prefix + ":" + input)[..15]`.
///
/// Output is 16 lowercase hex-safe characters, stable across builds.
pub fn derive_id(prefix: &str, input: &str) -> String {
    let digest = sha256_hex(format!("{}:{}", prefix, input).as_bytes());
    let lead = prefix
        .chars()
        .next()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .unwrap_or('x');
    format!("{}{}", lead, &digest[..DERIVED_ID_HEX_LEN])
}

/// Flow tab id for a channel.
pub fn generate_flow_id(channel_id: &str) -> String {
    derive_id("flow", channel_id)
}

/// Node id for a template node generated by a stage.
pub fn generate_node_id(stage_id: &str, template_node_id: &str) -> String {
    derive_id("node", &format!("{}:{}", stage_id, template_node_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorted() {
        let obj = json!({"z": 1, "a": 2, "m": {"d": [3, {"y": 1, "b": 2}], "c": null}});
        let canonical = canonical_json(&obj).unwrap();
        assert_eq!(canonical, r#"{"a":2,"m":{"c":null,"d":[3,{"b":2,"y":1}]},"z":1}"#);
    }

    #[test]
    fn test_hash_deterministic() {
        let data = b"test data";
        let h1 = sha256_hex(data);
        let h2 = sha256_hex(data);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn test_streamed_hash_matches_buffered() {
        let v = json!({"b": "x".repeat(HASH_CHUNK_SIZE * 2 + 7), "a": [1, 2, 3]});
        let streamed = hash_canonical(&v).unwrap();
        let canonical = canonical_json(&v).unwrap();
        assert_eq!(streamed.hash, sha256_hex(canonical.as_bytes()));
        assert_eq!(streamed.size, canonical.len() as u64);
        assert_eq!(streamed.algorithm, "sha256");
    }

    #[test]
    fn test_content_hash_ignores_key_order() {
        let a = json!({"x": 1, "y": {"p": true, "q": false}});
        let b = json!({"y": {"q": false, "p": true}, "x": 1});
        assert_eq!(compute_content_hash(&a).unwrap(), compute_content_hash(&b).unwrap());
    }

    #[test]
    fn test_derive_id_stable_and_shaped() {
        let a = generate_flow_id("orders-sync");
        let b = generate_flow_id("orders-sync");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.starts_with('f'));
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, generate_flow_id("orders-sync-2"));
    }

    #[test]
    fn test_node_ids_distinct_per_stage() {
        assert_ne!(generate_node_id("s1", "main"), generate_node_id("s2", "main"));
        assert!(generate_node_id("s1", "main").starts_with('n'));
    }

    #[test]
    fn test_hashing_writer_passes_through() {
        let mut w = HashingWriter::new(Vec::new());
        w.write_all(b"abc").unwrap();
        let (inner, hash, n) = w.finish();
        assert_eq!(inner, b"abc");
        assert_eq!(n, 3);
        assert_eq!(hash, sha256_hex(b"abc"));
    }
}
