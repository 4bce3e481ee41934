//! Hashing System - SHA-256 for Build Manifests
//!
//! Provides deterministic, reproducible digests so that two builds from the
//! same lock file and variant can be proven identical.

use serde::Serialize;
use serde_json::{to_string, Value};
use sha2::{Digest, Sha256};

/// Compute SHA-256 hash of bytes, return hex string
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    hex::encode(result)
}

/// Convert to canonical JSON (sorted keys, no whitespace)
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    let v: Value = serde_json::to_value(value)?;
    let sorted = sort_value(&v);
    to_string(&sorted)
}

fn sort_value(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut sorted: Vec<_> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            let sorted_map: serde_json::Map<String, Value> = sorted
                .into_iter()
                .map(|(k, v)| (k.clone(), sort_value(v)))
                .collect();
            Value::Object(sorted_map)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_value).collect()),
        _ => v.clone(),
    }
}

/// Compute the image digest over a serialized build manifest
pub fn compute_image_digest<T: Serialize>(manifest: &T) -> Result<String, serde_json::Error> {
    let canonical = canonical_json(manifest)?;
    Ok(sha256_hex(canonical.as_bytes()))
}

/// Compute build hash for audit logging
/// build_hash = sha256(variant_id + lock_digest + canonical_target + engine_version)
pub fn compute_build_hash(
    variant_id: &str,
    lock_digest: &str,
    target: &impl Serialize,
    engine_version: &str,
) -> Result<String, serde_json::Error> {
    let canonical_target = canonical_json(target)?;
    let combined = format!(
        "{}:{}:{}:{}",
        variant_id, lock_digest, canonical_target, engine_version
    );
    Ok(sha256_hex(combined.as_bytes()))
}

// We need hex encoding
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{:02x}", b)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorted() {
        let obj = json!({"z": 1, "a": 2, "m": 3});
        let canonical = canonical_json(&obj).unwrap();
        assert_eq!(canonical, r#"{"a":2,"m":3,"z":1}"#);
    }

    #[test]
    fn test_hash_deterministic() {
        let data = b"compiled artifact bytes";
        let h1 = sha256_hex(data);
        let h2 = sha256_hex(data);
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_image_digest_stable() {
        let manifest = json!({
            "variantId": "svc-ledger",
            "engineVersion": "1.0.0"
        });
        let h1 = compute_image_digest(&manifest).unwrap();
        let h2 = compute_image_digest(&manifest).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_build_hash_varies_by_lock() {
        let target = json!({"os": "linux", "arch": "amd64"});
        let h1 = compute_build_hash("svc-ledger", "aaa", &target, "1.0.0").unwrap();
        let h2 = compute_build_hash("svc-ledger", "bbb", &target, "1.0.0").unwrap();
        assert_ne!(h1, h2);
    }
}
