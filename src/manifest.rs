//! Dependency Manifest + Lock Record
//!
//! The lock file is truth: a build only ever sees the exact dependency set
//! the lock pins, never an implicitly upgraded one.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use crate::hashing::{canonical_json, sha256_hex};

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Failed to read {0}: {1}")]
    Read(String, std::io::Error),

    #[error("Failed to parse {0}: {1}")]
    Parse(String, serde_json::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A declared dependency, before resolution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Dependency {
    pub name: String,
    pub version: String,
}

/// The module manifest: what the source tree declares it needs.
///
/// Created once per source tree revision; read-only during a build.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub module: String,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
}

/// One pinned entry in the lock record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockEntry {
    pub name: String,
    pub version: String,
    /// SHA-256 hex digest the fetched payload must match.
    pub checksum: String,
}

/// The lock record: exact resolved versions plus payload checksums.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lock {
    #[serde(default)]
    pub entries: Vec<LockEntry>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ManifestError::Read(path.display().to_string(), e))?;
        serde_json::from_str(&content)
            .map_err(|e| ManifestError::Parse(path.display().to_string(), e))
    }
}

impl Lock {
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ManifestError::Read(path.display().to_string(), e))?;
        serde_json::from_str(&content)
            .map_err(|e| ManifestError::Parse(path.display().to_string(), e))
    }

    /// Look up the pinned entry for a declared dependency.
    pub fn entry(&self, name: &str, version: &str) -> Option<&LockEntry> {
        self.entries
            .iter()
            .find(|e| e.name == name && e.version == version)
    }

    /// Digest over the canonical lock record.
    ///
    /// This is the cache-invalidation key: any change to a pinned version or
    /// checksum changes the digest, so a new revision can never alias a stale
    /// cached dependency set.
    pub fn digest(&self) -> Result<String, ManifestError> {
        let canonical = canonical_json(self)?;
        Ok(sha256_hex(canonical.as_bytes()))
    }
}
