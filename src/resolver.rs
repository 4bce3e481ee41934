//! Dependency Resolver - Exact, Verified, Reproducible
//!
//! Fetches exactly the dependency set the lock record pins and verifies every
//! payload checksum against it. A mismatch aborts the whole build; silent
//! drift would break reproducibility. No implicit version upgrades, ever.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::hashing::sha256_hex;
use crate::manifest::{Lock, LockEntry, Manifest, ManifestError};

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("Integrity mismatch for {dependency}: lock pins {expected}, fetched {actual}")]
    IntegrityMismatch {
        dependency: String,
        expected: String,
        actual: String,
    },

    #[error("Dependency {0} is declared in the manifest but not pinned in the lock record")]
    NotPinned(String),

    #[error("Failed to fetch {dependency}: {reason}")]
    Fetch { dependency: String, reason: String },

    #[error("Dependency resolution exceeded {limit_secs}s")]
    Timeout { limit_secs: u64 },

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

/// Where dependency payloads come from. The only network (or filesystem)
/// access the resolver performs goes through this seam.
pub trait DependencySource {
    fn fetch(&self, name: &str, version: &str) -> Result<Vec<u8>, ResolverError>;
}

/// Reads `{name}-{version}` payload files from a local artifact directory.
pub struct DirSource {
    root: PathBuf,
}

impl DirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl DependencySource for DirSource {
    fn fetch(&self, name: &str, version: &str) -> Result<Vec<u8>, ResolverError> {
        let path = self.root.join(format!("{}-{}", name, version));
        fs::read(&path).map_err(|e| ResolverError::Fetch {
            dependency: format!("{}@{}", name, version),
            reason: format!("{}: {}", path.display(), e),
        })
    }
}

/// One verified dependency payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedDependency {
    pub name: String,
    pub version: String,
    pub checksum: String,
    #[serde(skip)]
    pub data: Vec<u8>,
}

/// The full verified dependency set, sorted by (name, version) so two runs
/// against the same lock are byte-identical.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedSet {
    pub lock_digest: String,
    pub dependencies: Vec<ResolvedDependency>,
}

impl ResolvedSet {
    /// Digest over every payload in set order.
    pub fn fingerprint(&self) -> String {
        let mut combined = Vec::new();
        for dep in &self.dependencies {
            combined.extend_from_slice(dep.checksum.as_bytes());
            combined.extend_from_slice(&dep.data);
        }
        sha256_hex(&combined)
    }
}

/// Append-only on-disk dependency cache, shared by concurrent variant builds.
///
/// Entries are keyed by name, version, and a prefix of the lock checksum, so
/// a revised lock can never alias a stale entry. Reads need no lock once an
/// entry is present; first-time population is mutually exclusive per key.
pub struct DependencyCache {
    root: PathBuf,
    population_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DependencyCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            population_locks: Mutex::new(HashMap::new()),
        }
    }

    fn key(entry: &LockEntry) -> String {
        let prefix = entry.checksum.get(..12).unwrap_or(&entry.checksum);
        format!("{}-{}-{}", entry.name, entry.version, prefix)
    }

    fn population_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .population_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(key.to_string()).or_default().clone()
    }

    /// Return the verified payload for a lock entry, fetching and populating
    /// the cache if it is not yet present.
    pub fn get_or_populate(
        &self,
        entry: &LockEntry,
        fetch: impl FnOnce() -> Result<Vec<u8>, ResolverError>,
    ) -> Result<Vec<u8>, ResolverError> {
        let key = Self::key(entry);
        let path = self.root.join(&key);
        let dependency = format!("{}@{}", entry.name, entry.version);

        if let Some(data) = self.read_verified(&path, entry, &dependency)? {
            debug!(%dependency, "dependency cache hit");
            return Ok(data);
        }

        let guard = self.population_lock(&key);
        let _held = guard.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        // Another build may have populated the entry while we waited.
        if let Some(data) = self.read_verified(&path, entry, &dependency)? {
            return Ok(data);
        }

        info!(%dependency, "fetching dependency");
        let data = fetch()?;
        let actual = sha256_hex(&data);
        if actual != entry.checksum {
            return Err(ResolverError::IntegrityMismatch {
                dependency,
                expected: entry.checksum.clone(),
                actual,
            });
        }

        fs::create_dir_all(&self.root).map_err(|e| ResolverError::Io {
            path: self.root.clone(),
            source: e,
        })?;
        let staging = self.root.join(format!("{}.partial", key));
        fs::write(&staging, &data).map_err(|e| ResolverError::Io {
            path: staging.clone(),
            source: e,
        })?;
        fs::rename(&staging, &path).map_err(|e| ResolverError::Io {
            path: path.clone(),
            source: e,
        })?;

        Ok(data)
    }

    fn read_verified(
        &self,
        path: &PathBuf,
        entry: &LockEntry,
        dependency: &str,
    ) -> Result<Option<Vec<u8>>, ResolverError> {
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(path).map_err(|e| ResolverError::Io {
            path: path.clone(),
            source: e,
        })?;
        let actual = sha256_hex(&data);
        if actual != entry.checksum {
            return Err(ResolverError::IntegrityMismatch {
                dependency: dependency.to_string(),
                expected: entry.checksum.clone(),
                actual,
            });
        }
        Ok(Some(data))
    }
}

/// The resolver: manifest + lock in, verified dependency set out.
pub struct DependencyResolver<S: DependencySource> {
    source: S,
    cache: Arc<DependencyCache>,
    timeout: Duration,
}

impl<S: DependencySource> DependencyResolver<S> {
    pub fn new(source: S, cache: Arc<DependencyCache>, timeout: Duration) -> Self {
        Self {
            source,
            cache,
            timeout,
        }
    }

    /// Fetch and verify every dependency the manifest declares.
    ///
    /// Fails closed: the first checksum disagreement, unpinned dependency, or
    /// deadline overrun aborts the whole resolution.
    pub fn resolve(&self, manifest: &Manifest, lock: &Lock) -> Result<ResolvedSet, ResolverError> {
        let deadline = Instant::now() + self.timeout;
        let mut declared = manifest.dependencies.clone();
        declared.sort_by(|a, b| (&a.name, &a.version).cmp(&(&b.name, &b.version)));

        let mut dependencies = Vec::with_capacity(declared.len());
        for dep in &declared {
            if Instant::now() >= deadline {
                return Err(ResolverError::Timeout {
                    limit_secs: self.timeout.as_secs(),
                });
            }
            let entry = lock
                .entry(&dep.name, &dep.version)
                .ok_or_else(|| ResolverError::NotPinned(format!("{}@{}", dep.name, dep.version)))?;
            let data = self
                .cache
                .get_or_populate(entry, || self.source.fetch(&dep.name, &dep.version))?;
            // A fetch that overran the budget is not promoted, even though
            // its payload is now cached for the retry.
            if Instant::now() >= deadline {
                return Err(ResolverError::Timeout {
                    limit_secs: self.timeout.as_secs(),
                });
            }
            dependencies.push(ResolvedDependency {
                name: entry.name.clone(),
                version: entry.version.clone(),
                checksum: entry.checksum.clone(),
                data,
            });
        }

        Ok(ResolvedSet {
            lock_digest: lock.digest()?,
            dependencies,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Dependency;
    use tempfile::TempDir;

    struct MapSource(HashMap<(String, String), Vec<u8>>);

    impl DependencySource for MapSource {
        fn fetch(&self, name: &str, version: &str) -> Result<Vec<u8>, ResolverError> {
            self.0
                .get(&(name.to_string(), version.to_string()))
                .cloned()
                .ok_or_else(|| ResolverError::Fetch {
                    dependency: format!("{}@{}", name, version),
                    reason: "not in source".to_string(),
                })
        }
    }

    fn fixture() -> (Manifest, Lock, MapSource) {
        let payload = b"module gin v1.9.1".to_vec();
        let manifest = Manifest {
            module: "fleet/services".to_string(),
            dependencies: vec![Dependency {
                name: "gin".to_string(),
                version: "1.9.1".to_string(),
            }],
        };
        let lock = Lock {
            entries: vec![LockEntry {
                name: "gin".to_string(),
                version: "1.9.1".to_string(),
                checksum: sha256_hex(&payload),
            }],
        };
        let mut map = HashMap::new();
        map.insert(("gin".to_string(), "1.9.1".to_string()), payload);
        (manifest, lock, MapSource(map))
    }

    #[test]
    fn resolve_verifies_and_returns_payloads() {
        let dir = TempDir::new().unwrap();
        let (manifest, lock, source) = fixture();
        let cache = Arc::new(DependencyCache::new(dir.path()));
        let resolver = DependencyResolver::new(source, cache, Duration::from_secs(30));

        let set = resolver.resolve(&manifest, &lock).unwrap();
        assert_eq!(set.dependencies.len(), 1);
        assert_eq!(set.dependencies[0].data, b"module gin v1.9.1");
    }

    #[test]
    fn two_runs_produce_identical_sets() {
        let dir = TempDir::new().unwrap();
        let (manifest, lock, source) = fixture();
        let cache = Arc::new(DependencyCache::new(dir.path()));
        let resolver = DependencyResolver::new(source, cache, Duration::from_secs(30));

        let first = resolver.resolve(&manifest, &lock).unwrap();
        let second = resolver.resolve(&manifest, &lock).unwrap();
        assert_eq!(first.fingerprint(), second.fingerprint());
        assert_eq!(first.lock_digest, second.lock_digest);
    }

    #[test]
    fn checksum_disagreement_is_integrity_mismatch() {
        let dir = TempDir::new().unwrap();
        let (manifest, mut lock, source) = fixture();
        lock.entries[0].checksum = "def456".to_string();
        let cache = Arc::new(DependencyCache::new(dir.path()));
        let resolver = DependencyResolver::new(source, cache, Duration::from_secs(30));

        let err = resolver.resolve(&manifest, &lock).unwrap_err();
        assert!(matches!(err, ResolverError::IntegrityMismatch { .. }));
    }

    #[test]
    fn unpinned_dependency_fails() {
        let dir = TempDir::new().unwrap();
        let (mut manifest, lock, source) = fixture();
        manifest.dependencies.push(Dependency {
            name: "echo".to_string(),
            version: "4.11.0".to_string(),
        });
        let cache = Arc::new(DependencyCache::new(dir.path()));
        let resolver = DependencyResolver::new(source, cache, Duration::from_secs(30));

        let err = resolver.resolve(&manifest, &lock).unwrap_err();
        assert!(matches!(err, ResolverError::NotPinned(_)));
    }

    struct SlowSource {
        inner: MapSource,
        delay: Duration,
    }

    impl DependencySource for SlowSource {
        fn fetch(&self, name: &str, version: &str) -> Result<Vec<u8>, ResolverError> {
            std::thread::sleep(self.delay);
            self.inner.fetch(name, version)
        }
    }

    #[test]
    fn fetch_overrunning_the_deadline_times_out() {
        let dir = TempDir::new().unwrap();
        let (manifest, lock, source) = fixture();
        let slow = SlowSource {
            inner: source,
            delay: Duration::from_millis(200),
        };
        let cache = Arc::new(DependencyCache::new(dir.path()));
        let resolver = DependencyResolver::new(slow, cache, Duration::from_millis(50));

        let err = resolver.resolve(&manifest, &lock).unwrap_err();
        assert!(matches!(err, ResolverError::Timeout { .. }));
    }

    #[test]
    fn zero_deadline_times_out() {
        let dir = TempDir::new().unwrap();
        let (manifest, lock, source) = fixture();
        let cache = Arc::new(DependencyCache::new(dir.path()));
        let resolver = DependencyResolver::new(source, cache, Duration::ZERO);

        let err = resolver.resolve(&manifest, &lock).unwrap_err();
        assert!(matches!(err, ResolverError::Timeout { .. }));
    }

    #[test]
    fn first_population_is_mutually_exclusive_per_key() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let dir = TempDir::new().unwrap();
        let cache = Arc::new(DependencyCache::new(dir.path()));
        let payload = b"module gin v1.9.1".to_vec();
        let entry = LockEntry {
            name: "gin".to_string(),
            version: "1.9.1".to_string(),
            checksum: sha256_hex(&payload),
        };
        let fetches = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                let entry = entry.clone();
                let fetches = fetches.clone();
                let payload = payload.clone();
                std::thread::spawn(move || {
                    cache
                        .get_or_populate(&entry, || {
                            fetches.fetch_add(1, Ordering::SeqCst);
                            std::thread::sleep(Duration::from_millis(20));
                            Ok(payload.clone())
                        })
                        .unwrap()
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), b"module gin v1.9.1".to_vec());
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cache_hit_skips_the_source() {
        let dir = TempDir::new().unwrap();
        let (manifest, lock, source) = fixture();
        let cache = Arc::new(DependencyCache::new(dir.path()));

        let resolver = DependencyResolver::new(source, cache.clone(), Duration::from_secs(30));
        resolver.resolve(&manifest, &lock).unwrap();

        // Second resolver has an empty source; only the cache can satisfy it.
        let empty = MapSource(HashMap::new());
        let resolver = DependencyResolver::new(empty, cache, Duration::from_secs(30));
        let set = resolver.resolve(&manifest, &lock).unwrap();
        assert_eq!(set.dependencies[0].data, b"module gin v1.9.1");
    }
}
