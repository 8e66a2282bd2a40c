// cache.rs - content-addressed artifact cache
//
// Entries are keyed "algo:digest" and live under root/<algo>/<aa>/<rest>
// where <aa> is the first two characters of the filesystem-safe digest.
// Writers stage under root/.staging/ and publish with a single rename, so
// readers never observe a partial entry and concurrent writers of the
// same key are both winners. A fixed pool of stripe locks serializes
// writers per key without a lock per entry.

use crate::config::CompilerConfig;
use rustc_hash::FxHasher;
use std::fs;
use std::hash::Hasher;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

const STRIPE_COUNT: usize = 64;
const STAGING_DIR: &str = ".staging";

static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("invalid cache key: {0}")]
    InvalidKey(String),
    #[error("cache i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Cache key for a module compilation: a digest over the wasm bytes and
/// the configuration, so changed settings never hit stale artifacts.
pub fn module_key(wasm: &[u8], config: &CompilerConfig) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(wasm);
    hasher.update(config.cache_fingerprint().as_bytes());
    format!("blake3:{}", hasher.finalize().to_hex())
}

pub struct FileCache {
    root: PathBuf,
    stripes: Vec<Mutex<()>>,
}

impl FileCache {
    /// Open (and create if needed) a cache rooted at `root`.
    pub fn open(root: &Path) -> Result<FileCache, CacheError> {
        fs::create_dir_all(root.join(STAGING_DIR))?;
        Ok(FileCache {
            root: root.to_path_buf(),
            stripes: (0..STRIPE_COUNT).map(|_| Mutex::new(())).collect(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read a file entry, or None when the key has never been published.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let path = self.entry_path(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Path of a published directory entry, or None.
    pub fn get_dir(&self, key: &str) -> Result<Option<PathBuf>, CacheError> {
        let path = self.entry_path(key)?;
        if path.is_dir() {
            Ok(Some(path))
        } else {
            Ok(None)
        }
    }

    /// Publish a file entry. Idempotent: a key that already exists keeps
    /// its original bytes and the write is dropped.
    pub fn put(&self, key: &str, bytes: &[u8]) -> Result<PathBuf, CacheError> {
        let path = self.entry_path(key)?;
        let _guard = self.stripe(key).lock().unwrap_or_else(|e| e.into_inner());
        if path.exists() {
            return Ok(path);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let staged = self.staging_path();
        fs::write(&staged, bytes)?;
        match fs::rename(&staged, &path) {
            Ok(()) => Ok(path),
            Err(e) => {
                let _ = fs::remove_file(&staged);
                // A concurrent writer may have won the rename.
                if path.exists() {
                    Ok(path)
                } else {
                    Err(e.into())
                }
            }
        }
    }

    /// Allocate a private staging directory for a multi-file entry. The
    /// directory is removed on drop unless it gets published.
    pub fn create_staging(&self) -> Result<StagingDir, CacheError> {
        let path = self.staging_path();
        fs::create_dir_all(&path)?;
        Ok(StagingDir {
            path,
            published: false,
        })
    }

    /// Publish a staged directory under `key` with a single rename.
    pub fn publish(&self, mut staging: StagingDir, key: &str) -> Result<PathBuf, CacheError> {
        let path = self.entry_path(key)?;
        let _guard = self.stripe(key).lock().unwrap_or_else(|e| e.into_inner());
        if path.exists() {
            // First writer wins; this staging attempt is redundant.
            staging.published = false;
            drop(staging);
            return Ok(path);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        match fs::rename(&staging.path, &path) {
            Ok(()) => {
                staging.published = true;
                drop(staging);
                Ok(path)
            }
            Err(e) => {
                if path.exists() {
                    Ok(path)
                } else {
                    Err(e.into())
                }
            }
        }
    }

    /// Shard layout: root/<algo>/<first two digest chars>/<rest>.
    fn entry_path(&self, key: &str) -> Result<PathBuf, CacheError> {
        let (algo, digest) = validate_key(key)?;
        let safe = safe_digest(digest);
        let path = if safe.len() > 2 {
            self.root.join(algo).join(&safe[..2]).join(&safe[2..])
        } else {
            self.root.join(algo).join(&safe)
        };
        Ok(path)
    }

    fn stripe(&self, key: &str) -> &Mutex<()> {
        let mut hasher = FxHasher::default();
        hasher.write(key.as_bytes());
        &self.stripes[hasher.finish() as usize % STRIPE_COUNT]
    }

    fn staging_path(&self) -> PathBuf {
        let seq = STAGING_SEQ.fetch_add(1, Ordering::Relaxed);
        self.root
            .join(STAGING_DIR)
            .join(format!("{}-{}", std::process::id(), seq))
    }
}

/// Split and check an "algo:digest" key.
pub fn validate_key(key: &str) -> Result<(&str, &str), CacheError> {
    let (algo, digest) = key
        .split_once(':')
        .ok_or_else(|| CacheError::InvalidKey(key.to_string()))?;
    if algo.is_empty()
        || digest.is_empty()
        || !algo
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(CacheError::InvalidKey(key.to_string()));
    }
    let safe = safe_digest(digest);
    if safe.is_empty()
        || !safe
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(CacheError::InvalidKey(key.to_string()));
    }
    Ok((algo, digest))
}

/// Re-encode a digest for the filesystem: base64 '+' and '/' become '-'
/// and '_', padding drops.
pub fn safe_digest(digest: &str) -> String {
    digest
        .chars()
        .filter(|&c| c != '=')
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            c => c,
        })
        .collect()
}

pub struct StagingDir {
    path: PathBuf,
    published: bool,
}

impl StagingDir {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if !self.published {
            let _ = fs::remove_dir_all(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_validation() {
        assert!(validate_key("blake3:abc123").is_ok());
        assert!(validate_key("sha-256:aGVsbG8=").is_ok());
        assert!(validate_key("nodigest").is_err());
        assert!(validate_key(":abc").is_err());
        assert!(validate_key("blake3:").is_err());
        assert!(validate_key("BLAKE3:abc").is_err());
        assert!(validate_key("blake3:../escape").is_err());
    }

    #[test]
    fn test_safe_digest_reencoding() {
        assert_eq!(safe_digest("a+b/c=="), "a-b_c");
        assert_eq!(safe_digest("deadbeef"), "deadbeef");
    }

    #[test]
    fn test_put_get_round_trip_and_sharding() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::open(dir.path()).unwrap();
        let path = cache.put("blake3:abcdef", b"artifact").unwrap();
        assert!(path.ends_with("blake3/ab/cdef"));
        assert_eq!(cache.get("blake3:abcdef").unwrap().unwrap(), b"artifact");
        assert!(cache.get("blake3:ffffff").unwrap().is_none());
    }

    #[test]
    fn test_put_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::open(dir.path()).unwrap();
        cache.put("blake3:abcdef", b"first").unwrap();
        cache.put("blake3:abcdef", b"second").unwrap();
        assert_eq!(cache.get("blake3:abcdef").unwrap().unwrap(), b"first");
    }

    #[test]
    fn test_concurrent_writers_agree() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::open(dir.path()).unwrap();
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    cache.put("blake3:raced", b"payload").unwrap();
                });
            }
        });
        assert_eq!(cache.get("blake3:raced").unwrap().unwrap(), b"payload");
        // Exactly one entry, no leftover staging files.
        let staged: Vec<_> = fs::read_dir(dir.path().join(STAGING_DIR))
            .unwrap()
            .collect();
        assert!(staged.is_empty());
    }

    #[test]
    fn test_directory_entry_publish_and_abandon() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::open(dir.path()).unwrap();

        let staging = cache.create_staging().unwrap();
        fs::write(staging.path().join("unit.bin"), b"x").unwrap();
        let published = cache.publish(staging, "blake3:dirent").unwrap();
        assert!(published.join("unit.bin").exists());
        assert_eq!(cache.get_dir("blake3:dirent").unwrap(), Some(published));

        // An abandoned staging directory cleans up after itself.
        let staging = cache.create_staging().unwrap();
        let stale = staging.path().to_path_buf();
        drop(staging);
        assert!(!stale.exists());
    }

    #[test]
    fn test_module_key_depends_on_config() {
        let wasm = b"\0asm";
        let a = module_key(wasm, &CompilerConfig::default());
        let mut config = CompilerConfig::default();
        config.max_functions_per_unit = 1;
        let b = module_key(wasm, &config);
        assert!(a.starts_with("blake3:"));
        assert_ne!(a, b);
    }
}
