//! Size-bounded local cache tier.
//!
//! Entries live as individual files under `{base_path}/{hh}/{sha256(key)}`
//! where `hh` is the first two hex digits of the digest.  An in-memory LRU
//! index tracks every file's size; once the total exceeds `max_bytes` the
//! least-recently-used files are deleted.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

use anyhow::{Context, Result};
use bytes::Bytes;
use lru::LruCache;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

/// Suffix carried by in-flight writes; never a valid entry name.
const TMP_SUFFIX: &str = ".tmp";

/// Key → bytes store shared by every request task.
///
/// Implementations must make `get`, `set` and `delete` linearizable per key
/// and must not serialize unrelated keys behind slow I/O.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Bytes>>;
    fn set(&self, key: &str, value: Bytes) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
    /// Bytes currently accounted to stored entries.
    fn size_bytes(&self) -> u64;
}

// ---------------------------------------------------------------------------
// DiskStore
// ---------------------------------------------------------------------------

struct Index {
    entries: LruCache<String, u64>,
    total_bytes: u64,
}

impl Index {
    fn insert(&mut self, name: String, size: u64) {
        if let Some(old) = self.entries.put(name, size) {
            self.total_bytes -= old;
        }
        self.total_bytes += size;
    }

    fn remove(&mut self, name: &str) -> Option<u64> {
        let size = self.entries.pop(name)?;
        self.total_bytes -= size;
        Some(size)
    }
}

pub struct DiskStore {
    base_path: PathBuf,
    max_bytes: u64,
    index: Mutex<Index>,
}

impl DiskStore {
    /// Open (or create) a store rooted at `base_path`, rebuilding the index
    /// from whatever entries a previous run left behind.
    pub fn open(base_path: impl AsRef<Path>, max_bytes: u64) -> Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_path).with_context(|| {
            format!("failed to create cache directory: {}", base_path.display())
        })?;

        let mut found = scan_entries(&base_path)?;
        // Oldest first, so the most recently written entries end up most
        // recently used.
        found.sort_by_key(|(_, _, mtime)| *mtime);

        let mut index = Index {
            entries: LruCache::unbounded(),
            total_bytes: 0,
        };
        for (name, size, _) in found {
            index.insert(name, size);
        }

        let store = Self {
            base_path,
            max_bytes,
            index: Mutex::new(index),
        };
        let (entries, size_bytes, evicted) = {
            let mut index = store.lock_index("open");
            let evicted = store.evict_to_budget(&mut index);
            (index.entries.len(), index.total_bytes, evicted)
        };

        info!(
            path = %store.base_path.display(),
            max_bytes,
            entries,
            size_bytes,
            evicted,
            "local cache opened"
        );
        Ok(store)
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Number of entries currently indexed.
    pub fn entry_count(&self) -> usize {
        self.lock_index("entry_count").entries.len()
    }

    fn entry_path(&self, name: &str) -> PathBuf {
        self.base_path.join(&name[..2]).join(name)
    }

    fn lock_index(&self, op: &'static str) -> MutexGuard<'_, Index> {
        match self.index.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!(op, "recovered poisoned local cache index lock");
                poisoned.into_inner()
            }
        }
    }

    /// Drop least-recently-used entries until the budget holds.  Returns the
    /// number of entries removed.
    fn evict_to_budget(&self, index: &mut Index) -> usize {
        let mut evicted = 0;
        while index.total_bytes > self.max_bytes {
            let Some((name, size)) = index.entries.pop_lru() else {
                break;
            };
            index.total_bytes -= size;
            if let Err(e) = std::fs::remove_file(self.entry_path(&name))
                && e.kind() != ErrorKind::NotFound
            {
                warn!(error = %e, entry = %name, "failed to remove evicted cache entry");
            }
            debug!(entry = %name, size, "evicted cache entry");
            evicted += 1;
        }
        evicted
    }
}

impl CacheStore for DiskStore {
    fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let name = entry_name(key);
        let path = self.entry_path(&name);

        match std::fs::read(&path) {
            Ok(data) => {
                // Promote only.  An entry dropped from the index since the
                // read has been evicted or deleted, and its file is gone.
                self.lock_index("get").entries.promote(&name);
                Ok(Some(Bytes::from(data)))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.lock_index("get").remove(&name);
                Ok(None)
            }
            Err(e) => {
                Err(e).with_context(|| format!("failed to read cache entry: {}", path.display()))
            }
        }
    }

    fn set(&self, key: &str, value: Bytes) -> Result<()> {
        let size = value.len() as u64;
        if size > self.max_bytes {
            debug!(%key, size, max_bytes = self.max_bytes, "entry larger than cache budget, not stored");
            return Ok(());
        }

        let name = entry_name(key);
        let path = self.entry_path(&name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let tmp_path = path.with_file_name(format!(
            "{name}.{:016x}{TMP_SUFFIX}",
            rand::random::<u64>()
        ));
        std::fs::write(&tmp_path, &value)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;

        let mut index = self.lock_index("set");
        if let Err(e) = std::fs::rename(&tmp_path, &path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e).with_context(|| format!("failed to install {}", path.display()));
        }
        index.insert(name, size);
        self.evict_to_budget(&mut index);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let name = entry_name(key);
        let path = self.entry_path(&name);

        let mut index = self.lock_index("delete");
        index.remove(&name);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("failed to delete cache entry: {}", path.display()))
            }
        }
    }

    fn size_bytes(&self) -> u64 {
        self.lock_index("size_bytes").total_bytes
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// File name for `key`: hex SHA-256, so arbitrary paths are safe on disk.
fn entry_name(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Walk the two-level layout, returning `(name, size, mtime)` for each
/// entry.  Leftover temp files from interrupted writes are deleted.
fn scan_entries(base_path: &Path) -> Result<Vec<(String, u64, SystemTime)>> {
    let mut found = Vec::new();

    let shards = std::fs::read_dir(base_path)
        .with_context(|| format!("failed to read cache directory: {}", base_path.display()))?;

    for shard in shards {
        let shard = shard?;
        if !shard.file_type()?.is_dir() {
            continue;
        }
        for entry in std::fs::read_dir(shard.path())? {
            let entry = entry?;
            let meta = match entry.metadata() {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(TMP_SUFFIX) {
                let _ = std::fs::remove_file(entry.path());
                continue;
            }
            if name.len() != 64 || !name.bytes().all(|b| b.is_ascii_hexdigit()) {
                continue;
            }
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((name, meta.len(), mtime));
        }
    }

    Ok(found)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn bytes_of(len: usize, fill: u8) -> Bytes {
        Bytes::from(vec![fill; len])
    }

    #[test]
    fn entry_name_is_hex_sha256() {
        let name = entry_name("/ac/0123");
        assert_eq!(name.len(), 64);
        assert_eq!(name, entry_name("/ac/0123"));
        assert_ne!(name, entry_name("/ac/0124"));
    }

    #[test]
    fn set_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path(), 1024).unwrap();

        assert!(store.get("/cas/aa").unwrap().is_none());

        store.set("/cas/aa", Bytes::from_static(b"hello")).unwrap();
        assert_eq!(store.get("/cas/aa").unwrap().unwrap(), "hello");
        assert_eq!(store.size_bytes(), 5);

        store.set("/cas/aa", Bytes::from_static(b"hi")).unwrap();
        assert_eq!(store.get("/cas/aa").unwrap().unwrap(), "hi");
        assert_eq!(store.size_bytes(), 2);

        store.delete("/cas/aa").unwrap();
        assert!(store.get("/cas/aa").unwrap().is_none());
        assert_eq!(store.size_bytes(), 0);

        // Deleting a missing key is not an error.
        store.delete("/cas/aa").unwrap();
    }

    #[test]
    fn evicts_least_recently_used_to_stay_in_budget() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path(), 100).unwrap();

        store.set("a", bytes_of(40, b'a')).unwrap();
        store.set("b", bytes_of(40, b'b')).unwrap();
        // Touch `a` so `b` becomes the eviction candidate.
        store.get("a").unwrap();
        store.set("c", bytes_of(40, b'c')).unwrap();

        assert!(store.size_bytes() <= 100);
        assert!(store.get("a").unwrap().is_some());
        assert!(store.get("b").unwrap().is_none());
        assert!(store.get("c").unwrap().is_some());
    }

    #[test]
    fn oversized_values_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path(), 10).unwrap();

        store.set("big", bytes_of(11, 0)).unwrap();
        assert!(store.get("big").unwrap().is_none());
        assert_eq!(store.size_bytes(), 0);
    }

    #[test]
    fn read_racing_a_delete_does_not_resurrect_the_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path(), 1024).unwrap();
        store.set("/cas/r", Bytes::from_static(b"racy")).unwrap();

        // Drop the index entry as a concurrent delete would before its
        // unlink, while the file is still readable.
        store.lock_index("test").remove(&entry_name("/cas/r"));

        assert_eq!(store.get("/cas/r").unwrap().unwrap(), "racy");
        assert_eq!(store.entry_count(), 0);
        assert_eq!(store.size_bytes(), 0);
    }

    #[test]
    fn reopen_rebuilds_index_and_removes_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = DiskStore::open(dir.path(), 1000).unwrap();
            store.set("one", bytes_of(10, 1)).unwrap();
            store.set("two", bytes_of(20, 2)).unwrap();
        }
        let name = entry_name("stale");
        let shard = dir.path().join(&name[..2]);
        std::fs::create_dir_all(&shard).unwrap();
        let tmp = shard.join(format!("{name}.00{TMP_SUFFIX}"));
        std::fs::write(&tmp, b"partial").unwrap();

        let store = DiskStore::open(dir.path(), 1000).unwrap();
        assert_eq!(store.entry_count(), 2);
        assert_eq!(store.size_bytes(), 30);
        assert_eq!(store.get("two").unwrap().unwrap(), bytes_of(20, 2));
        assert!(!tmp.exists());
    }

    #[test]
    fn reopen_with_smaller_budget_evicts() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = DiskStore::open(dir.path(), 1000).unwrap();
            for key in ["a", "b", "c", "d"] {
                store.set(key, bytes_of(100, 0)).unwrap();
            }
        }
        let store = DiskStore::open(dir.path(), 250).unwrap();
        assert_eq!(store.entry_count(), 2);
        assert!(store.size_bytes() <= 250);
    }

    #[test]
    fn concurrent_writers_on_distinct_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DiskStore::open(dir.path(), 1 << 20).unwrap());

        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for j in 0..16u8 {
                        let key = format!("/cas/{i}/{j}");
                        store.set(&key, bytes_of(64, i ^ j)).unwrap();
                        assert_eq!(store.get(&key).unwrap().unwrap(), bytes_of(64, i ^ j));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(store.entry_count(), 128);
        assert_eq!(store.size_bytes(), 128 * 64);
    }
}
