//! Defines the byte-bounded, recency-ordered cache index --- [`Cache`].
//!
//! Recency is tracked with a doubly-linked list threaded through an arena
//! (a `Vec` of slots addressed by [`EntryId`]) rather than owning references,
//! since the list is inherently cyclic through its head/tail ends.

mod entry;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

pub use entry::{CacheEntry, EntryId, UNKNOWN_VERSION};

/// Failure mode of the two operations that can fail.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Even after evicting every evictable entry, the request would not fit
    /// under `capacity`.
    Full,
}

/// Point-in-time cache statistics, for observability only.
#[derive(Debug, Copy, Clone)]
pub struct CacheStats {
    pub entries: usize,
    pub used_bytes: u64,
    pub capacity_bytes: u64,
    pub evictions: u64,
}

enum Slot {
    Occupied { entry: CacheEntry, prev: Option<EntryId>, next: Option<EntryId> },
    Free { next_free: Option<usize> },
}

/// The mutable half of the cache, guarded by [`Cache`]'s mutex.
pub struct Inner {
    dir: PathBuf,
    capacity: u64,
    used: u64,
    slots: Vec<Slot>,
    free_head: Option<usize>,
    /// Most-recently-used end of the recency list.
    mru: Option<EntryId>,
    /// Least-recently-used end of the recency list.
    lru: Option<EntryId>,
    by_path: HashMap<PathBuf, Vec<EntryId>>,
    evictions: u64,
}

impl Inner {
    fn new(dir: PathBuf, capacity: u64) -> Self {
        Self {
            dir,
            capacity,
            used: 0,
            slots: Vec::new(),
            free_head: None,
            mru: None,
            lru: None,
            by_path: HashMap::new(),
            evictions: 0,
        }
    }

    /// The absolute on-disk path for a cache-relative filename.
    pub fn disk_path(&self, filename: &str) -> PathBuf {
        self.dir.join(filename)
    }

    /// The cache directory root.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Borrow the entry behind an id. Panics if `id` is stale; callers never
    /// hold an `EntryId` past a `remove` of that id.
    pub fn entry(&self, id: EntryId) -> &CacheEntry {
        match &self.slots[id.0] {
            Slot::Occupied { entry, .. } => entry,
            Slot::Free { .. } => panic!("use of stale cache EntryId"),
        }
    }

    fn entry_mut(&mut self, id: EntryId) -> &mut CacheEntry {
        match &mut self.slots[id.0] {
            Slot::Occupied { entry, .. } => entry,
            Slot::Free { .. } => panic!("use of stale cache EntryId"),
        }
    }

    /// Among readable entries for `path`, the one with the maximum version.
    pub fn lookup_readable(&self, path: &Path) -> Option<EntryId> {
        let bucket = self.by_path.get(path)?;
        bucket
            .iter()
            .copied()
            .filter(|&id| self.entry(id).readable)
            .max_by_key(|&id| self.entry(id).version)
    }

    /// Pin the entry.
    pub fn incref(&mut self, id: EntryId) {
        self.entry_mut(id).incref();
    }

    /// Unpin the entry.
    pub fn decref(&mut self, id: EntryId) {
        self.entry_mut(id).decref();
    }

    /// Adopt the committed version and filename on a writer-private entry.
    /// The caller is responsible for having already renamed the on-disk file.
    pub fn mark_readable(&mut self, id: EntryId, new_version: i64, new_filename: String) {
        self.entry_mut(id).mark_readable(new_version, new_filename);
    }

    /// Move `id` to the most-recently-used end.
    pub fn touch(&mut self, id: EntryId) {
        if self.mru == Some(id) {
            return;
        }
        self.unlink(id);
        self.push_front(id);
    }

    fn unlink(&mut self, id: EntryId) {
        let (prev, next) = match &self.slots[id.0] {
            Slot::Occupied { prev, next, .. } => (*prev, *next),
            Slot::Free { .. } => return,
        };
        match prev {
            Some(p) => {
                if let Slot::Occupied { next: pn, .. } = &mut self.slots[p.0] {
                    *pn = next;
                }
            }
            None => self.mru = next,
        }
        match next {
            Some(n) => {
                if let Slot::Occupied { prev: np, .. } = &mut self.slots[n.0] {
                    *np = prev;
                }
            }
            None => self.lru = prev,
        }
        if let Slot::Occupied { prev, next, .. } = &mut self.slots[id.0] {
            *prev = None;
            *next = None;
        }
    }

    fn push_front(&mut self, id: EntryId) {
        let old_mru = self.mru;
        if let Slot::Occupied { prev, next, .. } = &mut self.slots[id.0] {
            *prev = None;
            *next = old_mru;
        }
        if let Some(old) = old_mru {
            if let Slot::Occupied { prev, .. } = &mut self.slots[old.0] {
                *prev = Some(id);
            }
        }
        self.mru = Some(id);
        if self.lru.is_none() {
            self.lru = Some(id);
        }
    }

    fn alloc_slot(&mut self, entry: CacheEntry) -> EntryId {
        let slot = Slot::Occupied { entry, prev: None, next: None };
        match self.free_head.take() {
            Some(idx) => {
                let next_free = match &self.slots[idx] {
                    Slot::Free { next_free } => *next_free,
                    Slot::Occupied { .. } => unreachable!("free list points at occupied slot"),
                };
                self.free_head = next_free;
                self.slots[idx] = slot;
                EntryId(idx)
            }
            None => {
                self.slots.push(slot);
                EntryId(self.slots.len() - 1)
            }
        }
    }

    fn free_slot(&mut self, id: EntryId) {
        self.slots[id.0] = Slot::Free { next_free: self.free_head };
        self.free_head = Some(id.0);
    }

    fn bucket_remove(&mut self, path: &Path, id: EntryId) {
        if let Some(bucket) = self.by_path.get_mut(path) {
            bucket.retain(|&e| e != id);
            if bucket.is_empty() {
                self.by_path.remove(path);
            }
        }
    }

    /// Unlink `id` from the LRU list and the per-path bucket, delete its
    /// on-disk file (best-effort), and free its slot. The size invariant is
    /// restored even if the file deletion fails.
    pub async fn remove(&mut self, id: EntryId) {
        let (path, filename, size) = {
            let entry = self.entry(id);
            (entry.path.clone(), entry.filename.clone(), entry.size)
        };
        self.unlink(id);
        self.bucket_remove(&path, id);
        self.used = self.used.saturating_sub(size);
        self.free_slot(id);

        let disk_path = self.dir.join(&filename);
        if let Err(err) = tokio::fs::remove_file(&disk_path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(?disk_path, %err, "failed to delete evicted cache file");
            }
        }
    }

    /// Evict least-recently-used evictable entries until `additional` more
    /// bytes would fit under `capacity`, or until no more entries can be
    /// evicted. Returns whether the budget was achieved.
    async fn make_room(&mut self, additional: u64) -> bool {
        if self.used + additional <= self.capacity {
            return true;
        }
        let mut cursor = self.lru;
        while self.used + additional > self.capacity {
            let Some(id) = cursor else { break };
            cursor = match &self.slots[id.0] {
                Slot::Occupied { prev, .. } => *prev,
                Slot::Free { .. } => None,
            };
            if !self.entry(id).evictable() {
                continue;
            }
            debug!(path = ?self.entry(id).path, "evicting cache entry");
            self.remove(id).await;
            self.evictions += 1;
        }
        self.used + additional <= self.capacity
    }

    /// Insert a new entry, evicting as needed to make room. On success the
    /// entry is placed at MRU and pinned at whatever refcount it already carries.
    pub async fn insert(&mut self, entry: CacheEntry) -> Result<EntryId, CacheError> {
        let size = entry.size;
        if !self.make_room(size).await {
            return Err(CacheError::Full);
        }
        let path = entry.path.clone();
        let id = self.alloc_slot(entry);
        self.by_path.entry(path).or_default().push(id);
        self.used += size;
        self.push_front(id);
        Ok(id)
    }

    /// Adjust capacity accounting for a resized entry, evicting as needed.
    /// Leaves all state unchanged if the new size would not fit.
    pub async fn update_size(&mut self, id: EntryId, new_size: u64) -> Result<(), CacheError> {
        let old_size = self.entry(id).size;
        if new_size <= old_size {
            self.used -= old_size - new_size;
            self.entry_mut(id).update_size(new_size);
            return Ok(());
        }
        let additional = new_size - old_size;
        if !self.make_room(additional).await {
            return Err(CacheError::Full);
        }
        self.used += additional;
        self.entry_mut(id).update_size(new_size);
        Ok(())
    }

    /// Remove every evictable entry tracked for `path`. Typically called
    /// right after installing a newer readable version.
    pub async fn remove_stale(&mut self, path: &Path) {
        let victims: Vec<EntryId> = self
            .by_path
            .get(path)
            .into_iter()
            .flatten()
            .copied()
            .filter(|&id| self.entry(id).evictable())
            .collect();
        for id in victims {
            self.remove(id).await;
        }
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.slots.iter().filter(|s| matches!(s, Slot::Occupied { .. })).count(),
            used_bytes: self.used,
            capacity_bytes: self.capacity,
            evictions: self.evictions,
        }
    }
}

/// Byte-bounded, recency-ordered cache of on-disk file copies.
///
/// All mutating operations --- and `lookup_readable`, to observe a
/// consistent snapshot --- serialize under a single cache-wide mutex. `open`
/// (see [`crate::session::Session`]) intentionally holds the lock returned by
/// [`Cache::lock`] across RPC calls for its whole duration; nothing else may.
pub struct Cache {
    inner: tokio::sync::Mutex<Inner>,
}

impl Cache {
    /// Construct a cache rooted at `dir` with a hard byte budget of `capacity`.
    pub fn new(dir: PathBuf, capacity: u64) -> Self {
        Self { inner: tokio::sync::Mutex::new(Inner::new(dir, capacity)) }
    }

    /// Take the cache-wide lock. Held across `.await` points by design: the
    /// `open` protocol must serialize the whole version decision.
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, Inner> {
        self.inner.lock().await
    }

    /// Point-in-time statistics, taking the lock briefly.
    pub async fn stats(&self) -> CacheStats {
        self.inner.lock().await.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, filename: &str, version: i64, size: u64) -> CacheEntry {
        CacheEntry::new(PathBuf::from(path), filename.to_string(), version, size, true)
    }

    #[tokio::test]
    async fn insert_and_lookup_readable_roundtrip() {
        let cache = Cache::new(PathBuf::from("/tmp/doesnotmatter"), 10_000);
        let mut guard = cache.lock().await;
        let id = guard.insert(entry("foo", "foo_v1", 1, 100)).await.unwrap();
        assert_eq!(guard.lookup_readable(Path::new("foo")), Some(id));
        assert_eq!(guard.stats().used_bytes, 100);
    }

    #[tokio::test]
    async fn lookup_readable_picks_max_version() {
        let cache = Cache::new(PathBuf::from("/tmp/doesnotmatter"), 10_000);
        let mut guard = cache.lock().await;
        let old = guard.insert(entry("foo", "foo_v1", 1, 10)).await.unwrap();
        let new = guard.insert(entry("foo", "foo_v2", 2, 10)).await.unwrap();
        assert_ne!(old, new);
        assert_eq!(guard.lookup_readable(Path::new("foo")), Some(new));
    }

    #[tokio::test]
    async fn eviction_skips_pinned_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path().to_path_buf(), 1000);
        let mut guard = cache.lock().await;

        let f1 = guard.insert(entry("f1", "f1_v1", 1, 400)).await.unwrap();
        guard.incref(f1);
        let _f2 = guard.insert(entry("f2", "f2_v1", 1, 400)).await.unwrap();

        // f3 would need to evict something; f1 is pinned, so only f2 (LRU, unpinned) goes.
        let result = guard.insert(entry("f3", "f3_v1", 1, 400)).await;
        assert!(result.is_ok());
        assert_eq!(guard.lookup_readable(Path::new("f1")), Some(f1));
        assert_eq!(guard.lookup_readable(Path::new("f2")), None);
    }

    #[tokio::test]
    async fn insert_fails_when_nothing_evictable_and_no_room() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path().to_path_buf(), 500);
        let mut guard = cache.lock().await;

        let f1 = guard.insert(entry("f1", "f1_v1", 1, 400)).await.unwrap();
        guard.incref(f1);

        let result = guard.insert(entry("f2", "f2_v1", 1, 400)).await;
        assert_eq!(result, Err(CacheError::Full));
    }

    #[tokio::test]
    async fn remove_stale_clears_only_evictable_versions() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::new(dir.path().to_path_buf(), 10_000);
        let mut guard = cache.lock().await;

        let old = guard.insert(entry("foo", "foo_v1", 1, 10)).await.unwrap();
        let new = guard.insert(entry("foo", "foo_v2", 2, 10)).await.unwrap();
        guard.incref(new);

        guard.remove_stale(Path::new("foo")).await;

        assert_eq!(guard.lookup_readable(Path::new("foo")), Some(new));
        // old entry id is gone; stats should reflect only the pinned copy.
        assert_eq!(guard.stats().used_bytes, 10);
        let _ = old;
    }
}
