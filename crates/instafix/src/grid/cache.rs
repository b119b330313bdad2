//! On-disk cache of finished collages.
//!
//! One `<post_id>.jpeg` per post in a flat directory. The in-memory index is
//! rebuilt from the directory at startup. Two budgets apply: an entry count,
//! enforced on insert, and a total byte size, enforced on insert and by the
//! maintenance loop. Both evict least-recently-accessed entries first.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use super::GridError;

const GRID_EXTENSION: &str = "jpeg";

struct GridCacheEntry {
    path: PathBuf,
    size: u64,
    last_accessed: Instant,
}

impl GridCacheEntry {
    fn touch(&mut self) {
        self.last_accessed = Instant::now();
    }
}

pub struct GridCache {
    dir: PathBuf,
    index: HashMap<String, GridCacheEntry>,
    max_entries: usize,
    max_bytes: u64,
    total_bytes: u64,
}

impl GridCache {
    /// Open the cache directory, indexing any collages already in it.
    pub fn open(dir: PathBuf, max_entries: usize, max_bytes: u64) -> Result<Self, GridError> {
        fs::create_dir_all(&dir)?;

        let mut index = HashMap::new();
        let mut total_bytes = 0;
        for entry in fs::read_dir(&dir)?.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(GRID_EXTENSION) {
                continue;
            }
            let Some(post_id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            total_bytes += size;
            index.insert(
                post_id,
                GridCacheEntry {
                    path,
                    size,
                    last_accessed: Instant::now(),
                },
            );
        }

        tracing::debug!(
            "grid cache initialized: {} entries, {} bytes in {}",
            index.len(),
            total_bytes,
            dir.display()
        );

        Ok(Self {
            dir,
            index,
            max_entries: max_entries.max(1),
            max_bytes,
            total_bytes,
        })
    }

    pub fn path_for(&self, post_id: &str) -> PathBuf {
        self.dir.join(format!("{post_id}.{GRID_EXTENSION}"))
    }

    /// Path of a cached collage, marking it as recently used.
    pub fn get(&mut self, post_id: &str) -> Option<PathBuf> {
        let entry = self.index.get_mut(post_id)?;
        entry.touch();
        Some(entry.path.clone())
    }

    pub fn contains(&self, post_id: &str) -> bool {
        self.index.contains_key(post_id)
    }

    /// Store a collage, evicting older entries to stay within budget.
    pub fn insert(&mut self, post_id: &str, data: &[u8]) -> Result<PathBuf, GridError> {
        self.invalidate(post_id);
        while self.index.len() >= self.max_entries {
            if !self.evict_lru() {
                break;
            }
        }

        let path = self.path_for(post_id);
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &path)?;

        let size = data.len() as u64;
        self.total_bytes += size;
        self.index.insert(
            post_id.to_string(),
            GridCacheEntry {
                path: path.clone(),
                size,
                last_accessed: Instant::now(),
            },
        );
        self.enforce_budget();
        Ok(path)
    }

    /// Drop a collage from the index and from disk.
    pub fn invalidate(&mut self, post_id: &str) {
        if let Some(entry) = self.index.remove(post_id) {
            self.total_bytes = self.total_bytes.saturating_sub(entry.size);
            let _ = fs::remove_file(&entry.path);
        }
    }

    /// Evict until total size fits the byte budget. Returns evicted count.
    pub fn enforce_budget(&mut self) -> usize {
        let mut evicted = 0;
        while self.total_bytes > self.max_bytes && self.evict_lru() {
            evicted += 1;
        }
        evicted
    }

    fn evict_lru(&mut self) -> bool {
        let Some(post_id) = self
            .index
            .iter()
            .min_by_key(|(_, entry)| entry.last_accessed)
            .map(|(post_id, _)| post_id.clone())
        else {
            return false;
        };
        tracing::info!("evicting grid cache entry: {post_id}");
        self.invalidate(&post_id);
        true
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
