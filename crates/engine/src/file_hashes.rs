// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Memoized path → content-hash cache.
//!
//! The first `get` on a path hashes the file; later calls return the cached
//! value. The engine is the only writer: after any operation that mutates a
//! path it invalidates the entry before the next `get`. Caches stack per
//! filesystem and are consulted in order by root prefix.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use sha1::{Digest, Sha1};

use crate::error::{BuildError, Result};
use crate::key::ContentHash;

/// Hash a file's contents without touching any cache.
pub fn hash_file(path: &Path) -> std::io::Result<ContentHash> {
    let mut file = File::open(path)?;
    let mut sponge = Sha1::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        sponge.update(&buf[..n]);
    }
    Ok(ContentHash::from_bytes(sponge.finalize().into()))
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub entries: usize,
}

/// Per-filesystem content-hash cache.
pub struct FileHashCache {
    root: PathBuf,
    inner: DashMap<PathBuf, ContentHash>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl FileHashCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            inner: DashMap::new(),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    /// Whether this layer is responsible for `path`.
    pub fn covers(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }

    /// Cached hash of `path`, hashing the file on first use.
    pub fn get(&self, path: &Path) -> Result<ContentHash> {
        if let Some(entry) = self.inner.get(path) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(*entry);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let hash = hash_file(path).map_err(|e| BuildError::io(path, e))?;
        self.inner.insert(path.to_path_buf(), hash);
        Ok(hash)
    }

    /// Seed the cache with a known hash, as after verifying fetched outputs.
    pub fn set(&self, path: PathBuf, hash: ContentHash) {
        self.inner.insert(path, hash);
    }

    /// Drop the entry for a path that is about to change or just changed.
    pub fn invalidate(&self, path: &Path) {
        self.inner.remove(path);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.inner.len(),
        }
    }
}

/// Stacked per-filesystem layers, consulted in order.
pub struct StackedFileHashCache {
    layers: Vec<FileHashCache>,
}

impl StackedFileHashCache {
    pub fn new(layers: Vec<FileHashCache>) -> Self {
        Self { layers }
    }

    /// Single-filesystem convenience.
    pub fn single(root: impl Into<PathBuf>) -> Self {
        Self::new(vec![FileHashCache::new(root)])
    }

    fn layer_for(&self, path: &Path) -> Result<&FileHashCache> {
        self.layers
            .iter()
            .find(|layer| layer.covers(path))
            .ok_or_else(|| {
                BuildError::Internal(format!("no hash-cache layer covers {}", path.display()))
            })
    }

    pub fn get(&self, path: &Path) -> Result<ContentHash> {
        self.layer_for(path)?.get(path)
    }

    pub fn set(&self, path: PathBuf, hash: ContentHash) -> Result<()> {
        let layer = self.layer_for(&path)?;
        layer.set(path, hash);
        Ok(())
    }

    pub fn invalidate(&self, path: &Path) -> Result<()> {
        self.layer_for(path)?.invalidate(path);
        Ok(())
    }

    /// Aggregate statistics across layers.
    pub fn stats(&self) -> CacheStats {
        let mut total = CacheStats::default();
        for layer in &self.layers {
            let stats = layer.stats();
            total.hits += stats.hits;
            total.misses += stats.misses;
            total.entries += stats.entries;
        }
        total
    }
}

#[cfg(test)]
#[path = "file_hashes_tests.rs"]
mod tests;
