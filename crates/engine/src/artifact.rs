// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! The artifact-cache contract and the directory-backed implementation.
//!
//! The engine treats every cache as potentially remote and best-effort:
//! all calls are fallible, fetch errors degrade to misses, and one blob may
//! be stored under several keys. Transports beyond the local directory
//! (HTTP, gRPC) implement the same trait elsewhere.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::key::RuleKey;

/// Outcome of a cache fetch.
#[derive(Debug, Clone)]
pub enum CacheResult {
    /// The blob landed at the fetch destination; metadata came out-of-band.
    Hit { metadata: HashMap<String, String> },
    /// The on-disk outputs already match; nothing was transferred.
    LocalKeyUnchangedHit,
    /// No artifact under this key.
    Miss,
    /// The rule is not cacheable; the cache was never consulted.
    Ignored,
    /// Transient transport failure. Demoted to a miss by the engine.
    Error { description: String },
}

impl CacheResult {
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit { .. } | Self::LocalKeyUnchangedHit)
    }
}

/// What to store alongside a blob: the full key set and rule metadata.
#[derive(Debug, Clone)]
pub struct ArtifactInfo {
    pub keys: Vec<RuleKey>,
    pub metadata: HashMap<String, String>,
}

/// Store error; always treated as transient by the engine.
#[derive(Debug, thiserror::Error)]
#[error("artifact cache: {0}")]
pub struct ArtifactCacheError(pub String);

/// The narrow fetch/store contract the engine drives.
#[async_trait]
pub trait ArtifactCache: Send + Sync {
    /// Fetch the blob stored under `key` into `dest`.
    async fn fetch(&self, key: &RuleKey, dest: &Path) -> CacheResult;

    /// Store `blob` under every key in `info.keys`. No ordering guarantees
    /// between concurrent stores of the same key.
    async fn store(&self, info: ArtifactInfo, blob: &Path) -> Result<(), ArtifactCacheError>;
}

/// Cache that never hits and never stores; used when caching is off.
#[derive(Debug, Default)]
pub struct NoopArtifactCache;

#[async_trait]
impl ArtifactCache for NoopArtifactCache {
    async fn fetch(&self, _key: &RuleKey, _dest: &Path) -> CacheResult {
        CacheResult::Miss
    }

    async fn store(&self, _info: ArtifactInfo, _blob: &Path) -> Result<(), ArtifactCacheError> {
        Ok(())
    }
}

/// Sidecar metadata persisted next to each blob.
#[derive(Debug, Serialize, Deserialize)]
struct SidecarMetadata {
    metadata: HashMap<String, String>,
}

/// Local-directory artifact cache with two-level key fan-out.
///
/// Blob for key `abcd…` lives at `<root>/ab/abcd…`, its metadata at
/// `<root>/ab/abcd….meta.json`. Writes publish via temp file and rename.
pub struct DirArtifactCache {
    root: PathBuf,
    /// Distinguishes temp files of concurrent stores for the same key.
    store_seq: AtomicU64,
}

impl DirArtifactCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            store_seq: AtomicU64::new(0),
        }
    }

    fn blob_path(&self, key: &RuleKey) -> PathBuf {
        let hex = key.to_hex();
        self.root.join(&hex[..2]).join(hex)
    }

    fn meta_path(&self, key: &RuleKey) -> PathBuf {
        let hex = key.to_hex();
        self.root.join(&hex[..2]).join(format!("{hex}.meta.json"))
    }
}

#[async_trait]
impl ArtifactCache for DirArtifactCache {
    async fn fetch(&self, key: &RuleKey, dest: &Path) -> CacheResult {
        let blob = self.blob_path(key);
        match tokio::fs::copy(&blob, dest).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return CacheResult::Miss,
            Err(e) => {
                return CacheResult::Error {
                    description: format!("fetch {}: {e}", blob.display()),
                };
            }
        }
        let metadata = match tokio::fs::read(self.meta_path(key)).await {
            Ok(bytes) => match serde_json::from_slice::<SidecarMetadata>(&bytes) {
                Ok(sidecar) => sidecar.metadata,
                Err(e) => {
                    return CacheResult::Error {
                        description: format!("corrupt metadata for {key}: {e}"),
                    };
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return CacheResult::Error {
                    description: format!("fetch metadata for {key}: {e}"),
                };
            }
        };
        CacheResult::Hit { metadata }
    }

    async fn store(&self, info: ArtifactInfo, blob: &Path) -> Result<(), ArtifactCacheError> {
        let sidecar = SidecarMetadata {
            metadata: info.metadata,
        };
        let meta_bytes = serde_json::to_vec(&sidecar)
            .map_err(|e| ArtifactCacheError(format!("encode metadata: {e}")))?;

        let seq = self.store_seq.fetch_add(1, Ordering::Relaxed);
        for key in &info.keys {
            let dest = self.blob_path(key);
            let Some(dir) = dest.parent() else {
                return Err(ArtifactCacheError(format!(
                    "blob path has no parent: {}",
                    dest.display()
                )));
            };
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| ArtifactCacheError(format!("mkdir {}: {e}", dir.display())))?;

            let tmp = dir.join(format!(".{key}.{seq}.tmp"));
            tokio::fs::copy(blob, &tmp)
                .await
                .map_err(|e| ArtifactCacheError(format!("copy {}: {e}", tmp.display())))?;
            tokio::fs::rename(&tmp, &dest)
                .await
                .map_err(|e| ArtifactCacheError(format!("publish {}: {e}", dest.display())))?;

            let meta_dest = self.meta_path(key);
            let meta_tmp = dir.join(format!(".{key}.{seq}.meta.tmp"));
            tokio::fs::write(&meta_tmp, &meta_bytes)
                .await
                .map_err(|e| ArtifactCacheError(format!("write {}: {e}", meta_tmp.display())))?;
            tokio::fs::rename(&meta_tmp, &meta_dest)
                .await
                .map_err(|e| {
                    ArtifactCacheError(format!("publish {}: {e}", meta_dest.display()))
                })?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "artifact_tests.rs"]
mod tests;
