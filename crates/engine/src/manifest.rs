// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Per-rule manifest mapping observed-input fingerprints to dep-file keys.
//!
//! A manifest is an append-only list of `(input-hash-tuple, rule-key)`
//! entries, bounded by `max-entries`; at the bound it is discarded and
//! restarted. Lookup scans in insertion order and returns the first entry
//! whose recorded inputs still hash the same on disk.
//!
//! On-disk form is a stable binary layout; the wire form sent to the
//! artifact cache is the same bytes GZIP-compressed.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::error::{BuildError, Result};
use crate::file_hashes::StackedFileHashCache;
use crate::key::{ContentHash, KEY_WIDTH, RuleKey};
use crate::target::{PathResolver, SourcePath};

/// Manifest (de)serialization failure.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed manifest: {0}")]
    Malformed(String),

    #[error("manifest path is not valid UTF-8: {0}")]
    NonUtf8Path(PathBuf),

    #[error("manifest path too long: {0}")]
    PathTooLong(String),
}

/// One manifest entry: the inputs a prior build consumed, and the dep-file
/// key its artifact was stored under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub inputs: Vec<(SourcePath, ContentHash)>,
    pub key: RuleKey,
}

/// In-memory manifest; see the module docs for semantics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    /// First entry (in insertion order) whose recorded inputs match the
    /// current hashes of the potential-input universe.
    pub fn lookup(
        &self,
        hashes: &StackedFileHashCache,
        resolver: &PathResolver,
        universe: &[SourcePath],
    ) -> Result<Option<RuleKey>> {
        let mut current: Vec<(&SourcePath, ContentHash)> = Vec::with_capacity(universe.len());
        for path in universe {
            let resolved = resolver.resolve(path);
            match hashes.get(&resolved) {
                Ok(hash) => current.push((path, hash)),
                // A vanished potential input simply fails to match any
                // entry that recorded it.
                Err(BuildError::Io { source, .. })
                    if source.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }

        for entry in &self.entries {
            let matches = entry.inputs.iter().all(|(path, hash)| {
                current
                    .iter()
                    .any(|(cur_path, cur_hash)| *cur_path == path && cur_hash == hash)
            });
            if matches {
                return Ok(Some(entry.key));
            }
        }
        Ok(None)
    }

    /// Record the inputs a successful local build consumed. At the bound the
    /// manifest resets to empty before the entry lands.
    pub fn add_entry(
        &mut self,
        hashes: &StackedFileHashCache,
        resolver: &PathResolver,
        key: RuleKey,
        observed: &[SourcePath],
        max_entries: usize,
    ) -> Result<()> {
        if self.entries.len() >= max_entries {
            tracing::debug!(
                entries = self.entries.len(),
                max_entries,
                "manifest at capacity, restarting"
            );
            self.entries.clear();
        }

        let mut inputs = Vec::with_capacity(observed.len());
        for path in observed {
            let resolved = resolver.resolve(path);
            let hash = hashes.get(&resolved)?;
            inputs.push((path.clone(), hash));
        }
        inputs.sort();
        inputs.dedup();

        self.entries.push(ManifestEntry { inputs, key });
        Ok(())
    }

    /// Write the stable binary form.
    pub fn serialize<W: Write>(&self, sink: &mut W) -> std::result::Result<(), ManifestError> {
        sink.write_all(&(self.entries.len() as u32).to_be_bytes())?;
        for entry in &self.entries {
            sink.write_all(&(entry.inputs.len() as u32).to_be_bytes())?;
            for (path, hash) in &entry.inputs {
                let s = path
                    .as_str()
                    .ok_or_else(|| ManifestError::NonUtf8Path(path.as_path().to_path_buf()))?;
                let len = u16::try_from(s.len())
                    .map_err(|_| ManifestError::PathTooLong(s.to_string()))?;
                sink.write_all(&len.to_be_bytes())?;
                sink.write_all(s.as_bytes())?;
                sink.write_all(hash.as_bytes())?;
            }
            sink.write_all(entry.key.as_bytes())?;
        }
        Ok(())
    }

    /// Read the stable binary form.
    pub fn deserialize<R: Read>(source: &mut R) -> std::result::Result<Self, ManifestError> {
        let n_entries = read_u32(source)?;
        let mut entries = Vec::new();
        for _ in 0..n_entries {
            let n_inputs = read_u32(source)?;
            let mut inputs = Vec::new();
            for _ in 0..n_inputs {
                let len = read_u16(source)? as usize;
                let mut path_bytes = vec![0u8; len];
                source.read_exact(&mut path_bytes)?;
                let path_str = String::from_utf8(path_bytes)
                    .map_err(|e| ManifestError::Malformed(format!("path: {e}")))?;
                let path = SourcePath::new(path_str)
                    .map_err(|e| ManifestError::Malformed(e.to_string()))?;
                inputs.push((path, ContentHash::from_bytes(read_hash(source)?)));
            }
            entries.push(ManifestEntry {
                inputs,
                key: RuleKey::from_bytes(read_hash(source)?),
            });
        }
        Ok(Self { entries })
    }

    /// GZIP wire form for the artifact cache.
    pub fn to_gzip_bytes(&self) -> std::result::Result<Vec<u8>, ManifestError> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        self.serialize(&mut encoder)?;
        Ok(encoder.finish()?)
    }

    pub fn from_gzip_bytes(bytes: &[u8]) -> std::result::Result<Self, ManifestError> {
        let mut decoder = GzDecoder::new(bytes);
        Self::deserialize(&mut decoder)
    }

    /// Load the uncompressed on-disk form, `None` if absent.
    pub fn load(path: &Path) -> std::result::Result<Option<Self>, ManifestError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ManifestError::Io(e)),
        };
        Ok(Some(Self::deserialize(&mut bytes.as_slice())?))
    }

    /// Persist the uncompressed on-disk form via temp file and rename.
    pub fn save(&self, path: &Path) -> std::result::Result<(), ManifestError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut bytes = Vec::new();
        self.serialize(&mut bytes)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn read_u32<R: Read>(source: &mut R) -> std::result::Result<u32, ManifestError> {
    let mut buf = [0u8; 4];
    source.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_u16<R: Read>(source: &mut R) -> std::result::Result<u16, ManifestError> {
    let mut buf = [0u8; 2];
    source.read_exact(&mut buf)?;
    Ok(u16::from_be_bytes(buf))
}

fn read_hash<R: Read>(source: &mut R) -> std::result::Result<[u8; KEY_WIDTH], ManifestError> {
    let mut buf = [0u8; KEY_WIDTH];
    source.read_exact(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
#[path = "manifest_tests.rs"]
mod tests;
