// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Per-rule build metadata, persisted under the output tree.
//!
//! Each target owns one `.metadata/` directory; each known key is a file
//! whose contents are the UTF-8 value. Writes go to a temp file and rename
//! into place; the engine's single-writer-per-target property makes an
//! update atomic against readers of the same target.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{BuildError, Result};
use crate::target::BuildTarget;

/// Name of the engine's output tree under a project root.
pub const OUT_DIR: &str = "kiln-out";

/// Name of the per-rule manifest file inside the metadata directory.
pub const MANIFEST_FILE: &str = "MANIFEST";

/// Fixed metadata keys written after a successful build.
pub mod metadata {
    pub const TARGET: &str = "TARGET";
    pub const RULE_KEY: &str = "RULE_KEY";
    pub const INPUT_BASED_RULE_KEY: &str = "INPUT_BASED_RULE_KEY";
    pub const DEP_FILE_RULE_KEY: &str = "DEP_FILE_RULE_KEY";
    pub const MANIFEST_KEY: &str = "MANIFEST_KEY";
    /// JSON list of output paths relative to the project root.
    pub const RECORDED_PATHS: &str = "RECORDED_PATHS";
    /// JSON map of output path to hex content hash.
    pub const RECORDED_PATH_HASHES: &str = "RECORDED_PATH_HASHES";
    /// JSON list of input descriptors produced by the rule.
    pub const DEP_FILE: &str = "DEP_FILE";
}

/// Metadata store rooted at one project filesystem.
pub struct BuildInfoStore {
    bin_dir: PathBuf,
}

impl BuildInfoStore {
    pub fn new(project_root: &Path) -> Self {
        Self {
            bin_dir: project_root.join(OUT_DIR).join("bin"),
        }
    }

    /// The target's metadata directory: `kiln-out/bin/<path>/<name>/.metadata`.
    pub fn metadata_dir(&self, target: &BuildTarget) -> PathBuf {
        let mut dir = self.bin_dir.clone();
        if !target.base_path().is_empty() {
            dir.push(target.base_path());
        }
        dir.push(target.short_name());
        dir.push(".metadata");
        dir
    }

    /// Well-known path of the target's dep-file manifest.
    pub fn manifest_path(&self, target: &BuildTarget) -> PathBuf {
        self.metadata_dir(target).join(MANIFEST_FILE)
    }

    /// Read one metadata value, `None` if absent.
    pub fn read(&self, target: &BuildTarget, key: &str) -> Result<Option<String>> {
        let path = self.metadata_dir(target).join(key);
        match std::fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BuildError::io(path, e)),
        }
    }

    /// Read every metadata value present for a target.
    pub fn read_all(&self, target: &BuildTarget) -> Result<BTreeMap<String, String>> {
        let dir = self.metadata_dir(target);
        let mut values = BTreeMap::new();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(values),
            Err(e) => return Err(BuildError::io(dir, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| BuildError::io(&dir, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') || name == MANIFEST_FILE {
                continue;
            }
            let path = entry.path();
            let value =
                std::fs::read_to_string(&path).map_err(|e| BuildError::io(path.clone(), e))?;
            values.insert(name.to_string(), value);
        }
        Ok(values)
    }

    /// Replace the target's metadata with `values`.
    pub fn update(&self, target: &BuildTarget, values: &BTreeMap<String, String>) -> Result<()> {
        let dir = self.metadata_dir(target);
        std::fs::create_dir_all(&dir).map_err(|e| BuildError::io(dir.clone(), e))?;
        for (key, value) in values {
            let tmp = dir.join(format!(".{key}.tmp"));
            let dest = dir.join(key);
            std::fs::write(&tmp, value).map_err(|e| BuildError::io(tmp.clone(), e))?;
            std::fs::rename(&tmp, &dest).map_err(|e| BuildError::io(dest, e))?;
        }
        Ok(())
    }

    /// Remove every trace of the target's metadata, including the manifest.
    pub fn delete(&self, target: &BuildTarget) -> Result<()> {
        let dir = self.metadata_dir(target);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BuildError::io(dir, e)),
        }
    }
}

/// Per-filesystem stores, created on demand and then shared.
#[derive(Default)]
pub struct BuildInfoStoreRegistry {
    stores: DashMap<PathBuf, Arc<BuildInfoStore>>,
}

impl BuildInfoStoreRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, project_root: &Path) -> Arc<BuildInfoStore> {
        self.stores
            .entry(project_root.to_path_buf())
            .or_insert_with(|| Arc::new(BuildInfoStore::new(project_root)))
            .clone()
    }
}

#[cfg(test)]
#[path = "build_info_tests.rs"]
mod tests;
