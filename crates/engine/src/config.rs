// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Engine configuration types.
//!
//! Loading (files, flags, environment) is the embedding tool's concern; the
//! engine consumes a fully-formed [`EngineConfig`].

use serde::{Deserialize, Serialize};

/// How much of the graph the engine materializes on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildMode {
    /// Materialize only outputs transitively needed by the top-level rules.
    #[default]
    Shallow,
    /// Materialize every output transitively.
    Deep,
    /// Fill local state from the remote cache; never run steps locally.
    PopulateFromRemoteCache,
}

/// Dep-file key handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DepFilesMode {
    Disabled,
    /// Dep-file keys only.
    #[default]
    Enabled,
    /// Dep-file keys plus the manifest store.
    Cache,
}

impl DepFilesMode {
    pub fn keys_enabled(self) -> bool {
        !matches!(self, Self::Disabled)
    }

    pub fn manifest_enabled(self) -> bool {
        matches!(self, Self::Cache)
    }
}

/// Options recognized by the build engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct EngineConfig {
    /// Materialization policy.
    pub build_mode: BuildMode,

    /// Dep-file key handling.
    pub dep_files: DepFilesMode,

    /// Manifest overflow bound; a manifest at this size is discarded and
    /// restarted before the next entry lands.
    pub max_dep_file_cache_entries: usize,

    /// Byte cap on artifact uploads; `None` uploads everything cacheable.
    pub artifact_cache_size_limit: Option<u64>,

    /// Byte cap on the hashed input set of an input-based key; past it the
    /// engine skips input-based caching for the rule.
    pub input_based_key_size_limit: Option<u64>,

    /// Continue building unaffected subtrees after a failure.
    pub keep_going: bool,

    /// Memoize default rule keys for the engine's lifetime.
    pub rule_key_caching: bool,

    /// Folded into every rule key so a fleet can invalidate all keys at once.
    pub key_seed: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            build_mode: BuildMode::default(),
            dep_files: DepFilesMode::default(),
            max_dep_file_cache_entries: default_max_dep_file_cache_entries(),
            artifact_cache_size_limit: None,
            input_based_key_size_limit: None,
            keep_going: false,
            rule_key_caching: true,
            key_seed: 0,
        }
    }
}

fn default_max_dep_file_cache_entries() -> usize {
    256
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
