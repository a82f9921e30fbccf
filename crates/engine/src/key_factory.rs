// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Rule-key computation: default, input-based, dep-file, and manifest keys.
//!
//! All four builders share one canonical serialization into the
//! [`KeyHasher`] sponge; they differ in which fields participate, how
//! dependencies are represented, and which file set is hashed.
//!
//! Size-limit and missing-input conditions are explicit results, not
//! exceptions; the engine branches on them to skip a cache tier.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::BuildError;
use crate::file_hashes::StackedFileHashCache;
use crate::key::{ContentHash, KeyHasher, RuleKey};
use crate::rule::{BuildRule, KeyValue};
use crate::target::{BuildTarget, PathResolver, RuleGraph, SourcePath, TargetId};

/// Key computation failure.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    /// The hashed input set of an input-based key exceeded the configured
    /// cap; the engine skips input-based caching for the rule.
    #[error("input-based key inputs exceed the size limit")]
    SizeLimitExceeded,

    /// A referenced input no longer exists on disk.
    #[error("missing input: {0}")]
    MissingInput(PathBuf),

    /// A rule depends on a target the graph does not know.
    #[error("unknown target `{0}` in dependency list")]
    UnknownTarget(BuildTarget),

    /// Hashed paths must be valid UTF-8.
    #[error("path is not valid UTF-8: {0}")]
    NonUtf8Path(PathBuf),

    /// I/O failure while hashing an input.
    #[error("io error: {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Running total of hashed input bytes for the input-based size cap.
struct InputSizeBudget {
    limit: u64,
    used: u64,
}

impl InputSizeBudget {
    fn charge(&mut self, bytes: u64) -> Result<(), KeyError> {
        self.used = self.used.saturating_add(bytes);
        if self.used > self.limit {
            Err(KeyError::SizeLimitExceeded)
        } else {
            Ok(())
        }
    }
}

/// Computes the four key kinds for rules in a [`RuleGraph`].
pub struct RuleKeyFactory {
    graph: Arc<RuleGraph>,
    hashes: Arc<StackedFileHashCache>,
    resolver: PathResolver,
    seed: u64,
    /// Memoized default keys, present when rule-key caching is on.
    default_keys: Option<DashMap<TargetId, RuleKey>>,
}

impl RuleKeyFactory {
    pub fn new(
        graph: Arc<RuleGraph>,
        hashes: Arc<StackedFileHashCache>,
        resolver: PathResolver,
        seed: u64,
        cache_keys: bool,
    ) -> Self {
        Self {
            graph,
            hashes,
            resolver,
            seed,
            default_keys: cache_keys.then(DashMap::new),
        }
    }

    /// The default key: rule identity, every key-relevant field, and the
    /// transitive default keys of all declared deps. Always computable.
    pub fn default_key(&self, id: TargetId) -> Result<RuleKey, KeyError> {
        if let Some(cache) = &self.default_keys
            && let Some(key) = cache.get(&id)
        {
            return Ok(*key);
        }

        let rule = self.graph.rule(id);
        let mut hasher = KeyHasher::new(self.seed);
        hasher.put_str("default");
        hasher.put_str(rule.target().as_str());
        hasher.put_str(rule.rule_type());

        let fields = rule.key_fields();
        hasher.put_count(fields.len());
        for field in &fields {
            hasher.put_str(field.name);
            self.feed_value(&mut hasher, &field.value, &include_all, &mut None)?;
        }

        let deps = rule.deps();
        hasher.put_count(deps.len());
        for dep in &deps {
            let dep_id = self
                .graph
                .id_of(dep)
                .ok_or_else(|| KeyError::UnknownTarget(dep.clone()))?;
            hasher.put_key(&self.default_key(dep_id)?);
        }

        let key = hasher.finish();
        if let Some(cache) = &self.default_keys {
            cache.insert(id, key);
        }
        Ok(key)
    }

    /// The input-based key: content of the rule's direct inputs plus the ABI
    /// keys of deps. Fields marked non-input are skipped. Fails with
    /// [`KeyError::SizeLimitExceeded`] past `size_limit` hashed bytes.
    pub fn input_based_key(
        &self,
        id: TargetId,
        size_limit: Option<u64>,
    ) -> Result<RuleKey, KeyError> {
        let rule = self.graph.rule(id);
        let mut budget = size_limit.map(|limit| InputSizeBudget { limit, used: 0 });

        let mut hasher = KeyHasher::new(self.seed);
        hasher.put_str("input-based");
        hasher.put_str(rule.target().as_str());
        hasher.put_str(rule.rule_type());

        let fields: Vec<_> = rule
            .key_fields()
            .into_iter()
            .filter(|f| f.input_based)
            .collect();
        hasher.put_count(fields.len());
        for field in &fields {
            hasher.put_str(field.name);
            self.feed_value(&mut hasher, &field.value, &include_all, &mut budget)?;
        }

        let deps = rule.deps();
        hasher.put_count(deps.len());
        for dep in &deps {
            let dep_id = self
                .graph
                .id_of(dep)
                .ok_or_else(|| KeyError::UnknownTarget(dep.clone()))?;
            // Implementation-only changes in a dep must not invalidate us,
            // so prefer the dep's ABI summary over its full key.
            match self.graph.rule(dep_id).abi_key() {
                Some(abi) => hasher.put_key(&abi),
                None => hasher.put_key(&self.default_key(dep_id)?),
            }
        }

        Ok(hasher.finish())
    }

    /// The dep-file key: input-participating non-file fields plus the files
    /// the rule actually read during a prior local build.
    ///
    /// Returns `Ok(None)` if a listed file no longer exists and the caller
    /// tolerates that (pre-build lookup); post-build the same condition is
    /// an error, because the rule misreported its inputs.
    pub fn dep_file_key(
        &self,
        id: TargetId,
        dep_file: &[SourcePath],
        tolerate_missing: bool,
    ) -> Result<Option<RuleKey>, KeyError> {
        let rule = self.graph.rule(id);
        let mut hasher = KeyHasher::new(self.seed);
        hasher.put_str("dep-file");
        self.feed_uncovered_fields(&mut hasher, rule.as_ref())?;

        let mut entries: Vec<&SourcePath> = dep_file.iter().collect();
        entries.sort();
        entries.dedup();
        hasher.put_count(entries.len());
        for path in entries {
            let resolved = self.resolver.resolve(path);
            let hash = match self.hash_input(&resolved) {
                Ok((hash, _)) => hash,
                Err(KeyError::MissingInput(missing)) => {
                    if tolerate_missing {
                        return Ok(None);
                    }
                    return Err(KeyError::MissingInput(missing));
                }
                Err(other) => return Err(other),
            };
            hasher.put_str(source_path_str(path)?);
            hasher.put_content_hash(&hash);
        }

        Ok(Some(hasher.finish()))
    }

    /// The manifest key: same non-file construction as the dep-file key, but
    /// over the *paths* of the potential input universe rather than observed
    /// contents. Returns the key and the universe used for manifest lookup.
    pub fn manifest_key(&self, id: TargetId) -> Result<(RuleKey, Vec<SourcePath>), KeyError> {
        let rule = self.graph.rule(id);
        let mut hasher = KeyHasher::new(self.seed);
        hasher.put_str("manifest");
        self.feed_uncovered_fields(&mut hasher, rule.as_ref())?;

        let universe = covered_universe(rule.as_ref());
        hasher.put_count(universe.len());
        for path in &universe {
            hasher.put_str(source_path_str(path)?);
        }

        Ok((hasher.finish(), universe))
    }

    /// Identity plus input-participating fields, with dep-file-covered paths
    /// excluded. Shared between the dep-file and manifest builders.
    fn feed_uncovered_fields(
        &self,
        hasher: &mut KeyHasher,
        rule: &dyn BuildRule,
    ) -> Result<(), KeyError> {
        hasher.put_str(rule.target().as_str());
        hasher.put_str(rule.rule_type());

        let fields: Vec<_> = rule
            .key_fields()
            .into_iter()
            .filter(|f| f.input_based)
            .collect();
        hasher.put_count(fields.len());
        let include = |path: &SourcePath| !rule.covered_by_dep_file(path);
        for field in &fields {
            hasher.put_str(field.name);
            self.feed_value(hasher, &field.value, &include, &mut None)?;
        }
        Ok(())
    }

    /// Canonical serialization of one field value.
    fn feed_value(
        &self,
        hasher: &mut KeyHasher,
        value: &KeyValue,
        include: &dyn Fn(&SourcePath) -> bool,
        budget: &mut Option<InputSizeBudget>,
    ) -> Result<(), KeyError> {
        match value {
            KeyValue::Str(s) => hasher.put_str(s),
            KeyValue::Num(n) => hasher.put_u64(*n),
            KeyValue::Bool(b) => hasher.put_bool(*b),
            KeyValue::Path(path) => self.feed_path(hasher, path, include, budget)?,
            KeyValue::Paths(paths) => {
                // Count only what participates, so excluding a covered path
                // leaves no trace of it in the key.
                let included: Vec<&SourcePath> = paths.iter().filter(|p| include(p)).collect();
                hasher.put_count(included.len());
                for path in included {
                    self.feed_path(hasher, path, include, budget)?;
                }
            }
            KeyValue::List(items) => {
                hasher.put_count(items.len());
                for item in items {
                    hasher.put_str(item);
                }
            }
            KeyValue::Set(items) => {
                let sorted: BTreeSet<&String> = items.iter().collect();
                hasher.put_count(sorted.len());
                for item in sorted {
                    hasher.put_str(item);
                }
            }
        }
        Ok(())
    }

    fn feed_path(
        &self,
        hasher: &mut KeyHasher,
        path: &SourcePath,
        include: &dyn Fn(&SourcePath) -> bool,
        budget: &mut Option<InputSizeBudget>,
    ) -> Result<(), KeyError> {
        if !include(path) {
            return Ok(());
        }
        let resolved = self.resolver.resolve(path);
        let (hash, size) = self.hash_input(&resolved)?;
        if let Some(budget) = budget {
            budget.charge(size)?;
        }
        hasher.put_str(source_path_str(path)?);
        hasher.put_content_hash(&hash);
        Ok(())
    }

    /// Hash one resolved input, reporting vanished files as `MissingInput`.
    fn hash_input(&self, resolved: &std::path::Path) -> Result<(ContentHash, u64), KeyError> {
        let size = match std::fs::metadata(resolved) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(KeyError::MissingInput(resolved.to_path_buf()));
            }
            Err(e) => {
                return Err(KeyError::Io {
                    path: resolved.to_path_buf(),
                    source: e,
                });
            }
        };
        let hash = self.hashes.get(resolved).map_err(|e| match e {
            BuildError::Io { path, source } if source.kind() == std::io::ErrorKind::NotFound => {
                KeyError::MissingInput(path)
            }
            BuildError::Io { path, source } => KeyError::Io { path, source },
            other => KeyError::Io {
                path: resolved.to_path_buf(),
                source: std::io::Error::other(other.to_string()),
            },
        })?;
        Ok((hash, size))
    }
}

fn include_all(_: &SourcePath) -> bool {
    true
}

fn source_path_str(path: &SourcePath) -> Result<&str, KeyError> {
    path.as_str()
        .ok_or_else(|| KeyError::NonUtf8Path(path.as_path().to_path_buf()))
}

/// The rule's potential dep-file inputs: every declared source path the rule
/// covers, sorted and deduplicated.
pub fn covered_universe(rule: &dyn BuildRule) -> Vec<SourcePath> {
    let mut universe: Vec<SourcePath> = rule
        .key_fields()
        .into_iter()
        .filter(|f| f.input_based)
        .flat_map(|f| match f.value {
            KeyValue::Path(path) => vec![path],
            KeyValue::Paths(paths) => paths,
            _ => Vec::new(),
        })
        .filter(|path| rule.covered_by_dep_file(path))
        .collect();
    universe.sort();
    universe.dedup();
    universe
}

#[cfg(test)]
#[path = "key_factory_tests.rs"]
mod tests;
