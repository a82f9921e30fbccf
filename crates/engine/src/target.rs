// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Build targets, the interned rule table, and project-relative paths.
//!
//! Rules are referenced everywhere by [`TargetId`], a small index into the
//! central [`RuleGraph`] table. Futures and maps key on `TargetId`, never on
//! owning pointers.

use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::rule::BuildRule;

/// Error constructing a target or source path.
#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    /// Target string is not of the form `//base/path:name`.
    #[error("malformed build target `{0}`")]
    Malformed(String),

    /// A rule for this target was already registered.
    #[error("duplicate build target `{0}`")]
    Duplicate(String),

    /// Source paths must be relative to the project root.
    #[error("source path must be relative: `{0}`")]
    AbsoluteSourcePath(PathBuf),

    /// Source paths may not traverse out of the project.
    #[error("source path escapes the project root: `{0}`")]
    PathTraversal(PathBuf),
}

/// Stable string identity of a rule across invocations: `//base/path:name`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct BuildTarget(String);

impl BuildTarget {
    /// Parse and validate a target string.
    pub fn parse(s: &str) -> Result<Self, TargetError> {
        let malformed = || TargetError::Malformed(s.to_string());
        let rest = s.strip_prefix("//").ok_or_else(malformed)?;
        let (base, name) = rest.split_once(':').ok_or_else(malformed)?;
        if name.is_empty() || name.contains([':', '/']) {
            return Err(malformed());
        }
        if base.starts_with('/') || base.ends_with('/') {
            return Err(malformed());
        }
        if base.split('/').any(|seg| seg == "." || seg == "..") {
            return Err(malformed());
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path component between `//` and `:`; empty for root targets.
    pub fn base_path(&self) -> &str {
        self.0
            .trim_start_matches('/')
            .split_once(':')
            .map(|(base, _)| base)
            .unwrap_or("")
    }

    /// Name component after the `:`.
    pub fn short_name(&self) -> &str {
        self.0.rsplit_once(':').map(|(_, name)| name).unwrap_or("")
    }
}

impl fmt::Display for BuildTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for BuildTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BuildTarget({})", self.0)
    }
}

/// Index of a rule in the [`RuleGraph`] table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(u32);

impl TargetId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// The central rule table: `Arc<dyn BuildRule>` per interned target.
///
/// Construction of the graph itself (target parsing, dependency wiring) is
/// the caller's concern; the engine only reads it.
#[derive(Default)]
pub struct RuleGraph {
    rules: Vec<Arc<dyn BuildRule>>,
    ids: HashMap<BuildTarget, TargetId>,
}

impl RuleGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a rule, returning its id.
    pub fn add(&mut self, rule: Arc<dyn BuildRule>) -> Result<TargetId, TargetError> {
        let target = rule.target().clone();
        if self.ids.contains_key(&target) {
            return Err(TargetError::Duplicate(target.0));
        }
        let id = TargetId(self.rules.len() as u32);
        self.rules.push(rule);
        self.ids.insert(target, id);
        Ok(id)
    }

    pub fn id_of(&self, target: &BuildTarget) -> Option<TargetId> {
        self.ids.get(target).copied()
    }

    pub fn rule(&self, id: TargetId) -> &Arc<dyn BuildRule> {
        &self.rules[id.index()]
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// A path relative to the project root, as rules declare inputs and outputs.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourcePath(PathBuf);

impl SourcePath {
    /// Validate that the path is relative and stays inside the project.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, TargetError> {
        let path = path.into();
        for component in path.components() {
            match component {
                Component::RootDir | Component::Prefix(_) => {
                    return Err(TargetError::AbsoluteSourcePath(path));
                }
                Component::ParentDir => return Err(TargetError::PathTraversal(path)),
                Component::CurDir | Component::Normal(_) => {}
            }
        }
        Ok(Self(path))
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// UTF-8 form, required for manifest serialization and metadata JSON.
    pub fn as_str(&self) -> Option<&str> {
        self.0.to_str()
    }
}

impl fmt::Display for SourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl fmt::Debug for SourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SourcePath({})", self.0.display())
    }
}

/// Resolves [`SourcePath`]s against the project root.
#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
}

impl PathResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn project_root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, path: &SourcePath) -> PathBuf {
        self.root.join(path.as_path())
    }
}

#[cfg(test)]
#[path = "target_tests.rs"]
mod tests;
