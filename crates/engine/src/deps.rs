// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Memoized per-rule dependency sets.
//!
//! Declared and runtime deps are resolved to [`TargetId`]s once and shared;
//! a rule naming a target the graph does not know is a user error.

use std::sync::Arc;

use dashmap::DashMap;

use crate::error::{BuildError, Result};
use crate::target::{BuildTarget, RuleGraph, TargetId};

/// Resolves and memoizes `rule → deps` and `rule → runtime deps`.
pub struct RuleDepsCache {
    graph: Arc<RuleGraph>,
    deps: DashMap<TargetId, Arc<Vec<TargetId>>>,
    runtime_deps: DashMap<TargetId, Arc<Vec<TargetId>>>,
}

impl RuleDepsCache {
    pub fn new(graph: Arc<RuleGraph>) -> Self {
        Self {
            graph,
            deps: DashMap::new(),
            runtime_deps: DashMap::new(),
        }
    }

    /// Declared dependencies, in declaration order.
    pub fn build_deps(&self, id: TargetId) -> Result<Arc<Vec<TargetId>>> {
        if let Some(cached) = self.deps.get(&id) {
            return Ok(cached.clone());
        }
        let rule = self.graph.rule(id);
        let resolved = Arc::new(self.resolve(rule.target(), rule.deps())?);
        self.deps.insert(id, resolved.clone());
        Ok(resolved)
    }

    /// Runtime dependencies; empty unless the rule declares them.
    pub fn runtime_deps(&self, id: TargetId) -> Result<Arc<Vec<TargetId>>> {
        if let Some(cached) = self.runtime_deps.get(&id) {
            return Ok(cached.clone());
        }
        let rule = self.graph.rule(id);
        let targets = if rule.has_runtime_deps() {
            rule.runtime_deps()
        } else {
            Vec::new()
        };
        let resolved = Arc::new(self.resolve(rule.target(), targets)?);
        self.runtime_deps.insert(id, resolved.clone());
        Ok(resolved)
    }

    fn resolve(&self, owner: &BuildTarget, targets: Vec<BuildTarget>) -> Result<Vec<TargetId>> {
        targets
            .into_iter()
            .map(|dep| {
                self.graph.id_of(&dep).ok_or_else(|| {
                    BuildError::User(format!("rule `{owner}` depends on unknown target `{dep}`"))
                })
            })
            .collect()
    }
}

#[cfg(test)]
#[path = "deps_tests.rs"]
mod tests;
