// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Shared unit test utilities.
//!
//! Provides a scriptable fake rule and steps for engine-level tests.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::key::RuleKey;
use crate::rule::{BuildRule, KeyField, KeyValue, Step, StepContext, StepError};
use crate::target::{BuildTarget, SourcePath, TargetError};

/// Creates a directory tree from a list of (path, content) pairs.
///
/// Parent directories are created automatically.
pub fn create_tree(root: &Path, files: &[(&str, &str)]) {
    for (path, content) in files {
        let full_path = root.join(path);
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(full_path, content).unwrap();
    }
}

pub fn target(s: &str) -> BuildTarget {
    BuildTarget::parse(s).unwrap()
}

pub fn src(s: &str) -> SourcePath {
    SourcePath::new(s).unwrap()
}

/// Step that writes fixed contents to one output path.
pub struct WriteFileStep {
    pub output: SourcePath,
    pub contents: String,
}

#[async_trait]
impl Step for WriteFileStep {
    fn short_name(&self) -> &str {
        "write_file"
    }

    async fn execute(&self, ctx: &StepContext) -> Result<(), StepError> {
        let dest = ctx.resolver.resolve(&self.output);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(dest, &self.contents)?;
        Ok(())
    }
}

/// Step wrapper that counts executions.
pub struct CountingStep {
    pub inner: Arc<dyn Step>,
    pub runs: Arc<std::sync::atomic::AtomicUsize>,
}

#[async_trait]
impl Step for CountingStep {
    fn short_name(&self) -> &str {
        self.inner.short_name()
    }

    async fn execute(&self, ctx: &StepContext) -> Result<(), StepError> {
        self.runs.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.inner.execute(ctx).await
    }
}

/// Step that always fails.
pub struct FailStep;

#[async_trait]
impl Step for FailStep {
    fn short_name(&self) -> &str {
        "fail"
    }

    async fn execute(&self, _ctx: &StepContext) -> Result<(), StepError> {
        Err(StepError::Failed("scripted failure".to_string()))
    }
}

/// A scriptable build rule for tests.
pub struct FakeRule {
    target: BuildTarget,
    rule_type: String,
    deps: Vec<BuildTarget>,
    outputs: Vec<SourcePath>,
    fields: Vec<KeyField>,
    steps: Vec<Arc<dyn Step>>,
    cacheable: bool,
    input_based: bool,
    dep_file_keys: bool,
    manifest_caching: bool,
    covered_prefix: Option<SourcePath>,
    runtime_deps: Vec<BuildTarget>,
    abi: Option<RuleKey>,
}

impl FakeRule {
    pub fn new(target_str: &str) -> Result<Self, TargetError> {
        Ok(Self {
            target: BuildTarget::parse(target_str)?,
            rule_type: "fake_rule".to_string(),
            deps: Vec::new(),
            outputs: Vec::new(),
            fields: Vec::new(),
            steps: Vec::new(),
            cacheable: true,
            input_based: false,
            dep_file_keys: false,
            manifest_caching: false,
            covered_prefix: None,
            runtime_deps: Vec::new(),
            abi: None,
        })
    }

    pub fn dep(mut self, target_str: &str) -> Self {
        self.deps.push(target(target_str));
        self
    }

    pub fn output(mut self, path: &str) -> Self {
        self.outputs.push(src(path));
        self
    }

    pub fn field(mut self, field: KeyField) -> Self {
        self.fields.push(field);
        self
    }

    pub fn source(mut self, path: &str) -> Self {
        self.fields
            .push(KeyField::new("srcs", KeyValue::Path(src(path))));
        self
    }

    pub fn step(mut self, step: Arc<dyn Step>) -> Self {
        self.steps.push(step);
        self
    }

    /// A write-file step plus the matching declared output.
    pub fn writes(mut self, path: &str, contents: &str) -> Self {
        let output = src(path);
        self.outputs.push(output.clone());
        self.steps.push(Arc::new(WriteFileStep {
            output,
            contents: contents.to_string(),
        }));
        self
    }

    pub fn not_cacheable(mut self) -> Self {
        self.cacheable = false;
        self
    }

    pub fn with_input_based_key(mut self) -> Self {
        self.input_based = true;
        self
    }

    /// Enable dep-file keys covering paths under `prefix`.
    pub fn with_dep_files(mut self, prefix: &str) -> Self {
        self.dep_file_keys = true;
        self.covered_prefix = Some(src(prefix));
        self
    }

    pub fn with_runtime_dep(mut self, target_str: &str) -> Self {
        self.runtime_deps.push(target(target_str));
        self
    }

    pub fn with_abi_key(mut self, key: RuleKey) -> Self {
        self.abi = Some(key);
        self
    }
}

impl BuildRule for FakeRule {
    fn target(&self) -> &BuildTarget {
        &self.target
    }

    fn rule_type(&self) -> &str {
        &self.rule_type
    }

    fn deps(&self) -> Vec<BuildTarget> {
        self.deps.clone()
    }

    fn outputs(&self) -> Vec<SourcePath> {
        self.outputs.clone()
    }

    fn key_fields(&self) -> Vec<KeyField> {
        self.fields.clone()
    }

    fn steps(&self) -> Vec<Arc<dyn Step>> {
        self.steps.clone()
    }

    fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    fn supports_input_based_key(&self) -> bool {
        self.input_based
    }

    fn uses_dep_file_keys(&self) -> bool {
        self.dep_file_keys
    }

    fn uses_manifest_caching(&self) -> bool {
        self.manifest_caching
    }

    fn covered_by_dep_file(&self, path: &SourcePath) -> bool {
        self.covered_prefix
            .as_ref()
            .is_some_and(|prefix| path.as_path().starts_with(prefix.as_path()))
    }

    fn has_runtime_deps(&self) -> bool {
        !self.runtime_deps.is_empty()
    }

    fn runtime_deps(&self) -> Vec<BuildTarget> {
        self.runtime_deps.clone()
    }

    fn abi_key(&self) -> Option<RuleKey> {
        self.abi
    }
}
