// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! Shared helpers for engine scenario tests.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

use kiln::artifact::ArtifactCache;
use kiln::rule::{BuildRule, KeyField, KeyValue, Step, StepContext, StepError};
use kiln::target::{BuildTarget, SourcePath};
use kiln::{BuildEngine, EngineConfig, RuleGraph};

static INIT_LOGGING: Once = Once::new();

/// Install a stderr subscriber once per test binary, filtered by KILN_LOG.
fn init_logging() {
    INIT_LOGGING.call_once(|| {
        let filter =
            EnvFilter::try_from_env("KILN_LOG").unwrap_or_else(|_| EnvFilter::new("off"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .init();
    });
}

pub fn target(s: &str) -> BuildTarget {
    BuildTarget::parse(s).unwrap()
}

pub fn src(s: &str) -> SourcePath {
    SourcePath::new(s).unwrap()
}

/// Creates a directory tree from (path, content) pairs.
pub fn create_tree(root: &Path, files: &[(&str, &str)]) {
    for (path, content) in files {
        let full_path = root.join(path);
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(full_path, content).unwrap();
    }
}

pub fn engine_for(
    root: &Path,
    rules: Vec<ScriptedRule>,
    config: EngineConfig,
    cache: Arc<dyn ArtifactCache>,
) -> BuildEngine {
    init_logging();
    let mut graph = RuleGraph::new();
    for rule in rules {
        graph.add(Arc::new(rule)).unwrap();
    }
    BuildEngine::new(Arc::new(graph), root, config, cache)
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

/// Step that concatenates inputs into one output and records what it read.
pub struct ConcatStep {
    pub inputs: Vec<SourcePath>,
    pub output: SourcePath,
    pub observed: Arc<Mutex<Vec<SourcePath>>>,
}

#[async_trait]
impl Step for ConcatStep {
    fn short_name(&self) -> &str {
        "concat"
    }

    async fn execute(&self, ctx: &StepContext) -> Result<(), StepError> {
        let mut combined = Vec::new();
        let mut observed = Vec::new();
        for input in &self.inputs {
            combined.extend(fs::read(ctx.resolver.resolve(input))?);
            observed.push(input.clone());
        }
        let dest = ctx.resolver.resolve(&self.output);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(dest, combined)?;
        *self.observed.lock() = observed;
        Ok(())
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

/// Step that sleeps, to sequence failure races in scheduling tests.
pub struct SleepStep {
    pub millis: u64,
}

#[async_trait]
impl Step for SleepStep {
    fn short_name(&self) -> &str {
        "sleep"
    }

    async fn execute(&self, _ctx: &StepContext) -> Result<(), StepError> {
        tokio::time::sleep(Duration::from_millis(self.millis)).await;
        Ok(())
    }
}

/// Step wrapper that counts executions.
pub struct CountingStep {
    pub inner: Arc<dyn Step>,
    pub runs: Arc<AtomicUsize>,
}

#[async_trait]
impl Step for CountingStep {
    fn short_name(&self) -> &str {
        self.inner.short_name()
    }

    async fn execute(&self, ctx: &StepContext) -> Result<(), StepError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.inner.execute(ctx).await
    }
}

/// A scriptable build rule driven entirely through the public API.
pub struct ScriptedRule {
    target: BuildTarget,
    deps: Vec<BuildTarget>,
    outputs: Vec<SourcePath>,
    fields: Vec<KeyField>,
    steps: Vec<Arc<dyn Step>>,
    cacheable: bool,
    input_based: bool,
    dep_file_keys: bool,
    manifest_caching: bool,
    covered_prefix: Option<SourcePath>,
    observed: Arc<Mutex<Vec<SourcePath>>>,
}

impl ScriptedRule {
    pub fn new(target_str: &str) -> Self {
        Self {
            target: target(target_str),
            deps: Vec::new(),
            outputs: Vec::new(),
            fields: Vec::new(),
            steps: Vec::new(),
            cacheable: true,
            input_based: false,
            dep_file_keys: false,
            manifest_caching: false,
            covered_prefix: None,
            observed: Arc::new(Mutex::new(Vec::new())),
        }
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

    /// A counted write-file step plus the matching declared output.
    pub fn writes_counted(mut self, path: &str, contents: &str) -> (Self, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let output = src(path);
        self.outputs.push(output.clone());
        self.steps.push(Arc::new(CountingStep {
            inner: Arc::new(WriteFileStep {
                output,
                contents: contents.to_string(),
            }),
            runs: runs.clone(),
        }));
        (self, runs)
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

    pub fn with_manifest_caching(mut self) -> Self {
        self.manifest_caching = true;
        self
    }

    /// A concat step reading `inputs`, recorded as the rule's observed
    /// inputs, plus the matching declared output.
    pub fn concats(mut self, inputs: &[&str], output: &str) -> Self {
        let output = src(output);
        self.outputs.push(output.clone());
        self.steps.push(Arc::new(ConcatStep {
            inputs: inputs.iter().map(|p| src(p)).collect(),
            output,
            observed: self.observed.clone(),
        }));
        self
    }
}

impl BuildRule for ScriptedRule {
    fn target(&self) -> &BuildTarget {
        &self.target
    }

    fn rule_type(&self) -> &str {
        "scripted_rule"
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

    fn inputs_after_building_locally(&self) -> Vec<SourcePath> {
        self.observed.lock().clone()
    }
}
