// SPDX-License-Identifier: MIT
// Copyright (c) 2026 Alfred Jean LLC

//! The four-stage caching build protocol.
//!
//! For each rule the engine tries, in order: an on-disk default-key match,
//! a default-key cache fetch, then (after deps are built) an input-based
//! match or fetch, a dep-file key match, a manifest-indexed fetch, and
//! finally a local build. The most specific successful route wins.
//!
//! Every rule's result is a memoized shared future created on first demand;
//! the map lock is held only around first insertion. Cancellation is
//! cooperative: once `first_failure` is set and keep-going is off, every
//! rule checks at its major transitions and resolves to `Canceled`.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use dashmap::DashMap;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared, join_all};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use serde::Serialize;
use tracing::{debug, warn};

use crate::artifact::{ArtifactCache, ArtifactInfo, CacheResult};
use crate::build_info::{BuildInfoStore, BuildInfoStoreRegistry, OUT_DIR, metadata};
use crate::config::{BuildMode, EngineConfig};
use crate::deps::RuleDepsCache;
use crate::error::BuildError;
use crate::events::{EngineEvent, EventBus};
use crate::file_hashes::{CacheStats, StackedFileHashCache, hash_file};
use crate::key::RuleKey;
use crate::key_factory::{KeyError, RuleKeyFactory};
use crate::manifest::Manifest;
use crate::packer::{self, ExistingFileMode};
use crate::rule::{BuildRule, StepContext};
use crate::scheduler::{ResourceAmounts, WeightedScheduler};
use crate::target::{BuildTarget, PathResolver, RuleGraph, SourcePath, TargetId};

/// How a rule's outputs were produced, most specific route first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildKind {
    BuiltLocally,
    FetchedFromCache,
    FetchedFromCacheInputBased,
    FetchedFromCacheManifestBased,
    MatchingRuleKey,
    MatchingInputBasedRuleKey,
    MatchingDepFileRuleKey,
}

impl BuildKind {
    pub fn was_fetched(self) -> bool {
        matches!(
            self,
            Self::FetchedFromCache
                | Self::FetchedFromCacheInputBased
                | Self::FetchedFromCacheManifestBased
        )
    }

    /// Whether this route (re)materialized output files.
    pub fn outputs_have_changed(self) -> bool {
        self == Self::BuiltLocally || self.was_fetched()
    }
}

/// Terminal outcome of one rule.
#[derive(Debug, Clone)]
pub enum BuildResult {
    Success {
        target: BuildTarget,
        kind: BuildKind,
    },
    Failure {
        target: BuildTarget,
        error: Arc<BuildError>,
    },
    Canceled {
        target: BuildTarget,
        reason: String,
    },
}

impl BuildResult {
    pub fn target(&self) -> &BuildTarget {
        match self {
            Self::Success { target, .. }
            | Self::Failure { target, .. }
            | Self::Canceled { target, .. } => target,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn kind(&self) -> Option<BuildKind> {
        match self {
            Self::Success { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Aggregate outcome of one `build()` call.
#[derive(Debug)]
pub struct BuildReport {
    /// Per-target results, in request order.
    pub results: Vec<BuildResult>,
    /// The first rule failure anywhere in the graph, if any.
    pub first_failure: Option<Arc<BuildError>>,
    /// Wall time of the whole call.
    pub total_ms: u64,
    /// Wall time per rule that ran.
    pub rule_ms: HashMap<BuildTarget, u64>,
    /// File-hash cache statistics at the end of the build.
    pub file_hash_stats: CacheStats,
}

impl BuildReport {
    pub fn succeeded(&self) -> bool {
        self.first_failure.is_none() && self.results.iter().all(BuildResult::is_success)
    }
}

type SharedBuildFuture = Shared<BoxFuture<'static, BuildResult>>;

/// Internal stage outcome; failures are shared so dep failures can be
/// attributed to parents without copying the error.
enum StageError {
    Failed(Arc<BuildError>),
    Canceled(String),
}

impl From<BuildError> for StageError {
    fn from(e: BuildError) -> Self {
        Self::Failed(Arc::new(e))
    }
}

type StageResult<T> = std::result::Result<T, StageError>;

/// Keys known at finalization time.
#[derive(Default)]
struct FinalKeys {
    default_key: Option<RuleKey>,
    input_based: Option<RuleKey>,
    dep_file: Option<RuleKey>,
    manifest: Option<RuleKey>,
}

struct EngineInner {
    graph: Arc<RuleGraph>,
    config: EngineConfig,
    resolver: PathResolver,
    file_hashes: Arc<StackedFileHashCache>,
    keys: RuleKeyFactory,
    stores: BuildInfoStoreRegistry,
    build_info: Arc<BuildInfoStore>,
    cache: Arc<dyn ArtifactCache>,
    scheduler: Arc<WeightedScheduler>,
    deps: RuleDepsCache,
    events: EventBus,
    /// Held only around first insertion per target.
    results: Mutex<HashMap<TargetId, SharedBuildFuture>>,
    first_failure: OnceLock<Arc<BuildError>>,
    uploads: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    rule_ms: DashMap<TargetId, u64>,
}

/// Orchestrates the cache protocol and local execution over a rule graph.
pub struct BuildEngine {
    inner: Arc<EngineInner>,
}

impl BuildEngine {
    pub fn new(
        graph: Arc<RuleGraph>,
        project_root: impl Into<PathBuf>,
        config: EngineConfig,
        cache: Arc<dyn ArtifactCache>,
    ) -> Self {
        let root: PathBuf = project_root.into();
        let resolver = PathResolver::new(&root);
        let file_hashes = Arc::new(StackedFileHashCache::single(&root));
        let keys = RuleKeyFactory::new(
            Arc::clone(&graph),
            Arc::clone(&file_hashes),
            resolver.clone(),
            config.key_seed,
            config.rule_key_caching,
        );
        let stores = BuildInfoStoreRegistry::new();
        let build_info = stores.get_or_create(&root);
        let deps = RuleDepsCache::new(Arc::clone(&graph));
        Self {
            inner: Arc::new(EngineInner {
                graph,
                config,
                resolver,
                file_hashes,
                keys,
                stores,
                build_info,
                cache,
                scheduler: Arc::new(WeightedScheduler::for_host()),
                deps,
                events: EventBus::default(),
                results: Mutex::new(HashMap::new()),
                first_failure: OnceLock::new(),
                uploads: Mutex::new(Vec::new()),
                rule_ms: DashMap::new(),
            }),
        }
    }

    /// Replace the default host-sized scheduler. Configure before building.
    pub fn with_scheduler(mut self, scheduler: WeightedScheduler) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.scheduler = Arc::new(scheduler);
        }
        self
    }

    /// Replace the default event bus. Configure before building.
    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.events = events;
        }
        self
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.inner.events
    }

    /// The metadata store for this engine's project filesystem.
    pub fn build_info(&self) -> &Arc<BuildInfoStore> {
        &self.inner.build_info
    }

    /// Metadata stores for other filesystems, created on demand.
    pub fn build_info_for(&self, project_root: &std::path::Path) -> Arc<BuildInfoStore> {
        self.inner.stores.get_or_create(project_root)
    }

    /// Build the given top-level targets and everything they need.
    pub async fn build(&self, targets: &[BuildTarget]) -> crate::error::Result<BuildReport> {
        let started = Instant::now();
        let ids = targets
            .iter()
            .map(|target| {
                self.inner
                    .graph
                    .id_of(target)
                    .ok_or_else(|| BuildError::User(format!("unknown build target `{target}`")))
            })
            .collect::<crate::error::Result<Vec<_>>>()?;

        let futures: Vec<_> = ids
            .iter()
            .map(|id| result_with_runtime_deps(Arc::clone(&self.inner), *id))
            .collect();
        let results = join_all(futures).await;

        // Uploads are off the critical path but must land before we return.
        let pending: Vec<_> = self.inner.uploads.lock().drain(..).collect();
        for handle in pending {
            let _ = handle.await;
        }

        let rule_ms = self
            .inner
            .rule_ms
            .iter()
            .map(|entry| {
                let target = self.inner.graph.rule(*entry.key()).target().clone();
                (target, *entry.value())
            })
            .collect();

        Ok(BuildReport {
            results,
            first_failure: self.inner.first_failure.get().cloned(),
            total_ms: started.elapsed().as_millis() as u64,
            rule_ms,
            file_hash_stats: self.inner.file_hashes.stats(),
        })
    }
}

/// The memoized shared future for one rule, created on first demand.
fn result_future(inner: &Arc<EngineInner>, id: TargetId) -> SharedBuildFuture {
    let mut results = inner.results.lock();
    if let Some(existing) = results.get(&id) {
        return existing.clone();
    }
    let future = build_rule(Arc::clone(inner), id).boxed().shared();
    results.insert(id, future.clone());
    future
}

/// Resolves after the rule's own result and, on success, after every
/// runtime dep has also resolved successfully. Runtime-dep failures and
/// cancellations propagate to the parent's result.
fn result_with_runtime_deps(
    inner: Arc<EngineInner>,
    id: TargetId,
) -> BoxFuture<'static, BuildResult> {
    async move {
        let own = result_future(&inner, id).await;
        if !own.is_success() {
            return own;
        }
        let target = inner.graph.rule(id).target().clone();
        let runtime_deps = match inner.deps.runtime_deps(id) {
            Ok(deps) => deps,
            Err(e) => {
                let error = Arc::new(e);
                let _ = inner.first_failure.set(error.clone());
                return BuildResult::Failure { target, error };
            }
        };
        let futures: Vec<_> = runtime_deps
            .iter()
            .map(|dep| result_with_runtime_deps(Arc::clone(&inner), *dep))
            .collect();
        for dep_result in join_all(futures).await {
            match dep_result {
                BuildResult::Success { .. } => {}
                BuildResult::Failure { error, .. } => {
                    return BuildResult::Failure { target, error };
                }
                BuildResult::Canceled { reason, .. } => {
                    return BuildResult::Canceled { target, reason };
                }
            }
        }
        own
    }
    .boxed()
}

async fn build_rule(inner: Arc<EngineInner>, id: TargetId) -> BuildResult {
    let target = inner.graph.rule(id).target().clone();
    inner.events.post(EngineEvent::RuleStarted {
        target: target.clone(),
    });
    let started = Instant::now();

    let outcome = run_stages(&inner, id, &target).await;
    inner
        .rule_ms
        .insert(id, started.elapsed().as_millis() as u64);

    let result = match outcome {
        Ok(kind) => {
            debug!(target = %target, ?kind, "rule finished");
            BuildResult::Success {
                target: target.clone(),
                kind,
            }
        }
        Err(StageError::Canceled(reason)) => BuildResult::Canceled {
            target: target.clone(),
            reason,
        },
        Err(StageError::Failed(error)) => {
            let _ = inner.first_failure.set(error.clone());
            BuildResult::Failure {
                target: target.clone(),
                error,
            }
        }
    };
    inner.events.post(EngineEvent::RuleFinished {
        target,
        kind: result.kind(),
    });
    result
}

/// Short-circuit to `Canceled` once a failure is recorded and keep-going
/// is off. Polled at every major transition and at task admission.
fn check_canceled(inner: &EngineInner) -> StageResult<()> {
    if !inner.config.keep_going
        && let Some(first) = inner.first_failure.get()
    {
        return Err(StageError::Canceled(first.to_string()));
    }
    Ok(())
}

/// The state machine of the four-stage cache protocol.
async fn run_stages(
    inner: &Arc<EngineInner>,
    id: TargetId,
    target: &BuildTarget,
) -> StageResult<BuildKind> {
    let rule = Arc::clone(inner.graph.rule(id));
    check_canceled(inner)?;

    // Stage 1: default key against on-disk metadata.
    let default_key = compute_key(inner, move |keys| keys.default_key(id))
        .await
        .map_err(StageError::from)?;
    if on_disk_key(inner, target, metadata::RULE_KEY)? == Some(default_key) {
        debug!(target = %target, "default key matches on disk");
        materialize_deps_if_deep(inner, id).await?;
        return Ok(BuildKind::MatchingRuleKey);
    }

    // Stage 2: default-key cache fetch.
    if rule.is_cacheable() {
        let keys = FinalKeys {
            default_key: Some(default_key),
            ..FinalKeys::default()
        };
        if let Some(kind) = try_fetch(
            inner,
            id,
            &rule,
            target,
            default_key,
            BuildKind::FetchedFromCache,
            keys,
        )
        .await?
        {
            materialize_deps_if_deep(inner, id).await?;
            return Ok(kind);
        }
    } else {
        debug!(target = %target, "rule is not cacheable, skipping fetch");
    }

    // Stage 3: build all deps, in shuffled order to spread contention.
    check_canceled(inner)?;
    await_deps(inner, id).await?;
    check_canceled(inner)?;

    // Stage 4a: input-based key.
    let mut input_key = None;
    if rule.supports_input_based_key() {
        let limit = inner.config.input_based_key_size_limit;
        match compute_key(inner, move |keys| keys.input_based_key(id, limit)).await {
            Ok(key) => {
                input_key = Some(key);
                if on_disk_key(inner, target, metadata::INPUT_BASED_RULE_KEY)? == Some(key) {
                    debug!(target = %target, "input-based key matches on disk");
                    let keys = FinalKeys {
                        default_key: Some(default_key),
                        input_based: Some(key),
                        ..FinalKeys::default()
                    };
                    finalize(inner, id, &rule, target, BuildKind::MatchingInputBasedRuleKey, keys, None)
                        .await?;
                    return Ok(BuildKind::MatchingInputBasedRuleKey);
                }
                if rule.is_cacheable() {
                    let keys = FinalKeys {
                        default_key: Some(default_key),
                        input_based: Some(key),
                        ..FinalKeys::default()
                    };
                    if let Some(kind) = try_fetch(
                        inner,
                        id,
                        &rule,
                        target,
                        key,
                        BuildKind::FetchedFromCacheInputBased,
                        keys,
                    )
                    .await?
                    {
                        return Ok(kind);
                    }
                }
            }
            Err(BuildError::Key(KeyError::SizeLimitExceeded)) => {
                debug!(target = %target, "input set over size limit, skipping input-based caching");
            }
            Err(e) => return Err(e.into()),
        }
    }

    // Stage 4b: dep-file key from the prior build's observed inputs.
    if inner.config.dep_files.keys_enabled()
        && rule.uses_dep_file_keys()
        && let Some(prior) = read_dep_file(inner, target)?
    {
        let computed =
            compute_key(inner, move |keys| keys.dep_file_key(id, &prior, true)).await;
        match computed {
            Ok(Some(key)) => {
                if on_disk_key(inner, target, metadata::DEP_FILE_RULE_KEY)? == Some(key) {
                    debug!(target = %target, "dep-file key matches on disk");
                    let keys = FinalKeys {
                        default_key: Some(default_key),
                        input_based: input_key,
                        dep_file: Some(key),
                        ..FinalKeys::default()
                    };
                    finalize(inner, id, &rule, target, BuildKind::MatchingDepFileRuleKey, keys, None)
                        .await?;
                    return Ok(BuildKind::MatchingDepFileRuleKey);
                }
            }
            Ok(None) => {
                debug!(target = %target, "dep-file input vanished, key unavailable");
            }
            Err(e) => return Err(e.into()),
        }
    }

    // Stage 4c: manifest-indexed fetch.
    if inner.config.dep_files.manifest_enabled()
        && rule.uses_manifest_caching()
        && rule.is_cacheable()
    {
        let (manifest_key, universe) = compute_manifest_key(inner, id).await?;
        if let Some(manifest) = load_manifest(inner, target, &manifest_key).await? {
            let looked_up = {
                let inner = Arc::clone(inner);
                let universe = universe.clone();
                tokio::task::spawn_blocking(move || {
                    manifest.lookup(&inner.file_hashes, &inner.resolver, &universe)
                })
                .await
                .map_err(|e| BuildError::Internal(format!("manifest lookup panicked: {e}")))
                .map_err(StageError::from)?
                .map_err(StageError::from)?
            };
            if let Some(dep_file_key) = looked_up {
                let keys = FinalKeys {
                    default_key: Some(default_key),
                    input_based: input_key,
                    dep_file: Some(dep_file_key),
                    manifest: Some(manifest_key),
                };
                if let Some(kind) = try_fetch(
                    inner,
                    id,
                    &rule,
                    target,
                    dep_file_key,
                    BuildKind::FetchedFromCacheManifestBased,
                    keys,
                )
                .await?
                {
                    return Ok(kind);
                }
            } else {
                debug!(target = %target, "no manifest entry matches current inputs");
            }
        }
    }

    // Stage 5: local build.
    check_canceled(inner)?;
    if inner.config.build_mode == BuildMode::PopulateFromRemoteCache {
        return Err(BuildError::PopulateOnlyDisabledLocal.into());
    }
    let built = build_locally(inner, id, &rule, target, default_key, input_key).await;
    if let Err(e) = built {
        // Half-complete metadata must never be mistaken for success later.
        if let Err(cleanup) = inner.build_info.delete(target) {
            warn!(target = %target, error = %cleanup, "metadata cleanup failed");
        }
        return Err(e);
    }
    Ok(BuildKind::BuiltLocally)
}

/// Await every declared dep, in shuffled order. Dep failures are attributed
/// to the parent under keep-going and cancel it otherwise.
async fn await_deps(inner: &Arc<EngineInner>, id: TargetId) -> StageResult<()> {
    let dep_ids = inner.deps.build_deps(id).map_err(StageError::from)?;
    let mut shuffled: Vec<TargetId> = dep_ids.as_ref().clone();
    shuffled.shuffle(&mut rand::thread_rng());

    let futures: Vec<_> = shuffled
        .iter()
        .map(|dep| result_future(inner, *dep))
        .collect();

    let mut failed: Option<(BuildTarget, Arc<BuildError>)> = None;
    let mut canceled: Option<String> = None;
    for result in join_all(futures).await {
        match result {
            BuildResult::Success { .. } => {}
            BuildResult::Failure { target, error } => {
                if failed.is_none() {
                    failed = Some((target, error));
                }
            }
            BuildResult::Canceled { reason, .. } => {
                if canceled.is_none() {
                    canceled = Some(reason);
                }
            }
        }
    }

    if let Some((dep, error)) = failed {
        if inner.config.keep_going {
            debug!(dep = %dep, "dependency failed, failing parent");
            return Err(StageError::Failed(error));
        }
        return Err(StageError::Canceled(format!("dependency `{dep}` failed")));
    }
    if let Some(reason) = canceled {
        return Err(StageError::Canceled(reason));
    }
    Ok(())
}

/// Deep mode materializes the whole subtree even when the rule itself was
/// satisfied at stage 1 or 2.
async fn materialize_deps_if_deep(inner: &Arc<EngineInner>, id: TargetId) -> StageResult<()> {
    if inner.config.build_mode == BuildMode::Deep {
        await_deps(inner, id).await?;
    }
    Ok(())
}

/// Key computation runs off the async workers under a cpu share.
async fn compute_key<T, F>(inner: &Arc<EngineInner>, compute: F) -> crate::error::Result<T>
where
    T: Send + 'static,
    F: FnOnce(&RuleKeyFactory) -> Result<T, KeyError> + Send + 'static,
{
    let _permit = inner.scheduler.clone().acquire(ResourceAmounts::cpu(1)).await;
    let inner = Arc::clone(inner);
    tokio::task::spawn_blocking(move || compute(&inner.keys))
        .await
        .map_err(|e| BuildError::Internal(format!("key computation panicked: {e}")))?
        .map_err(BuildError::from)
}

async fn compute_manifest_key(
    inner: &Arc<EngineInner>,
    id: TargetId,
) -> StageResult<(RuleKey, Vec<SourcePath>)> {
    compute_key(inner, move |keys| keys.manifest_key(id))
        .await
        .map_err(StageError::from)
}

/// Parse a persisted key, tolerating absent or corrupt metadata.
fn on_disk_key(
    inner: &EngineInner,
    target: &BuildTarget,
    key_name: &str,
) -> StageResult<Option<RuleKey>> {
    let Some(hex) = inner
        .build_info
        .read(target, key_name)
        .map_err(StageError::from)?
    else {
        return Ok(None);
    };
    match RuleKey::parse_hex(hex.trim()) {
        Ok(key) => Ok(Some(key)),
        Err(e) => {
            warn!(target = %target, key_name, error = %e, "corrupt key metadata ignored");
            Ok(None)
        }
    }
}

/// The prior build's dep file, if present and well-formed.
fn read_dep_file(inner: &EngineInner, target: &BuildTarget) -> StageResult<Option<Vec<SourcePath>>> {
    let Some(json) = inner
        .build_info
        .read(target, metadata::DEP_FILE)
        .map_err(StageError::from)?
    else {
        return Ok(None);
    };
    let raw: Vec<String> = match serde_json::from_str(&json) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(target = %target, error = %e, "corrupt dep file ignored");
            return Ok(None);
        }
    };
    let mut paths = Vec::with_capacity(raw.len());
    for entry in raw {
        match SourcePath::new(entry) {
            Ok(path) => paths.push(path),
            Err(e) => {
                warn!(target = %target, error = %e, "corrupt dep file ignored");
                return Ok(None);
            }
        }
    }
    Ok(Some(paths))
}

/// Scratch path for in-flight archive transfers.
fn scratch_zip(inner: &EngineInner, key: &RuleKey) -> crate::error::Result<PathBuf> {
    let dir = inner.resolver.project_root().join(OUT_DIR).join("tmp");
    std::fs::create_dir_all(&dir).map_err(|e| BuildError::io(&dir, e))?;
    Ok(dir.join(format!("fetch-{key}.zip")))
}

/// Fetch `key` and, on a hit, unpack and finalize. Transient cache errors
/// demote to misses and never fail the build.
async fn try_fetch(
    inner: &Arc<EngineInner>,
    id: TargetId,
    rule: &Arc<dyn BuildRule>,
    target: &BuildTarget,
    key: RuleKey,
    kind: BuildKind,
    keys: FinalKeys,
) -> StageResult<Option<BuildKind>> {
    inner.events.post(EngineEvent::CacheFetchStarted {
        target: target.clone(),
        key: key.to_hex(),
    });
    let zip = scratch_zip(inner, &key).map_err(StageError::from)?;
    let fetched = {
        let _permit = inner.scheduler.clone().acquire(ResourceAmounts::network(1)).await;
        inner.cache.fetch(&key, &zip).await
    };
    inner.events.post(EngineEvent::CacheFetchFinished {
        target: target.clone(),
        key: key.to_hex(),
        hit: fetched.is_hit(),
    });

    let metadata_map = match fetched {
        CacheResult::Hit { metadata } => metadata,
        CacheResult::LocalKeyUnchangedHit => {
            debug!(target = %target, "cache reports on-disk outputs already current");
            finalize(inner, id, rule, target, kind, keys, None).await?;
            return Ok(Some(kind));
        }
        CacheResult::Miss | CacheResult::Ignored => return Ok(None),
        CacheResult::Error { description } => {
            warn!(target = %target, %description, "cache fetch failed, treating as miss");
            return Ok(None);
        }
    };

    // Clear prior metadata before touching the tree so a half-written
    // state can never be mistaken for a completed build.
    inner.build_info.delete(target).map_err(StageError::from)?;

    let declared = rule.outputs();
    {
        let _permit = inner.scheduler.clone().acquire(ResourceAmounts::disk(1)).await;
        let resolver = inner.resolver.clone();
        let zip = zip.clone();
        let declared = declared.clone();
        tokio::task::spawn_blocking(move || {
            packer::unpack(
                &zip,
                &resolver,
                &declared,
                ExistingFileMode::OverwriteAndCleanDirectories,
            )
        })
        .await
        .map_err(|e| StageError::from(BuildError::Internal(format!("unpack panicked: {e}"))))?
        .map_err(BuildError::from)
        .map_err(StageError::from)?;
    }
    if let Err(e) = std::fs::remove_file(&zip) {
        debug!(path = %zip.display(), error = %e, "scratch archive not removed");
    }

    finalize(inner, id, rule, target, kind, keys, Some(metadata_map)).await?;
    Ok(Some(kind))
}

/// Run the rule's steps under its declared resource share.
async fn build_locally(
    inner: &Arc<EngineInner>,
    id: TargetId,
    rule: &Arc<dyn BuildRule>,
    target: &BuildTarget,
    default_key: RuleKey,
    input_key: Option<RuleKey>,
) -> StageResult<()> {
    let ctx = StepContext {
        resolver: inner.resolver.clone(),
    };
    {
        let _permit = inner.scheduler.clone().acquire(rule.resources()).await;
        check_canceled(inner)?;

        // Prior metadata describes outputs the steps are about to replace.
        inner.build_info.delete(target).map_err(StageError::from)?;

        for step in rule.steps() {
            debug!(target = %target, step = step.short_name(), "executing step");
            step.execute(&ctx).await.map_err(|e| {
                StageError::from(BuildError::StepFailed {
                    step: step.short_name().to_string(),
                    source: e,
                })
            })?;
        }
    }

    let keys = FinalKeys {
        default_key: Some(default_key),
        input_based: input_key,
        dep_file: None,
        manifest: None,
    };
    finalize(inner, id, rule, target, BuildKind::BuiltLocally, keys, None).await
}

/// Post-build finalization: reconcile recorded outputs, run post-build
/// steps, persist dep files and manifests, seed and invalidate the hash
/// cache, atomically write metadata, and schedule uploads.
async fn finalize(
    inner: &Arc<EngineInner>,
    id: TargetId,
    rule: &Arc<dyn BuildRule>,
    target: &BuildTarget,
    kind: BuildKind,
    mut keys: FinalKeys,
    fetched_metadata: Option<HashMap<String, String>>,
) -> StageResult<()> {
    // Matching kinds start from the metadata already on disk; fetched kinds
    // start from what traveled with the artifact.
    let mut values: BTreeMap<String, String> = match &fetched_metadata {
        Some(map) => map
            .iter()
            .filter(|(k, _)| is_known_metadata_key(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        None if kind != BuildKind::BuiltLocally => inner
            .build_info
            .read_all(target)
            .map_err(StageError::from)?,
        None => BTreeMap::new(),
    };

    // 1. Recorded outputs: declared set reconciled with what the prior
    // build (or the artifact) recorded.
    let mut recorded = rule.outputs();
    if kind != BuildKind::BuiltLocally
        && let Some(json) = values.get(metadata::RECORDED_PATHS)
        && let Ok(extra) = serde_json::from_str::<Vec<String>>(json)
    {
        for entry in extra {
            if let Ok(path) = SourcePath::new(entry) {
                recorded.push(path);
            }
        }
    }
    recorded.sort();
    recorded.dedup();

    // 2. Outputs changed: post-build steps, then hash-cache invalidation.
    if kind.outputs_have_changed() {
        if rule.has_post_build_steps() {
            let ctx = StepContext {
                resolver: inner.resolver.clone(),
            };
            for step in rule.post_build_steps() {
                debug!(target = %target, step = step.short_name(), "executing post-build step");
                step.execute(&ctx).await.map_err(|e| {
                    StageError::from(BuildError::StepFailed {
                        step: step.short_name().to_string(),
                        source: e,
                    })
                })?;
            }
        }
        for path in &recorded {
            inner
                .file_hashes
                .invalidate(&inner.resolver.resolve(path))
                .map_err(StageError::from)?;
        }
    }

    // 3. Built locally with dep files: persist the observed inputs, their
    // key, and (with manifest caching) the manifest entry.
    let mut observed_inputs: Option<Vec<SourcePath>> = None;
    if kind == BuildKind::BuiltLocally
        && inner.config.dep_files.keys_enabled()
        && rule.uses_dep_file_keys()
    {
        let observed = rule.inputs_after_building_locally();
        for path in &observed {
            if !rule.covered_by_dep_file(path) {
                return Err(StageError::from(BuildError::User(format!(
                    "rule `{target}` reported input `{path}` outside its dep-file coverage"
                ))));
            }
        }
        let dep_file_key = {
            let observed = observed.clone();
            compute_key(inner, move |factory| factory.dep_file_key(id, &observed, false))
                .await
                .map_err(|e| match e {
                    BuildError::Key(KeyError::MissingInput(path)) => {
                        StageError::from(BuildError::User(format!(
                            "rule `{target}` misreported its inputs: `{}` does not exist",
                            path.display()
                        )))
                    }
                    other => StageError::from(other),
                })?
                .ok_or_else(|| {
                    StageError::from(BuildError::Internal(
                        "dep-file key unavailable after local build".to_string(),
                    ))
                })?
        };
        keys.dep_file = Some(dep_file_key);

        if inner.config.dep_files.manifest_enabled() && rule.uses_manifest_caching() {
            let (manifest_key, _universe) = compute_manifest_key(inner, id).await?;
            keys.manifest = Some(manifest_key);
            update_and_store_manifest(inner, target, &manifest_key, dep_file_key, &observed)
                .await?;
        }
        observed_inputs = Some(observed);
    }

    // 4. Built locally and cacheable: record output hashes, within limits.
    let output_size = total_output_size(inner, &recorded).map_err(StageError::from)?;
    let within_limit = inner
        .config
        .artifact_cache_size_limit
        .is_none_or(|limit| output_size <= limit);
    if kind == BuildKind::BuiltLocally && rule.is_cacheable() && within_limit {
        let hashes = hash_outputs(inner, &recorded).map_err(StageError::from)?;
        if let Ok(json) = serde_json::to_string(&hashes) {
            values.insert(metadata::RECORDED_PATH_HASHES.to_string(), json);
        }
    }

    // 5. Fetched outputs: verify recorded hashes against disk and seed the
    // hash cache from them.
    if kind.was_fetched()
        && let Some(json) = values.get(metadata::RECORDED_PATH_HASHES)
        && let Ok(expected) = serde_json::from_str::<BTreeMap<String, String>>(json)
    {
        seed_hashes_from(inner, target, &expected).map_err(StageError::from)?;
    }

    // 6. Atomically write the metadata set.
    values.insert(metadata::TARGET.to_string(), target.to_string());
    if let Some(key) = keys.default_key {
        values.insert(metadata::RULE_KEY.to_string(), key.to_hex());
    }
    if let Some(key) = keys.input_based {
        values.insert(metadata::INPUT_BASED_RULE_KEY.to_string(), key.to_hex());
    }
    if let Some(key) = keys.dep_file {
        values.insert(metadata::DEP_FILE_RULE_KEY.to_string(), key.to_hex());
    }
    if let Some(key) = keys.manifest {
        values.insert(metadata::MANIFEST_KEY.to_string(), key.to_hex());
    }
    let recorded_json: Vec<String> = recorded.iter().map(|p| p.to_string()).collect();
    if let Ok(json) = serde_json::to_string(&recorded_json) {
        values.insert(metadata::RECORDED_PATHS.to_string(), json);
    }
    if let Some(observed) = &observed_inputs {
        let entries: Vec<String> = observed.iter().map(|p| p.to_string()).collect();
        if let Ok(json) = serde_json::to_string(&entries) {
            values.insert(metadata::DEP_FILE.to_string(), json);
        }
    }
    {
        let build_info = Arc::clone(&inner.build_info);
        let target = target.clone();
        let values = values.clone();
        tokio::task::spawn_blocking(move || build_info.update(&target, &values))
            .await
            .map_err(|e| StageError::from(BuildError::Internal(format!("metadata write panicked: {e}"))))?
            .map_err(StageError::from)?;
    }

    // 7. Upload under every applicable key, in deterministic order:
    // default, then input-based, then dep-file.
    let upload_keys = upload_keys_for(kind, &keys);
    if !upload_keys.is_empty() && rule.is_cacheable() && within_limit {
        schedule_upload(inner, target, &recorded, upload_keys, values).await?;
    }

    Ok(())
}

/// Which keys an artifact is (re)stored under after this outcome.
fn upload_keys_for(kind: BuildKind, keys: &FinalKeys) -> Vec<RuleKey> {
    let candidates: &[Option<RuleKey>] = match kind {
        BuildKind::BuiltLocally => &[keys.default_key, keys.input_based, keys.dep_file],
        // A manifest-based hit was only indexed under its dep-file key;
        // re-store it under the exact keys so later builds hit sooner.
        BuildKind::FetchedFromCacheManifestBased => &[keys.default_key, keys.input_based],
        // An input-based hit gains its new default key.
        BuildKind::FetchedFromCacheInputBased => &[keys.default_key],
        _ => &[],
    };
    candidates.iter().flatten().copied().collect()
}

/// Pack the outputs and hand them to the artifact cache off the critical
/// path. Store failures are logged, never fatal.
async fn schedule_upload(
    inner: &Arc<EngineInner>,
    target: &BuildTarget,
    recorded: &[SourcePath],
    upload_keys: Vec<RuleKey>,
    metadata_values: BTreeMap<String, String>,
) -> StageResult<()> {
    let first_key = match upload_keys.first() {
        Some(key) => *key,
        None => return Ok(()),
    };
    inner.events.post(EngineEvent::CompressionStarted {
        target: target.clone(),
    });
    let zip = scratch_zip(inner, &first_key).map_err(StageError::from)?;
    let compressed_bytes = {
        let _permit = inner.scheduler.clone().acquire(ResourceAmounts::disk(1)).await;
        let resolver = inner.resolver.clone();
        let recorded = recorded.to_vec();
        let zip = zip.clone();
        tokio::task::spawn_blocking(move || packer::pack(&resolver, &recorded, &zip))
            .await
            .map_err(|e| StageError::from(BuildError::Internal(format!("pack panicked: {e}"))))?
            .map_err(BuildError::from)
            .map_err(StageError::from)?
    };
    inner.events.post(EngineEvent::CompressionFinished {
        target: target.clone(),
        compressed_bytes,
    });

    let info = ArtifactInfo {
        keys: upload_keys,
        metadata: metadata_values.into_iter().collect(),
    };
    let upload_inner = Arc::clone(inner);
    let upload_target = target.clone();
    let handle = tokio::spawn(async move {
        upload_inner.events.post(EngineEvent::UploadStarted {
            target: upload_target.clone(),
        });
        let _permit = upload_inner
            .scheduler
            .clone()
            .acquire(ResourceAmounts::network(1))
            .await;
        let ok = match upload_inner.cache.store(info, &zip).await {
            Ok(()) => true,
            Err(e) => {
                warn!(target = %upload_target, error = %e, "artifact upload failed");
                false
            }
        };
        if let Err(e) = std::fs::remove_file(&zip) {
            debug!(path = %zip.display(), error = %e, "scratch archive not removed");
        }
        upload_inner.events.post(EngineEvent::UploadFinished {
            target: upload_target,
            ok,
        });
    });
    inner.uploads.lock().push(handle);
    Ok(())
}

/// Load the rule's manifest: the artifact cache first, the local file as
/// fallback. Corrupt manifests are discarded, not fatal.
async fn load_manifest(
    inner: &Arc<EngineInner>,
    target: &BuildTarget,
    manifest_key: &RuleKey,
) -> StageResult<Option<Manifest>> {
    let scratch = scratch_zip(inner, manifest_key).map_err(StageError::from)?;
    let fetched = {
        let _permit = inner.scheduler.clone().acquire(ResourceAmounts::network(1)).await;
        inner.cache.fetch(manifest_key, &scratch).await
    };
    if let CacheResult::Hit { .. } = fetched {
        let bytes = std::fs::read(&scratch).map_err(|e| BuildError::io(&scratch, e))
            .map_err(StageError::from)?;
        if let Err(e) = std::fs::remove_file(&scratch) {
            debug!(path = %scratch.display(), error = %e, "scratch manifest not removed");
        }
        match Manifest::from_gzip_bytes(&bytes) {
            Ok(manifest) => return Ok(Some(manifest)),
            Err(e) => {
                warn!(target = %target, error = %e, "corrupt cached manifest discarded");
            }
        }
    }

    let local = inner.build_info.manifest_path(target);
    match Manifest::load(&local) {
        Ok(found) => Ok(found),
        Err(e) => {
            warn!(target = %target, error = %e, "corrupt local manifest discarded");
            Ok(None)
        }
    }
}

/// Add the observed-input entry for a fresh local build, persist the
/// manifest locally, and push the gzip form to the artifact cache.
async fn update_and_store_manifest(
    inner: &Arc<EngineInner>,
    target: &BuildTarget,
    manifest_key: &RuleKey,
    dep_file_key: RuleKey,
    observed: &[SourcePath],
) -> StageResult<()> {
    let mut manifest = load_manifest(inner, target, manifest_key)
        .await?
        .unwrap_or_default();
    manifest
        .add_entry(
            &inner.file_hashes,
            &inner.resolver,
            dep_file_key,
            observed,
            inner.config.max_dep_file_cache_entries,
        )
        .map_err(StageError::from)?;

    let local = inner.build_info.manifest_path(target);
    manifest
        .save(&local)
        .map_err(|e| StageError::from(BuildError::User(format!("persist manifest: {e}"))))?;

    let bytes = manifest
        .to_gzip_bytes()
        .map_err(|e| StageError::from(BuildError::User(format!("encode manifest: {e}"))))?;
    // Dot-prefixed so metadata reads never mistake the wire form for a key.
    let wire = local.with_file_name(".MANIFEST.gz");
    std::fs::write(&wire, &bytes)
        .map_err(|e| BuildError::io(&wire, e))
        .map_err(StageError::from)?;

    let info = ArtifactInfo {
        keys: vec![*manifest_key],
        metadata: HashMap::new(),
    };
    let upload_inner = Arc::clone(inner);
    let upload_target = target.clone();
    let handle = tokio::spawn(async move {
        let _permit = upload_inner
            .scheduler
            .clone()
            .acquire(ResourceAmounts::network(1))
            .await;
        if let Err(e) = upload_inner.cache.store(info, &wire).await {
            warn!(target = %upload_target, error = %e, "manifest upload failed");
        }
        if let Err(e) = std::fs::remove_file(&wire) {
            debug!(path = %wire.display(), error = %e, "scratch manifest not removed");
        }
    });
    inner.uploads.lock().push(handle);
    Ok(())
}

/// Total uncompressed size of the recorded outputs.
fn total_output_size(inner: &EngineInner, recorded: &[SourcePath]) -> crate::error::Result<u64> {
    let mut total = 0u64;
    for path in recorded {
        for file in files_under(&inner.resolver.resolve(path))? {
            total = total.saturating_add(
                std::fs::metadata(&file)
                    .map_err(|e| BuildError::io(&file, e))?
                    .len(),
            );
        }
    }
    Ok(total)
}

/// Hash every output file, keyed by project-relative path.
fn hash_outputs(
    inner: &EngineInner,
    recorded: &[SourcePath],
) -> crate::error::Result<BTreeMap<String, String>> {
    let root = inner.resolver.project_root();
    let mut hashes = BTreeMap::new();
    for path in recorded {
        for file in files_under(&inner.resolver.resolve(path))? {
            let hash = inner.file_hashes.get(&file)?;
            let relative = file
                .strip_prefix(root)
                .map_err(|_| {
                    BuildError::Internal(format!("output escapes project root: {}", file.display()))
                })?
                .to_string_lossy()
                .into_owned();
            hashes.insert(relative, hash.to_hex());
        }
    }
    Ok(hashes)
}

/// Verify fetched outputs against their recorded hashes; matching entries
/// seed the hash cache, mismatches are logged and skipped.
fn seed_hashes_from(
    inner: &EngineInner,
    target: &BuildTarget,
    expected: &BTreeMap<String, String>,
) -> crate::error::Result<()> {
    for (relative, hex) in expected {
        let Ok(want) = crate::key::ContentHash::parse_hex(hex) else {
            warn!(target = %target, path = %relative, "corrupt recorded hash ignored");
            continue;
        };
        let resolved = inner.resolver.project_root().join(relative);
        let actual = match hash_file(&resolved) {
            Ok(hash) => hash,
            Err(e) => {
                warn!(target = %target, path = %relative, error = %e, "recorded output missing");
                continue;
            }
        };
        if actual == want {
            inner.file_hashes.set(resolved, actual)?;
        } else {
            warn!(target = %target, path = %relative, "fetched output does not match recorded hash");
        }
    }
    Ok(())
}

/// Every file under a declared output path (itself, or its subtree).
fn files_under(resolved: &std::path::Path) -> crate::error::Result<Vec<PathBuf>> {
    let meta = std::fs::metadata(resolved).map_err(|e| BuildError::io(resolved, e))?;
    if meta.is_file() {
        return Ok(vec![resolved.to_path_buf()]);
    }
    let mut files = Vec::new();
    let mut entries: Vec<_> = std::fs::read_dir(resolved)
        .map_err(|e| BuildError::io(resolved, e))?
        .collect::<Result<_, _>>()
        .map_err(|e| BuildError::io(resolved, e))?;
    entries.sort_by_key(|entry| entry.file_name());
    for entry in entries {
        files.extend(files_under(&entry.path())?);
    }
    Ok(files)
}

fn is_known_metadata_key(key: &str) -> bool {
    matches!(
        key,
        metadata::TARGET
            | metadata::RULE_KEY
            | metadata::INPUT_BASED_RULE_KEY
            | metadata::DEP_FILE_RULE_KEY
            | metadata::MANIFEST_KEY
            | metadata::RECORDED_PATHS
            | metadata::RECORDED_PATH_HASHES
            | metadata::DEP_FILE
    )
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
