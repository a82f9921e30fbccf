#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use super::*;

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use tempfile::tempdir;

use crate::artifact::{DirArtifactCache, NoopArtifactCache};
use crate::test_utils::{CountingStep, FailStep, FakeRule, WriteFileStep, create_tree, src, target};

fn engine_for(
    root: &Path,
    rules: Vec<FakeRule>,
    config: EngineConfig,
    cache: Arc<dyn ArtifactCache>,
) -> BuildEngine {
    let mut graph = RuleGraph::new();
    for rule in rules {
        graph.add(Arc::new(rule)).unwrap();
    }
    BuildEngine::new(Arc::new(graph), root, config, cache)
}

fn counted_write(path: &str, contents: &str) -> (Arc<dyn crate::rule::Step>, Arc<AtomicUsize>) {
    let runs = Arc::new(AtomicUsize::new(0));
    let step = Arc::new(CountingStep {
        inner: Arc::new(WriteFileStep {
            output: src(path),
            contents: contents.to_string(),
        }),
        runs: runs.clone(),
    });
    (step, runs)
}

#[tokio::test]
async fn unknown_target_is_an_error() {
    let dir = tempdir().unwrap();
    let engine = engine_for(
        dir.path(),
        vec![],
        EngineConfig::default(),
        Arc::new(NoopArtifactCache),
    );
    let result = engine.build(&[target("//:ghost")]).await;
    assert!(matches!(result, Err(BuildError::User(_))));
}

#[tokio::test]
async fn fresh_build_runs_steps_and_records_metadata() {
    let dir = tempdir().unwrap();
    create_tree(dir.path(), &[("a.txt", "source")]);
    let (step, runs) = counted_write("lib.out", "built");
    let rule = FakeRule::new("//:lib")
        .unwrap()
        .source("a.txt")
        .output("lib.out")
        .step(step);

    let engine = engine_for(
        dir.path(),
        vec![rule],
        EngineConfig::default(),
        Arc::new(NoopArtifactCache),
    );
    let report = engine.build(&[target("//:lib")]).await.unwrap();

    assert!(report.succeeded());
    assert_eq!(report.results[0].kind(), Some(BuildKind::BuiltLocally));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(
        std::fs::read(dir.path().join("lib.out")).unwrap(),
        b"built"
    );

    let store = engine.build_info();
    let lib = target("//:lib");
    let rule_key = store.read(&lib, metadata::RULE_KEY).unwrap().unwrap();
    assert!(RuleKey::parse_hex(&rule_key).is_ok());
    let recorded = store.read(&lib, metadata::RECORDED_PATHS).unwrap().unwrap();
    let recorded: Vec<String> = serde_json::from_str(&recorded).unwrap();
    assert_eq!(recorded, ["lib.out"]);
}

#[tokio::test]
async fn second_build_matches_rule_key_without_running_steps() {
    let dir = tempdir().unwrap();
    create_tree(dir.path(), &[("a.txt", "source")]);
    let (step, runs) = counted_write("lib.out", "built");
    let build_rule = || {
        FakeRule::new("//:lib")
            .unwrap()
            .source("a.txt")
            .output("lib.out")
            .step(step.clone())
    };

    let first = engine_for(
        dir.path(),
        vec![build_rule()],
        EngineConfig::default(),
        Arc::new(NoopArtifactCache),
    );
    first.build(&[target("//:lib")]).await.unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    let second = engine_for(
        dir.path(),
        vec![build_rule()],
        EngineConfig::default(),
        Arc::new(NoopArtifactCache),
    );
    let report = second.build(&[target("//:lib")]).await.unwrap();
    assert_eq!(report.results[0].kind(), Some(BuildKind::MatchingRuleKey));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn built_rule_uploads_to_the_artifact_cache() {
    let dir = tempdir().unwrap();
    let cache_dir = tempdir().unwrap();
    create_tree(dir.path(), &[("a.txt", "source")]);
    let rule = FakeRule::new("//:lib")
        .unwrap()
        .source("a.txt")
        .writes("lib.out", "built");

    let engine = engine_for(
        dir.path(),
        vec![rule],
        EngineConfig::default(),
        Arc::new(DirArtifactCache::new(cache_dir.path())),
    );
    engine.build(&[target("//:lib")]).await.unwrap();

    let stored: Vec<_> = walk_files(cache_dir.path());
    assert!(
        !stored.is_empty(),
        "expected an uploaded artifact, found none"
    );
}

#[tokio::test]
async fn not_cacheable_rule_skips_the_cache_entirely() {
    let dir = tempdir().unwrap();
    let cache_dir = tempdir().unwrap();
    create_tree(dir.path(), &[("a.txt", "source")]);
    let rule = FakeRule::new("//:lib")
        .unwrap()
        .not_cacheable()
        .source("a.txt")
        .writes("lib.out", "built");

    let engine = engine_for(
        dir.path(),
        vec![rule],
        EngineConfig::default(),
        Arc::new(DirArtifactCache::new(cache_dir.path())),
    );
    let report = engine.build(&[target("//:lib")]).await.unwrap();

    assert_eq!(report.results[0].kind(), Some(BuildKind::BuiltLocally));
    assert!(walk_files(cache_dir.path()).is_empty());
}

#[tokio::test]
async fn populate_mode_refuses_local_builds() {
    let dir = tempdir().unwrap();
    create_tree(dir.path(), &[("a.txt", "source")]);
    let rule = FakeRule::new("//:lib")
        .unwrap()
        .source("a.txt")
        .writes("lib.out", "built");

    let config = EngineConfig {
        build_mode: BuildMode::PopulateFromRemoteCache,
        ..EngineConfig::default()
    };
    let engine = engine_for(dir.path(), vec![rule], config, Arc::new(NoopArtifactCache));
    let report = engine.build(&[target("//:lib")]).await.unwrap();

    match &report.results[0] {
        BuildResult::Failure { error, .. } => {
            assert!(matches!(**error, BuildError::PopulateOnlyDisabledLocal));
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn failed_step_leaves_no_metadata_behind() {
    let dir = tempdir().unwrap();
    create_tree(dir.path(), &[("a.txt", "source")]);
    let rule = FakeRule::new("//:lib")
        .unwrap()
        .source("a.txt")
        .output("lib.out")
        .step(Arc::new(FailStep));

    let engine = engine_for(
        dir.path(),
        vec![rule],
        EngineConfig::default(),
        Arc::new(NoopArtifactCache),
    );
    let report = engine.build(&[target("//:lib")]).await.unwrap();

    assert!(!report.succeeded());
    assert!(report.first_failure.is_some());
    let store = engine.build_info();
    assert!(store.read_all(&target("//:lib")).unwrap().is_empty());
}

#[tokio::test]
async fn runtime_dep_failure_propagates_to_parent() {
    let dir = tempdir().unwrap();
    create_tree(dir.path(), &[("a.txt", "source"), ("b.txt", "source")]);
    let bin = FakeRule::new("//:bin")
        .unwrap()
        .source("a.txt")
        .writes("bin.out", "ok")
        .with_runtime_dep("//:helper");
    let helper = FakeRule::new("//:helper")
        .unwrap()
        .source("b.txt")
        .output("helper.out")
        .step(Arc::new(FailStep));

    let config = EngineConfig {
        keep_going: true,
        ..EngineConfig::default()
    };
    let engine = engine_for(dir.path(), vec![bin, helper], config, Arc::new(NoopArtifactCache));
    let report = engine.build(&[target("//:bin")]).await.unwrap();

    match &report.results[0] {
        BuildResult::Failure { target: t, error } => {
            assert_eq!(t.as_str(), "//:bin");
            assert!(matches!(**error, BuildError::StepFailed { .. }));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    // The parent's own steps did run; the failure came from the runtime dep.
    assert!(dir.path().join("bin.out").exists());
}

#[tokio::test]
async fn deep_mode_materializes_pruned_subtrees() {
    let dir = tempdir().unwrap();
    create_tree(dir.path(), &[("a.txt", "source"), ("b.txt", "source")]);
    let rules = || {
        vec![
            FakeRule::new("//:dep")
                .unwrap()
                .source("b.txt")
                .writes("dep.out", "dep"),
            FakeRule::new("//:top")
                .unwrap()
                .dep("//:dep")
                .source("a.txt")
                .writes("top.out", "top"),
        ]
    };

    let first = engine_for(
        dir.path(),
        rules(),
        EngineConfig::default(),
        Arc::new(NoopArtifactCache),
    );
    first.build(&[target("//:top")]).await.unwrap();

    // Lose the dep's output and metadata; the top-level key is unaffected.
    std::fs::remove_file(dir.path().join("dep.out")).unwrap();
    first.build_info().delete(&target("//:dep")).unwrap();

    let shallow = engine_for(
        dir.path(),
        rules(),
        EngineConfig::default(),
        Arc::new(NoopArtifactCache),
    );
    let report = shallow.build(&[target("//:top")]).await.unwrap();
    assert_eq!(report.results[0].kind(), Some(BuildKind::MatchingRuleKey));
    assert!(!dir.path().join("dep.out").exists());

    let deep = engine_for(
        dir.path(),
        rules(),
        EngineConfig {
            build_mode: BuildMode::Deep,
            ..EngineConfig::default()
        },
        Arc::new(NoopArtifactCache),
    );
    let report = deep.build(&[target("//:top")]).await.unwrap();
    assert_eq!(report.results[0].kind(), Some(BuildKind::MatchingRuleKey));
    assert!(dir.path().join("dep.out").exists());
}

fn walk_files(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let Ok(entries) = std::fs::read_dir(root) else {
        return files;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            files.extend(walk_files(&path));
        } else {
            files.push(path);
        }
    }
    files
}
