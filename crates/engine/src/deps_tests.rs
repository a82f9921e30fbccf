#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use super::*;
use crate::test_utils::FakeRule;

fn graph_of(rules: Vec<FakeRule>) -> Arc<RuleGraph> {
    let mut graph = RuleGraph::new();
    for rule in rules {
        graph.add(Arc::new(rule)).unwrap();
    }
    Arc::new(graph)
}

#[test]
fn resolves_declared_deps_in_order() {
    let graph = graph_of(vec![
        FakeRule::new("//:a").unwrap(),
        FakeRule::new("//:b").unwrap(),
        FakeRule::new("//:top").unwrap().dep("//:b").dep("//:a"),
    ]);
    let cache = RuleDepsCache::new(graph.clone());
    let top = graph.id_of(&BuildTarget::parse("//:top").unwrap()).unwrap();

    let deps = cache.build_deps(top).unwrap();
    let names: Vec<_> = deps
        .iter()
        .map(|id| graph.rule(*id).target().short_name().to_string())
        .collect();
    assert_eq!(names, ["b", "a"]);
}

#[test]
fn memoizes_resolution() {
    let graph = graph_of(vec![
        FakeRule::new("//:a").unwrap(),
        FakeRule::new("//:top").unwrap().dep("//:a"),
    ]);
    let cache = RuleDepsCache::new(graph.clone());
    let top = graph.id_of(&BuildTarget::parse("//:top").unwrap()).unwrap();

    let first = cache.build_deps(top).unwrap();
    let second = cache.build_deps(top).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
}

#[test]
fn unknown_dep_is_a_user_error() {
    let graph = graph_of(vec![FakeRule::new("//:top").unwrap().dep("//:ghost")]);
    let cache = RuleDepsCache::new(graph.clone());
    let top = graph.id_of(&BuildTarget::parse("//:top").unwrap()).unwrap();

    assert!(matches!(
        cache.build_deps(top),
        Err(BuildError::User(_))
    ));
}

#[test]
fn runtime_deps_default_to_empty() {
    let graph = graph_of(vec![FakeRule::new("//:lib").unwrap()]);
    let cache = RuleDepsCache::new(graph.clone());
    let lib = graph.id_of(&BuildTarget::parse("//:lib").unwrap()).unwrap();

    assert!(cache.runtime_deps(lib).unwrap().is_empty());
}

#[test]
fn runtime_deps_resolve_when_declared() {
    let graph = graph_of(vec![
        FakeRule::new("//:helper").unwrap(),
        FakeRule::new("//:bin").unwrap().with_runtime_dep("//:helper"),
    ]);
    let cache = RuleDepsCache::new(graph.clone());
    let bin = graph.id_of(&BuildTarget::parse("//:bin").unwrap()).unwrap();

    let rdeps = cache.runtime_deps(bin).unwrap();
    assert_eq!(rdeps.len(), 1);
    assert_eq!(graph.rule(rdeps[0]).target().short_name(), "helper");
}
