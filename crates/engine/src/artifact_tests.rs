#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use super::*;
use tempfile::tempdir;

use crate::key::KEY_WIDTH;

fn key(byte: u8) -> RuleKey {
    RuleKey::from_bytes([byte; KEY_WIDTH])
}

#[tokio::test]
async fn dir_cache_misses_when_empty() {
    let root = tempdir().unwrap();
    let dest = root.path().join("dest.zip");
    let cache = DirArtifactCache::new(root.path().join("cache"));
    assert!(matches!(
        cache.fetch(&key(1), &dest).await,
        CacheResult::Miss
    ));
}

#[tokio::test]
async fn dir_cache_store_then_fetch() {
    let root = tempdir().unwrap();
    let blob = root.path().join("blob.zip");
    std::fs::write(&blob, b"artifact-bytes").unwrap();
    let cache = DirArtifactCache::new(root.path().join("cache"));

    let mut metadata = HashMap::new();
    metadata.insert("RULE_KEY".to_string(), key(1).to_hex());
    cache
        .store(
            ArtifactInfo {
                keys: vec![key(1)],
                metadata: metadata.clone(),
            },
            &blob,
        )
        .await
        .unwrap();

    let dest = root.path().join("fetched.zip");
    match cache.fetch(&key(1), &dest).await {
        CacheResult::Hit { metadata: got } => assert_eq!(got, metadata),
        other => panic!("expected hit, got {other:?}"),
    }
    assert_eq!(std::fs::read(&dest).unwrap(), b"artifact-bytes");
}

#[tokio::test]
async fn multi_key_store_is_fetchable_under_every_key() {
    let root = tempdir().unwrap();
    let blob = root.path().join("blob.zip");
    std::fs::write(&blob, b"shared").unwrap();
    let cache = DirArtifactCache::new(root.path().join("cache"));

    cache
        .store(
            ArtifactInfo {
                keys: vec![key(1), key(2), key(3)],
                metadata: HashMap::new(),
            },
            &blob,
        )
        .await
        .unwrap();

    for k in [key(1), key(2), key(3)] {
        let dest = root.path().join(format!("{k}.zip"));
        assert!(cache.fetch(&k, &dest).await.is_hit());
        assert_eq!(std::fs::read(&dest).unwrap(), b"shared");
    }
}

#[tokio::test]
async fn noop_cache_never_hits() {
    let root = tempdir().unwrap();
    let cache = NoopArtifactCache;
    let dest = root.path().join("dest.zip");
    assert!(matches!(
        cache.fetch(&key(1), &dest).await,
        CacheResult::Miss
    ));
    cache
        .store(
            ArtifactInfo {
                keys: vec![key(1)],
                metadata: HashMap::new(),
            },
            &dest,
        )
        .await
        .unwrap();
}

#[test]
fn cache_result_hit_predicate() {
    assert!(
        CacheResult::Hit {
            metadata: HashMap::new()
        }
        .is_hit()
    );
    assert!(CacheResult::LocalKeyUnchangedHit.is_hit());
    assert!(!CacheResult::Miss.is_hit());
    assert!(!CacheResult::Ignored.is_hit());
    assert!(
        !CacheResult::Error {
            description: "boom".to_string()
        }
        .is_hit()
    );
}
