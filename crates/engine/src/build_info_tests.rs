#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use super::*;
use tempfile::tempdir;

use crate::test_utils::target;

#[test]
fn metadata_dir_layout() {
    let store = BuildInfoStore::new(std::path::Path::new("/project"));
    let dir = store.metadata_dir(&target("//lib/core:parser"));
    assert_eq!(
        dir,
        PathBuf::from("/project/kiln-out/bin/lib/core/parser/.metadata")
    );
}

#[test]
fn root_target_has_no_base_component() {
    let store = BuildInfoStore::new(std::path::Path::new("/project"));
    let dir = store.metadata_dir(&target("//:lib"));
    assert_eq!(dir, PathBuf::from("/project/kiln-out/bin/lib/.metadata"));
}

#[test]
fn read_absent_returns_none() {
    let dir = tempdir().unwrap();
    let store = BuildInfoStore::new(dir.path());
    assert!(
        store
            .read(&target("//:lib"), metadata::RULE_KEY)
            .unwrap()
            .is_none()
    );
}

#[test]
fn update_then_read_back() {
    let dir = tempdir().unwrap();
    let store = BuildInfoStore::new(dir.path());
    let lib = target("//:lib");

    let mut values = BTreeMap::new();
    values.insert(metadata::RULE_KEY.to_string(), "abc123".to_string());
    values.insert(metadata::TARGET.to_string(), "//:lib".to_string());
    store.update(&lib, &values).unwrap();

    assert_eq!(
        store.read(&lib, metadata::RULE_KEY).unwrap().as_deref(),
        Some("abc123")
    );
    assert_eq!(store.read_all(&lib).unwrap(), values);
}

#[test]
fn update_overwrites_existing_values() {
    let dir = tempdir().unwrap();
    let store = BuildInfoStore::new(dir.path());
    let lib = target("//:lib");

    let mut values = BTreeMap::new();
    values.insert(metadata::RULE_KEY.to_string(), "old".to_string());
    store.update(&lib, &values).unwrap();
    values.insert(metadata::RULE_KEY.to_string(), "new".to_string());
    store.update(&lib, &values).unwrap();

    assert_eq!(
        store.read(&lib, metadata::RULE_KEY).unwrap().as_deref(),
        Some("new")
    );
}

#[test]
fn delete_removes_everything() {
    let dir = tempdir().unwrap();
    let store = BuildInfoStore::new(dir.path());
    let lib = target("//:lib");

    let mut values = BTreeMap::new();
    values.insert(metadata::RULE_KEY.to_string(), "abc".to_string());
    store.update(&lib, &values).unwrap();
    store.delete(&lib).unwrap();

    assert!(store.read(&lib, metadata::RULE_KEY).unwrap().is_none());
    assert!(store.read_all(&lib).unwrap().is_empty());
    // Deleting again is fine.
    store.delete(&lib).unwrap();
}

#[test]
fn read_all_skips_manifest_and_temp_files() {
    let dir = tempdir().unwrap();
    let store = BuildInfoStore::new(dir.path());
    let lib = target("//:lib");

    let mut values = BTreeMap::new();
    values.insert(metadata::RULE_KEY.to_string(), "abc".to_string());
    store.update(&lib, &values).unwrap();
    std::fs::write(store.manifest_path(&lib), b"binary").unwrap();

    let all = store.read_all(&lib).unwrap();
    assert_eq!(all.len(), 1);
    assert!(all.contains_key(metadata::RULE_KEY));
}

#[test]
fn registry_shares_stores_per_root() {
    let dir = tempdir().unwrap();
    let registry = BuildInfoStoreRegistry::new();
    let a = registry.get_or_create(dir.path());
    let b = registry.get_or_create(dir.path());
    assert!(Arc::ptr_eq(&a, &b));
}
