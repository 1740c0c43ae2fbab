#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use common::{MockRegistry, labels_for};
use stargz_fs::fs::filesystem::{
    ANNOTATION_REF_NAME, TARGET_DIGEST_LABEL, TARGET_REF_LABEL, TARGET_SIZE_LABEL,
};
use stargz_fs::fs::{Config, Descriptor, LayerFs, MountError};

async fn layer_fs(root: &Path, registry: Arc<MockRegistry>) -> LayerFs<MockRegistry> {
    let config = Config {
        insecure: common::insecure_all(),
        ..Config::default()
    };
    LayerFs::new(root, &config, registry).await.unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn new_creates_both_cache_directories() {
    let tmp = tempfile::tempdir().unwrap();
    let _fs = layer_fs(tmp.path(), Arc::new(MockRegistry::default())).await;

    assert!(tmp.path().join("httpcache").is_dir());
    assert!(tmp.path().join("fscache").is_dir());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mount_requires_every_label() {
    let tmp = tempfile::tempdir().unwrap();
    let fs = layer_fs(tmp.path(), Arc::new(MockRegistry::default())).await;
    let mountpoint = tmp.path().join("mnt");

    for missing in [TARGET_REF_LABEL, TARGET_DIGEST_LABEL, TARGET_SIZE_LABEL] {
        let mut labels = labels_for(1000);
        labels.remove(missing);
        let err = fs.mount(&mountpoint, &labels).await.unwrap_err();
        assert!(
            matches!(err, MountError::MissingLabel(name) if name == missing),
            "expected MissingLabel({missing}), got {err:?}"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mount_rejects_unparseable_size() {
    let tmp = tempfile::tempdir().unwrap();
    let fs = layer_fs(tmp.path(), Arc::new(MockRegistry::default())).await;

    let mut labels = labels_for(0);
    labels.insert(TARGET_SIZE_LABEL.to_owned(), "not-a-number".to_owned());
    let err = fs.mount(&tmp.path().join("mnt"), &labels).await.unwrap_err();
    assert!(matches!(err, MountError::InvalidSize(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn check_fails_for_unregistered_mountpoint() {
    let tmp = tempfile::tempdir().unwrap();
    let fs = layer_fs(tmp.path(), Arc::new(MockRegistry::default())).await;

    let err = fs.check(Path::new("/never/mounted")).await.unwrap_err();
    assert!(matches!(err, MountError::NotRegistered(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn annotate_translates_descriptors_into_labels() {
    let tmp = tempfile::tempdir().unwrap();
    let fs = layer_fs(tmp.path(), Arc::new(MockRegistry::default())).await;

    let desc = Descriptor {
        media_type: "application/vnd.oci.image.layer.v1.tar+gzip".to_owned(),
        digest: "sha256:cafe".to_owned(),
        size: 4242,
        annotations: HashMap::from([(
            ANNOTATION_REF_NAME.to_owned(),
            "ghcr.io/org/app:v2".to_owned(),
        )]),
    };
    let labels = fs.annotate(&desc).unwrap();
    assert_eq!(labels[TARGET_REF_LABEL], "ghcr.io/org/app:v2");
    assert_eq!(labels[TARGET_DIGEST_LABEL], "sha256:cafe");
    assert_eq!(labels[TARGET_SIZE_LABEL], "4242");

    let bare = Descriptor {
        media_type: String::new(),
        digest: "sha256:cafe".to_owned(),
        size: 1,
        annotations: HashMap::new(),
    };
    assert!(matches!(
        fs.annotate(&bare).unwrap_err(),
        MountError::MissingAnnotation
    ));
}

#[test]
fn valid_interval_distinguishes_unset_from_zero() {
    let unset = Config::default();
    assert_eq!(unset.effective_valid_interval(), Duration::from_secs(60));

    let explicit_zero = Config {
        layer_valid_interval: Some(0),
        ..Config::default()
    };
    assert_eq!(explicit_zero.effective_valid_interval(), Duration::ZERO);

    let tuned = Config {
        layer_valid_interval: Some(5),
        ..Config::default()
    };
    assert_eq!(tuned.effective_valid_interval(), Duration::from_secs(5));

    let forced = Config {
        layer_valid_interval: Some(300),
        check_layer_always: true,
        ..Config::default()
    };
    assert_eq!(forced.effective_valid_interval(), Duration::ZERO);
}

#[test]
fn config_deserializes_snapshotter_style_toml() {
    let raw = r#"
        lru_max_entry = 100
        http_chunk_size = 4096
        http_cache_type = "memory"
        filesystem_cache_type = "directory"
        layer_valid_interval = 0
        noprefetch = true
        insecure = ["^localhost"]
    "#;
    let config: Config = toml::from_str(raw).unwrap();
    assert_eq!(config.lru_max_entry, 100);
    assert_eq!(config.http_chunk_size, 4096);
    assert_eq!(config.layer_valid_interval, Some(0));
    assert!(config.noprefetch);
    assert!(!config.check_layer_always);
}
