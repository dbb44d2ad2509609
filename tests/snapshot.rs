//! Snapshot builds and snapshot-restored sandboxes.

mod common;

use common::snapshot_builder;
use serde_json::json;
use validator_sandbox::*;

const BUNDLE: &str = r#"
globalThis.counter = {
  value: 0,
  increment() {
    this.value += 1;
    return this.value;
  },
};

function loadedAt() {
  return 'snapshot';
}
"#;

#[tokio::test]
async fn test_restored_sandboxes_are_independent() {
    let snapshot = snapshot_builder().build(BUNDLE).await.unwrap();
    assert!(!snapshot.is_empty());

    let first = create_sandbox(&snapshot, ResourceLimits::default(), BridgeBindings::new())
        .await
        .unwrap();
    let second = create_sandbox(&snapshot, ResourceLimits::default(), BridgeBindings::new())
        .await
        .unwrap();

    for expected in 1..=3 {
        let value = first
            .invoke("counter", "increment", vec![], InvocationOptions::default())
            .await
            .unwrap();
        assert_eq!(value.into_data().unwrap(), json!(expected));
    }

    let value = second
        .invoke("counter", "increment", vec![], InvocationOptions::default())
        .await
        .unwrap();
    assert_eq!(value.into_data().unwrap(), json!(1));

    let value = second
        .invoke("", "loadedAt", vec![], InvocationOptions::default())
        .await
        .unwrap();
    assert_eq!(value.into_data().unwrap(), json!("snapshot"));
}

#[tokio::test]
async fn test_restored_sandbox_is_preemptible() {
    let bundle = format!("{}\nfunction spin() {{ while (true) {{}} }}", BUNDLE);
    let snapshot = snapshot_builder().build(&bundle).await.unwrap();
    let sandbox = create_sandbox(&snapshot, ResourceLimits::default(), BridgeBindings::new())
        .await
        .unwrap();

    let err = sandbox
        .invoke(
            "",
            "spin",
            vec![],
            InvocationOptions::default().with_timeout_millis(300),
        )
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    assert!(sandbox.is_disposed());
}

#[tokio::test]
async fn test_snapshot_file_round_trip() {
    let snapshot = snapshot_builder().build(BUNDLE).await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("validator.snapshot");

    snapshot.write_to(&path).await.unwrap();
    let restored = Snapshot::read_from(&path).await.unwrap();
    assert_eq!(restored.digest(), snapshot.digest());

    let sandbox = create_sandbox(&restored, ResourceLimits::default(), BridgeBindings::new())
        .await
        .unwrap();
    let value = sandbox
        .invoke("", "loadedAt", vec![], InvocationOptions::default())
        .await
        .unwrap();
    assert_eq!(value.into_data().unwrap(), json!("snapshot"));
}

#[tokio::test]
async fn test_broken_bundle_fails_to_build() {
    let err = snapshot_builder()
        .build("throw new Error('cannot bootstrap');")
        .await
        .unwrap_err();

    assert_eq!(err.kind(), FailureKind::Bootstrap);
    assert!(err.to_string().contains("cannot bootstrap"), "{}", err);
}

#[tokio::test]
async fn test_cache_builds_each_version_once() {
    let cache = SnapshotCache::new(snapshot_builder());

    let built = cache.get_or_build("1.0.0", BUNDLE).await.unwrap();
    // A second request for the same version never runs the (broken) source.
    let cached = cache.get_or_build("1.0.0", "syntax error (").await.unwrap();
    assert_eq!(built.digest(), cached.digest());

    assert!(cache.get("2.0.0").await.is_none());
    assert!(cache.get_or_build("2.0.0", "syntax error (").await.is_err());
    assert!(cache.get("2.0.0").await.is_none());

    cache.clear().await;
    assert!(cache.get("1.0.0").await.is_none());
}
