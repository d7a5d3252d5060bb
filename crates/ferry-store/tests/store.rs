use ferry_schema::{BuildStatus, VarMap};
use ferry_store::{Store, StoreError, VersionDraft};

fn draft(version: &str) -> VersionDraft {
    VersionDraft {
        version: version.to_owned(),
        manifest: "services:\n  app:\n    image: nginx:1.25\n".to_owned(),
        ..VersionDraft::default()
    }
}

#[test]
fn deactivation_refused_while_referenced() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path()).unwrap();
    store.modules.create("web", None, None, None).unwrap();
    store.modules.add_version("web", draft("1.0")).unwrap();
    store.modules.publish("web", "1.0").unwrap();
    store.projects.create("shop", None).unwrap();
    store
        .projects
        .add_module("shop", "web", "1.0", VarMap::new())
        .unwrap();

    let err = store.deactivate_module("web").unwrap_err();
    assert!(matches!(err, StoreError::Conflict(_)));
    assert!(err.to_string().contains("shop"));

    store.projects.set_active("shop", false).unwrap();
    store.deactivate_module("web").unwrap();
    assert!(!store.modules.get("web").unwrap().active);
    // Module records are never physically removed.
    assert_eq!(store.modules.list().unwrap().len(), 1);
}

#[test]
fn concurrent_build_updates_are_serialized() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open(dir.path()).unwrap();
    let build = store.builds.create(None, "b", None, None).unwrap();

    std::thread::scope(|s| {
        for _ in 0..8 {
            s.spawn(|| {
                for _ in 0..5 {
                    store
                        .builds
                        .update::<StoreError>(&build.id, |b| {
                            b.progress += 1;
                            Ok(())
                        })
                        .unwrap();
                }
            });
        }
    });

    let b = store.builds.get(&build.id).unwrap();
    assert_eq!(b.progress, 40);
    assert_eq!(b.status, BuildStatus::Queued);
}

#[test]
fn reopening_keeps_records() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = Store::open(dir.path()).unwrap();
        store.modules.create("db", Some("ops".to_owned()), None, None).unwrap();
    }
    let store = Store::open(dir.path()).unwrap();
    assert_eq!(store.modules.get("db").unwrap().author.as_deref(), Some("ops"));
}
