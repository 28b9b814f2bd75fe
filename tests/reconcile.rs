use std::fs;
use std::sync::Arc;

use camino::Utf8PathBuf;

use formcat::domain::{FormId, FormVersion, SortOrder};
use formcat::index::{FormIndex, RecordSource};
use formcat::reconcile::{DiskReconciler, ReconcilerState};
use formcat::store::FormStore;

struct Fixture {
    _temp: tempfile::TempDir,
    store: FormStore,
    index: Arc<FormIndex>,
    reconciler: DiskReconciler,
}

fn fixture() -> Fixture {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().join("catalog")).unwrap();
    let store = FormStore::new(root);
    store.ensure_root().unwrap();
    let index = Arc::new(FormIndex::open(&store.index_path()).unwrap());
    let reconciler = DiskReconciler::new(store.clone(), Arc::clone(&index));
    Fixture {
        _temp: temp,
        store,
        index,
        reconciler,
    }
}

fn put(store: &FormStore, relative: &str, body: &str) -> Utf8PathBuf {
    let path = store.forms_dir().join(relative);
    fs::create_dir_all(path.parent().unwrap().as_std_path()).unwrap();
    fs::write(path.as_std_path(), body).unwrap();
    path
}

fn form(id: &str, version: &str, title: &str) -> String {
    format!(r#"{{"formId":"{id}","version":"{version}","title":"{title}"}}"#)
}

fn id(value: &str) -> FormId {
    value.parse().unwrap()
}

#[test]
fn first_scan_indexes_every_artifact() {
    let fx = fixture();
    put(&fx.store, "intake.json", &form("intake", "1", "Intake"));
    put(&fx.store, "visits/site.json", &form("site_visit", "3", "Site visit"));

    let result = fx.reconciler.run().unwrap();
    assert_eq!(result.added, 2);
    assert_eq!(result.updated, 0);
    assert!(result.skipped.is_empty());
    assert_eq!(
        result.summary_message,
        "Disk scan complete: 2 added, 0 updated, 0 missing, 0 skipped"
    );

    let record = fx.index.get(&id("site_visit"), &FormVersion::new("3")).unwrap();
    assert_eq!(record.display_name, "Site visit");
    assert_eq!(record.source, RecordSource::Disk);
    assert!(!record.deleted);
    assert_eq!(fx.reconciler.state(), ReconcilerState::Idle);
    assert!(fx.store.index_path().as_std_path().exists());
}

#[test]
fn repeated_scan_is_idempotent() {
    let fx = fixture();
    put(&fx.store, "a.json", &form("a", "1", "Alpha"));
    put(&fx.store, "b.json", &form("b", "1", "Beta"));

    fx.reconciler.run().unwrap();
    let records_before = fx.index.records();
    let revision_before = fx.index.revision();

    let second = fx.reconciler.run().unwrap();
    assert_eq!(second.added, 0);
    assert_eq!(second.updated, 0);
    assert_eq!(second.unchanged, 2);
    assert_eq!(second.summary_message, "Disk scan complete: no changes (2 forms)");
    assert_eq!(fx.index.revision(), revision_before);
    assert_eq!(fx.index.records(), records_before);
}

#[test]
fn deleted_file_is_marked_missing_and_revived() {
    let fx = fixture();
    let body = form("intake", "1", "Intake");
    let path = put(&fx.store, "intake.json", &body);
    fx.reconciler.run().unwrap();

    fs::remove_file(path.as_std_path()).unwrap();
    let result = fx.reconciler.run().unwrap();
    assert_eq!(result.missing, 1);
    let record = fx.index.get(&id("intake"), &FormVersion::new("1")).unwrap();
    assert!(record.deleted);
    assert!(fx.index.query("", SortOrder::NameAsc, false).is_empty());

    // A second pass does not count the same record again.
    assert_eq!(fx.reconciler.run().unwrap().missing, 0);

    put(&fx.store, "intake.json", &body);
    let result = fx.reconciler.run().unwrap();
    assert_eq!(result.updated, 1);
    assert!(!fx.index.get(&id("intake"), &FormVersion::new("1")).unwrap().deleted);
}

#[test]
fn edited_file_moves_to_new_key() {
    let fx = fixture();
    put(&fx.store, "intake.json", &form("intake", "1", "Intake"));
    fx.reconciler.run().unwrap();

    put(&fx.store, "intake.json", &form("intake", "2", "Intake v2"));
    let result = fx.reconciler.run().unwrap();
    assert_eq!(result.updated, 1);

    assert!(fx.index.get(&id("intake"), &FormVersion::new("1")).unwrap().deleted);
    let current = fx.index.get(&id("intake"), &FormVersion::new("2")).unwrap();
    assert_eq!(current.display_name, "Intake v2");
    assert!(!current.deleted);
}

#[test]
fn malformed_and_duplicate_artifacts_are_skipped() {
    let fx = fixture();
    put(&fx.store, "a.json", &form("intake", "1", "Intake"));
    put(&fx.store, "b.json", &form("intake", "1", "Intake copy"));
    put(&fx.store, "c.json", "{ not json");

    let result = fx.reconciler.run().unwrap();
    assert_eq!(result.added, 1);
    assert_eq!(result.skipped.len(), 2);
    assert!(result.skipped[0].path.ends_with("b.json"));
    assert!(result.skipped[0].reason.contains("duplicate"));
    assert!(result.skipped[1].path.ends_with("c.json"));

    let record = fx.index.get(&id("intake"), &FormVersion::new("1")).unwrap();
    assert!(record.storage_path.ends_with("a.json"));
}

#[test]
fn locked_artifact_is_not_reported_missing() {
    let fx = fixture();
    let path = put(&fx.store, "intake.json", &form("intake", "1", "Intake"));
    fx.reconciler.run().unwrap();

    let marker = path.with_file_name("intake.json.lock");
    fs::write(marker.as_std_path(), b"").unwrap();
    let result = fx.reconciler.run().unwrap();
    assert_eq!(result.missing, 0);
    assert_eq!(result.skipped.len(), 1);
    assert!(!fx.index.get(&id("intake"), &FormVersion::new("1")).unwrap().deleted);
}

#[test]
fn media_directory_is_recorded() {
    let fx = fixture();
    let path = put(&fx.store, "intake/v1.json", &form("intake", "1", "Intake"));
    let media = FormStore::media_dir(&path);
    fs::create_dir_all(media.as_std_path()).unwrap();
    fs::write(media.join("logo.png").as_std_path(), b"png").unwrap();

    let result = fx.reconciler.run().unwrap();
    assert_eq!(result.added, 1);
    let record = fx.index.get(&id("intake"), &FormVersion::new("1")).unwrap();
    assert_eq!(record.media_path, Some(media));
}

#[test]
fn index_survives_reopen() {
    let fx = fixture();
    put(&fx.store, "intake.json", &form("intake", "1", "Intake"));
    fx.reconciler.run().unwrap();

    let reopened = FormIndex::open(&fx.store.index_path()).unwrap();
    assert_eq!(reopened.records(), fx.index.records());
}
