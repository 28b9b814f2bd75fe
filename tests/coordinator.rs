use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use formcat::app::Catalog;
use formcat::config::{Config, ConfigLoader};
use formcat::coordinator::{TaskOutcome, TaskStatus};
use formcat::domain::{SortOrder, TaskKind};
use formcat::error::{CatalogError, ErrorKind};
use formcat::remote::{
    CatalogClient, Credentials, DownloadedArtifact, MediaFile, RemoteCatalogEntry, ServerSettings,
};

/// Holds every form list request until the test releases it.
struct GatedCatalog {
    gate: Mutex<Receiver<()>>,
    fetches: Arc<AtomicUsize>,
    reject: bool,
}

impl GatedCatalog {
    fn new(reject: bool) -> (Self, Sender<()>) {
        let (release, gate) = mpsc::channel();
        let client = Self {
            gate: Mutex::new(gate),
            fetches: Arc::new(AtomicUsize::new(0)),
            reject,
        };
        (client, release)
    }
}

impl CatalogClient for GatedCatalog {
    fn fetch_catalog(
        &self,
        _server: &ServerSettings,
    ) -> Result<Vec<RemoteCatalogEntry>, CatalogError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        // A dropped sender releases every later request too.
        let _ = self.gate.lock().unwrap().recv();
        if self.reject {
            return Err(CatalogError::Auth { status: 403 });
        }
        Ok(Vec::new())
    }

    fn download_artifact(
        &self,
        _entry: &RemoteCatalogEntry,
        _credentials: Option<&Credentials>,
    ) -> Result<DownloadedArtifact, CatalogError> {
        Err(CatalogError::Network("not implemented".to_string()))
    }

    fn download_media(
        &self,
        _file: &MediaFile,
        _credentials: Option<&Credentials>,
    ) -> Result<Vec<u8>, CatalogError> {
        Err(CatalogError::Network("not implemented".to_string()))
    }
}

fn open_catalog(temp: &tempfile::TempDir, client: GatedCatalog) -> Catalog<GatedCatalog> {
    let config = ConfigLoader::resolve_config(Config {
        server_url: Some("https://forms.example.org".to_string()),
        ..Config::default()
    })
    .unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().join("catalog")).unwrap();
    Catalog::open(&config, root, client).unwrap()
}

#[test]
fn concurrent_starts_share_one_sync() {
    let temp = tempfile::tempdir().unwrap();
    let (client, release) = GatedCatalog::new(false);
    let fetches = Arc::clone(&client.fetches);
    let catalog = open_catalog(&temp, client);

    let first = catalog.start(TaskKind::CatalogSync).unwrap();
    let second = catalog.start(TaskKind::CatalogSync).unwrap();
    assert_eq!(first.id(), second.id());
    assert!(second.is_running());

    release.send(()).unwrap();
    first.wait();
    assert_eq!(second.status(), TaskStatus::Finished);
    assert_eq!(fetches.load(Ordering::SeqCst), 1);

    drop(release);
    let third = catalog.start(TaskKind::CatalogSync).unwrap();
    assert_ne!(third.id(), first.id());
    third.wait();
    assert_eq!(fetches.load(Ordering::SeqCst), 2);
}

#[test]
fn different_kinds_run_independently() {
    let temp = tempfile::tempdir().unwrap();
    let (client, release) = GatedCatalog::new(false);
    let catalog = open_catalog(&temp, client);

    let sync = catalog.start(TaskKind::CatalogSync).unwrap();
    let scan = catalog.start(TaskKind::DiskScan).unwrap();
    assert_ne!(sync.id(), scan.id());

    scan.wait();
    assert!(sync.is_running());
    assert_matches!(scan.poll(), Some(TaskOutcome::Scan(result)) => {
        assert_eq!(result.summary_message, "Disk scan complete: no changes (0 forms)");
    });

    drop(release);
    sync.wait();
}

#[test]
fn result_waits_for_a_listener() {
    let temp = tempfile::tempdir().unwrap();
    let (client, release) = GatedCatalog::new(false);
    drop(release);
    let catalog = open_catalog(&temp, client);
    let forms = catalog.store().forms_dir();
    fs::write(
        forms.join("intake.json").as_std_path(),
        r#"{"formId":"intake","version":"1","title":"Intake"}"#,
    )
    .unwrap();

    let handle = catalog.start(TaskKind::DiskScan).unwrap();
    handle.wait();

    let received = Arc::new(Mutex::new(Vec::<String>::new()));
    let sink = Arc::clone(&received);
    catalog.coordinator().attach_listener(
        &handle,
        Arc::new(move |summary: &str| sink.lock().unwrap().push(summary.to_string())),
    );
    catalog.coordinator().detach_listener(&handle);

    // Reattaching through the coordinator finds the same, already drained task.
    let again = catalog.coordinator().handle(TaskKind::DiskScan).unwrap();
    assert_eq!(again.id(), handle.id());
    let sink = Arc::clone(&received);
    again.attach_listener(Arc::new(move |summary: &str| {
        sink.lock().unwrap().push(summary.to_string())
    }));

    assert_eq!(
        *received.lock().unwrap(),
        vec!["Disk scan complete: 1 added, 0 updated, 0 missing, 0 skipped".to_string()]
    );
    assert_eq!(catalog.list("", SortOrder::NameAsc, None).forms.len(), 1);

    let status = catalog.status();
    assert_eq!(status.live, 1);
    assert_eq!(status.tasks.len(), 1);
    assert_eq!(status.tasks[0].status, TaskStatus::Finished);
}

#[test]
fn rejected_sync_reports_auth_failure() {
    let temp = tempfile::tempdir().unwrap();
    let (client, release) = GatedCatalog::new(true);
    drop(release);
    let catalog = open_catalog(&temp, client);

    let handle = catalog.start(TaskKind::CatalogSync).unwrap();
    handle.wait();
    let outcome = handle.poll().unwrap();
    assert!(outcome.is_failure());
    assert_matches!(
        &outcome,
        TaskOutcome::Failed { kind: ErrorKind::Auth, .. }
    );
    assert_eq!(
        outcome.summary(),
        "Task failed (auth): catalog server rejected credentials (status 403)"
    );
    assert!(catalog.index().is_empty());
}
