use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use chrono::Utc;
use serde::Serialize;

use crate::domain::{FormId, FormVersion};
use crate::error::{CatalogError, ErrorKind};
use crate::index::{FormIndex, FormRecord, RecordSource};
use crate::remote::{CatalogClient, Credentials, RemoteCatalogEntry, ServerSettings};
use crate::store::{Fingerprint, FormStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncFailure {
    pub form_id: FormId,
    pub version: FormVersion,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    pub added: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failures: Vec<SyncFailure>,
    pub summary_message: String,
}

impl SyncResult {
    fn new(added: usize, updated: usize, unchanged: usize, failures: Vec<SyncFailure>) -> Self {
        let mut summary_message = format!(
            "Catalog sync complete: {added} added, {updated} updated, {} failed",
            failures.len()
        );
        for failure in &failures {
            summary_message.push_str(&format!(
                "\n  {} ({}): {}",
                failure.form_id, failure.version, failure.message
            ));
        }
        Self {
            added,
            updated,
            unchanged,
            failures,
            summary_message,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Add,
    Update,
}

#[derive(Debug, Clone)]
struct Planned {
    position: usize,
    entry: RemoteCatalogEntry,
    action: Action,
}

/// Pulls the remote catalog into the local store and index.
pub struct CatalogSynchronizer<C: CatalogClient> {
    client: C,
    store: FormStore,
    index: Arc<FormIndex>,
    workers: usize,
}

impl<C: CatalogClient> CatalogSynchronizer<C> {
    pub fn new(client: C, store: FormStore, index: Arc<FormIndex>) -> Self {
        Self {
            client,
            store,
            index,
            workers: 4,
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Fails only when the form list itself cannot be fetched. Every per-form
    /// problem is reported in the returned [`SyncResult`].
    pub fn synchronize(&self, server: &ServerSettings) -> Result<SyncResult, CatalogError> {
        let entries = self.client.fetch_catalog(server)?;
        tracing::info!(entries = entries.len(), "form list fetched");

        let (plan, unchanged) = self.plan(entries);
        let outcomes = self.execute(plan, server.credentials.as_ref());

        let mut added = 0;
        let mut updated = 0;
        let mut failures = Vec::new();
        for (planned, outcome) in outcomes {
            match outcome {
                Ok(()) => match planned.action {
                    Action::Add => added += 1,
                    Action::Update => updated += 1,
                },
                Err(err) => {
                    tracing::warn!(
                        form_id = %planned.entry.form_id,
                        version = %planned.entry.version,
                        error = %err,
                        "form download failed"
                    );
                    failures.push(SyncFailure {
                        form_id: planned.entry.form_id,
                        version: planned.entry.version,
                        kind: err.kind(),
                        message: err.to_string(),
                    });
                }
            }
        }

        if added + updated > 0 {
            self.index.persist()?;
        }
        let result = SyncResult::new(added, updated, unchanged, failures);
        tracing::info!(summary = %result.summary_message, "catalog sync finished");
        Ok(result)
    }

    fn plan(&self, entries: Vec<RemoteCatalogEntry>) -> (Vec<Planned>, usize) {
        let mut seen = HashSet::new();
        let mut plan = Vec::new();
        let mut unchanged = 0;

        for (position, entry) in entries.into_iter().enumerate() {
            if !seen.insert((entry.form_id.clone(), entry.version.clone())) {
                tracing::debug!(form_id = %entry.form_id, "duplicate catalog entry ignored");
                continue;
            }
            let action = match self.index.get(&entry.form_id, &entry.version) {
                Some(local) => {
                    let content_changed = entry
                        .hash
                        .as_ref()
                        .is_some_and(|hash| hash != &local.content_fingerprint);
                    if local.deleted || content_changed {
                        Some(Action::Update)
                    } else {
                        None
                    }
                }
                None => match self.index.latest_version(&entry.form_id) {
                    Some(latest) if entry.version > latest => Some(Action::Update),
                    _ => Some(Action::Add),
                },
            };
            match action {
                Some(action) => plan.push(Planned {
                    position,
                    entry,
                    action,
                }),
                None => unchanged += 1,
            }
        }
        (plan, unchanged)
    }

    /// Runs the plan on a bounded pool. Entries sharing a form id form one unit
    /// of work, so no two workers ever write the same form's files.
    fn execute(
        &self,
        plan: Vec<Planned>,
        credentials: Option<&Credentials>,
    ) -> Vec<(Planned, Result<(), CatalogError>)> {
        let mut order: Vec<FormId> = Vec::new();
        let mut groups: HashMap<FormId, Vec<Planned>> = HashMap::new();
        for planned in plan {
            let id = planned.entry.form_id.clone();
            if !groups.contains_key(&id) {
                order.push(id.clone());
            }
            groups.entry(id).or_default().push(planned);
        }
        let queue: Mutex<VecDeque<Vec<Planned>>> = Mutex::new(
            order
                .into_iter()
                .filter_map(|id| groups.remove(&id))
                .collect(),
        );
        let workers = self.workers.min(queue_len(&queue)).max(1);
        let results = Mutex::new(Vec::new());
        // Status of the first credential rejection; 0 while none has happened.
        let auth_rejected = AtomicU16::new(0);

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        let next = lock(&queue).pop_front();
                        let Some(group) = next else {
                            break;
                        };
                        for planned in group {
                            let rejected = auth_rejected.load(Ordering::SeqCst);
                            let outcome = if rejected != 0 {
                                Err(CatalogError::Auth { status: rejected })
                            } else {
                                self.apply(&planned, credentials)
                            };
                            if let Err(CatalogError::Auth { status }) = &outcome {
                                auth_rejected.store(*status, Ordering::SeqCst);
                            }
                            lock(&results).push((planned, outcome));
                        }
                    }
                });
            }
        });

        let mut results = results.into_inner().unwrap_or_else(|p| p.into_inner());
        results.sort_by_key(|(planned, _)| planned.position);
        results
    }

    fn apply(
        &self,
        planned: &Planned,
        credentials: Option<&Credentials>,
    ) -> Result<(), CatalogError> {
        let entry = &planned.entry;
        tracing::debug!(
            form_id = %entry.form_id,
            version = %entry.version,
            action = ?planned.action,
            "downloading form"
        );
        let downloaded = self.client.download_artifact(entry, credentials)?;

        let target = self.store.artifact_path(&entry.form_id, &entry.version);
        let media_path = match &downloaded.manifest {
            Some(manifest) if !manifest.files.is_empty() => {
                let mut files = Vec::with_capacity(manifest.files.len());
                for file in &manifest.files {
                    let bytes = self.client.download_media(file, credentials)?;
                    files.push((file.filename.clone(), bytes));
                }
                Some(self.store.replace_media(&target, &files)?)
            }
            _ => None,
        };
        let storage_path = self
            .store
            .write(&entry.form_id, &entry.version, &downloaded.bytes)?;

        self.index.upsert(FormRecord {
            form_id: entry.form_id.clone(),
            version: entry.version.clone(),
            display_name: downloaded.header.title,
            storage_path,
            content_fingerprint: Fingerprint::of(&downloaded.bytes),
            last_modified: Utc::now(),
            deleted: false,
            media_path,
            source: RecordSource::Server,
        });
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn queue_len<T>(queue: &Mutex<VecDeque<T>>) -> usize {
    lock(queue).len()
}
