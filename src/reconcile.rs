use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use camino::Utf8PathBuf;
use serde::Serialize;

use crate::domain::{FormHeader, parse_form_header};
use crate::error::CatalogError;
use crate::index::{FormIndex, FormRecord, RecordKey, RecordSource};
use crate::store::{FormStore, ScanItem, ScannedArtifact};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilerState {
    Idle,
    /// Walking the store and reconciling each artifact found.
    Scanning,
    /// Flagging indexed records whose artifacts were not found.
    Reconciling,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedArtifact {
    pub path: Utf8PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanResult {
    pub added: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub missing: usize,
    pub skipped: Vec<SkippedArtifact>,
    pub summary_message: String,
}

#[derive(Debug, Default)]
struct Tally {
    added: usize,
    updated: usize,
    unchanged: usize,
    missing: usize,
    skipped: Vec<SkippedArtifact>,
}

impl Tally {
    fn skip(&mut self, path: Utf8PathBuf, reason: String) {
        tracing::warn!(%path, %reason, "skipping artifact");
        self.skipped.push(SkippedArtifact { path, reason });
    }

    fn finish(self) -> ScanResult {
        let summary_message = if self.added + self.updated + self.missing == 0
            && self.skipped.is_empty()
        {
            format!("Disk scan complete: no changes ({} forms)", self.unchanged)
        } else {
            format!(
                "Disk scan complete: {} added, {} updated, {} missing, {} skipped",
                self.added,
                self.updated,
                self.missing,
                self.skipped.len()
            )
        };
        ScanResult {
            added: self.added,
            updated: self.updated,
            unchanged: self.unchanged,
            missing: self.missing,
            skipped: self.skipped,
            summary_message,
        }
    }
}

/// Brings the index in line with what is actually on disk.
pub struct DiskReconciler {
    store: FormStore,
    index: Arc<FormIndex>,
    state: Mutex<ReconcilerState>,
}

impl DiskReconciler {
    pub fn new(store: FormStore, index: Arc<FormIndex>) -> Self {
        Self {
            store,
            index,
            state: Mutex::new(ReconcilerState::Idle),
        }
    }

    pub fn state(&self) -> ReconcilerState {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, next: ReconcilerState) {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = next;
    }

    pub fn run(&self) -> Result<ScanResult, CatalogError> {
        self.set_state(ReconcilerState::Scanning);
        let result = self.reconcile();
        self.set_state(ReconcilerState::Idle);
        result
    }

    fn reconcile(&self) -> Result<ScanResult, CatalogError> {
        let start_revision = self.index.revision();
        // Records written by a concurrent sync after this point are not judged
        // by this walk.
        let baseline = self.live_managed();
        let scan = self.store.scan()?;
        tracing::info!(root = %self.store.root(), "disk scan started");

        let mut seen = HashSet::new();
        let mut tally = Tally::default();
        for item in scan {
            seen.insert(item.path().to_path_buf());
            match item {
                ScanItem::Artifact(artifact) => self.reconcile_artifact(artifact, &mut tally),
                ScanItem::Skipped { path, reason } => tally.skip(path, reason),
            }
        }

        self.set_state(ReconcilerState::Reconciling);
        self.flag_missing(&baseline, &seen, &mut tally);

        if self.index.revision() != start_revision {
            self.index.persist()?;
        }
        let result = tally.finish();
        tracing::info!(summary = %result.summary_message, "disk scan finished");
        Ok(result)
    }

    fn live_managed(&self) -> BTreeMap<RecordKey, Utf8PathBuf> {
        self.index
            .records()
            .into_iter()
            .filter(|record| !record.deleted && self.store.is_managed(&record.storage_path))
            .map(|record| (record.key(), record.storage_path))
            .collect()
    }

    /// Marks baseline records whose artifact neither showed up in the walk nor
    /// exists now. A record relinked or rewritten since the baseline is left
    /// alone.
    fn flag_missing(
        &self,
        baseline: &BTreeMap<RecordKey, Utf8PathBuf>,
        seen: &HashSet<Utf8PathBuf>,
        tally: &mut Tally,
    ) {
        for ((form_id, version), path) in baseline {
            if seen.contains(path) || self.store.exists(path) {
                continue;
            }
            let Some(current) = self.index.get(form_id, version) else {
                continue;
            };
            if current.deleted || current.storage_path != *path {
                continue;
            }
            if self.index.mark_missing(form_id, version) {
                tracing::info!(
                    %form_id,
                    %version,
                    %path,
                    "artifact missing from disk"
                );
                tally.missing += 1;
            }
        }
    }

    fn reconcile_artifact(&self, artifact: ScannedArtifact, tally: &mut Tally) {
        let previous = self.index.find_by_path(&artifact.path);

        if let Some(existing) = &previous {
            if existing.content_fingerprint == artifact.fingerprint {
                if existing.deleted {
                    self.index.upsert(FormRecord {
                        deleted: false,
                        ..existing.clone()
                    });
                    tally.updated += 1;
                } else {
                    tally.unchanged += 1;
                }
                return;
            }
        }

        let header = match parse_form_header(&artifact.bytes) {
            Ok(header) => header,
            Err(err) => {
                tally.skip(artifact.path, err.to_string());
                return;
            }
        };

        if let Some(holder) = self.index.get(&header.form_id, &header.version) {
            let same_file = holder.storage_path == artifact.path;
            if !same_file && !holder.deleted && self.store.exists(&holder.storage_path) {
                let reason = format!(
                    "duplicate of {} version {} at {}",
                    header.form_id, header.version, holder.storage_path
                );
                tally.skip(artifact.path, reason);
                return;
            }
        }

        if let Some(existing) = &previous {
            if existing.key() != (header.form_id.clone(), header.version.clone()) {
                self.index.mark_missing(&existing.form_id, &existing.version);
            }
        }

        let replaces = previous.is_some()
            || self
                .index
                .get(&header.form_id, &header.version)
                .is_some();
        let source = previous
            .as_ref()
            .map(|record| record.source)
            .unwrap_or(RecordSource::Disk);
        tracing::debug!(
            form_id = %header.form_id,
            version = %header.version,
            path = %artifact.path,
            replaces,
            "indexing artifact"
        );
        self.index.upsert(self.record_for(header, artifact, source));
        if replaces {
            tally.updated += 1;
        } else {
            tally.added += 1;
        }
    }

    fn record_for(
        &self,
        header: FormHeader,
        artifact: ScannedArtifact,
        source: RecordSource,
    ) -> FormRecord {
        let media_dir = FormStore::media_dir(&artifact.path);
        let media_path = media_dir.as_std_path().is_dir().then_some(media_dir);
        FormRecord {
            form_id: header.form_id,
            version: header.version,
            display_name: header.title,
            storage_path: artifact.path,
            content_fingerprint: artifact.fingerprint,
            last_modified: artifact.modified,
            deleted: false,
            media_path,
            source,
        }
    }
}
