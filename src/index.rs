use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::sync::{Mutex, MutexGuard};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{FormId, FormVersion, SortOrder};
use crate::error::CatalogError;
use crate::store::{Fingerprint, write_bytes_atomic};

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordSource {
    Disk,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormRecord {
    pub form_id: FormId,
    pub version: FormVersion,
    pub display_name: String,
    pub storage_path: Utf8PathBuf,
    pub content_fingerprint: Fingerprint,
    pub last_modified: DateTime<Utc>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub media_path: Option<Utf8PathBuf>,
    pub source: RecordSource,
}

impl FormRecord {
    pub fn key(&self) -> RecordKey {
        (self.form_id.clone(), self.version.clone())
    }
}

pub type RecordKey = (FormId, FormVersion);

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    schema_version: u32,
    records: Vec<FormRecord>,
}

#[derive(Debug, Default)]
struct IndexState {
    records: BTreeMap<RecordKey, FormRecord>,
    revision: u64,
}

/// Local registry of indexed forms, keyed by `(form_id, version)`.
///
/// All access goes through one mutex: writers are serialized and every query
/// works on a consistent view of the records.
#[derive(Debug)]
pub struct FormIndex {
    state: Mutex<IndexState>,
    snapshot_path: Option<Utf8PathBuf>,
}

impl FormIndex {
    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(IndexState::default()),
            snapshot_path: None,
        }
    }

    pub fn open(path: &Utf8Path) -> Result<Self, CatalogError> {
        let mut state = IndexState::default();
        if path.as_std_path().exists() {
            let content = fs::read(path.as_std_path())
                .map_err(|err| CatalogError::Storage(format!("read {path}: {err}")))?;
            let snapshot: Snapshot = serde_json::from_slice(&content)
                .map_err(|err| CatalogError::Parse(format!("index snapshot {path}: {err}")))?;
            for record in snapshot.records {
                state.records.insert(record.key(), record);
            }
        }
        Ok(Self {
            state: Mutex::new(state),
            snapshot_path: Some(path.to_path_buf()),
        })
    }

    pub fn persist(&self) -> Result<(), CatalogError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let snapshot = Snapshot {
            schema_version: SNAPSHOT_VERSION,
            records: self.records(),
        };
        let content = serde_json::to_vec_pretty(&snapshot)
            .map_err(|err| CatalogError::Storage(err.to_string()))?;
        write_bytes_atomic(path, &content)
    }

    pub fn upsert(&self, record: FormRecord) {
        let mut state = self.lock();
        state.records.insert(record.key(), record);
        state.revision += 1;
    }

    pub fn remove(&self, form_id: &FormId, version: &FormVersion) -> Option<FormRecord> {
        let mut state = self.lock();
        let removed = state.records.remove(&(form_id.clone(), version.clone()));
        if removed.is_some() {
            state.revision += 1;
        }
        removed
    }

    /// Flags a record whose artifact is gone. Returns false when there was
    /// nothing to flag.
    pub fn mark_missing(&self, form_id: &FormId, version: &FormVersion) -> bool {
        let mut state = self.lock();
        let Some(record) = state.records.get_mut(&(form_id.clone(), version.clone())) else {
            return false;
        };
        if record.deleted {
            return false;
        }
        record.deleted = true;
        state.revision += 1;
        true
    }

    pub fn get(&self, form_id: &FormId, version: &FormVersion) -> Option<FormRecord> {
        self.lock()
            .records
            .get(&(form_id.clone(), version.clone()))
            .cloned()
    }

    pub fn find_by_path(&self, path: &Utf8Path) -> Option<FormRecord> {
        self.lock()
            .records
            .values()
            .find(|record| record.storage_path.as_path() == path)
            .cloned()
    }

    pub fn versions_of(&self, form_id: &FormId) -> Vec<FormRecord> {
        self.lock()
            .records
            .values()
            .filter(|record| &record.form_id == form_id)
            .cloned()
            .collect()
    }

    /// Highest version held for `form_id`, counting deleted records too.
    pub fn latest_version(&self, form_id: &FormId) -> Option<FormVersion> {
        self.lock()
            .records
            .values()
            .filter(|record| &record.form_id == form_id)
            .map(|record| record.version.clone())
            .max()
    }

    pub fn records(&self) -> Vec<FormRecord> {
        self.lock().records.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of mutations applied since the index was opened.
    pub fn revision(&self) -> u64 {
        self.lock().revision
    }

    /// Returns live records matching `filter_text`, ordered by `sort`.
    ///
    /// With `hide_old_versions` the records are first grouped by form id and
    /// reduced to one representative each (highest version, then latest
    /// modification); filtering and sorting then apply to that reduced set.
    pub fn query(
        &self,
        filter_text: &str,
        sort: SortOrder,
        hide_old_versions: bool,
    ) -> Vec<FormRecord> {
        let live: Vec<FormRecord> = self
            .lock()
            .records
            .values()
            .filter(|record| !record.deleted)
            .cloned()
            .collect();

        let candidates = if hide_old_versions {
            newest_per_form(live)
        } else {
            live
        };

        let needle = filter_text.trim().to_lowercase();
        let mut selected: Vec<FormRecord> = candidates
            .into_iter()
            .filter(|record| {
                needle.is_empty() || record.display_name.to_lowercase().contains(&needle)
            })
            .collect();

        selected.sort_by(|left, right| {
            let primary = match sort {
                SortOrder::NameAsc => name_key(left).cmp(&name_key(right)),
                SortOrder::NameDesc => name_key(right).cmp(&name_key(left)),
                SortOrder::DateAsc => left.last_modified.cmp(&right.last_modified),
                SortOrder::DateDesc => right.last_modified.cmp(&left.last_modified),
            };
            primary
                .then_with(|| right.version.cmp(&left.version))
                .then_with(|| left.form_id.cmp(&right.form_id))
        });
        selected
    }

    fn lock(&self) -> MutexGuard<'_, IndexState> {
        // Records are replaced whole, so a poisoned map is still consistent.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn newest_per_form(records: Vec<FormRecord>) -> Vec<FormRecord> {
    let mut newest: HashMap<FormId, FormRecord> = HashMap::new();
    for record in records {
        match newest.get(&record.form_id) {
            Some(current)
                if (&current.version, current.last_modified)
                    >= (&record.version, record.last_modified) => {}
            _ => {
                newest.insert(record.form_id.clone(), record);
            }
        }
    }
    newest.into_values().collect()
}

fn name_key(record: &FormRecord) -> String {
    record.display_name.to_lowercase()
}
