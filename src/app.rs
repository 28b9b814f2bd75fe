use std::sync::Arc;

use camino::Utf8PathBuf;
use serde::Serialize;

use crate::config::ResolvedConfig;
use crate::coordinator::{TaskCoordinator, TaskHandle, TaskStatus};
use crate::domain::{SortOrder, TaskKind};
use crate::error::CatalogError;
use crate::index::{FormIndex, FormRecord};
use crate::reconcile::DiskReconciler;
use crate::remote::CatalogClient;
use crate::store::FormStore;
use crate::sync::CatalogSynchronizer;

#[derive(Debug, Clone, Serialize)]
pub struct ListResult {
    pub filter: String,
    pub sort: SortOrder,
    pub hide_old_versions: bool,
    pub forms: Vec<FormRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResult {
    pub storage_root: Utf8PathBuf,
    pub indexed: usize,
    pub live: usize,
    pub missing: usize,
    pub tasks: Vec<TaskStatusEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusEntry {
    pub kind: TaskKind,
    pub id: u64,
    pub status: TaskStatus,
}

/// One storage root with its index, reconcilers and task coordinator.
pub struct Catalog<C: CatalogClient + 'static> {
    store: FormStore,
    index: Arc<FormIndex>,
    coordinator: TaskCoordinator<C>,
    hide_old_versions: bool,
}

impl<C: CatalogClient + 'static> Catalog<C> {
    pub fn open(
        config: &ResolvedConfig,
        storage_root: Utf8PathBuf,
        client: C,
    ) -> Result<Self, CatalogError> {
        let store = FormStore::new(storage_root);
        store.ensure_root()?;
        let index = Arc::new(FormIndex::open(&store.index_path())?);
        tracing::debug!(root = %store.root(), records = index.len(), "catalog opened");

        let disk = Arc::new(DiskReconciler::new(store.clone(), Arc::clone(&index)));
        let sync = Arc::new(
            CatalogSynchronizer::new(client, store.clone(), Arc::clone(&index))
                .with_workers(config.download_workers),
        );
        let coordinator = TaskCoordinator::new(disk, sync, config.server.clone());

        Ok(Self {
            store,
            index,
            coordinator,
            hide_old_versions: config.hide_old_versions,
        })
    }

    pub fn store(&self) -> &FormStore {
        &self.store
    }

    pub fn index(&self) -> &Arc<FormIndex> {
        &self.index
    }

    pub fn coordinator(&self) -> &TaskCoordinator<C> {
        &self.coordinator
    }

    pub fn start(&self, kind: TaskKind) -> Result<TaskHandle, CatalogError> {
        self.coordinator.start(kind)
    }

    /// Queries the index; `hide_old_versions` falls back to the configured
    /// preference.
    pub fn list(
        &self,
        filter: &str,
        sort: SortOrder,
        hide_old_versions: Option<bool>,
    ) -> ListResult {
        let hide_old_versions = hide_old_versions.unwrap_or(self.hide_old_versions);
        ListResult {
            filter: filter.to_string(),
            sort,
            hide_old_versions,
            forms: self.index.query(filter, sort, hide_old_versions),
        }
    }

    pub fn status(&self) -> StatusResult {
        let records = self.index.records();
        let missing = records.iter().filter(|record| record.deleted).count();
        let tasks = [TaskKind::DiskScan, TaskKind::CatalogSync]
            .into_iter()
            .filter_map(|kind| self.coordinator.handle(kind))
            .map(|handle| TaskStatusEntry {
                kind: handle.kind(),
                id: handle.id(),
                status: handle.status(),
            })
            .collect();
        StatusResult {
            storage_root: self.store.root().to_path_buf(),
            indexed: records.len(),
            live: records.len() - missing,
            missing,
            tasks,
        }
    }
}
