// This file is part of apw. Copyright © 2025 apw contributors.
// apw is licensed under the GNU AGPL v3.0 or any later version. See LICENSE file for full text.

use crate::db::ApwDb;
use crate::deals::import::{self, DealImporter, ImportContinuation, ImportLimits};
use crate::deals::store::DealStore;
use crate::error::{ApwError, ApwResult};
use crate::http::deal_feed;
use crate::queue::WorkQueue;
use crate::settings::DealSettings;
use crate::time;
use std::path::{Path, PathBuf};
use tracing::info;

pub const DEAL_IMPORT_QUEUE: &str = "deal_import";

/// Entry point for everything deal related: lookups, feed download, and scheduling imports.
///
/// Cloning is by-reference.
#[derive(Clone)]
pub struct DealFeedService {
    store: DealStore,
    settings: DealSettings,
    queue: WorkQueue<ImportContinuation>,
}

impl DealFeedService {
    pub fn new(db: ApwDb, settings: &DealSettings) -> Self {
        Self {
            store: DealStore::new(db.clone()),
            settings: settings.clone(),
            queue: WorkQueue::new(db, DEAL_IMPORT_QUEUE),
        }
    }

    pub fn store(&self) -> &DealStore {
        &self.store
    }

    pub fn queue(&self) -> &WorkQueue<ImportContinuation> {
        &self.queue
    }

    pub fn importer(&self) -> DealImporter {
        DealImporter::new(self.store.clone())
    }

    pub fn limits(&self) -> ImportLimits {
        ImportLimits::from(&self.settings)
    }

    /// Price of the deal currently running for `asin`
    pub async fn get(&self, asin: &str) -> ApwResult<Option<f64>> {
        self.store.get_active_deal(asin).await
    }

    /// Download the feed, then schedule its import. With `path` set, that file is imported instead of downloading.
    pub async fn update(&self, path: Option<PathBuf>) -> ApwResult<ImportContinuation> {
        if !self.settings.active {
            return Err(ApwError::DealApiDisabled);
        }
        let path = match path {
            Some(path) => path,
            None => {
                let destination = default_download_path();
                deal_feed::download_deals_csv(&self.settings, &destination).await?;
                destination
            }
        };
        self.start_batch_import(&path).await
    }

    /// Queue an import of the CSV at `path`
    pub async fn start_batch_import(&self, path: &Path) -> ApwResult<ImportContinuation> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(ApwError::new(format!("File at path '{}' does not exist.", path.display())));
        }
        let owned_path = path.to_path_buf();
        let total = tokio::task::spawn_blocking(move || import::count_rows(&owned_path)).await??;
        let continuation = ImportContinuation::new(path.to_path_buf(), total);
        if self.queue.create_item(&continuation).await? {
            info!("queued import of {total} deals from {}", path.display());
        } else {
            info!("import of {} is already queued", path.display());
        }
        Ok(continuation)
    }
}

fn default_download_path() -> PathBuf {
    std::env::temp_dir().join(format!("apw-deals-{}.csv", time::unix_now_millis()))
}
