//! Versioned reference-data sync.
//!
//! Each dataset keeps one opaque cursor. A sync step posts `{since}` to
//! `/sync/{dataset}/` and commits the returned page (records, deletions and
//! the next cursor) in a single transaction, looping while the server
//! reports more pages. A crash between pages therefore resumes from the last
//! committed page.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::api::SyncApi;
use crate::config::DEFAULT_MAX_PAGES_PER_DATASET;
use crate::db::{LocalStore, PageCommit};
use crate::error::{Result, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dataset {
    Products,
    Categories,
    Modifiers,
    Discounts,
    Taxes,
    ProductTypes,
    Staff,
    InventoryStocks,
    InventoryLocations,
    Settings,
}

impl Dataset {
    /// Full-cycle order: later datasets (tax and discount settings) are only
    /// meaningful once the catalog they refer to is current.
    pub const FULL_CYCLE: [Dataset; 10] = [
        Dataset::Products,
        Dataset::Categories,
        Dataset::Modifiers,
        Dataset::Discounts,
        Dataset::Taxes,
        Dataset::ProductTypes,
        Dataset::Staff,
        Dataset::InventoryStocks,
        Dataset::InventoryLocations,
        Dataset::Settings,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Dataset::Products => "products",
            Dataset::Categories => "categories",
            Dataset::Modifiers => "modifiers",
            Dataset::Discounts => "discounts",
            Dataset::Taxes => "taxes",
            Dataset::ProductTypes => "product_types",
            Dataset::Staff => "staff",
            Dataset::InventoryStocks => "inventory_stocks",
            Dataset::InventoryLocations => "inventory_locations",
            Dataset::Settings => "settings",
        }
    }

    pub fn endpoint(self) -> String {
        format!("/sync/{}/", self.key())
    }

    /// Datasets that feed `PricingSettings`.
    pub fn affects_pricing(self) -> bool {
        matches!(self, Dataset::Taxes | Dataset::Settings)
    }
}

/// One page of a dataset sync response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SyncPage {
    #[serde(default)]
    pub data: Vec<Value>,
    #[serde(default)]
    pub next_version: Option<String>,
    /// Ids arrive as strings or numbers.
    #[serde(default)]
    pub deleted_ids: Vec<Value>,
    #[serde(default)]
    pub has_more: bool,
}

impl SyncPage {
    pub fn deleted_id_strings(&self) -> Vec<String> {
        self.deleted_ids
            .iter()
            .filter_map(|id| match id {
                Value::String(s) if !s.is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct DatasetSyncReport {
    pub dataset: Option<Dataset>,
    pub pages: u32,
    pub upserted: usize,
    pub deleted: usize,
    pub version: Option<String>,
}

pub struct DatasetSyncManager {
    api: Arc<dyn SyncApi>,
    store: Arc<LocalStore>,
    max_pages: u32,
}

impl DatasetSyncManager {
    pub fn new(api: Arc<dyn SyncApi>, store: Arc<LocalStore>) -> Self {
        Self {
            api,
            store,
            max_pages: DEFAULT_MAX_PAGES_PER_DATASET,
        }
    }

    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    /// Pull every page of one dataset from its stored cursor.
    pub async fn sync_dataset(&self, dataset: Dataset) -> Result<DatasetSyncReport> {
        let key = dataset.key();
        let mut cursor = self.store.dataset_version(key)?;
        let mut report = DatasetSyncReport {
            dataset: Some(dataset),
            version: cursor.clone(),
            ..Default::default()
        };

        loop {
            let body = json!({ "since": cursor });
            let response = self.api.post_json(&dataset.endpoint(), &body).await?;
            let page: SyncPage =
                serde_json::from_value(response).map_err(|e| SyncError::MalformedResponse {
                    dataset: key.to_string(),
                    reason: e.to_string(),
                })?;

            // Later pages of the same response must not replay deletions.
            let deleted_ids = if report.pages == 0 {
                page.deleted_id_strings()
            } else {
                Vec::new()
            };
            let stats = self.store.commit_dataset_page(
                key,
                &PageCommit {
                    records: &page.data,
                    deleted_ids: &deleted_ids,
                    next_version: page.next_version.as_deref(),
                },
            )?;

            report.pages += 1;
            report.upserted += stats.upserted;
            report.deleted += stats.deleted;
            if stats.skipped > 0 {
                warn!(dataset = key, skipped = stats.skipped, "records without id ignored");
            }

            if !page.has_more {
                if page.next_version.is_some() {
                    report.version = page.next_version;
                }
                break;
            }
            if page.next_version.is_none() || page.next_version == cursor {
                warn!(dataset = key, "server reported more pages without advancing the cursor");
                break;
            }
            cursor = page.next_version;
            report.version = cursor.clone();
            if report.pages >= self.max_pages {
                info!(
                    dataset = key,
                    pages = report.pages,
                    "page limit reached, continuing next cycle"
                );
                break;
            }
        }

        debug!(
            dataset = key,
            pages = report.pages,
            upserted = report.upserted,
            deleted = report.deleted,
            "dataset synced"
        );
        Ok(report)
    }

    /// Run the full cycle in dependency order. The first failure aborts the
    /// remaining datasets so nothing downstream syncs against a stale
    /// catalog.
    pub async fn sync_all(&self) -> Result<Vec<DatasetSyncReport>> {
        let mut reports = Vec::with_capacity(Dataset::FULL_CYCLE.len());
        for dataset in Dataset::FULL_CYCLE {
            match self.sync_dataset(dataset).await {
                Ok(report) => reports.push(report),
                Err(e) => {
                    warn!(dataset = dataset.key(), "dataset sync failed, aborting cycle: {e}");
                    return Err(e);
                }
            }
        }
        let changed: usize = reports.iter().map(|r| r.upserted + r.deleted).sum();
        info!(datasets = reports.len(), changed, "dataset sync cycle complete");
        Ok(reports)
    }
}
