// This file is part of apw. Copyright © 2025 apw contributors.
// apw is licensed under the GNU AGPL v3.0 or any later version. See LICENSE file for full text.

//! Upstream fetch coordination: one fetcher at a time across processes, a daily request quota, a per-second throttle,
//! batches of ten, and negative caching for anything upstream can't deliver.

mod counter;

use crate::db::ApwDb;
use crate::error::{ApwError, ApwResult};
use crate::http::paapi::ProductApi;
use crate::lock::LockBackend;
use crate::product::{ProductMap, SearchResultRecord, is_valid_asin, search_key};
use crate::settings::Settings;
use crate::store::KeyValueStore;
pub use counter::RequestCounter;
use std::slice;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

pub const FETCH_LOCK_NAME: &str = "apw_upstream_fetch";
/// Upstream accepts at most this many ASINs per lookup
pub const BATCH_SIZE: usize = 10;
pub const SEARCH_ITEM_COUNT: u32 = 10;
const MAX_LOCK_TIMEOUT: Duration = Duration::from_secs(30);
const NO_API_MESSAGE: &str = "No product API endpoint configured; set api.endpoint.";
const LOCK_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

/// Cloning is by-reference.
#[derive(Clone)]
pub struct FetchCoordinator {
    /// `None` when no upstream endpoint is configured
    api: Option<Arc<dyn ProductApi>>,
    db: ApwDb,
    counter: RequestCounter,
    max_requests_per_day: u64,
    max_requests_per_second: u64,
    api_disabled: bool,
}

impl FetchCoordinator {
    pub fn new(db: ApwDb, api: Option<Arc<dyn ProductApi>>, settings: &Settings) -> Self {
        Self {
            api,
            counter: RequestCounter::new(db.clone()),
            db,
            max_requests_per_day: settings.max_requests_per_day,
            max_requests_per_second: settings.max_requests_per_second.max(1),
            api_disabled: settings.amazon_api_disabled,
        }
    }

    pub fn counter(&self) -> &RequestCounter {
        &self.counter
    }

    /// Pause before every upstream call: `1 / max_requests_per_second`, never more than a second
    pub fn throttle_delay(&self) -> Duration {
        Duration::from_secs_f64((1.0 / self.max_requests_per_second as f64).min(1.0))
    }

    /// Long enough to fetch `asin_count` ASINs in batches with throttling, plus a margin, capped at 30s
    pub fn lock_timeout(&self, asin_count: usize) -> Duration {
        let batches = asin_count as f64 / BATCH_SIZE as f64;
        let expected = self.throttle_delay().mul_f64(batches);
        (expected + LOCK_TIMEOUT_MARGIN).min(MAX_LOCK_TIMEOUT)
    }

    /// Fetch product data for `asins` from upstream and cache every result, negative ones included, batch by batch.
    ///
    /// Fails with [`ApwError::RequestLimitReached`] if the quota runs out or another process holds the fetch lock;
    /// batches cached before that point stay cached. Any other upstream failure is retried one ASIN at a time, and
    /// ASINs that still fail are cached as unavailable.
    pub async fn fetch_products(&self, store: &KeyValueStore, asins: &[String]) -> ApwResult<ProductMap> {
        self.api()?;
        if asins.is_empty() {
            return Ok(ProductMap::default());
        }
        let lock = self.acquire_lock(self.lock_timeout(asins.len())).await?;
        let result = self.fetch_products_locked(store, asins).await;
        release_lock(&lock).await;
        result
    }

    async fn fetch_products_locked(&self, store: &KeyValueStore, asins: &[String]) -> ApwResult<ProductMap> {
        let mut product_data = ProductMap::default();
        for batch in asins.chunks(BATCH_SIZE) {
            let (batch_data, abort) = match self.fetch_item_data(batch).await {
                Ok(batch_data) => (batch_data, None),
                Err(e) if e.is_request_limit() => return Err(e),
                Err(e) => {
                    warn!("fetching {} ASINs failed, retrying one at a time: {e}", batch.len());
                    self.fetch_individually(batch).await
                }
            };
            if let Err(e) = store.set_multiple(batch_data.iter(), None).await {
                error!("failed to cache {} fetched products: {e}", batch_data.len());
            }
            product_data.extend(batch_data);
            if let Some(e) = abort {
                return Err(e);
            }
        }
        Ok(product_data)
    }

    /// Per-ASIN retry. Stops early on a quota or lock error, handing it back with whatever was fetched so far.
    async fn fetch_individually(&self, batch: &[String]) -> (ProductMap, Option<ApwError>) {
        let mut batch_data = ProductMap::default();
        for asin in batch {
            match self.fetch_item_data(slice::from_ref(asin)).await {
                Ok(item_data) => batch_data.extend(item_data),
                Err(e) if e.is_request_limit() => return (batch_data, Some(e)),
                Err(e) => {
                    warn!("fetching ASIN {asin} failed: {e}");
                    batch_data.insert(asin.clone(), None);
                }
            }
        }
        (batch_data, None)
    }

    /// One upstream lookup. Every requested ASIN is in the result; invalid ASINs and ASINs upstream didn't return are
    /// `None`.
    async fn fetch_item_data(&self, asins: &[String]) -> ApwResult<ProductMap> {
        self.check_daily_quota().await?;

        let mut item_data: ProductMap = asins.iter().map(|asin| (asin.clone(), None)).collect();
        let valid_asins: Vec<String> = asins.iter().filter(|asin| is_valid_asin(asin)).cloned().collect();
        if valid_asins.is_empty() {
            return Ok(item_data);
        }

        // in case other requests preceded this one, wait at the start
        tokio::time::sleep(self.throttle_delay()).await;
        self.counter.increase(1).await?;

        let records = self.api()?.get_items(&valid_asins).await?;
        debug!("upstream returned {} of {} ASINs", records.len(), valid_asins.len());
        for record in records {
            if let Some(slot) = item_data.get_mut(&record.asin) {
                *slot = Some(record);
            }
        }
        Ok(item_data)
    }

    /// Run an upstream search and cache its result under the search key, even when empty. Upstream failures other
    /// than throttling yield (and cache) an empty result.
    pub async fn fetch_search_results(
        &self,
        store: &KeyValueStore,
        search_terms: &str,
        category: &str,
    ) -> ApwResult<Vec<String>> {
        self.api()?;
        self.check_daily_quota().await?;
        let lock = self.acquire_lock(MAX_LOCK_TIMEOUT).await?;
        let result = self.search_locked(search_terms, category).await;
        release_lock(&lock).await;

        let asins = match result {
            Ok(asins) => asins,
            Err(e) if e.is_request_limit() => return Err(e),
            Err(e) => {
                warn!("search for \"{search_terms}\" in {category} failed: {e}");
                Vec::new()
            }
        };

        let record = SearchResultRecord {
            search_terms: search_terms.to_string(),
            category: category.to_string(),
            result: asins.clone(),
        };
        if let Err(e) = store.set(&search_key(search_terms, category), &record, None).await {
            error!("failed to cache search result for \"{search_terms}\": {e}");
        }
        Ok(asins)
    }

    async fn search_locked(&self, search_terms: &str, category: &str) -> ApwResult<Vec<String>> {
        tokio::time::sleep(self.throttle_delay()).await;
        self.counter.increase(1).await?;
        Ok(self.api()?.search_items(search_terms, category, SEARCH_ITEM_COUNT).await?)
    }

    /// The upstream API, unless switched off or not configured. Checked before any network attempt.
    fn api(&self) -> ApwResult<&dyn ProductApi> {
        if self.api_disabled {
            return Err(ApwError::ApiDisabled);
        }
        self.api
            .as_deref()
            .ok_or_else(|| ApwError::ServiceUnavailable(NO_API_MESSAGE.to_string()))
    }


    async fn check_daily_quota(&self) -> ApwResult<()> {
        if self.counter.todays_count().await? >= self.max_requests_per_day {
            Err(ApwError::daily_limit())
        } else {
            Ok(())
        }
    }

    /// Take the fetch lock, waiting once for another holder to finish. Every fetch cycle is its own lock owner, so
    /// clones of this coordinator exclude each other just like separate processes do.
    async fn acquire_lock(&self, timeout: Duration) -> ApwResult<LockBackend> {
        let lock = LockBackend::new(self.db.clone());
        if lock.acquire(FETCH_LOCK_NAME, timeout).await? {
            return Ok(lock);
        }
        debug!("fetch lock busy, waiting up to {}s", timeout.as_secs());
        lock.wait(FETCH_LOCK_NAME, timeout).await?;
        if lock.acquire(FETCH_LOCK_NAME, timeout).await? {
            Ok(lock)
        } else {
            Err(ApwError::lock_blocked())
        }
    }
}

async fn release_lock(lock: &LockBackend) {
    if let Err(e) = lock.release(FETCH_LOCK_NAME).await {
        error!("failed to release fetch lock: {e}");
    }
}
