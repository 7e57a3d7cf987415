// This file is part of apw. Copyright © 2025 apw contributors.
// apw is licensed under the GNU AGPL v3.0 or any later version. See LICENSE file for full text.

//! Background jobs: renewing stale cache entries and importing deal feeds

use crate::deals::{ChunkedOutcome, DealFeedService, ImportContinuation, import_chunked};
use crate::error::ApwResult;
use crate::product_service::{ProductService, RenewalItem};
use crate::store::Collection;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{error, info, warn};

/// How long a claimed item stays invisible to other workers
const ITEM_LEASE: Duration = Duration::from_secs(300);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ItemOutcome {
    Processed,
    /// This collection was already handled during this run
    AlreadyProcessed,
    /// Stale data remains; give the item back to the queue after this run
    Requeue,
}

/// Processes renewal items. Each collection is renewed at most once per instance, so one instance corresponds to
/// one queue run.
pub struct ProductDataUpdate<'a> {
    service: &'a ProductService,
    processed: HashSet<Collection, ahash::RandomState>,
}

impl<'a> ProductDataUpdate<'a> {
    pub fn new(service: &'a ProductService) -> Self {
        Self {
            service,
            processed: HashSet::default(),
        }
    }

    pub async fn process_item(&mut self, item: &RenewalItem) -> ApwResult<ItemOutcome> {
        if !self.processed.insert(item.collection) {
            return Ok(ItemOutcome::AlreadyProcessed);
        }

        let store = self.service.store(item.collection);
        let outdated = store.get_outdated_keys().await?;
        match item.collection {
            Collection::Products => match self.service.get_product_data(&outdated, true).await {
                Ok(_) => info!("renewed {} products", outdated.len()),
                Err(e) => error!("product renewal failed: {e}"),
            },
            Collection::SearchResults => {
                let mut renewed = 0usize;
                for key in &outdated {
                    match self.service.renew_search_result(key).await {
                        Ok(()) => renewed += 1,
                        Err(e) if e.is_request_limit() => {
                            error!("search result renewal stopped: {e}");
                            break;
                        }
                        Err(e) => error!("search result renewal failed for {key}: {e}"),
                    }
                }
                info!("renewed {renewed} of {} search results", outdated.len());
            }
        }

        if store.has_stale_data().await? {
            Ok(ItemOutcome::Requeue)
        } else {
            Ok(ItemOutcome::Processed)
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueRunSummary {
    pub processed: usize,
    pub skipped: usize,
    pub requeued: usize,
}

/// Work through the renewal queue until it is empty. Requeued items become available again once the run is over.
pub async fn run_product_queue(service: &ProductService) -> ApwResult<QueueRunSummary> {
    let queue = service.queue();
    let mut worker = ProductDataUpdate::new(service);
    let mut summary = QueueRunSummary::default();
    let mut requeue = Vec::new();

    while let Some(item) = queue.claim_item(ITEM_LEASE).await? {
        match worker.process_item(&item.data).await {
            Ok(ItemOutcome::Processed) => {
                summary.processed += 1;
                queue.delete_item(item.item_id).await?;
            }
            Ok(ItemOutcome::AlreadyProcessed) => {
                summary.skipped += 1;
                queue.delete_item(item.item_id).await?;
            }
            Ok(ItemOutcome::Requeue) => requeue.push(item.item_id),
            Err(e) => {
                error!("renewal of {} failed: {e}", item.data.collection);
                requeue.push(item.item_id);
            }
        }
    }

    summary.requeued = requeue.len();
    for item_id in requeue {
        queue.release_item(item_id).await?;
    }
    Ok(summary)
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DealRunSummary {
    pub finished: usize,
    pub paused: usize,
    pub failed: usize,
}

/// Give every queued deal import one time-boxed round. Unfinished imports are queued again with their progress.
pub async fn run_deal_import_queue(feed: &DealFeedService) -> ApwResult<DealRunSummary> {
    let queue = feed.queue();
    let importer = feed.importer();
    let limits = feed.limits();
    let mut summary = DealRunSummary::default();
    let mut continuations: Vec<ImportContinuation> = Vec::new();

    while let Some(item) = queue.claim_item(ITEM_LEASE).await? {
        let mut continuation = item.data;
        let outcome = import_chunked(&importer, &mut continuation, &limits).await;
        queue.delete_item(item.item_id).await?;
        let state = &continuation.state;
        match outcome {
            Ok(ChunkedOutcome::Finished) => {
                summary.finished += 1;
                info!(
                    "Import finished with {} errors. Maximum is {}",
                    state.errors, limits.max_errors
                );
            }
            Ok(ChunkedOutcome::Failed) => {
                summary.failed += 1;
                warn!(
                    "Import stopped due to too many invalid deals. Got {}, max is {}.",
                    state.errors, limits.max_errors
                );
            }
            Ok(ChunkedOutcome::Paused) => {
                summary.paused += 1;
                info!(
                    "Processed {} out of {} entries with {} errors.",
                    state.processed, continuation.total, state.errors
                );
                continuations.push(continuation);
            }
            Err(e) => {
                summary.failed += 1;
                error!("deal import of {} failed: {e}", continuation.path.display());
            }
        }
    }

    for continuation in &continuations {
        queue.create_item(continuation).await?;
    }
    Ok(summary)
}

/// One scheduled maintenance pass: queue renewals for stale collections, then drain both queues
pub async fn cron(service: &ProductService, feed: &DealFeedService) -> ApwResult<()> {
    for collection in Collection::ALL {
        service.queue_renewal(collection).await?;
    }
    let products = run_product_queue(service).await?;
    info!(
        "renewal queue: {} processed, {} skipped, {} requeued",
        products.processed, products.skipped, products.requeued
    );
    let deals = run_deal_import_queue(feed).await?;
    if deals != DealRunSummary::default() {
        info!(
            "deal imports: {} finished, {} paused, {} failed",
            deals.finished, deals.paused, deals.failed
        );
    }
    Ok(())
}
