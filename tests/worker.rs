// This file is part of apw. Copyright © 2025 apw contributors.
// apw is licensed under the GNU AGPL v3.0 or any later version. See LICENSE file for full text.

//! Queue runs for renewals and deal imports

mod common;

use apw::deals::DealFeedService;
use apw::product::{ProductRecord, SEARCH_CATEGORY_ALL};
use apw::product_service::RenewalItem;
use apw::settings::{DealSettings, Settings};
use apw::store::Collection;
use apw::worker::{self, DealRunSummary, ItemOutcome, ProductDataUpdate, QueueRunSummary};
use common::{MockApi, asin, deal_feed, product, running_deal_row, service, service_with, test_settings};
use std::sync::Arc;
use std::time::Duration;
use tracing_test::traced_test;

#[tokio::test]
#[traced_test]
async fn test_renewal_run_fills_seeded_products() {
    let api = Arc::new(MockApi::new().with_products((0..3).map(|i| product(&asin(i)))));
    let (service, _) = service(api.clone()).await;
    let asins: Vec<String> = (0..3).map(asin).collect();
    assert!(service.queue_product_renewal(&asins).await.expect("queue"));

    let summary = worker::run_product_queue(&service).await.expect("run");
    assert_eq!(
        summary,
        QueueRunSummary {
            processed: 1,
            skipped: 0,
            requeued: 0
        }
    );
    assert_eq!(api.batch_sizes(), [3]);
    assert_eq!(service.queue().number_of_items().await.expect("count"), 0);
    assert!(!service.product_store().has_stale_data().await.expect("stale"));

    let cached = service
        .product_store()
        .get::<Option<ProductRecord>>(&asin(1))
        .await
        .expect("read");
    assert_eq!(cached, Some(Some(product(&asin(1)))));
}

#[tokio::test]
async fn test_collection_is_processed_once_per_run() {
    let api = Arc::new(MockApi::new());
    let (service, _) = service(api.clone()).await;
    service.queue_product_renewal(&[asin(0)]).await.expect("queue");

    let mut update = ProductDataUpdate::new(&service);
    let item = RenewalItem {
        collection: Collection::Products,
    };
    assert_eq!(update.process_item(&item).await.expect("process"), ItemOutcome::Processed);
    assert_eq!(
        update.process_item(&item).await.expect("process"),
        ItemOutcome::AlreadyProcessed
    );
    assert_eq!(api.item_calls(), 1);
}

#[tokio::test]
#[traced_test]
async fn test_renewal_limit_requeues() {
    let api = Arc::new(MockApi::new().with_products((0..3).map(|i| product(&asin(i)))));
    let mut settings = test_settings();
    settings.products.renewal_limit = 2;
    let (service, _) = service_with(api.clone(), &settings).await;
    let asins: Vec<String> = (0..3).map(asin).collect();
    service.queue_product_renewal(&asins).await.expect("queue");

    let summary = worker::run_product_queue(&service).await.expect("first run");
    assert_eq!(summary.requeued, 1);
    assert_eq!(service.queue().number_of_items().await.expect("count"), 1);
    assert_eq!(service.product_store().get_outdated_keys_count().await.expect("count"), 1);

    let summary = worker::run_product_queue(&service).await.expect("second run");
    assert_eq!(summary.processed, 1);
    assert_eq!(service.queue().number_of_items().await.expect("count"), 0);
    assert_eq!(api.batch_sizes(), [2, 1]);
}

#[tokio::test]
#[traced_test]
async fn test_search_renewal_uses_stored_terms() {
    let api = Arc::new(MockApi::new().with_search("kettle", &["B000000003", "B000000004"]));
    let (service, _) = service(api.clone()).await;
    assert!(
        service
            .queue_search_results("kettle", SEARCH_CATEGORY_ALL)
            .await
            .expect("queue")
    );

    let summary = worker::run_product_queue(&service).await.expect("run");
    assert_eq!(summary.processed, 1);
    assert_eq!(api.search_calls(), 1);

    let result = service
        .get_search_results("kettle", SEARCH_CATEGORY_ALL, false)
        .await
        .expect("search");
    assert_eq!(result, ["B000000003", "B000000004"]);
    assert_eq!(api.search_calls(), 1);
}

#[tokio::test]
#[traced_test]
async fn test_cron_queues_and_drains() {
    let api = Arc::new(MockApi::new().with_product(product(&asin(0))));
    let (service, db) = service(api.clone()).await;
    service
        .product_store()
        .set(&asin(0), &None::<ProductRecord>, Some(0))
        .await
        .expect("seed stale entry");
    let feed = DealFeedService::new(db, &Settings::default().deals);

    worker::cron(&service, &feed).await.expect("cron");
    assert_eq!(api.item_calls(), 1);
    assert!(!service.product_store().has_stale_data().await.expect("stale"));
    assert_eq!(service.queue().number_of_items().await.expect("count"), 0);
}

#[tokio::test]
#[traced_test]
async fn test_deal_import_resumes_across_runs() {
    let api = Arc::new(MockApi::new());
    let (_, db) = service(api).await;
    let settings = DealSettings {
        active: true,
        max_processing_time: Duration::ZERO,
        imports_per_round: 10,
        ..Settings::default().deals
    };
    let feed = DealFeedService::new(db, &settings);
    let rows: Vec<String> = (0..25).map(|i| running_deal_row(&asin(i))).collect();
    let file = deal_feed(&rows);
    feed.start_batch_import(file.path()).await.expect("queue import");

    let paused = DealRunSummary {
        finished: 0,
        paused: 1,
        failed: 0,
    };
    assert_eq!(worker::run_deal_import_queue(&feed).await.expect("run"), paused);
    assert_eq!(feed.store().count().await.expect("count"), 10);
    assert_eq!(worker::run_deal_import_queue(&feed).await.expect("run"), paused);
    assert_eq!(feed.store().count().await.expect("count"), 20);

    let summary = worker::run_deal_import_queue(&feed).await.expect("run");
    assert_eq!(summary.finished, 1);
    assert_eq!(feed.store().count().await.expect("count"), 25);
    assert_eq!(feed.store().active_count().await.expect("count"), 25);
    assert_eq!(feed.queue().number_of_items().await.expect("count"), 0);
}
