// This file is part of apw. Copyright © 2025 apw contributors.
// apw is licensed under the GNU AGPL v3.0 or any later version. See LICENSE file for full text.

//! Product cache behavior against a scripted upstream

mod common;

use apw::deals::{DealStatus, DealStore, FeedDeal};
use apw::error::ApwError;
use apw::fetch::FETCH_LOCK_NAME;
use apw::lock::LockBackend;
use apw::product::{ProductField, ProductOverrides, ProductRecord, SEARCH_CATEGORY_ALL};
use apw::time;
use common::{MockApi, asin, product, service, service_with, test_settings, unavailable_product};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing_test::traced_test;

fn strings(asins: &[&str]) -> Vec<String> {
    asins.iter().map(|asin| asin.to_string()).collect()
}

fn widget_asins(container: &apw::product_service::ProductsContainer) -> Vec<&str> {
    container.products.iter().map(|product| product.asin.as_str()).collect()
}

#[tokio::test]
#[traced_test]
async fn test_every_requested_asin_is_a_key() {
    let api = Arc::new(MockApi::new().with_product(product("B000000001")));
    let (service, _) = service(api).await;
    let requested = strings(&["B000000001", "B000000002", "B000000001", "", "  ", "not-an-asin"]);
    let product_data = service.get_product_data(&requested, false).await.expect("fetch");

    let keys: HashSet<&str> = product_data.keys().map(String::as_str).collect();
    assert_eq!(keys, HashSet::from(["B000000001", "B000000002", "not-an-asin"]));
    assert!(product_data["B000000001"].is_some());
    assert!(product_data["B000000002"].is_none());
    assert!(product_data["not-an-asin"].is_none());
}

#[tokio::test]
#[traced_test]
async fn test_second_read_is_served_from_cache() {
    let api = Arc::new(MockApi::new().with_product(product("B000000001")));
    let (service, _) = service(api.clone()).await;
    let requested = strings(&["B000000001", "B000000002"]);

    let first = service.get_product_data(&requested, false).await.expect("fetch");
    assert_eq!(api.item_calls(), 1);
    let second = service.get_product_data(&requested, false).await.expect("fetch");
    assert_eq!(api.item_calls(), 1, "cached and negatively cached ASINs must not be fetched again");
    assert_eq!(first, second);

    service.get_product_data(&requested, true).await.expect("fetch");
    assert_eq!(api.item_calls(), 2);
}

#[tokio::test]
async fn test_batches_of_ten() {
    let api = Arc::new(MockApi::new().with_products((0..25).map(|i| product(&asin(i)))));
    let (service, _) = service(api.clone()).await;
    let requested: Vec<String> = (0..25).map(asin).collect();

    let product_data = service.get_product_data(&requested, false).await.expect("fetch");
    assert_eq!(product_data.len(), 25);
    assert_eq!(api.batch_sizes(), [10, 10, 5]);
    assert_eq!(service.fetcher().counter().todays_count().await.expect("count"), 3);
}

#[tokio::test]
#[traced_test]
async fn test_failed_batch_is_retried_per_item() {
    let poisoned = asin(3);
    let api = Arc::new(
        MockApi::new()
            .with_products((0..10).map(|i| product(&asin(i))))
            .with_poisoned(&poisoned),
    );
    let (service, _) = service(api.clone()).await;
    let requested: Vec<String> = (0..10).map(asin).collect();

    let product_data = service.get_product_data(&requested, false).await.expect("fetch");
    assert_eq!(api.batch_sizes(), [10, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1]);
    assert_eq!(product_data.len(), 10);
    for (key, value) in &product_data {
        assert_eq!(value.is_none(), *key == poisoned, "unexpected result for {key}");
    }

    // the poisoned ASIN is negatively cached
    service.get_product_data(&[poisoned], false).await.expect("fetch");
    assert_eq!(api.item_calls(), 11);
}

#[tokio::test]
#[traced_test]
async fn test_daily_quota() {
    let api = Arc::new(MockApi::new().with_products([product("B000000001"), product("B000000002")]));
    let mut settings = test_settings();
    settings.max_requests_per_day = 1;
    let (service, _) = service_with(api.clone(), &settings).await;

    service
        .get_product_data(&strings(&["B000000001"]), false)
        .await
        .expect("first fetch is within quota");
    let result = service.get_product_data(&strings(&["B000000002"]), false).await;
    assert!(matches!(result, Err(ApwError::RequestLimitReached(_))));
    assert_eq!(api.item_calls(), 1);
}

#[tokio::test]
#[traced_test]
async fn test_upstream_throttling_is_not_negatively_cached() {
    let api = Arc::new(MockApi::new().with_product(product("B000000001")));
    api.set_throttled(true);
    let (service, _) = service(api.clone()).await;

    let result = service.get_product_data(&strings(&["B000000001"]), false).await;
    assert!(result.is_err_and(|e| e.is_request_limit()));
    assert_eq!(api.item_calls(), 1, "throttling must not trigger per-item retries");
    assert_eq!(service.product_store().count().await.expect("count"), 0);

    api.set_throttled(false);
    let product_data = service
        .get_product_data(&strings(&["B000000001"]), false)
        .await
        .expect("fetch");
    assert!(product_data["B000000001"].is_some());
}

#[tokio::test]
#[traced_test]
async fn test_held_lock_blocks_fetch() {
    let api = Arc::new(MockApi::new().with_product(product("B000000001")));
    let (service, db) = service(api.clone()).await;
    let other_process = LockBackend::new(db);
    assert!(
        other_process
            .acquire(FETCH_LOCK_NAME, Duration::from_secs(60))
            .await
            .expect("acquire")
    );

    let result = service.get_product_data(&strings(&["B000000001"]), false).await;
    assert!(result.is_err_and(|e| e.is_request_limit()));
    assert_eq!(api.item_calls(), 0);

    other_process.release(FETCH_LOCK_NAME).await.expect("release");
    service
        .get_product_data(&strings(&["B000000001"]), false)
        .await
        .expect("fetch after release");
}

#[tokio::test]
#[traced_test]
async fn test_cloned_services_fetch_one_at_a_time() {
    let api = Arc::new(
        MockApi::new()
            .with_products([product("B000000001"), product("B000000002")])
            .with_delay(Duration::from_millis(300)),
    );
    let (service, _) = service(api.clone()).await;

    let first = tokio::spawn({
        let service = service.clone();
        async move { service.get_product_data(&strings(&["B000000001"]), false).await }
    });
    let second = tokio::spawn({
        let service = service.clone();
        async move { service.get_product_data(&strings(&["B000000002"]), false).await }
    });
    let first = first.await.expect("first task").expect("first fetch");
    let second = second.await.expect("second task").expect("second fetch");

    assert!(first["B000000001"].is_some());
    assert!(second["B000000002"].is_some());
    assert_eq!(api.item_calls(), 2);
    assert_eq!(api.max_in_flight(), 1);
}

#[tokio::test]
#[traced_test]
async fn test_quota_runs_out_mid_fetch() {
    let api = Arc::new(MockApi::new().with_products((0..25).map(|i| product(&asin(i)))));
    let mut settings = test_settings();
    settings.max_requests_per_day = 2;
    let (service, db) = service_with(api.clone(), &settings).await;
    let requested: Vec<String> = (0..25).map(asin).collect();

    let result = service.get_product_data(&requested, false).await;
    assert!(matches!(result, Err(ApwError::RequestLimitReached(_))));
    assert_eq!(api.batch_sizes(), [10, 10]);
    // batches fetched before the quota ran out stay cached
    assert_eq!(service.product_store().count().await.expect("count"), 20);

    // and the fetch lock was released
    let other_process = LockBackend::new(db);
    assert!(
        other_process
            .acquire(FETCH_LOCK_NAME, Duration::from_secs(60))
            .await
            .expect("acquire")
    );
}

#[tokio::test]
async fn test_overrides_survive_renewal() {
    let api = Arc::new(MockApi::new().with_product(product("B000000001")));
    let (service, _) = service(api).await;
    let overrides = ProductOverrides {
        title: Some("Better title".to_string()),
        ..ProductOverrides::default()
    };
    service.get_product_data(&strings(&["B000000001"]), false).await.expect("fetch");
    service
        .set_overrides([("B000000001", &overrides)])
        .await
        .expect("set overrides");

    let product_data = service.get_product_data(&strings(&["B000000001"]), true).await.expect("renew");
    let record = product_data["B000000001"].as_ref().expect("record");
    assert_eq!(record.overrides.as_ref(), Some(&overrides));
    assert_eq!(record.title.as_deref(), Some("Product B000000001"));
    assert_eq!(
        record.with_overrides_applied().title.as_deref(),
        Some("Better title")
    );
}

#[tokio::test]
async fn test_search_results_cache() {
    let api = Arc::new(MockApi::new().with_search("kettle", &["B000000003", "B000000004"]));
    let (service, _) = service(api.clone()).await;

    assert!(service.get_search_results("  ", SEARCH_CATEGORY_ALL, false).await.expect("search").is_empty());
    assert_eq!(api.search_calls(), 0);

    let result = service.get_search_results("kettle", SEARCH_CATEGORY_ALL, false).await.expect("search");
    assert_eq!(result, ["B000000003", "B000000004"]);
    service.get_search_results("kettle", SEARCH_CATEGORY_ALL, false).await.expect("search");
    assert_eq!(api.search_calls(), 1);
    service.get_search_results("kettle", SEARCH_CATEGORY_ALL, true).await.expect("search");
    assert_eq!(api.search_calls(), 2);

    // empty results are cached, but don't count as a hit
    assert!(service.get_search_results("nothing", SEARCH_CATEGORY_ALL, false).await.expect("search").is_empty());
    assert_eq!(service.search_result_store().count().await.expect("count"), 2);
    service.get_search_results("nothing", SEARCH_CATEGORY_ALL, false).await.expect("search");
    assert_eq!(api.search_calls(), 4);
}

#[tokio::test]
async fn test_queue_product_renewal() {
    let api = Arc::new(MockApi::new());
    let (service, _) = service(api.clone()).await;

    assert!(!service.queue_product_renewal(&[]).await.expect("queue"));
    assert!(service.queue_product_renewal(&strings(&["B000000001", "B000000002"])).await.expect("queue"));
    assert!(
        !service.queue_product_renewal(&strings(&["B000000003"])).await.expect("queue"),
        "one queued renewal per collection"
    );
    let store = service.product_store();
    assert_eq!(store.count().await.expect("count"), 3);
    assert_eq!(store.get_outdated_keys_count().await.expect("count"), 3);
    assert_eq!(service.queue().number_of_items().await.expect("count"), 1);
    assert_eq!(api.item_calls(), 0);

    // seeding never clobbers real data
    let cached = store.get::<Option<ProductRecord>>("B000000001").await.expect("read");
    assert_eq!(cached, Some(None));
}

#[tokio::test]
#[traced_test]
async fn test_fallback_replaces_unavailable_products() {
    let api = Arc::new(
        MockApi::new()
            .with_products([
                product("B00000000A"),
                unavailable_product("B00000000B"),
                product("B00000000C"),
                product("B00000000D"),
            ])
            .with_search("kettle", &["B00000000C", "B00000000D"]),
    );
    let (service, _) = service(api).await;
    let field = ProductField::new(Some("Kettles".to_string()), "B00000000A,B00000000B", Some("kettle".to_string()));

    let container = service.get_products_with_fallback(&field).await;
    assert_eq!(container.title, "Kettles");
    assert_eq!(widget_asins(&container), ["B00000000A", "B00000000C"]);
}

#[tokio::test]
#[traced_test]
async fn test_fallback_fills_up() {
    let api = Arc::new(
        MockApi::new()
            .with_products([product("B00000000A"), product("B00000000C"), product("B00000000D")])
            .with_search("kettle", &["B00000000A", "B00000000C", "B00000000D"]),
    );
    let mut settings = test_settings();
    settings.fill_up_with_fallback = true;
    let (service, _) = service_with(api, &settings).await;
    let field = ProductField::new(None, "B00000000A", Some("kettle".to_string()));

    let container = service.get_products_with_fallback(&field).await;
    assert_eq!(widget_asins(&container), ["B00000000A", "B00000000C", "B00000000D"]);
}

#[tokio::test]
async fn test_no_fill_up_by_default() {
    let api = Arc::new(
        MockApi::new()
            .with_products([product("B00000000A"), product("B00000000C")])
            .with_search("kettle", &["B00000000C"]),
    );
    let (service, _) = service(api.clone()).await;
    let field = ProductField::new(None, "B00000000A", Some("kettle".to_string()));

    let container = service.get_products_with_fallback(&field).await;
    assert_eq!(widget_asins(&container), ["B00000000A"]);
    assert_eq!(api.search_calls(), 0);
}

#[tokio::test]
#[traced_test]
async fn test_widget_survives_upstream_failure() {
    let api = Arc::new(MockApi::new().with_product(product("B00000000A")));
    api.set_throttled(true);
    let (service, _) = service(api).await;
    let field = ProductField::new(None, "B00000000A", Some("kettle".to_string()));

    let container = service.get_products_with_fallback(&field).await;
    assert!(container.products.is_empty());
}

#[tokio::test]
async fn test_widget_prices() {
    let mut expensive = product("B00000000A");
    expensive.price = Some(1234.5);
    expensive.suggested_price = Some(1500.0);
    let mut plain = product("B00000000B");
    plain.suggested_price = plain.price;
    let api = Arc::new(MockApi::new().with_products([expensive, plain, product("B00000000C")]));
    let (service, db) = service(api).await;

    let now = time::unix_now();
    DealStore::new(db)
        .insert_or_update(&FeedDeal {
            asin: "B00000000C".to_string(),
            deal_start: now - 60,
            deal_end: now + 3600,
            deal_price: 9.5,
            deal_status: DealStatus::Available,
        })
        .await
        .expect("store deal");

    let field = ProductField::new(None, "B00000000A,B00000000B,B00000000C", None);
    let container = service.get_products_with_fallback(&field).await;
    let prices: Vec<(Option<&str>, Option<&str>)> = container
        .products
        .iter()
        .map(|product| (product.price.as_deref(), product.suggested_price.as_deref()))
        .collect();
    assert_eq!(
        prices,
        [
            (Some("1.234,50"), Some("1.500,00")),
            (Some("19,99"), None),
            (Some("9,50"), Some("19,99")),
        ]
    );
    assert!(container.products.iter().all(|product| product.call_to_action_text == "Buy"));
}

#[tokio::test]
async fn test_override_can_make_product_displayable() {
    let mut priceless = product("B00000000A");
    priceless.price = None;
    let api = Arc::new(MockApi::new().with_product(priceless));
    let (service, _) = service(api).await;
    let field = ProductField::new(None, "B00000000A", None);
    assert!(service.get_products_with_fallback(&field).await.products.is_empty());

    let overrides = ProductOverrides {
        price: Some(5.0),
        ..ProductOverrides::default()
    };
    service
        .set_overrides([("B00000000A", &overrides)])
        .await
        .expect("set overrides");
    let container = service.get_products_with_fallback(&field).await;
    assert_eq!(container.products.len(), 1);
    assert_eq!(container.products[0].price.as_deref(), Some("5,00"));
}
