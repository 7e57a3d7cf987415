// This file is part of apw. Copyright © 2025 apw contributors.
// apw is licensed under the GNU AGPL v3.0 or any later version. See LICENSE file for full text.

//! Scripted upstream and fixtures shared by the integration tests

#![allow(dead_code)] // not every test binary uses every helper

use apw::db::ApwDb;
use apw::http::paapi::{ProductApi, UpstreamError, UpstreamResult};
use apw::product::{ProductImage, ProductRecord};
use apw::product_service::ProductService;
use apw::settings::Settings;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::io::Write as _;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::NamedTempFile;

/// Upstream that knows a fixed set of products and searches and records every call
#[derive(Default)]
pub struct MockApi {
    products: HashMap<String, ProductRecord>,
    /// any lookup containing one of these fails
    poisoned: HashSet<String>,
    searches: HashMap<String, Vec<String>>,
    throttled: AtomicBool,
    item_calls: AtomicUsize,
    search_calls: AtomicUsize,
    batches: Mutex<Vec<Vec<String>>>,
    /// how long every lookup takes
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_product(mut self, record: ProductRecord) -> Self {
        self.products.insert(record.asin.clone(), record);
        self
    }

    pub fn with_products<I: IntoIterator<Item = ProductRecord>>(mut self, records: I) -> Self {
        for record in records {
            self.products.insert(record.asin.clone(), record);
        }
        self
    }

    pub fn with_poisoned(mut self, asin: &str) -> Self {
        self.poisoned.insert(asin.to_string());
        self
    }

    pub fn with_search(mut self, keywords: &str, asins: &[&str]) -> Self {
        self.searches
            .insert(keywords.to_string(), asins.iter().map(|asin| asin.to_string()).collect());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_throttled(&self, throttled: bool) {
        self.throttled.store(throttled, Ordering::SeqCst);
    }

    pub fn item_calls(&self) -> usize {
        self.item_calls.load(Ordering::SeqCst)
    }

    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }

    /// Most lookups that were ever running at the same time
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches
            .lock()
            .expect("batch log poisoned")
            .iter()
            .map(Vec::len)
            .collect()
    }
}

#[async_trait]
impl ProductApi for MockApi {
    async fn get_items(&self, asins: &[String]) -> UpstreamResult<Vec<ProductRecord>> {
        self.item_calls.fetch_add(1, Ordering::SeqCst);
        self.batches.lock().expect("batch log poisoned").push(asins.to_vec());
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.throttled.load(Ordering::SeqCst) {
            return Err(UpstreamError::api("TooManyRequests", "The request was denied due to request throttling."));
        }
        if asins.iter().any(|asin| self.poisoned.contains(asin)) {
            return Err(UpstreamError::api("InternalFailure", "The request processing has failed."));
        }
        Ok(asins.iter().filter_map(|asin| self.products.get(asin)).cloned().collect())
    }

    async fn search_items(&self, keywords: &str, _category: &str, item_count: u32) -> UpstreamResult<Vec<String>> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        if self.throttled.load(Ordering::SeqCst) {
            return Err(UpstreamError::api("TooManyRequests", "The request was denied due to request throttling."));
        }
        let mut result = self.searches.get(keywords).cloned().unwrap_or_default();
        result.truncate(item_count as usize);
        Ok(result)
    }
}

fn image() -> Option<ProductImage> {
    Some(ProductImage {
        url: "https://m.media-amazon.com/images/I/example.jpg".to_string(),
        width: Some(160),
        height: Some(160),
    })
}

/// A product that passes every display check
pub fn product(asin: &str) -> ProductRecord {
    ProductRecord {
        asin: asin.to_string(),
        title: Some(format!("Product {asin}")),
        url: Some(format!("https://www.amazon.de/dp/{asin}")),
        manufacturer: Some("ACME".to_string()),
        medium_image: image(),
        large_image: image(),
        price: Some(19.99),
        suggested_price: None,
        currency: Some("EUR".to_string()),
        product_available: true,
        is_eligible_for_prime: true,
        overrides: None,
    }
}

/// A product upstream knows but that can't be bought right now
pub fn unavailable_product(asin: &str) -> ProductRecord {
    ProductRecord {
        price: None,
        product_available: false,
        ..product(asin)
    }
}

/// Ten character ASIN for an index
pub fn asin(i: usize) -> String {
    format!("B{i:09}")
}

/// Defaults, but without the one second throttle
pub fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.max_requests_per_second = 1000;
    settings
}

pub async fn service_with(api: Arc<MockApi>, settings: &Settings) -> (ProductService, ApwDb) {
    let db = ApwDb::open_in_memory().await.expect("in-memory db");
    let service = ProductService::new(db.clone(), Some(api as Arc<dyn ProductApi>), settings);
    (service, db)
}

pub async fn service(api: Arc<MockApi>) -> (ProductService, ApwDb) {
    service_with(api, &test_settings()).await
}

pub const DEAL_FEED_HEADER: &str = "id,type,status,title,asin,link,start,end,list_price,deal_price";

/// One feed row with the columns the importer reads filled in
pub fn deal_row(status: &str, asin: &str, start: &str, end: &str, price: &str) -> String {
    format!("1,LIGHTNING_DEAL,{status},Deal title,{asin},https://www.amazon.de/dp/{asin},{start},{end},29.99,{price}")
}

/// A currently running deal
pub fn running_deal_row(asin: &str) -> String {
    deal_row("AVAILABLE", asin, "2024-01-01T00:00:00Z", "2099-12-31T23:59:59Z", "14.99")
}

/// A row whose start and end can't be parsed
pub fn broken_deal_row(asin: &str) -> String {
    deal_row("AVAILABLE", asin, "soon", "later", "14.99")
}

pub fn deal_feed(rows: &[String]) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    writeln!(file, "{DEAL_FEED_HEADER}").expect("write header");
    for row in rows {
        writeln!(file, "{row}").expect("write row");
    }
    file.flush().expect("flush feed");
    file
}
