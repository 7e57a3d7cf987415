// This file is part of apw. Copyright © 2025 apw contributors.
// apw is licensed under the GNU AGPL v3.0 or any later version. See LICENSE file for full text.

//! Product and search result caching on top of the key-value store, plus the widget view of a product field.

use crate::db::ApwDb;
use crate::deals::DealStore;
use crate::error::{ApwError, ApwResult};
use crate::fallback;
use crate::fetch::FetchCoordinator;
use crate::http::paapi::ProductApi;
use crate::product::{
    ProductField, ProductImage, ProductMap, ProductOverrides, ProductRecord, SEARCH_CATEGORY_ALL, SearchResultRecord,
    normalize_asins, search_key,
};
use crate::queue::WorkQueue;
use crate::settings::Settings;
use crate::store::{Collection, KeyValueStore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, warn};

pub const PRODUCT_QUEUE: &str = "product_data_update";

/// Queued request to renew the stale entries of one collection
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenewalItem {
    pub collection: Collection,
}

/// Settings that shape the widget output
#[derive(Clone, Debug)]
struct Presentation {
    fill_up_with_fallback: bool,
    call_to_action_text: String,
    decimal_separator: String,
    thousand_separator: String,
}

/// Product widget contents, ready for a template
#[derive(Clone, Debug, Default, Serialize)]
pub struct ProductsContainer {
    pub title: String,
    pub products: Vec<WidgetProduct>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WidgetProduct {
    pub asin: String,
    pub title: Option<String>,
    pub url: Option<String>,
    pub medium_image: Option<ProductImage>,
    pub large_image: Option<ProductImage>,
    pub call_to_action_text: String,
    pub currency_symbol: Option<String>,
    pub manufacturer: Option<String>,
    /// formatted with two decimals and the configured separators
    pub price: Option<String>,
    /// only present when it differs from the price
    pub suggested_price: Option<String>,
    pub is_eligible_for_prime: bool,
}

/// Cloning is by-reference.
#[derive(Clone)]
pub struct ProductService {
    products: KeyValueStore,
    search_results: KeyValueStore,
    fetcher: FetchCoordinator,
    queue: WorkQueue<RenewalItem>,
    deals: DealStore,
    presentation: Arc<Presentation>,
}

impl ProductService {
    /// Without an `api`, anything that needs upstream fails with [`crate::error::ApwError::ServiceUnavailable`].
    pub fn new(db: ApwDb, api: Option<Arc<dyn ProductApi>>, settings: &Settings) -> Self {
        Self {
            products: KeyValueStore::new(db.clone(), Collection::Products, &settings.products),
            search_results: KeyValueStore::new(db.clone(), Collection::SearchResults, &settings.search_results),
            fetcher: FetchCoordinator::new(db.clone(), api, settings),
            queue: WorkQueue::new(db.clone(), PRODUCT_QUEUE),
            deals: DealStore::new(db),
            presentation: Arc::new(Presentation {
                fill_up_with_fallback: settings.fill_up_with_fallback,
                call_to_action_text: settings.call_to_action_text.clone(),
                decimal_separator: settings.price_decimal_separator.clone(),
                thousand_separator: settings.price_thousand_separator.clone(),
            }),
        }
    }

    pub fn product_store(&self) -> &KeyValueStore {
        &self.products
    }

    pub fn search_result_store(&self) -> &KeyValueStore {
        &self.search_results
    }

    pub fn store(&self, collection: Collection) -> &KeyValueStore {
        match collection {
            Collection::Products => &self.products,
            Collection::SearchResults => &self.search_results,
        }
    }

    pub fn fetcher(&self) -> &FetchCoordinator {
        &self.fetcher
    }

    pub fn queue(&self) -> &WorkQueue<RenewalItem> {
        &self.queue
    }

    /// Product data for `asins`, from the cache where possible.
    ///
    /// Every distinct non-empty ASIN is a key of the result; `None` means upstream has nothing usable for it. With
    /// `renew`, the cache is bypassed and every ASIN is fetched again. Stored overrides are attached to the records.
    pub async fn get_product_data(&self, asins: &[String], renew: bool) -> ApwResult<ProductMap> {
        let asins = normalize_asins(asins);
        let mut product_data = if renew {
            ProductMap::default()
        } else {
            match self.products.get_multiple::<Option<ProductRecord>>(&asins).await {
                Ok(cached) => cached,
                Err(e) => {
                    error!("failed to read cached products: {e}");
                    ProductMap::default()
                }
            }
        };

        let to_fetch: Vec<String> = asins
            .iter()
            .filter(|asin| !product_data.contains_key(*asin))
            .cloned()
            .collect();
        if !to_fetch.is_empty() {
            debug!("fetching {} of {} products", to_fetch.len(), asins.len());
            let fetched = self.fetcher.fetch_products(&self.products, &to_fetch).await?;
            product_data.extend(fetched);
        }
        for asin in &asins {
            product_data.entry(asin.clone()).or_insert(None);
        }

        let overrides: HashMap<String, ProductOverrides, ahash::RandomState> =
            self.products.get_overrides(&asins).await;
        for (asin, overrides) in overrides {
            if let Some(Some(record)) = product_data.get_mut(&asin) {
                record.overrides = Some(overrides);
            }
        }
        Ok(product_data)
    }

    /// Top ranked ASINs for a search, top result first. Empty terms give an empty list without asking upstream.
    pub async fn get_search_results(&self, search_terms: &str, category: &str, renew: bool) -> ApwResult<Vec<String>> {
        if search_terms.trim().is_empty() {
            return Ok(Vec::new());
        }
        let key = search_key(search_terms, category);
        let cached = match self.search_results.get::<SearchResultRecord>(&key).await {
            Ok(cached) => cached,
            Err(e) => {
                error!("failed to read cached search result for \"{search_terms}\": {e}");
                None
            }
        };
        match cached {
            Some(record) if !renew && !record.result.is_empty() => Ok(record.result),
            _ => {
                self.fetcher
                    .fetch_search_results(&self.search_results, search_terms, category)
                    .await
            }
        }
    }

    /// Renew one cached search, using the terms and category stored with it
    pub async fn renew_search_result(&self, key: &str) -> ApwResult<()> {
        match self.search_results.get::<SearchResultRecord>(key).await? {
            Some(record) => {
                self.get_search_results(&record.search_terms, &record.category, true)
                    .await?;
            }
            None => warn!("no search result stored under {key}"),
        }
        Ok(())
    }

    /// Seed stale placeholders for ASINs that aren't cached yet, then queue a renewal if the product collection has
    /// stale data. Returns whether a new queue item was created.
    pub async fn queue_product_renewal(&self, asins: &[String]) -> ApwResult<bool> {
        for asin in normalize_asins(asins) {
            self.products
                .set_if_not_exists(&asin, &None::<ProductRecord>, Some(0))
                .await?;
        }
        self.queue_renewal(Collection::Products).await
    }

    /// Seed a stale placeholder for a search that isn't cached yet, then queue a renewal if the search collection has
    /// stale data. Returns whether a new queue item was created.
    pub async fn queue_search_results(&self, search_terms: &str, category: &str) -> ApwResult<bool> {
        if !search_terms.trim().is_empty() {
            let placeholder = SearchResultRecord::placeholder(search_terms, category);
            self.search_results
                .set_if_not_exists(&search_key(search_terms, category), &placeholder, Some(0))
                .await?;
        }
        self.queue_renewal(Collection::SearchResults).await
    }

    /// Queue a renewal of `collection` if it has stale data
    pub async fn queue_renewal(&self, collection: Collection) -> ApwResult<bool> {
        if self.store(collection).has_stale_data().await? {
            self.queue.create_item(&RenewalItem { collection }).await
        } else {
            Ok(false)
        }
    }

    pub async fn set_overrides<'a, I>(&self, overrides: I) -> ApwResult<()>
    where
        I: IntoIterator<Item = (&'a str, &'a ProductOverrides)>,
    {
        for (asin, overrides) in overrides {
            self.products.set_override(asin, overrides).await?;
        }
        Ok(())
    }

    pub async fn get_overrides(&self, asins: &[String]) -> HashMap<String, ProductOverrides, ahash::RandomState> {
        self.products.get_overrides(asins).await
    }

    /// The products a widget shows for `field`. Never fails: anything that can't be loaded is left out.
    ///
    /// Products that can't be displayed are replaced with results of the field's search terms, and with top-up enabled
    /// the widget is filled to [`fallback::MIN_PRODUCTS`]. Running deals replace the price.
    pub async fn get_products_with_fallback(&self, field: &ProductField) -> ProductsContainer {
        let primary = normalize_asins(&field.asins);
        let product_data = match self.get_product_data(&primary, false).await {
            Ok(product_data) => product_data,
            Err(e) => {
                warn!("failed to load products for widget: {e}");
                ProductMap::default()
            }
        };

        let need = fallback::fallback_need(&primary, &product_data, self.presentation.fill_up_with_fallback);
        let (fallback_asins, fallback_data) = match field.search_terms.as_deref() {
            Some(search_terms) if need.is_needed() => self.fallback_products(search_terms).await,
            _ => (Vec::new(), ProductMap::default()),
        };
        let records = fallback::resolve(&primary, &product_data, &fallback_asins, &fallback_data, need);

        let mut products = Vec::with_capacity(records.len());
        for record in &records {
            let deal_price = match self.deals.get_active_deal(&record.asin).await {
                Ok(deal_price) => deal_price,
                Err(e) => {
                    error!("failed to look up deal for {}: {e}", record.asin);
                    None
                }
            };
            products.push(self.widget_product(record, deal_price));
        }

        ProductsContainer {
            title: field.title.clone().unwrap_or_default(),
            products,
        }
    }

    async fn fallback_products(&self, search_terms: &str) -> (Vec<String>, ProductMap) {
        let result = async {
            let asins = self.get_search_results(search_terms, SEARCH_CATEGORY_ALL, false).await?;
            let product_data = self.get_product_data(&asins, false).await?;
            Ok::<_, ApwError>((asins, product_data))
        };
        match result.await {
            Ok(fallback) => fallback,
            Err(e) => {
                warn!("failed to load fallback products for \"{search_terms}\": {e}");
                (Vec::new(), ProductMap::default())
            }
        }
    }

    fn widget_product(&self, record: &ProductRecord, deal_price: Option<f64>) -> WidgetProduct {
        let presentation = &self.presentation;
        let mut record = record.with_overrides_applied();
        if let Some(deal_price) = deal_price {
            apply_deal(&mut record, deal_price);
        }
        let format = |price: f64| format_price(price, &presentation.decimal_separator, &presentation.thousand_separator);

        let price = record.price.filter(|price| *price != 0.0);
        let suggested_price = match (price, record.suggested_price) {
            (Some(price), Some(suggested)) if suggested != 0.0 && suggested != price => Some(format(suggested)),
            _ => None,
        };
        WidgetProduct {
            asin: record.asin,
            title: record.title,
            url: record.url,
            medium_image: record.medium_image,
            large_image: record.large_image,
            call_to_action_text: presentation.call_to_action_text.clone(),
            currency_symbol: record.currency,
            manufacturer: record.manufacturer,
            price: price.map(format),
            suggested_price,
            is_eligible_for_prime: record.is_eligible_for_prime,
        }
    }
}

/// The deal price becomes the price; the highest previous price becomes the suggested price if it is above the deal
fn apply_deal(record: &mut ProductRecord, deal_price: f64) {
    let reference = record
        .suggested_price
        .into_iter()
        .chain(record.price)
        .fold(f64::NAN, f64::max);
    record.suggested_price = (reference > deal_price).then_some(reference);
    record.price = Some(deal_price);
}

/// Format with exactly two decimals, rounding half away from zero
pub fn format_price(price: f64, decimal_separator: &str, thousand_separator: &str) -> String {
    let cents = (price.abs() * 100.0).round() as u64;
    let integer = (cents / 100).to_string();
    let fraction = cents % 100;

    let mut grouped = String::with_capacity(integer.len() + integer.len() / 3 * thousand_separator.len());
    for (i, digit) in integer.chars().enumerate() {
        if i != 0 && (integer.len() - i) % 3 == 0 {
            grouped.push_str(thousand_separator);
        }
        grouped.push(digit);
    }

    let sign = if price < 0.0 && cents != 0 { "-" } else { "" };
    format!("{sign}{grouped}{decimal_separator}{fraction:02}")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_format_price() {
        assert_eq!(format_price(0.0, ",", "."), "0,00");
        assert_eq!(format_price(9.99, ",", "."), "9,99");
        assert_eq!(format_price(19.995, ".", ","), "20.00");
        assert_eq!(format_price(1234.5, ",", "."), "1.234,50");
        assert_eq!(format_price(1234567.891, ".", ","), "1,234,567.89");
        assert_eq!(format_price(123456.0, ",", ""), "123456,00");
        assert_eq!(format_price(-42.1, ",", "."), "-42,10");
    }

    fn record(price: Option<f64>, suggested_price: Option<f64>) -> ProductRecord {
        ProductRecord {
            asin: "B000000001".to_string(),
            price,
            suggested_price,
            ..ProductRecord::default()
        }
    }

    #[test]
    fn test_deal_replaces_price() {
        let mut product = record(Some(20.0), None);
        apply_deal(&mut product, 15.0);
        assert_eq!(product.price, Some(15.0));
        assert_eq!(product.suggested_price, Some(20.0));
    }

    #[test]
    fn test_deal_keeps_higher_list_price() {
        let mut product = record(Some(20.0), Some(25.0));
        apply_deal(&mut product, 15.0);
        assert_eq!(product.price, Some(15.0));
        assert_eq!(product.suggested_price, Some(25.0));
    }

    #[test]
    fn test_deal_above_price() {
        let mut product = record(Some(10.0), None);
        apply_deal(&mut product, 12.0);
        assert_eq!(product.price, Some(12.0));
        assert_eq!(product.suggested_price, None);

        let mut product = record(None, None);
        apply_deal(&mut product, 12.0);
        assert_eq!(product.price, Some(12.0));
        assert_eq!(product.suggested_price, None);
    }
}
