// This file is part of apw. Copyright © 2025 apw contributors.
// apw is licensed under the GNU AGPL v3.0 or any later version. See LICENSE file for full text.

//! Cached product and search result records

use crate::store::CacheValue;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

/// Upstream search category covering every department
pub const SEARCH_CATEGORY_ALL: &str = "All";

static ASIN_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9A-Z]{10}$").expect("Failed to compile ASIN_REGEX"));

/// ASIN -> cached data, where `None` means upstream had nothing usable for that ASIN
pub type ProductMap = HashMap<String, Option<ProductRecord>, ahash::RandomState>;

/// Cheap syntactic check: ten upper-case alphanumerics. Anything else is never sent upstream.
pub fn is_valid_asin(asin: &str) -> bool {
    ASIN_REGEX.is_match(asin)
}

/// Trim, drop empties, and de-duplicate while keeping first-seen order
pub fn normalize_asins<I, S>(asins: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::with_hasher(ahash::RandomState::default());
    asins
        .into_iter()
        .map(|asin| asin.as_ref().trim().to_string())
        .filter(|asin| !asin.is_empty())
        .filter(|asin| seen.insert(asin.clone()))
        .collect()
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProductImage {
    pub url: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub asin: String,
    pub title: Option<String>,
    pub url: Option<String>,
    pub manufacturer: Option<String>,
    pub medium_image: Option<ProductImage>,
    pub large_image: Option<ProductImage>,
    pub price: Option<f64>,
    pub suggested_price: Option<f64>,
    pub currency: Option<String>,
    pub product_available: bool,
    pub is_eligible_for_prime: bool,
    /// Operator overrides, attached on read. Never persisted as part of the value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overrides: Option<ProductOverrides>,
}

impl ProductRecord {
    /// Whether this product can be shown in a widget: both images, a title, a price, and availability
    pub fn is_displayable(&self) -> bool {
        self.medium_image.is_some()
            && self.large_image.is_some()
            && self.title.as_deref().is_some_and(|title| !title.is_empty())
            && self.price.is_some_and(|price| price > 0.0)
            && self.product_available
    }

    /// This record with its overrides merged in
    pub fn with_overrides_applied(&self) -> ProductRecord {
        let mut record = self.clone();
        if let Some(overrides) = record.overrides.take() {
            overrides.apply_to(&mut record);
        }
        record
    }
}

/// Operator-supplied replacements for upstream fields
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProductOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_price: Option<f64>,
}

impl ProductOverrides {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn apply_to(&self, record: &mut ProductRecord) {
        if let Some(title) = &self.title {
            record.title = Some(title.clone());
        }
        if let Some(url) = &self.url {
            record.url = Some(url.clone());
        }
        if let Some(manufacturer) = &self.manufacturer {
            record.manufacturer = Some(manufacturer.clone());
        }
        if let Some(price) = self.price {
            record.price = Some(price);
        }
        if let Some(suggested_price) = self.suggested_price {
            record.suggested_price = Some(suggested_price);
        }
    }
}

impl CacheValue for Option<ProductRecord> {
    fn is_available(&self) -> bool {
        self.as_ref().is_some_and(|record| record.product_available)
    }
}

/// A cached upstream search. Stored under [`search_key`] of its own terms and category.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SearchResultRecord {
    pub search_terms: String,
    pub category: String,
    /// ASINs in upstream rank order
    pub result: Vec<String>,
}

impl SearchResultRecord {
    pub fn placeholder(search_terms: &str, category: &str) -> Self {
        Self {
            search_terms: search_terms.to_string(),
            category: category.to_string(),
            result: Vec::new(),
        }
    }
}

impl CacheValue for SearchResultRecord {
    fn is_available(&self) -> bool {
        !self.result.is_empty()
    }
}

/// Cache key for a search: hex SHA-256 over category and terms
pub fn search_key(search_terms: &str, category: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(category.as_bytes());
    hasher.update([0u8]);
    hasher.update(search_terms.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// The product widget field as configured on a piece of content
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductField {
    pub title: Option<String>,
    pub asins: Vec<String>,
    pub search_terms: Option<String>,
}

impl ProductField {
    pub fn new(title: Option<String>, asins: &str, search_terms: Option<String>) -> Self {
        Self {
            title: title.filter(|title| !title.trim().is_empty()),
            asins: parse_asin_list(asins),
            search_terms: search_terms
                .map(|terms| terms.trim().to_string())
                .filter(|terms| !terms.is_empty()),
        }
    }
}

/// Parse a comma separated ASIN list
pub fn parse_asin_list(asins: &str) -> Vec<String> {
    normalize_asins(asins.split(','))
}
