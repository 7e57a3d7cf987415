// This file is part of apw. Copyright © 2025 apw contributors.
// apw is licensed under the GNU AGPL v3.0 or any later version. See LICENSE file for full text.

//! Product Advertising API 5 request and response shapes

use super::error::ApiErrorData;
use crate::product::{ProductImage, ProductRecord};
use serde::{Deserialize, Serialize};

pub const PARTNER_TYPE: &str = "Associates";

/// Everything needed to build a [`ProductRecord`]
pub const GET_ITEMS_RESOURCES: &[&str] = &[
    "Images.Primary.Medium",
    "Images.Primary.Large",
    "ItemInfo.ByLineInfo",
    "ItemInfo.Title",
    "Offers.Listings.Price",
    "Offers.Listings.DeliveryInfo.IsPrimeEligible",
];

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetItemsRequest<'a> {
    pub item_ids: &'a [String],
    pub resources: &'static [&'static str],
    pub partner_tag: &'a str,
    pub partner_type: &'static str,
    pub marketplace: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct SearchItemsRequest<'a> {
    pub keywords: &'a str,
    pub search_index: &'a str,
    pub item_count: u32,
    pub resources: &'static [&'static str],
    pub partner_tag: &'a str,
    pub partner_type: &'static str,
    pub marketplace: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetItemsResponse {
    pub items_result: Option<ItemsResult>,
    #[serde(default)]
    pub errors: Vec<ApiErrorData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ItemsResult {
    #[serde(default)]
    pub items: Vec<Item>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SearchItemsResponse {
    pub search_result: Option<SearchResult>,
    #[serde(default)]
    pub errors: Vec<ApiErrorData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SearchResult {
    #[serde(default)]
    pub items: Vec<Item>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Item {
    #[serde(rename = "ASIN")]
    pub asin: String,
    #[serde(rename = "DetailPageURL")]
    pub detail_page_url: Option<String>,
    pub item_info: Option<ItemInfo>,
    pub offers: Option<Offers>,
    pub images: Option<Images>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ItemInfo {
    pub title: Option<DisplayValue>,
    pub by_line_info: Option<ByLineInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ByLineInfo {
    pub manufacturer: Option<DisplayValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DisplayValue {
    pub display_value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Offers {
    #[serde(default)]
    pub listings: Vec<Listing>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Listing {
    pub price: Option<Price>,
    pub delivery_info: Option<DeliveryInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Price {
    pub amount: f64,
    pub currency: Option<String>,
    pub savings: Option<Savings>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Savings {
    pub amount: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeliveryInfo {
    #[serde(default)]
    pub is_prime_eligible: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Images {
    pub primary: Option<PrimaryImages>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PrimaryImages {
    pub medium: Option<Image>,
    pub large: Option<Image>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Image {
    #[serde(rename = "URL")]
    pub url: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl From<Image> for ProductImage {
    fn from(image: Image) -> Self {
        ProductImage {
            url: image.url,
            width: image.width,
            height: image.height,
        }
    }
}

impl From<Item> for ProductRecord {
    fn from(item: Item) -> Self {
        let mut record = ProductRecord {
            asin: item.asin,
            url: item.detail_page_url,
            ..ProductRecord::default()
        };

        if let Some(item_info) = item.item_info {
            record.title = item_info.title.map(|title| title.display_value);
            record.manufacturer = item_info
                .by_line_info
                .and_then(|by_line| by_line.manufacturer)
                .map(|manufacturer| manufacturer.display_value);
        }

        // only the first listing counts
        if let Some(listing) = item.offers.and_then(|offers| offers.listings.into_iter().next()) {
            if let Some(price) = listing.price {
                record.price = Some(price.amount);
                record.currency = price.currency;
                record.product_available = true;
                record.suggested_price = price.savings.map(|savings| price.amount + savings.amount);
            }
            record.is_eligible_for_prime = listing.delivery_info.is_some_and(|info| info.is_prime_eligible);
        }

        if let Some(primary) = item.images.and_then(|images| images.primary) {
            record.medium_image = primary.medium.map(Into::into);
            record.large_image = primary.large.map(Into::into);
        }

        record
    }
}
