// This file is part of apw. Copyright © 2025 apw contributors.
// apw is licensed under the GNU AGPL v3.0 or any later version. See LICENSE file for full text.

//! Product Advertising API calls. Requests go to a gateway that signs and forwards them, so this client only deals in
//! the API's JSON shapes.

mod dto;
mod error;

use super::HTTP_CLIENT;
use crate::error::{ApwError, ApwResult};
use crate::product::ProductRecord;
use crate::settings::ApiSettings;
use async_trait::async_trait;
pub use error::{ApiErrorData, UpstreamError, UpstreamResult};
use reqwest::header;
use serde::Serialize;
use tracing::{debug, warn};

const GET_ITEMS_ENDPOINT: &str = "/paapi5/getitems";
const SEARCH_ITEMS_ENDPOINT: &str = "/paapi5/searchitems";

/// Upstream product data source
#[async_trait]
pub trait ProductApi: Send + Sync {
    /// Look up at most ten ASINs. ASINs upstream doesn't know are simply missing from the result.
    async fn get_items(&self, asins: &[String]) -> UpstreamResult<Vec<ProductRecord>>;

    /// Top ASINs for a keyword search, in rank order
    async fn search_items(&self, keywords: &str, category: &str, item_count: u32) -> UpstreamResult<Vec<String>>;
}

pub struct PaapiClient {
    base_url: String,
    api_key: String,
    partner_tag: String,
    marketplace: String,
}

impl PaapiClient {
    pub fn new(settings: &ApiSettings) -> ApwResult<Self> {
        let base_url = settings.endpoint.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(ApwError::ServiceUnavailable(
                "no product API endpoint configured; set api.endpoint".to_string(),
            ));
        }
        Ok(Self {
            base_url,
            api_key: settings.key.clone(),
            partner_tag: settings.partner_tag.clone(),
            marketplace: settings.marketplace.clone(),
        })
    }

    /// Get extra headers needed for gateway calls
    fn headers(&self) -> header::HeaderMap {
        let mut header_map = header::HeaderMap::new();
        if self.api_key.is_empty() {
            return header_map;
        }
        match header::HeaderValue::try_from(self.api_key.as_str()) {
            Ok(mut api_key) => {
                api_key.set_sensitive(true);
                header_map.insert("x-api-key", api_key);
            }
            Err(_) => warn!("api.key contains characters that are not valid in an HTTP header; sending no key"),
        }
        header_map
    }

    async fn post<B: Serialize + Sync>(&self, endpoint: &'static str, body: &B) -> UpstreamResult<bytes::Bytes> {
        let response = HTTP_CLIENT
            .post(format!("{}{endpoint}", self.base_url))
            .headers(self.headers())
            .json(body)
            .send()
            .await
            .map_err(|e| UpstreamError::from_request(endpoint, e))?;
        if !response.status().is_success() {
            return Err(UpstreamError::from_response(endpoint, response).await);
        }
        response.bytes().await.map_err(|e| UpstreamError::from_read(endpoint, e))
    }
}

/// Errors about individual items come back next to the items that did resolve; anything else fails the request
fn check_request_errors(errors: Vec<ApiErrorData>, have_results: bool) -> UpstreamResult<()> {
    const ITEM_LEVEL_CODES: &[&str] = &["InvalidParameterValue", "ItemNotAccessible", "NoResults"];
    if errors.is_empty() {
        return Ok(());
    }
    if have_results || errors.iter().all(|error| ITEM_LEVEL_CODES.contains(&error.code.as_str())) {
        for error in &errors {
            debug!("product API item error [{}]: {}", error.code, error.message);
        }
        Ok(())
    } else {
        Err(UpstreamError::Api(errors))
    }
}

#[async_trait]
impl ProductApi for PaapiClient {
    async fn get_items(&self, asins: &[String]) -> UpstreamResult<Vec<ProductRecord>> {
        let request = dto::GetItemsRequest {
            item_ids: asins,
            resources: dto::GET_ITEMS_RESOURCES,
            partner_tag: &self.partner_tag,
            partner_type: dto::PARTNER_TYPE,
            marketplace: &self.marketplace,
        };
        let body = self.post(GET_ITEMS_ENDPOINT, &request).await?;
        let response: dto::GetItemsResponse = serde_json::from_slice(&body).map_err(UpstreamError::from_json)?;
        let items = response.items_result.map(|result| result.items).unwrap_or_default();
        check_request_errors(response.errors, !items.is_empty())?;
        Ok(items.into_iter().map(Into::into).collect())
    }

    async fn search_items(&self, keywords: &str, category: &str, item_count: u32) -> UpstreamResult<Vec<String>> {
        let request = dto::SearchItemsRequest {
            keywords,
            search_index: category,
            item_count,
            resources: &[],
            partner_tag: &self.partner_tag,
            partner_type: dto::PARTNER_TYPE,
            marketplace: &self.marketplace,
        };
        let body = self.post(SEARCH_ITEMS_ENDPOINT, &request).await?;
        let response: dto::SearchItemsResponse = serde_json::from_slice(&body).map_err(UpstreamError::from_json)?;
        let items = response.search_result.map(|result| result.items).unwrap_or_default();
        check_request_errors(response.errors, !items.is_empty())?;
        Ok(items.into_iter().map(|item| item.asin).collect())
    }
}
