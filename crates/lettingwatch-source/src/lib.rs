//! Listing-portal HTTP client and payload parsing.
//!
//! The portal answers its search endpoint with either a JSON document or a
//! server-rendered HTML page that embeds the same results as a JSON script
//! tag; both shapes decode to the same [`SearchPage`].

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettingwatch_core::{CandidateListing, SearchConfig};
use scraper::{Html, Selector};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};

/// Results per page served by the portal search endpoint.
pub const PAGE_SIZE: usize = 24;

/// Hard page ceiling for the bulk path; the portal stops serving results
/// past this depth regardless of the reported total.
const MAX_BULK_PAGES: usize = 42;

const SEARCH_PATH: &str = "/api/_search";
const EMBEDDED_STATE_SELECTOR: &str = "script#__NEXT_DATA__";

#[derive(Debug, Error)]
pub enum SourceError {
    /// Transport-level failure reaching the portal.
    #[error("portal unreachable: {0}")]
    Transport(#[from] reqwest::Error),
    /// Non-success status, with any machine-readable detail the body carried.
    #[error("portal returned status {status}: {}", message.as_deref().unwrap_or("no detail"))]
    Status { status: u16, message: Option<String> },
    /// The expected result structure was absent or undecodable.
    #[error("portal payload malformed: {0}")]
    Parse(String),
}

#[derive(Debug, Clone)]
pub struct PortalConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.rightmove.co.uk".to_string(),
            timeout: Duration::from_secs(20),
            user_agent: "lettingwatch/0.1".to_string(),
        }
    }
}

/// One decoded page of search results.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchPage {
    pub listings: Vec<CandidateListing>,
    /// Total matches the portal reports for the whole search, not this page.
    pub total: usize,
}

/// Seam the monitor depends on, so runs can be driven against a stub portal.
#[async_trait]
pub trait ListingSource: Send + Sync {
    async fn fetch_page(&self, search: &SearchConfig, page: usize)
        -> Result<SearchPage, SourceError>;
}

pub struct PortalClient {
    client: reqwest::Client,
    base_url: String,
}

impl PortalClient {
    pub fn new(config: PortalConfig) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Bulk path: walk every result page for one search. Not used by
    /// monitoring, which only needs the first page per run.
    pub async fn fetch_all(&self, search: &SearchConfig) -> Result<Vec<CandidateListing>, SourceError> {
        let mut collected = Vec::new();
        for page in 0..MAX_BULK_PAGES {
            if page > 0 {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            let result = self.fetch_page(search, page).await?;
            let total = result.total;
            if result.listings.is_empty() {
                break;
            }
            collected.extend(result.listings);
            if collected.len() >= total {
                break;
            }
        }
        info!(search = %search.name, listings = collected.len(), "bulk fetch complete");
        Ok(collected)
    }
}

#[async_trait]
impl ListingSource for PortalClient {
    async fn fetch_page(
        &self,
        search: &SearchConfig,
        page: usize,
    ) -> Result<SearchPage, SourceError> {
        let url = format!("{}{SEARCH_PATH}", self.base_url);
        let params = build_search_params(search, page);
        debug!(search = %search.name, page, "fetching portal page");

        let response = self.client.get(&url).query(&params).send().await?;
        let status = response.status();
        let is_html = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("text/html"))
            .unwrap_or(false);
        let body = response.text().await?;

        if !status.is_success() {
            return Err(SourceError::Status {
                status: status.as_u16(),
                message: extract_error_message(&body),
            });
        }

        parse_search_body(&body, is_html)
    }
}

/// Query parameters for one search page. Optional filters are appended only
/// when present; an absent filter must not turn into a default value.
fn build_search_params(search: &SearchConfig, page: usize) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("locationIdentifier", search.location_identifier.clone()),
        ("channel", search.transaction.channel().to_string()),
        ("index", (page * PAGE_SIZE).to_string()),
        ("numberOfPropertiesPerPage", PAGE_SIZE.to_string()),
    ];
    if let Some(min) = search.min_price {
        params.push(("minPrice", min.to_string()));
    }
    if let Some(max) = search.max_price {
        params.push(("maxPrice", max.to_string()));
    }
    if let Some(min) = search.min_bedrooms {
        params.push(("minBedrooms", min.to_string()));
    }
    if let Some(max) = search.max_bedrooms {
        params.push(("maxBedrooms", max.to_string()));
    }
    if let Some(min) = search.min_bathrooms {
        params.push(("minBathrooms", min.to_string()));
    }
    if let Some(max) = search.max_bathrooms {
        params.push(("maxBathrooms", max.to_string()));
    }
    if let Some(furnish) = search.furnish_type {
        params.push(("furnishTypes", furnish.as_param().to_string()));
    }
    if let Some(radius) = search.radius_miles {
        params.push(("radius", radius.to_string()));
    }
    if !search.property_types.is_empty() {
        params.push(("propertyTypes", search.property_types.join(",")));
    }
    params
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchPayload {
    properties: Vec<RawListing>,
    #[serde(default)]
    result_count: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawListing {
    id: i64,
    display_address: String,
    #[serde(default)]
    bedrooms: Option<u32>,
    #[serde(default)]
    bathrooms: Option<u32>,
    #[serde(default)]
    number_of_images: Option<u32>,
    #[serde(default)]
    first_visible_date: Option<DateTime<Utc>>,
    #[serde(default)]
    price: Option<RawPrice>,
    #[serde(default)]
    property_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPrice {
    #[serde(default)]
    display_prices: Vec<RawDisplayPrice>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDisplayPrice {
    display_price: String,
}

/// Decode a response body into a [`SearchPage`]. HTML bodies are searched for
/// the embedded state script; JSON bodies decode directly.
pub fn parse_search_body(body: &str, is_html: bool) -> Result<SearchPage, SourceError> {
    let results = if is_html {
        embedded_search_results(body)?
    } else {
        serde_json::from_str(body)
            .map_err(|err| SourceError::Parse(format!("decoding search payload: {err}")))?
    };
    search_page_from_value(results)
}

fn embedded_search_results(html: &str) -> Result<JsonValue, SourceError> {
    let document = Html::parse_document(html);
    let selector = Selector::parse(EMBEDDED_STATE_SELECTOR)
        .map_err(|err| SourceError::Parse(err.to_string()))?;
    let script = document
        .select(&selector)
        .next()
        .ok_or_else(|| SourceError::Parse("embedded search state script not found".into()))?;
    let text: String = script.text().collect();
    let state: JsonValue = serde_json::from_str(&text)
        .map_err(|err| SourceError::Parse(format!("decoding embedded state: {err}")))?;
    json_at(&state, &["props", "pageProps", "searchResults"])
        .cloned()
        .ok_or_else(|| SourceError::Parse("embedded state has no search results".into()))
}

fn search_page_from_value(results: JsonValue) -> Result<SearchPage, SourceError> {
    let payload: SearchPayload = serde_json::from_value(results)
        .map_err(|err| SourceError::Parse(format!("decoding search results: {err}")))?;

    let listings: Vec<CandidateListing> = payload
        .properties
        .into_iter()
        .map(|raw| CandidateListing {
            portal_id: raw.id,
            price_display: raw
                .price
                .and_then(|p| p.display_prices.into_iter().next())
                .map(|p| p.display_price)
                .unwrap_or_else(|| "Price on application".to_string()),
            address: raw.display_address,
            bedrooms: raw.bedrooms.unwrap_or(0),
            bathrooms: raw.bathrooms,
            image_count: raw.number_of_images.unwrap_or(0),
            first_visible: raw.first_visible_date,
            listing_path: raw
                .property_url
                .unwrap_or_else(|| format!("/properties/{}", raw.id)),
        })
        .collect();

    let total = payload
        .result_count
        .as_ref()
        .and_then(parse_result_count)
        .unwrap_or(listings.len());

    Ok(SearchPage { listings, total })
}

/// The portal reports the total as either a number or a grouped string
/// ("1,204").
fn parse_result_count(value: &JsonValue) -> Option<usize> {
    match value {
        JsonValue::Number(n) => n.as_u64().map(|n| n as usize),
        JsonValue::String(s) => s.replace(',', "").parse().ok(),
        _ => None,
    }
}

fn extract_error_message(body: &str) -> Option<String> {
    let value: JsonValue = serde_json::from_str(body).ok()?;
    for field in ["message", "errorMessage", "error"] {
        if let Some(text) = value.get(field).and_then(JsonValue::as_str) {
            return Some(text.to_string());
        }
    }
    None
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    Some(cur)
}
