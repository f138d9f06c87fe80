//! Core domain model for Letting Watch.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum listings included in one outbound alert, regardless of how many
/// new ones a run found.
pub const DEFAULT_BATCH_CAP: usize = 3;

/// Maximum tracked listings retained per search partition.
pub const DEFAULT_HISTORY_CAP: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionType {
    Rent,
    Sale,
}

impl TransactionType {
    /// Portal search-channel parameter value.
    pub fn channel(self) -> &'static str {
        match self {
            TransactionType::Rent => "RENT",
            TransactionType::Sale => "BUY",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FurnishType {
    Furnished,
    PartFurnished,
    Unfurnished,
}

impl FurnishType {
    pub fn as_param(self) -> &'static str {
        match self {
            FurnishType::Furnished => "furnished",
            FurnishType::PartFurnished => "partFurnished",
            FurnishType::Unfurnished => "unfurnished",
        }
    }
}

/// One saved search, owned by the configuration registry and read-only to a
/// monitoring run. Absent filters mean "no constraint", never a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    pub name: String,
    pub transaction: TransactionType,
    pub location_identifier: String,
    #[serde(default)]
    pub min_price: Option<u32>,
    #[serde(default)]
    pub max_price: Option<u32>,
    #[serde(default)]
    pub min_bedrooms: Option<u32>,
    #[serde(default)]
    pub max_bedrooms: Option<u32>,
    #[serde(default)]
    pub min_bathrooms: Option<u32>,
    #[serde(default)]
    pub max_bathrooms: Option<u32>,
    #[serde(default)]
    pub furnish_type: Option<FurnishType>,
    #[serde(default)]
    pub radius_miles: Option<f64>,
    #[serde(default)]
    pub property_types: Vec<String>,
}

/// One listing as fetched from the portal for a single run. Transient: only
/// survives the run as a [`TrackedListing`] if it was actually alerted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateListing {
    pub portal_id: i64,
    pub address: String,
    pub price_display: String,
    pub bedrooms: u32,
    pub bathrooms: Option<u32>,
    pub image_count: u32,
    pub first_visible: Option<DateTime<Utc>>,
    pub listing_path: String,
}

impl CandidateListing {
    pub fn key(&self) -> ListingKey {
        ListingKey::derive(self.portal_id, &self.address)
    }

    /// Fully-qualified URL to the listing page.
    pub fn page_url(&self, base_url: &str) -> String {
        let base = base_url.trim_end_matches('/');
        if self.listing_path.starts_with('/') {
            format!("{base}{}", self.listing_path)
        } else {
            format!("{base}/{}", self.listing_path)
        }
    }
}

/// Deterministic dedup identity: portal id plus normalized address, so a
/// listing re-posted under a fresh id (or the same flat observed at two ids)
/// still collapses to one alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListingKey(Uuid);

impl ListingKey {
    pub fn derive(portal_id: i64, address: &str) -> Self {
        let material = format!("{portal_id}:{}", normalize_address(address));
        Self(Uuid::new_v5(&Uuid::NAMESPACE_URL, material.as_bytes()))
    }
}

impl fmt::Display for ListingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lowercase, strip punctuation, collapse whitespace.
pub fn normalize_address(input: &str) -> String {
    input
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Persisted record of a listing that was included in a dispatched alert.
/// Immutable after creation; evicted only by capacity pruning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedListing {
    pub key: ListingKey,
    pub address: String,
    pub price_display: String,
    pub bedrooms: u32,
    pub bathrooms: Option<u32>,
    pub url: String,
    pub first_seen: DateTime<Utc>,
}

/// Candidate plus its ranking score; lives only between scoring and batching.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedListing {
    pub listing: CandidateListing,
    pub score: f64,
}

/// The listings selected for one outbound message, plus the full new-listing
/// count so the message can say "found 12, showing top 3".
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationBatch {
    pub search_name: String,
    pub total_new: usize,
    pub entries: Vec<RankedListing>,
}

impl NotificationBatch {
    pub fn shown(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_key_is_stable_across_derivations() {
        let a = ListingKey::derive(144_871_253, "12 Abbey Road, London NW8");
        let b = ListingKey::derive(144_871_253, "12 Abbey Road, London NW8");
        assert_eq!(a, b);
    }

    #[test]
    fn listing_key_ignores_address_punctuation_and_case() {
        let a = ListingKey::derive(7, "12 Abbey Road, London NW8");
        let b = ListingKey::derive(7, "12  abbey road   LONDON nw8!");
        assert_eq!(a, b);
    }

    #[test]
    fn listing_key_separates_distinct_portal_ids() {
        let a = ListingKey::derive(1, "12 Abbey Road");
        let b = ListingKey::derive(2, "12 Abbey Road");
        assert_ne!(a, b);
    }

    #[test]
    fn address_normalization_collapses_to_words() {
        assert_eq!(
            normalize_address("  Flat 2, 9/11 King's Cross Rd.  "),
            "flat 2 9 11 king s cross rd"
        );
    }

    #[test]
    fn page_url_joins_base_and_path() {
        let listing = CandidateListing {
            portal_id: 1,
            address: "x".into(),
            price_display: "£1,000 pcm".into(),
            bedrooms: 1,
            bathrooms: None,
            image_count: 0,
            first_visible: None,
            listing_path: "/properties/1#/".into(),
        };
        assert_eq!(
            listing.page_url("https://portal.example/"),
            "https://portal.example/properties/1#/"
        );
        assert_eq!(
            listing.page_url("https://portal.example"),
            "https://portal.example/properties/1#/"
        );
    }
}
