//! Scoring, batching, message rendering, and Telegram delivery.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettingwatch_core::{CandidateListing, NotificationBatch, RankedListing};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Recency contribution for a listing first visible right now.
pub const RECENCY_MAX: f64 = 50.0;
/// Window over which the recency contribution decays linearly to zero.
pub const RECENCY_WINDOW_DAYS: f64 = 7.0;
pub const POINTS_PER_IMAGE: f64 = 2.0;
pub const RICHNESS_CAP: f64 = 40.0;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// Ranking score for one candidate. Pure and deterministic for a fixed `now`.
///
/// A listing with no first-visible date scores as brand-new; the portal omits
/// the field on some fresh listings, and surfacing those beats penalizing
/// missing metadata.
pub fn score(listing: &CandidateListing, now: DateTime<Utc>) -> f64 {
    let age_days = listing
        .first_visible
        .map(|visible| (now - visible).num_seconds().max(0) as f64 / SECONDS_PER_DAY)
        .unwrap_or(0.0);
    let recency = RECENCY_MAX * (1.0 - (age_days / RECENCY_WINDOW_DAYS).min(1.0));
    let richness = (f64::from(listing.image_count) * POINTS_PER_IMAGE).min(RICHNESS_CAP);
    recency + richness
}

/// Score candidates in input order; ordering happens in [`build_batch`].
pub fn rank(candidates: Vec<CandidateListing>, now: DateTime<Utc>) -> Vec<RankedListing> {
    candidates
        .into_iter()
        .map(|listing| RankedListing {
            score: score(&listing, now),
            listing,
        })
        .collect()
}

/// Sort descending by score (stable, so ties keep input order) and truncate
/// to `cap`. Returns `None` when there is nothing new: callers must skip
/// dispatch entirely rather than send an empty message.
pub fn build_batch(
    ranked: Vec<RankedListing>,
    total_new: usize,
    search_name: &str,
    cap: usize,
) -> Option<NotificationBatch> {
    if ranked.is_empty() {
        return None;
    }
    let mut entries = ranked;
    entries.sort_by(|a, b| b.score.total_cmp(&a.score));
    entries.truncate(cap.max(1));
    Some(NotificationBatch {
        search_name: search_name.to_string(),
        total_new,
        entries,
    })
}

fn escape_html(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Telegram-HTML body for a listing batch.
pub fn render_batch(batch: &NotificationBatch, base_url: &str) -> String {
    let mut out = format!("<b>🏠 {}</b>\n", escape_html(&batch.search_name));
    let noun = if batch.total_new == 1 { "listing" } else { "listings" };
    if batch.total_new > batch.shown() {
        out.push_str(&format!(
            "Found {} new {noun}, showing top {}.\n",
            batch.total_new,
            batch.shown()
        ));
    } else {
        out.push_str(&format!("Found {} new {noun}.\n", batch.total_new));
    }

    for entry in &batch.entries {
        let listing = &entry.listing;
        out.push('\n');
        out.push_str(&format!("<b>{}</b>\n", escape_html(&listing.address)));
        out.push_str(&format!(
            "{} · {} bed",
            escape_html(&listing.price_display),
            listing.bedrooms
        ));
        if let Some(bathrooms) = listing.bathrooms {
            out.push_str(&format!(" · {bathrooms} bath"));
        }
        out.push('\n');
        out.push_str(&format!(
            "<a href=\"{}\">View listing</a>\n",
            listing.page_url(base_url)
        ));
    }
    out
}

/// Distinct template for a failed monitoring run.
pub fn render_failure_report(search_name: &str, detail: &str) -> String {
    format!(
        "<b>⚠️ Monitor failed: {}</b>\n{}",
        escape_html(search_name),
        escape_html(detail)
    )
}

/// Loudest template: an alert went out but the dedup state was not saved, so
/// the next run may repeat the same listings. Not automatically correctable.
pub fn render_flush_warning(search_name: &str, detail: &str) -> String {
    format!(
        "<b>🚨 {}: alert sent but tracking state was NOT saved</b>\n\
         The next run may repeat these listings.\n{}",
        escape_html(search_name),
        escape_html(detail)
    )
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The request exceeded its deadline. Kept apart from protocol errors so
    /// callers can reason about may-have-been-delivered cases.
    #[error("alert request timed out")]
    Timeout,
    #[error("alert channel unreachable: {0}")]
    Transport(reqwest::Error),
    #[error("alert channel rejected message: {0}")]
    Rejected(String),
}

fn classify_reqwest_error(err: reqwest::Error) -> DeliveryError {
    if err.is_timeout() {
        DeliveryError::Timeout
    } else {
        DeliveryError::Transport(err)
    }
}

/// Seam the monitor dispatches through, so runs can be driven against a
/// recording sink in tests.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, text: &str) -> Result<(), DeliveryError>;
}

pub const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
    pub timeout: Duration,
}

impl TelegramConfig {
    pub fn new(bot_token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
            timeout: DELIVERY_TIMEOUT,
        }
    }
}

/// Sends one message per call to the Telegram bot API. No internal retry:
/// a timed-out send may still have been delivered, and retrying it would
/// trade a missed alert for a duplicate one.
pub struct TelegramNotifier {
    client: reqwest::Client,
    endpoint: String,
    chat_id: String,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'a str,
}

#[derive(Debug, Deserialize)]
struct SendMessageAck {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

impl TelegramNotifier {
    pub fn new(config: TelegramConfig) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(classify_reqwest_error)?;
        Ok(Self {
            client,
            endpoint: format!(
                "https://api.telegram.org/bot{}/sendMessage",
                config.bot_token
            ),
            chat_id: config.chat_id,
        })
    }
}

#[async_trait]
impl AlertSink for TelegramNotifier {
    async fn send(&self, text: &str) -> Result<(), DeliveryError> {
        let request = SendMessageRequest {
            chat_id: &self.chat_id,
            text,
            parse_mode: "HTML",
        };
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(classify_reqwest_error)?;
        let status = response.status();
        let body = response.text().await.map_err(classify_reqwest_error)?;
        debug!(%status, bytes = body.len(), "telegram sendMessage answered");
        acknowledge(status, &body)
    }
}

/// Success means a well-formed body carrying `"ok": true`; anything else is a
/// rejection, never silently swallowed.
fn acknowledge(status: StatusCode, body: &str) -> Result<(), DeliveryError> {
    match serde_json::from_str::<SendMessageAck>(body) {
        Ok(ack) if ack.ok => Ok(()),
        Ok(ack) => Err(DeliveryError::Rejected(
            ack.description
                .unwrap_or_else(|| format!("status {status}")),
        )),
        Err(_) => Err(DeliveryError::Rejected(format!(
            "unrecognized response body (status {status})"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn listing(id: i64, images: u32, first_visible: Option<DateTime<Utc>>) -> CandidateListing {
        CandidateListing {
            portal_id: id,
            address: format!("{id} Mare Street, London E8"),
            price_display: "£1,950 pcm".to_string(),
            bedrooms: 2,
            bathrooms: Some(1),
            image_count: images,
            first_visible,
            listing_path: format!("/properties/{id}"),
        }
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, day, hour, 0, 0).single().unwrap()
    }

    #[test]
    fn score_is_deterministic() {
        let now = at(6, 12);
        let candidate = listing(1, 5, Some(at(4, 12)));
        assert_eq!(score(&candidate, now), score(&candidate, now));
    }

    #[test]
    fn newer_listing_scores_at_least_as_high() {
        let now = at(6, 12);
        let newer = listing(1, 5, Some(at(5, 12)));
        let older = listing(2, 5, Some(at(1, 12)));
        assert!(score(&newer, now) >= score(&older, now));
    }

    #[test]
    fn missing_first_visible_counts_as_brand_new() {
        let now = at(6, 12);
        let unknown = listing(1, 5, None);
        let fresh = listing(2, 5, Some(now));
        assert_eq!(score(&unknown, now), score(&fresh, now));
    }

    #[test]
    fn recency_reaches_zero_past_the_window() {
        let now = at(30, 12);
        let stale = listing(1, 0, Some(at(1, 12)));
        assert_eq!(score(&stale, now), 0.0);
    }

    #[test]
    fn richness_caps_at_forty() {
        let now = at(6, 12);
        let twenty = listing(1, 20, Some(now));
        let eighty = listing(2, 80, Some(now));
        assert_eq!(score(&twenty, now), score(&eighty, now));
        assert_eq!(score(&twenty, now), RECENCY_MAX + RICHNESS_CAP);
    }

    #[test]
    fn batch_respects_cap_but_reports_full_total() {
        let now = at(6, 12);
        let candidates: Vec<_> = (0..10).map(|i| listing(i, i as u32, Some(now))).collect();
        let ranked = rank(candidates, now);
        let batch = build_batch(ranked, 10, "Hackney two-beds", 3).expect("batch");

        assert_eq!(batch.shown(), 3);
        assert_eq!(batch.total_new, 10);
        // Highest image counts rank first at equal recency.
        assert_eq!(batch.entries[0].listing.portal_id, 9);
    }

    #[test]
    fn batch_sort_is_stable_for_ties() {
        let now = at(6, 12);
        let ranked = rank(vec![listing(1, 4, None), listing(2, 4, None)], now);
        let batch = build_batch(ranked, 2, "Hackney two-beds", 3).expect("batch");
        assert_eq!(batch.entries[0].listing.portal_id, 1);
        assert_eq!(batch.entries[1].listing.portal_id, 2);
    }

    #[test]
    fn empty_ranking_produces_no_batch() {
        assert!(build_batch(Vec::new(), 0, "Hackney two-beds", 3).is_none());
    }

    #[test]
    fn rendered_batch_lists_entries_and_counts() {
        let now = at(6, 12);
        let ranked = rank((0..5).map(|i| listing(i, 2, Some(now))).collect(), now);
        let batch = build_batch(ranked, 5, "Hackney two-beds", 3).expect("batch");
        let text = render_batch(&batch, "https://portal.example");

        assert!(text.contains("Found 5 new listings, showing top 3."));
        assert!(text.contains("0 Mare Street, London E8"));
        assert!(text.contains("£1,950 pcm · 2 bed · 1 bath"));
        assert!(text.contains("https://portal.example/properties/0"));
        assert!(!text.contains("4 Mare Street"));
    }

    #[test]
    fn rendered_batch_omits_absent_bathrooms() {
        let now = at(6, 12);
        let mut candidate = listing(1, 2, Some(now));
        candidate.bathrooms = None;
        let batch = build_batch(rank(vec![candidate], now), 1, "Hackney two-beds", 3).unwrap();
        let text = render_batch(&batch, "https://portal.example");

        assert!(text.contains("Found 1 new listing.\n"));
        assert!(text.contains("£1,950 pcm · 2 bed\n"));
        assert!(!text.contains("bath"));
    }

    #[test]
    fn rendering_escapes_markup_in_addresses() {
        let now = at(6, 12);
        let mut candidate = listing(1, 2, Some(now));
        candidate.address = "Dog & Duck Court <Shoreditch>".to_string();
        let batch = build_batch(rank(vec![candidate], now), 1, "Bars & flats", 3).unwrap();
        let text = render_batch(&batch, "https://portal.example");

        assert!(text.contains("Dog &amp; Duck Court &lt;Shoreditch&gt;"));
        assert!(text.contains("Bars &amp; flats"));
    }

    #[test]
    fn acknowledge_accepts_ok_true() {
        assert!(acknowledge(StatusCode::OK, r#"{"ok": true, "result": {}}"#).is_ok());
    }

    #[test]
    fn acknowledge_rejects_ok_false_with_description() {
        let err = acknowledge(
            StatusCode::BAD_REQUEST,
            r#"{"ok": false, "description": "chat not found"}"#,
        )
        .expect_err("should reject");
        assert!(matches!(err, DeliveryError::Rejected(ref detail) if detail == "chat not found"));
    }

    #[test]
    fn acknowledge_rejects_malformed_bodies() {
        let err = acknowledge(StatusCode::OK, "<html>gateway</html>").expect_err("should reject");
        assert!(matches!(err, DeliveryError::Rejected(_)));
    }
}
