//! Per-search monitoring runs.
//!
//! One run is a strict sequence: load tracking state, fetch the first portal
//! page, filter against history, rank, batch, dispatch, commit. Committing
//! only ever happens after a confirmed dispatch, so a listing is tracked if
//! and only if an alert containing it went out.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use lettingwatch_core::{
    CandidateListing, SearchConfig, TrackedListing, DEFAULT_BATCH_CAP, DEFAULT_HISTORY_CAP,
};
use lettingwatch_notify::{
    build_batch, rank, render_batch, render_failure_report, render_flush_warning, AlertSink,
    DeliveryError, TelegramConfig,
};
use lettingwatch_source::{ListingSource, PortalConfig, SourceError};
use lettingwatch_storage::{JsonFileBackend, StoreError, TrackingBackend, TrackingStore};
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

/// Minimum spacing between consecutive portal fetches when several searches
/// run back to back, to stay clear of upstream throttling.
pub const FETCH_SPACING: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Fetching,
    Filtering,
    Ranking,
    Batching,
    Dispatching,
    Committing,
    Done,
}

impl RunPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            RunPhase::Fetching => "fetching",
            RunPhase::Filtering => "filtering",
            RunPhase::Ranking => "ranking",
            RunPhase::Batching => "batching",
            RunPhase::Dispatching => "dispatching",
            RunPhase::Committing => "committing",
            RunPhase::Done => "done",
        }
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    /// Tracking state unreadable. Raised before any network call.
    #[error("tracking state could not be loaded: {0}")]
    StoreLoad(#[source] StoreError),
    #[error("listing source failed: {0}")]
    Source(#[from] SourceError),
    /// Dispatch failed; nothing was committed, the listings stay eligible.
    #[error("alert delivery failed: {0}")]
    Delivery(#[from] DeliveryError),
    /// The alert went out but the dedup state was not durably written; the
    /// next run may repeat the same listings.
    #[error("tracking state could not be flushed after send: {0}")]
    StoreFlush(#[source] StoreError),
}

impl RunError {
    /// Phase the run was in when it errored.
    pub fn phase(&self) -> RunPhase {
        match self {
            RunError::StoreLoad(_) => RunPhase::Filtering,
            RunError::Source(_) => RunPhase::Fetching,
            RunError::Delivery(_) => RunPhase::Dispatching,
            RunError::StoreFlush(_) => RunPhase::Committing,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub search_name: String,
    pub fetched: usize,
    pub new_found: usize,
    pub sent: usize,
}

/// One monitoring run for one saved search.
pub struct MonitorRun<'a> {
    pub search: &'a SearchConfig,
    pub source: &'a dyn ListingSource,
    pub sink: &'a dyn AlertSink,
    pub portal_base_url: &'a str,
    pub batch_cap: usize,
    pub history_cap: usize,
}

impl MonitorRun<'_> {
    pub async fn execute(
        &self,
        backend: Box<dyn TrackingBackend>,
        now: DateTime<Utc>,
    ) -> Result<RunOutcome, RunError> {
        // The store loads before the fetch: a broken partition must never
        // cost a network call, and must never be treated as "all unseen".
        let mut store = TrackingStore::open(backend)
            .await
            .map_err(RunError::StoreLoad)?;

        let page = match self.source.fetch_page(self.search, 0).await {
            Ok(page) => page,
            Err(err) => {
                self.report_failure(&err.to_string()).await;
                return Err(RunError::Source(err));
            }
        };
        let fetched = page.listings.len();

        let unseen = store.filter_unseen(page.listings);
        let new_found = unseen.len();
        if unseen.is_empty() {
            info!(search = %self.search.name, fetched, "no new listings");
            return Ok(self.outcome(fetched, 0, 0));
        }

        let ranked = rank(unseen, now);
        let Some(batch) = build_batch(ranked, new_found, &self.search.name, self.batch_cap) else {
            return Ok(self.outcome(fetched, new_found, 0));
        };

        let message = render_batch(&batch, self.portal_base_url);
        self.sink.send(&message).await?;

        // Commit exactly what was dispatched. Candidates that lost the
        // ranking cutoff stay unrecorded and eligible for the next run.
        let sent: Vec<TrackedListing> = batch
            .entries
            .iter()
            .map(|entry| self.tracked(&entry.listing, now))
            .collect();
        store.record_sent(&sent);
        store.prune(self.history_cap);
        if let Err(err) = store.flush().await {
            let warning = render_flush_warning(&self.search.name, &err.to_string());
            if let Err(report_err) = self.sink.send(&warning).await {
                warn!(search = %self.search.name, error = %report_err,
                    "flush warning could not be delivered");
            }
            return Err(RunError::StoreFlush(err));
        }

        info!(search = %self.search.name, fetched, new_found, sent = sent.len(), "run complete");
        Ok(self.outcome(fetched, new_found, sent.len()))
    }

    fn outcome(&self, fetched: usize, new_found: usize, sent: usize) -> RunOutcome {
        RunOutcome {
            search_name: self.search.name.clone(),
            fetched,
            new_found,
            sent,
        }
    }

    fn tracked(&self, listing: &CandidateListing, now: DateTime<Utc>) -> TrackedListing {
        TrackedListing {
            key: listing.key(),
            address: listing.address.clone(),
            price_display: listing.price_display.clone(),
            bedrooms: listing.bedrooms,
            bathrooms: listing.bathrooms,
            url: listing.page_url(self.portal_base_url),
            first_seen: now,
        }
    }

    /// Best effort: a failed run should still surface on the alert channel,
    /// but failure to report stays a log line rather than masking the
    /// original error.
    async fn report_failure(&self, detail: &str) {
        let report = render_failure_report(&self.search.name, detail);
        if let Err(err) = self.sink.send(&report).await {
            warn!(search = %self.search.name, error = %err,
                "failure report could not be delivered");
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchRegistry {
    pub searches: Vec<SearchConfig>,
}

impl SearchRegistry {
    pub fn find(&self, name: &str) -> Option<&SearchConfig> {
        self.searches.iter().find(|s| s.name == name)
    }
}

pub async fn load_registry(path: &Path) -> anyhow::Result<SearchRegistry> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub registry_path: PathBuf,
    pub state_dir: PathBuf,
    pub portal_base_url: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
    pub batch_cap: usize,
    pub history_cap: usize,
}

impl MonitorSettings {
    pub fn from_env() -> Self {
        Self {
            registry_path: std::env::var("LETTINGWATCH_SEARCHES")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./searches.yaml")),
            state_dir: std::env::var("LETTINGWATCH_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./state")),
            portal_base_url: std::env::var("LETTINGWATCH_PORTAL_BASE")
                .unwrap_or_else(|_| "https://www.rightmove.co.uk".to_string()),
            http_timeout_secs: std::env::var("LETTINGWATCH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            user_agent: std::env::var("LETTINGWATCH_USER_AGENT")
                .unwrap_or_else(|_| "lettingwatch/0.1".to_string()),
            bot_token: std::env::var("LETTINGWATCH_BOT_TOKEN").ok(),
            chat_id: std::env::var("LETTINGWATCH_CHAT_ID").ok(),
            batch_cap: std::env::var("LETTINGWATCH_BATCH_CAP")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_BATCH_CAP),
            history_cap: std::env::var("LETTINGWATCH_HISTORY_CAP")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_HISTORY_CAP),
        }
    }

    pub fn portal(&self) -> PortalConfig {
        PortalConfig {
            base_url: self.portal_base_url.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: self.user_agent.clone(),
        }
    }

    pub fn telegram(&self) -> anyhow::Result<TelegramConfig> {
        let bot_token = self
            .bot_token
            .clone()
            .context("LETTINGWATCH_BOT_TOKEN is not set")?;
        let chat_id = self
            .chat_id
            .clone()
            .context("LETTINGWATCH_CHAT_ID is not set")?;
        Ok(TelegramConfig::new(bot_token, chat_id))
    }
}

/// Run every configured search once, sequentially. One search failing never
/// stops the others; each search gets its own tracking partition.
pub async fn run_all(
    settings: &MonitorSettings,
    registry: &SearchRegistry,
    source: &dyn ListingSource,
    sink: &dyn AlertSink,
) -> Vec<(String, Result<RunOutcome, RunError>)> {
    let mut outcomes = Vec::with_capacity(registry.searches.len());
    for (i, search) in registry.searches.iter().enumerate() {
        if i > 0 {
            tokio::time::sleep(FETCH_SPACING).await;
        }
        let backend = JsonFileBackend::for_search(&settings.state_dir, &search.name);
        let run = MonitorRun {
            search,
            source,
            sink,
            portal_base_url: &settings.portal_base_url,
            batch_cap: settings.batch_cap,
            history_cap: settings.history_cap,
        };
        let result = run.execute(Box::new(backend), Utc::now()).await;
        match &result {
            Ok(outcome) => info!(
                search = %search.name,
                fetched = outcome.fetched,
                sent = outcome.sent,
                "monitor run finished"
            ),
            Err(err) => warn!(
                search = %search.name,
                phase = err.phase().as_str(),
                error = %err,
                "monitor run failed"
            ),
        }
        outcomes.push((search.name.clone(), result));
    }
    outcomes
}
