//! Cursor-driven ingestion orchestration.
//!
//! Ties the rate-limited fetcher, the cooldown governor, and the idempotent
//! writer together across successive pagination windows, then reconciles the
//! collection with one post-hoc dedupe pass before summarizing the run.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tdh_api::{ApiConfig, AttackSource, FactionAttackSource, FetchError, TornClient, UserBasic};
use tdh_core::{
    format_timestamp, IngestionCursor, UserProfileSummary, UserStatusSnapshot,
    FALLBACK_START_TIMESTAMP,
};
use tdh_store::HarvestStore;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tdh-ingest";

/// Proactive pause enforced every `threshold` successful fetches, independent
/// of (and additive to) any retry backoff on individual requests.
#[derive(Debug)]
pub struct CooldownGovernor {
    requests_since_cooldown: u32,
    threshold: u32,
    period: Duration,
}

impl CooldownGovernor {
    pub fn new() -> Self {
        Self::with_limits(100, Duration::from_secs(60))
    }

    pub fn with_limits(threshold: u32, period: Duration) -> Self {
        Self {
            // The exploratory request has already been made when the
            // governor starts gating the loop.
            requests_since_cooldown: 1,
            threshold,
            period,
        }
    }

    pub fn should_cooldown(&self) -> bool {
        self.requests_since_cooldown >= self.threshold
    }

    pub fn note_request(&mut self) {
        self.requests_since_cooldown += 1;
    }

    pub async fn cooldown(&mut self) {
        info!(secs = self.period.as_secs(), "cooling down for API rate limiting");
        tokio::time::sleep(self.period).await;
        info!("cooldown complete, resuming");
        // 1, not 0: the request that tripped the check is about to be made.
        self.requests_since_cooldown = 1;
    }
}

impl Default for CooldownGovernor {
    fn default() -> Self {
        Self::new()
    }
}

/// Running totals threaded through the loop; owned by the run, never ambient.
#[derive(Debug, Clone, Copy, Default)]
pub struct IngestionState {
    pub total_requests: u64,
    pub new_records: u64,
    pub duplicate_records: u64,
    pub earliest_timestamp: Option<i64>,
    pub latest_timestamp: Option<i64>,
}

impl IngestionState {
    fn observe_page(&mut self, page_min: i64, page_max: i64) {
        self.earliest_timestamp = Some(match self.earliest_timestamp {
            Some(current) => current.min(page_min),
            None => page_min,
        });
        self.latest_timestamp = Some(match self.latest_timestamp {
            Some(current) => current.max(page_max),
            None => page_max,
        });
    }
}

/// Reconciled result of one ingestion run.
#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub total_requests: u64,
    pub new_records: u64,
    pub duplicate_records: u64,
    pub removed_duplicates: u64,
    pub earliest_timestamp: Option<i64>,
    pub latest_timestamp: Option<i64>,
}

impl IngestSummary {
    fn from_state(state: IngestionState, removed_duplicates: u64) -> Self {
        Self {
            total_requests: state.total_requests,
            new_records: state.new_records,
            duplicate_records: state.duplicate_records,
            removed_duplicates,
            earliest_timestamp: state.earliest_timestamp,
            latest_timestamp: state.latest_timestamp,
        }
    }

    pub fn render(&self) -> String {
        let not_available = || "Not Available".to_string();
        let earliest = self
            .earliest_timestamp
            .map(format_timestamp)
            .unwrap_or_else(not_available);
        let latest = self
            .latest_timestamp
            .map(format_timestamp)
            .unwrap_or_else(not_available);
        format!(
            "Final summary of requests from {earliest} to {latest}:\n\
             Total API requests made: {}\n\
             Total new records saved: {}\n\
             Total duplicate records encountered: {}\n\
             Duplicates removed in reconciliation: {}",
            self.total_requests, self.new_records, self.duplicate_records, self.removed_duplicates
        )
    }
}

/// Runs the full attack-log ingestion: explore for the upper bound, paginate
/// with a monotonic cursor, write idempotently, then drain through one dedupe
/// pass. Retry-budget exhaustion mid-pagination degrades to "stop and
/// summarize"; only a stalled cursor is an error.
pub async fn ingest_attacks(
    source: &dyn AttackSource,
    store: &mut HarvestStore,
    start: Option<i64>,
) -> Result<IngestSummary> {
    // Exploratory call, counted against the rate limit like any other.
    let mut state = IngestionState {
        total_requests: 1,
        ..IngestionState::default()
    };
    let mut governor = CooldownGovernor::new();

    let newest_known = match source.fetch_page(None).await {
        Ok(page) => page.iter().map(|r| r.timestamp_started).max(),
        Err(err) => {
            warn!(error = %err, "exploratory fetch failed");
            None
        }
    };
    let Some(newest_known) = newest_known else {
        warn!("exploratory fetch returned no records; nothing to ingest");
        let removed = store.remove_duplicate_attacks() as u64;
        store.flush()?;
        return Ok(IngestSummary::from_state(state, removed));
    };

    let start = start.unwrap_or(FALLBACK_START_TIMESTAMP);
    let mut cursor = IngestionCursor::new(start, newest_known);
    info!(newest_known, start, "beginning paginated fetch");

    while !cursor.exhausted() {
        if governor.should_cooldown() {
            governor.cooldown().await;
        }

        let page = match source.fetch_page(Some(cursor.next_fetch_timestamp)).await {
            Ok(page) => page,
            Err(err) => {
                warn!(error = %err, "pagination stopped, draining");
                break;
            }
        };
        if page.is_empty() {
            warn!(
                from = cursor.next_fetch_timestamp,
                "empty page, no further progress possible"
            );
            break;
        }

        let page_min = page
            .iter()
            .map(|r| r.timestamp_started)
            .min()
            .expect("page checked non-empty");
        let page_max = page
            .iter()
            .map(|r| r.timestamp_started)
            .max()
            .expect("page checked non-empty");
        if !cursor.advance_past(page_max) {
            bail!(
                "cursor stalled: page max timestamp {page_max} does not advance past {}",
                cursor.next_fetch_timestamp
            );
        }
        state.observe_page(page_min, page_max);

        let fetched = page.len();
        let outcome = store.insert_attack_batch(page);
        state.new_records += outcome.new;
        state.duplicate_records += outcome.duplicates;
        state.total_requests += 1;
        governor.note_request();
        store.flush()?;
        info!(
            request = state.total_requests,
            fetched,
            new = outcome.new,
            duplicates = outcome.duplicates,
            next_from = cursor.next_fetch_timestamp,
            "page ingested"
        );
    }

    // Draining: one reconciliation pass over the whole collection.
    let removed = store.remove_duplicate_attacks() as u64;
    store.flush()?;

    let summary = IngestSummary::from_state(state, removed);
    info!(
        total_requests = summary.total_requests,
        new = summary.new_records,
        duplicates = summary.duplicate_records,
        removed = summary.removed_duplicates,
        "ingestion run complete"
    );
    Ok(summary)
}

/// Appends a status snapshot for `user` and upserts the matching profile
/// projection, recomputing `status_inventory` from the stored snapshots.
pub fn record_user_snapshot(
    store: &mut HarvestStore,
    user: UserBasic,
    observed_at: DateTime<Utc>,
) -> UserProfileSummary {
    let snapshot = UserStatusSnapshot {
        snapshot_id: Uuid::new_v4(),
        player_id: user.player_id,
        status: user.status,
        timestamp: observed_at,
    };
    let status_id = store.insert_status(snapshot);
    let summary = UserProfileSummary {
        player_id: user.player_id,
        latest_status: status_id,
        latest_name: user.name,
        latest_level: user.level,
        last_status_update: format_timestamp(observed_at.timestamp()),
        status_inventory: store.status_count(user.player_id),
    };
    store.upsert_profile(summary.clone());
    summary
}

/// Single-record path: fetch once (with the client's own backoff), insert a
/// snapshot, upsert the profile. No cursor, no cooldown governor.
pub async fn ingest_user_once(
    client: &TornClient,
    store: &mut HarvestStore,
    user_id: Option<i64>,
) -> Result<Option<UserProfileSummary>> {
    let user = match client.fetch_user_basic(user_id).await {
        Ok(user) => user,
        Err(FetchError::MaxRetriesExceeded { .. }) => {
            warn!("max retries reached; no status recorded this cycle");
            return Ok(None);
        }
        Err(err) => return Err(err.into()),
    };
    let summary = record_user_snapshot(store, user, Utc::now());
    store.flush()?;
    Ok(Some(summary))
}

/// Everything a strategy needs to run one ingestion.
#[derive(Debug, Clone)]
pub struct StrategyContext {
    pub api: ApiConfig,
    pub data_dir: PathBuf,
    pub entity_id: Option<i64>,
    pub from: Option<i64>,
}

/// One `(primary entity, subtable)` ingestion, looked up through the
/// registry instead of hardcoded per-table dispatch.
#[async_trait]
pub trait IngestionStrategy: Send + Sync {
    fn primary_entity(&self) -> &'static str;
    fn subtable(&self) -> &'static str;
    async fn run(&self, ctx: StrategyContext) -> Result<()>;
}

pub struct FactionAttacksStrategy;

#[async_trait]
impl IngestionStrategy for FactionAttacksStrategy {
    fn primary_entity(&self) -> &'static str {
        "faction"
    }

    fn subtable(&self) -> &'static str {
        "attacks"
    }

    async fn run(&self, ctx: StrategyContext) -> Result<()> {
        let faction_id = ctx
            .entity_id
            .context("faction id is required for faction attacks ingestion")?;
        let client = TornClient::new(ctx.api)?;
        let source = FactionAttackSource::new(client, faction_id);
        let mut store = HarvestStore::open(&ctx.data_dir)?;
        let summary = ingest_attacks(&source, &mut store, ctx.from).await?;
        println!("{}", summary.render());
        Ok(())
    }
}

pub struct UserBasicStrategy;

#[async_trait]
impl IngestionStrategy for UserBasicStrategy {
    fn primary_entity(&self) -> &'static str {
        "user"
    }

    fn subtable(&self) -> &'static str {
        "basic"
    }

    async fn run(&self, ctx: StrategyContext) -> Result<()> {
        let client = TornClient::new(ctx.api)?;
        let mut store = HarvestStore::open(&ctx.data_dir)?;
        match ingest_user_once(&client, &mut store, ctx.entity_id).await? {
            Some(profile) => println!(
                "Updated profile for player {} ({}, level {}); status inventory: {}",
                profile.player_id, profile.latest_name, profile.latest_level, profile.status_inventory
            ),
            None => println!("No user data fetched this cycle."),
        }
        Ok(())
    }
}

pub fn registry() -> Vec<Box<dyn IngestionStrategy>> {
    vec![Box::new(FactionAttacksStrategy), Box::new(UserBasicStrategy)]
}

pub fn find_strategy(primary: &str, subtable: &str) -> Option<Box<dyn IngestionStrategy>> {
    registry()
        .into_iter()
        .find(|s| s.primary_entity() == primary && s.subtable() == subtable)
}
