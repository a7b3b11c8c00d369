//! Run orchestration: normalize scraped listings, diff against the previous
//! run, notify, and persist.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Duration, Local, NaiveDate, NaiveDateTime, Utc};
use encore_adapters::{ListingSource, RunContext, SourceError};
use encore_core::{parse_price, ClassifiedListing, DealStatus, Listing, PersistedState, RawListing};
use encore_notify::{context_line, NotifyConfig, NotifyOutcome, WebhookNotifier};
use encore_storage::{ArtifactStore, StateStore};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "encore-sync";

/// Immutable run configuration, built once at process start and passed
/// explicitly into every component. Nothing below reads the environment.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Display label for the target city, e.g. "New York".
    pub location: String,
    pub days_ahead: i64,
    /// Display-only context for notifications; never affects filtering.
    pub ticket_quantity: u32,
    /// Bypasses every normalizer filter. Diagnostic use only.
    pub debug: bool,
    /// Ingestion-time price bounds, inclusive. Either side may be open.
    pub min_price: Option<i64>,
    pub max_price: Option<i64>,
    /// Notification-time price bounds, independent of the ingestion pair.
    pub notify_min_price: Option<i64>,
    pub notify_max_price: Option<i64>,
    pub webhook_url: Option<String>,
    pub state_file: PathBuf,
    pub reports_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub filters_file: PathBuf,
    pub capture_bundle: PathBuf,
    pub watch_cron: String,
    pub batch_delay_ms: u64,
    pub batch_ceiling_chars: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            location: "New York".to_string(),
            days_ahead: 3,
            ticket_quantity: 2,
            debug: false,
            min_price: None,
            max_price: None,
            notify_min_price: None,
            notify_max_price: None,
            webhook_url: None,
            state_file: PathBuf::from("./state/previous_deals.json"),
            reports_dir: PathBuf::from("./reports"),
            artifacts_dir: PathBuf::from("./artifacts"),
            filters_file: PathBuf::from("./filters.yaml"),
            capture_bundle: PathBuf::from("./fixtures/stubhub/sample/bundle.json"),
            watch_cron: "0 0 * * * *".to_string(),
            batch_delay_ms: 1000,
            batch_ceiling_chars: encore_notify::DEFAULT_CEILING_CHARS,
        }
    }
}

impl WatchConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let opt_price = |key: &str| std::env::var(key).ok().and_then(|v| v.parse::<i64>().ok());
        Self {
            location: std::env::var("ENCORE_LOCATION").unwrap_or(defaults.location),
            days_ahead: std::env::var("ENCORE_DAYS_AHEAD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.days_ahead),
            ticket_quantity: std::env::var("ENCORE_TICKET_QUANTITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.ticket_quantity),
            debug: std::env::var("ENCORE_DEBUG")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            min_price: opt_price("ENCORE_MIN_PRICE"),
            max_price: opt_price("ENCORE_MAX_PRICE"),
            notify_min_price: opt_price("ENCORE_NOTIFY_MIN_PRICE"),
            notify_max_price: opt_price("ENCORE_NOTIFY_MAX_PRICE"),
            webhook_url: std::env::var("SLACK_WEBHOOK_URL").ok(),
            state_file: std::env::var("ENCORE_STATE_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.state_file),
            reports_dir: std::env::var("ENCORE_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
            artifacts_dir: std::env::var("ENCORE_ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.artifacts_dir),
            filters_file: std::env::var("ENCORE_FILTERS_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.filters_file),
            capture_bundle: std::env::var("ENCORE_BUNDLE")
                .map(PathBuf::from)
                .unwrap_or(defaults.capture_bundle),
            watch_cron: std::env::var("ENCORE_WATCH_CRON").unwrap_or(defaults.watch_cron),
            batch_delay_ms: std::env::var("ENCORE_BATCH_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.batch_delay_ms),
            batch_ceiling_chars: std::env::var("ENCORE_BATCH_CEILING")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.batch_ceiling_chars),
        }
    }

    /// Slug the target city's event URLs carry, e.g. `new-york`.
    pub fn location_slug(&self) -> String {
        self.location
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect::<String>()
            .split('-')
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("-")
    }
}

/// Title exclusion lists, loaded from `filters.yaml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FilterRules {
    #[serde(default)]
    #[allow(dead_code)]
    pub version: u32,
    #[serde(default)]
    pub exclude_keywords: Vec<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

/// A missing rules file just means no exclusions; a present-but-broken one
/// is a configuration error worth failing on.
pub fn load_filter_rules(path: &Path) -> Result<FilterRules> {
    if !path.exists() {
        info!(path = %path.display(), "no filters file, running without title exclusions");
        return Ok(FilterRules::default());
    }
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

// --- Title cleanup -------------------------------------------------------

// The scraper sometimes leaves the schedule fragment ("Fri • Aug 29 •
// 7:00 PM") and a "#12" row index embedded in the anchor text.
static TRAILING_SCHEDULE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\s*\b(?:mon|tues?|wed(?:nes)?|thur?s?|fri|sat(?:ur)?|sun)(?:day)?\b\s*•.*$")
        .expect("static regex")
});
static TRAILING_INDEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*#\d+\s*$").expect("static regex"));

/// Strip embedded schedule/index suffixes. Returns `None` when nothing
/// usable remains.
pub fn clean_title(raw: &str) -> Option<String> {
    let stripped = TRAILING_INDEX.replace(raw, "");
    let stripped = TRAILING_SCHEDULE.replace(&stripped, "");
    let cleaned = stripped.trim();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

/// Recover a title from the event URL's `*-tickets-*` path segment,
/// Title-Casing the hyphenated words before `-tickets`.
pub fn title_from_url(url: &str) -> Option<String> {
    let segment = url
        .split('/')
        .filter(|s| !s.is_empty())
        .filter(|s| s.contains("-tickets-"))
        .next_back()?;
    let name = segment.split("-tickets-").next()?;
    let words: Vec<String> = name
        .split('-')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect();
    if words.is_empty() {
        None
    } else {
        Some(words.join(" "))
    }
}

// --- Date window ---------------------------------------------------------

fn month_from_token(token: &str) -> Option<u32> {
    const MONTHS: [&str; 12] = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ];
    MONTHS
        .iter()
        .position(|m| token.starts_with(m))
        .map(|i| i as u32 + 1)
}

/// Best-effort parse of free-text event dates like "Fri, Aug 29" or
/// "Saturday • Aug 30". Assumes the current year; a date already in the
/// past is taken to mean next year.
pub fn parse_event_date(text: &str, today: NaiveDate) -> Option<NaiveDate> {
    let lower = text.to_lowercase();
    if lower.contains("today") {
        return Some(today);
    }

    let tokens: Vec<&str> = lower
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();

    let month_idx = tokens.iter().position(|t| month_from_token(t).is_some())?;
    let month = month_from_token(tokens[month_idx])?;

    let day = tokens[month_idx + 1..]
        .iter()
        .chain(tokens[..month_idx].iter())
        .find_map(|t| t.parse::<u32>().ok().filter(|d| (1..=31).contains(d)))?;

    let date = NaiveDate::from_ymd_opt(today.year(), month, day)?;
    if date < today {
        NaiveDate::from_ymd_opt(today.year() + 1, month, day)
    } else {
        Some(date)
    }
}

/// Date-window inclusion: keep a listing only when its date text parses and
/// the event's end of day falls at or before `now + days_ahead` days.
/// Unparseable or absent dates are excluded (fail-closed).
pub fn within_window(date_text: &str, now: NaiveDateTime, days_ahead: i64) -> bool {
    let Some(date) = parse_event_date(date_text, now.date()) else {
        return false;
    };
    let Some(end_of_day) = date.and_hms_opt(23, 59, 59) else {
        return false;
    };
    date == now.date() || end_of_day <= now + Duration::days(days_ahead)
}

// --- Title exclusion filters ---------------------------------------------

/// Case-insensitive regex match with a literal-substring fallback when the
/// pattern is not valid regex syntax.
pub fn pattern_matches(pattern: &str, text: &str) -> bool {
    match RegexBuilder::new(pattern).case_insensitive(true).build() {
        Ok(re) => re.is_match(text),
        Err(_) => text.to_lowercase().contains(&pattern.to_lowercase()),
    }
}

fn title_excluded(title: &str, rules: &FilterRules) -> bool {
    let lower = title.to_lowercase();
    if rules
        .exclude_keywords
        .iter()
        .any(|k| lower.contains(&k.to_lowercase()))
    {
        return true;
    }
    rules
        .exclude_patterns
        .iter()
        .any(|p| pattern_matches(p, &lower))
}

// --- Normalizer ----------------------------------------------------------

/// Turn one raw extractor batch into canonical listings.
///
/// Malformed records (no URL, no recoverable title) are skipped. Duplicate
/// URLs keep the first occurrence so the batch satisfies the uniqueness
/// invariant. In debug mode every normalized listing is returned with all
/// filters bypassed.
pub fn normalize_batch(
    raws: &[RawListing],
    config: &WatchConfig,
    rules: &FilterRules,
    now: NaiveDateTime,
) -> Vec<Listing> {
    let mut seen_urls: HashSet<String> = HashSet::new();
    let mut listings = Vec::new();

    for raw in raws {
        if raw.url.trim().is_empty() {
            warn!(title = %raw.title, "skipping listing without a URL");
            continue;
        }
        if !seen_urls.insert(raw.url.clone()) {
            warn!(url = %raw.url, "skipping duplicate listing URL");
            continue;
        }

        let Some(title) = clean_title(&raw.title).or_else(|| title_from_url(&raw.url)) else {
            warn!(url = %raw.url, "skipping listing with no recoverable title");
            continue;
        };

        let raw_prices = if raw.prices.is_empty() && !raw.price.is_empty() {
            std::slice::from_ref(&raw.price)
        } else {
            raw.prices.as_slice()
        };
        let listing = Listing::new(title, &raw.venue, &raw.date, &raw.time, &raw.url, raw_prices);

        if config.debug {
            listings.push(listing);
            continue;
        }

        if !within_window(&listing.date, now, config.days_ahead) {
            continue;
        }
        if title_excluded(&listing.title, rules) {
            continue;
        }
        let Some(cheapest) = listing.cheapest_price() else {
            continue;
        };
        if config.min_price.is_some_and(|m| cheapest < m) {
            continue;
        }
        if config.max_price.is_some_and(|m| cheapest > m) {
            continue;
        }

        listings.push(listing);
    }

    listings
}

// --- Diff engine ---------------------------------------------------------

/// Classify the current batch against the previous run.
///
/// Pure and order-preserving with respect to `current`. A cheapest price of
/// `$0` or one that fails to parse counts as "no price data" on either
/// side, which forces `no_change`: a parsing failure must never manufacture
/// a price-drop alert.
pub fn classify(current: &[Listing], previous: Option<&PersistedState>) -> Vec<ClassifiedListing> {
    let prior: HashMap<&str, &Listing> = previous
        .map(|state| {
            state
                .deals
                .iter()
                .map(|deal| (deal.url.as_str(), deal))
                .collect()
        })
        .unwrap_or_default();

    current
        .iter()
        .map(|listing| {
            let Some(prev) = prior.get(listing.url.as_str()) else {
                return ClassifiedListing {
                    listing: listing.clone(),
                    status: DealStatus::New,
                    previous_price: None,
                };
            };

            let current_value = listing
                .prices
                .first()
                .and_then(|p| parse_price(p))
                .unwrap_or(0);
            let previous_value = prev
                .prices
                .first()
                .and_then(|p| parse_price(p))
                .unwrap_or(0);

            // Can't compare prices when either side is unknown.
            let status = if current_value == 0 || previous_value == 0 {
                DealStatus::NoChange
            } else if current_value < previous_value {
                DealStatus::PriceDrop
            } else if current_value > previous_value {
                DealStatus::PriceIncrease
            } else {
                DealStatus::NoChange
            };

            ClassifiedListing {
                listing: listing.clone(),
                status,
                previous_price: Some(prev.price.clone()),
            }
        })
        .collect()
}

// --- Run report ----------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub timestamp: DateTime<Utc>,
    pub location: String,
    pub days_ahead: i64,
    pub ticket_quantity: u32,
    pub total_deals: usize,
    pub new_deals: usize,
    pub price_drops: usize,
    pub deals: Vec<ReportDeal>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportDeal {
    pub title: String,
    pub venue: String,
    pub date: String,
    pub time: String,
    pub current_price: String,
    pub previous_price: Option<String>,
    pub all_prices: Vec<String>,
    pub url: String,
    pub status: DealStatus,
}

pub fn build_report(config: &WatchConfig, classified: &[ClassifiedListing]) -> RunReport {
    let new_deals = classified
        .iter()
        .filter(|c| c.status == DealStatus::New)
        .count();
    let price_drops = classified
        .iter()
        .filter(|c| c.status == DealStatus::PriceDrop)
        .count();

    RunReport {
        timestamp: Utc::now(),
        location: config.location.clone(),
        days_ahead: config.days_ahead,
        ticket_quantity: config.ticket_quantity,
        total_deals: classified.len(),
        new_deals,
        price_drops,
        deals: classified
            .iter()
            .map(|c| ReportDeal {
                title: c.listing.title.clone(),
                venue: c.listing.venue.clone(),
                date: c.listing.date.clone(),
                time: c.listing.time.clone(),
                current_price: c.listing.price.clone(),
                previous_price: c.previous_price.clone(),
                all_prices: c.listing.prices.clone(),
                url: c.listing.url.clone(),
                status: c.status,
            })
            .collect(),
    }
}

async fn write_report(reports_dir: &Path, run_id: Uuid, report: &RunReport) -> Result<PathBuf> {
    let run_dir = reports_dir.join(run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;
    let path = run_dir.join("deals_report.json");
    let bytes = serde_json::to_vec_pretty(report).context("serializing run report")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

// --- Pipeline ------------------------------------------------------------

/// Only extraction-phase failures abort a run; every later stage absorbs
/// its errors so the report and state write stay as complete as possible.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("extraction failed: {0}")]
    Extraction(#[from] SourceError),
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub raw_count: usize,
    pub kept: usize,
    pub new_deals: usize,
    pub price_drops: usize,
    pub batches_sent: usize,
    pub batches_failed: usize,
    pub report_path: Option<String>,
}

pub struct Pipeline {
    config: WatchConfig,
    rules: FilterRules,
    state: StateStore,
    artifacts: ArtifactStore,
    notifier: WebhookNotifier,
}

impl Pipeline {
    pub fn new(config: WatchConfig) -> Result<Self> {
        let rules = load_filter_rules(&config.filters_file)?;
        let state = StateStore::new(config.state_file.clone());
        let artifacts = ArtifactStore::new(config.artifacts_dir.clone());
        let notifier = WebhookNotifier::new(NotifyConfig {
            webhook_url: config.webhook_url.clone(),
            ceiling_chars: config.batch_ceiling_chars,
            batch_delay: std::time::Duration::from_millis(config.batch_delay_ms),
            min_price: config.notify_min_price,
            max_price: config.notify_max_price,
        })?;
        Ok(Self {
            config,
            rules,
            state,
            artifacts,
            notifier,
        })
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    /// Fetch, archive and normalize one batch. Shared by the one-time
    /// console report and the full pipeline.
    pub async fn collect_listings(
        &self,
        source: &dyn ListingSource,
        ctx: &RunContext,
    ) -> Result<(Vec<RawListing>, Vec<Listing>), PipelineError> {
        let raws = source.fetch_listings(ctx).await?;
        info!(count = raws.len(), source = source.source_id(), "fetched raw listings");

        if let Err(err) = self
            .artifacts
            .store_raw_batch(ctx.fetched_at, source.source_id(), &raws)
            .await
        {
            warn!(%err, "could not archive raw batch, continuing");
        }

        let now = Local::now().naive_local();
        let listings = normalize_batch(&raws, &self.config, &self.rules, now);
        info!(
            kept = listings.len(),
            dropped = raws.len().saturating_sub(listings.len()),
            "normalized batch"
        );
        Ok((raws, listings))
    }

    /// One full run: fetch -> normalize -> diff -> notify -> report ->
    /// persist. State is only written after everything else has had its
    /// chance, and never when extraction itself failed.
    pub async fn run_once(&self, source: &dyn ListingSource) -> Result<RunSummary, PipelineError> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let ctx = RunContext {
            run_id,
            fetched_at: started_at,
        };
        info!(%run_id, location = %self.config.location, "starting run");

        let (raws, listings) = self.collect_listings(source, &ctx).await?;

        let previous = self.state.load().await;
        let classified = classify(&listings, previous.as_ref());

        let line = context_line(
            &self.config.location,
            self.config.days_ahead,
            self.config.ticket_quantity,
        );
        let outcome: NotifyOutcome = self.notifier.dispatch(&classified, &line).await;

        let report = build_report(&self.config, &classified);
        let report_path = match write_report(&self.config.reports_dir, run_id, &report).await {
            Ok(path) => Some(path.display().to_string()),
            Err(err) => {
                error!(%err, "could not write run report");
                None
            }
        };

        if let Err(err) = self.state.save(&listings).await {
            error!(%err, "could not persist run state, next run will re-report");
        }

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            raw_count: raws.len(),
            kept: listings.len(),
            new_deals: report.new_deals,
            price_drops: report.price_drops,
            batches_sent: outcome.batches_sent,
            batches_failed: outcome.batches_failed,
            report_path,
        };
        info!(
            kept = summary.kept,
            new_deals = summary.new_deals,
            price_drops = summary.price_drops,
            batches_sent = summary.batches_sent,
            "run finished"
        );
        Ok(summary)
    }
}

/// Built-in scheduler for `watch` mode; external cron triggering `run`
/// remains the primary deployment shape.
pub async fn build_scheduler(
    pipeline: Arc<Pipeline>,
    source: Arc<dyn ListingSource>,
) -> Result<JobScheduler> {
    let cron = pipeline.config().watch_cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let pipeline = pipeline.clone();
        let source = source.clone();
        Box::pin(async move {
            match pipeline.run_once(source.as_ref()).await {
                Ok(summary) => info!(run_id = %summary.run_id, kept = summary.kept, "scheduled run finished"),
                Err(err) => error!(%err, "scheduled run failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}
