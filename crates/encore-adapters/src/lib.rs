//! Extractor boundary: listing source contract + fixture-first sources.
//!
//! The live browser scraper is a separate, deliberately brittle collaborator.
//! This crate fixes its output contract (`RawListing` batches) and ships a
//! fixture-backed source so the pipeline can run and be tested against
//! captured pages.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use encore_core::RawListing;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "encore-adapters";

/// Majority threshold for the wrong-geography sanity check.
const OFFSITE_FATAL_FRACTION: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

/// Extraction-phase failures. Every variant is fatal to the run: the
/// orchestrator aborts before any state write so a bad scrape can never
/// poison the diff baseline. Losses scoped to a single listing are handled
/// inside sources and surface as empty `prices`, never as an error.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },
    #[error("no listings found at {url} where a non-empty page was expected")]
    NoListings { url: String },
    #[error("wrong geography: {offsite_fraction:.2} of listings point outside the target area")]
    WrongGeography { offsite_fraction: f64 },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[async_trait]
pub trait ListingSource: Send + Sync {
    fn source_id(&self) -> &str;

    /// Produce one run's raw listing batch. Per-listing price lookups by a
    /// real implementation are sequential with a fixed inter-request delay;
    /// a failed lookup records an empty price list for that listing only.
    async fn fetch_listings(&self, ctx: &RunContext) -> Result<Vec<RawListing>, SourceError>;
}

/// Captured page bundle: pre-parsed records plus, optionally, the raw
/// search-results HTML the capture came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureBundle {
    pub source_id: String,
    pub captured_from_url: String,
    pub base_url: String,
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub records: Vec<RawListing>,
    #[serde(default)]
    pub raw_html: RawHtml,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawHtml {
    /// Path relative to the bundle file.
    pub path: Option<String>,
    pub inline_text: Option<String>,
}

pub fn load_capture_bundle(path: impl AsRef<Path>) -> Result<CaptureBundle> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let mut bundle: CaptureBundle =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    hydrate_inline_html(path, &mut bundle)?;
    Ok(bundle)
}

fn hydrate_inline_html(bundle_path: &Path, bundle: &mut CaptureBundle) -> Result<()> {
    if bundle.raw_html.inline_text.is_some() {
        return Ok(());
    }
    let Some(rel_path) = &bundle.raw_html.path else {
        return Ok(());
    };
    let html_path = bundle_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(rel_path);
    if !html_path.exists() {
        return Ok(());
    }
    let raw = fs::read_to_string(&html_path)
        .with_context(|| format!("reading captured page {}", html_path.display()))?;
    bundle.raw_html.inline_text = Some(raw);
    Ok(())
}

/// Pull the `$`-prefixed fragment out of price text like `"From $63"`.
fn price_fragment(text: &str) -> Option<String> {
    let start = text.find('$')?;
    let fragment: String = text[start..]
        .chars()
        .take_while(|c| *c == '$' || c.is_ascii_digit() || *c == ',')
        .collect();
    if fragment.len() > 1 {
        Some(fragment)
    } else {
        None
    }
}

fn select_text(card: scraper::ElementRef<'_>, selector: &Selector) -> String {
    card.select(selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .unwrap_or_default()
}

/// Parse event cards out of a captured search-results page.
///
/// Cards missing an href are dropped here; everything else is passed through
/// raw and left for the normalizer to judge.
pub fn parse_listing_page(html: &str, base_url: &str) -> Vec<RawListing> {
    let card_sel = Selector::parse("li.event-row").expect("static selector");
    let link_sel = Selector::parse("a.event-link").expect("static selector");
    let title_sel = Selector::parse(".event-title").expect("static selector");
    let venue_sel = Selector::parse(".event-venue").expect("static selector");
    let date_sel = Selector::parse(".event-date").expect("static selector");
    let time_sel = Selector::parse(".event-time").expect("static selector");
    let price_sel = Selector::parse(".event-price").expect("static selector");

    let document = Html::parse_document(html);
    let mut records = Vec::new();

    for card in document.select(&card_sel) {
        let Some(href) = card
            .select(&link_sel)
            .next()
            .and_then(|a| a.value().attr("href"))
        else {
            continue;
        };
        let url = if href.starts_with("http") {
            href.to_string()
        } else {
            format!("{base_url}{href}")
        };

        let price_text = select_text(card, &price_sel);
        let price = price_fragment(&price_text).unwrap_or_default();
        let prices = if price.is_empty() {
            Vec::new()
        } else {
            vec![price.clone()]
        };

        records.push(RawListing {
            title: select_text(card, &title_sel),
            venue: select_text(card, &venue_sel),
            date: select_text(card, &date_sel),
            time: select_text(card, &time_sel),
            price,
            url,
            prices,
        });
    }

    records
}

/// Listing source backed by a captured page bundle.
#[derive(Debug, Clone)]
pub struct FixtureSource {
    bundle_path: PathBuf,
    /// URL slug the target city's event pages carry, e.g. `new-york`.
    expected_location_slug: Option<String>,
}

impl FixtureSource {
    pub fn new(bundle_path: impl Into<PathBuf>) -> Self {
        Self {
            bundle_path: bundle_path.into(),
            expected_location_slug: None,
        }
    }

    pub fn with_expected_location(mut self, slug: impl Into<String>) -> Self {
        self.expected_location_slug = Some(slug.into());
        self
    }
}

#[async_trait]
impl ListingSource for FixtureSource {
    fn source_id(&self) -> &str {
        "fixture"
    }

    async fn fetch_listings(&self, _ctx: &RunContext) -> Result<Vec<RawListing>, SourceError> {
        let bundle = load_capture_bundle(&self.bundle_path)?;

        let mut records = bundle.records;
        if let Some(html) = &bundle.raw_html.inline_text {
            for parsed in parse_listing_page(html, &bundle.base_url) {
                if !records.iter().any(|r| r.url == parsed.url) {
                    records.push(parsed);
                }
            }
        }

        if records.is_empty() {
            return Err(SourceError::NoListings {
                url: bundle.captured_from_url,
            });
        }

        if let Some(slug) = &self.expected_location_slug {
            let offsite = records
                .iter()
                .filter(|r| !r.url.to_lowercase().contains(&slug.to_lowercase()))
                .count();
            let offsite_fraction = offsite as f64 / records.len() as f64;
            if offsite_fraction > OFFSITE_FATAL_FRACTION {
                return Err(SourceError::WrongGeography { offsite_fraction });
            }
        }

        Ok(records)
    }
}
