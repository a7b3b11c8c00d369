//! Slack webhook notification: block formatting, size-bounded batching,
//! best-effort dispatch.

use std::time::Duration;

use anyhow::Context;
use encore_core::{ClassifiedListing, DealStatus};
use reqwest::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "encore-notify";

/// Slack hard-limits message payloads around 4000 characters; the default
/// ceiling leaves headroom for JSON scaffolding the estimate misses.
pub const DEFAULT_CEILING_CHARS: usize = 3500;

/// Estimated JSON scaffolding per section block beyond its text.
const SECTION_OVERHEAD: usize = 60;

/// Estimated header + context + divider cost charged to every batch.
const BATCH_OVERHEAD: usize = 250;

#[derive(Debug, Clone)]
pub struct NotifyConfig {
    /// Dispatch is enabled only when a webhook URL is present.
    pub webhook_url: Option<String>,
    pub ceiling_chars: usize,
    pub batch_delay: Duration,
    /// Notification-time price bounds, independent of the ingestion filter.
    pub min_price: Option<i64>,
    pub max_price: Option<i64>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            ceiling_chars: DEFAULT_CEILING_CHARS,
            batch_delay: Duration::from_millis(1000),
            min_price: None,
            max_price: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextObject {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub text: String,
}

impl TextObject {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            kind: "plain_text",
            text: text.into(),
        }
    }

    pub fn mrkdwn(text: impl Into<String>) -> Self {
        Self {
            kind: "mrkdwn",
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Header { text: TextObject },
    Context { elements: Vec<TextObject> },
    Section { text: TextObject },
    Divider,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookPayload {
    pub blocks: Vec<Block>,
}

#[derive(Debug, Error)]
enum DispatchError {
    #[error("webhook returned status {0}")]
    Http(StatusCode),
    #[error("webhook request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RetryDisposition {
    Retryable,
    NonRetryable,
}

fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// One listing rendered to its mrkdwn section text plus a size estimate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedDeal {
    pub url: String,
    pub text: String,
}

impl RenderedDeal {
    pub fn cost(&self) -> usize {
        self.text.chars().count() + SECTION_OVERHEAD
    }
}

/// Keep only the statuses worth telling anyone about.
pub fn select_noteworthy(classified: &[ClassifiedListing]) -> Vec<&ClassifiedListing> {
    classified
        .iter()
        .filter(|c| matches!(c.status, DealStatus::New | DealStatus::PriceDrop))
        .collect()
}

/// Notification-time price sub-filter. Listings outside the bounds stay in
/// the run report; they just do not go out over the webhook.
pub fn within_notify_bounds(deal: &ClassifiedListing, min: Option<i64>, max: Option<i64>) -> bool {
    let Some(cheapest) = deal.listing.cheapest_price() else {
        return false;
    };
    if min.is_some_and(|m| cheapest < m) {
        return false;
    }
    if max.is_some_and(|m| cheapest > m) {
        return false;
    }
    true
}

/// Render one deal to its message block text. Price-drop deals show the
/// previous price struck through.
pub fn render_deal(deal: &ClassifiedListing) -> RenderedDeal {
    let listing = &deal.listing;
    let when = if listing.time.is_empty() {
        listing.date.clone()
    } else {
        format!("{} {}", listing.date, listing.time)
    };

    let price_line = match (deal.status, deal.previous_price.as_deref()) {
        (DealStatus::PriceDrop, Some(previous)) => {
            format!("💰 ~{}~ → *{}*", previous, listing.price)
        }
        _ => format!("💰 *{}*", listing.price),
    };

    let text = format!(
        "*<{}|{}>*\n📍 {} — {}\n{}",
        listing.url, listing.title, listing.venue, when, price_line
    );

    RenderedDeal {
        url: listing.url.clone(),
        text,
    }
}

/// Pack rendered deals into batches whose estimated size stays under the
/// ceiling. Input order is preserved and every deal lands in exactly one
/// batch; a single deal too large for the ceiling gets a batch of its own.
pub fn plan_batches(rendered: Vec<RenderedDeal>, ceiling_chars: usize) -> Vec<Vec<RenderedDeal>> {
    let mut batches: Vec<Vec<RenderedDeal>> = Vec::new();
    let mut current: Vec<RenderedDeal> = Vec::new();
    let mut current_cost = BATCH_OVERHEAD;

    for deal in rendered {
        let cost = deal.cost();
        if !current.is_empty() && current_cost + cost > ceiling_chars {
            batches.push(std::mem::take(&mut current));
            current_cost = BATCH_OVERHEAD;
        }
        if current.is_empty() && BATCH_OVERHEAD + cost > ceiling_chars {
            warn!(url = %deal.url, "single listing exceeds batch ceiling, sending alone");
        }
        current_cost += cost;
        current.push(deal);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Assemble the webhook payload for one batch. The header is numbered
/// `i/N` only when the run needed more than one batch.
pub fn build_payload(
    batch: &[RenderedDeal],
    batch_index: usize,
    batch_count: usize,
    context_line: &str,
) -> WebhookPayload {
    let header = if batch_count > 1 {
        format!(
            "🎭 Last-minute ticket deals ({}/{})",
            batch_index + 1,
            batch_count
        )
    } else {
        "🎭 Last-minute ticket deals".to_string()
    };

    let mut blocks = vec![
        Block::Header {
            text: TextObject::plain(header),
        },
        Block::Context {
            elements: vec![TextObject::mrkdwn(context_line.to_string())],
        },
        Block::Divider,
    ];
    for deal in batch {
        blocks.push(Block::Section {
            text: TextObject::mrkdwn(deal.text.clone()),
        });
    }

    WebhookPayload { blocks }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotifyOutcome {
    pub selected: usize,
    pub filtered_out: usize,
    pub batches_sent: usize,
    pub batches_failed: usize,
}

pub struct WebhookNotifier {
    client: reqwest::Client,
    config: NotifyConfig,
    backoff: BackoffPolicy,
}

impl WebhookNotifier {
    pub fn new(config: NotifyConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("building webhook client")?;
        Ok(Self {
            client,
            config,
            backoff: BackoffPolicy::default(),
        })
    }

    /// Send the noteworthy deals. Dispatch failures are logged and counted,
    /// never propagated: a dead webhook must not stop the run from
    /// persisting its state.
    pub async fn dispatch(
        &self,
        classified: &[ClassifiedListing],
        context_line: &str,
    ) -> NotifyOutcome {
        let noteworthy = select_noteworthy(classified);
        let (kept, dropped): (Vec<_>, Vec<_>) = noteworthy
            .into_iter()
            .partition(|d| within_notify_bounds(d, self.config.min_price, self.config.max_price));

        for deal in &dropped {
            info!(
                url = %deal.listing.url,
                price = %deal.listing.price,
                "deal outside notification price bounds, report only"
            );
        }

        let mut outcome = NotifyOutcome {
            selected: kept.len(),
            filtered_out: dropped.len(),
            ..Default::default()
        };

        if kept.is_empty() {
            info!("no noteworthy deals to send");
            return outcome;
        }
        let Some(webhook_url) = self.config.webhook_url.as_deref() else {
            info!(deals = kept.len(), "webhook not configured, skipping dispatch");
            return outcome;
        };

        let rendered: Vec<RenderedDeal> = kept.iter().map(|d| render_deal(d)).collect();
        let batches = plan_batches(rendered, self.config.ceiling_chars);
        let batch_count = batches.len();

        for (i, batch) in batches.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.config.batch_delay).await;
            }
            let payload = build_payload(batch, i, batch_count, context_line);
            match self.post_with_retry(webhook_url, &payload).await {
                Ok(()) => {
                    info!(batch = i + 1, batch_count, deals = batch.len(), "batch delivered");
                    outcome.batches_sent += 1;
                }
                Err(err) => {
                    warn!(batch = i + 1, batch_count, %err, "batch delivery failed");
                    outcome.batches_failed += 1;
                }
            }
        }

        outcome
    }

    async fn post_with_retry(
        &self,
        webhook_url: &str,
        payload: &WebhookPayload,
    ) -> Result<(), DispatchError> {
        let mut last_err: Option<DispatchError> = None;

        for attempt in 0..=self.backoff.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.backoff.delay_for_attempt(attempt - 1)).await;
            }
            match self.client.post(webhook_url).json(payload).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(());
                    }
                    if classify_status(status) == RetryDisposition::NonRetryable {
                        return Err(DispatchError::Http(status));
                    }
                    last_err = Some(DispatchError::Http(status));
                }
                Err(err) => {
                    if !(err.is_timeout() || err.is_connect() || err.is_request()) {
                        return Err(DispatchError::Transport(err));
                    }
                    last_err = Some(DispatchError::Transport(err));
                }
            }
        }

        Err(last_err.expect("retry loop always records an error before exhausting"))
    }
}

/// Context line shown under every batch header.
pub fn context_line(location: &str, days_ahead: i64, ticket_quantity: u32) -> String {
    format!("{location} • next {days_ahead} days • {ticket_quantity} ticket(s)")
}

#[cfg(test)]
mod tests {
    use super::*;
    use encore_core::Listing;

    fn classified(url: &str, price: &str, status: DealStatus, previous: Option<&str>) -> ClassifiedListing {
        ClassifiedListing {
            listing: Listing::new(
                "Hamilton",
                "Richard Rodgers Theatre",
                "Fri, Aug 29",
                "7:00 PM",
                url,
                &[price.to_string()],
            ),
            status,
            previous_price: previous.map(str::to_string),
        }
    }

    #[test]
    fn selects_only_new_and_price_drop() {
        let deals = vec![
            classified("u1", "$50", DealStatus::New, None),
            classified("u2", "$40", DealStatus::PriceDrop, Some("$50")),
            classified("u3", "$40", DealStatus::NoChange, Some("$40")),
            classified("u4", "$90", DealStatus::PriceIncrease, Some("$40")),
        ];
        let selected = select_noteworthy(&deals);
        let urls: Vec<_> = selected.iter().map(|d| d.listing.url.as_str()).collect();
        assert_eq!(urls, vec!["u1", "u2"]);
    }

    #[test]
    fn price_drop_renders_previous_price_struck_through() {
        let deal = classified("u1", "$40", DealStatus::PriceDrop, Some("$50"));
        let rendered = render_deal(&deal);
        assert!(rendered.text.contains("~$50~ → *$40*"));
        assert!(rendered.text.contains("<u1|Hamilton>"));
    }

    #[test]
    fn new_deal_renders_current_price_only() {
        let deal = classified("u1", "$40", DealStatus::New, None);
        let rendered = render_deal(&deal);
        assert!(rendered.text.contains("💰 *$40*"));
        assert!(!rendered.text.contains('~'));
    }

    #[test]
    fn batches_stay_under_ceiling_and_cover_input_exactly() {
        let rendered: Vec<RenderedDeal> = (0..40)
            .map(|i| RenderedDeal {
                url: format!("u{i}"),
                text: "x".repeat(150),
            })
            .collect();
        let expected_urls: Vec<String> = rendered.iter().map(|r| r.url.clone()).collect();

        let ceiling = 1000;
        let batches = plan_batches(rendered, ceiling);
        assert!(batches.len() > 1);

        let mut seen = Vec::new();
        for batch in &batches {
            let cost: usize = BATCH_OVERHEAD + batch.iter().map(RenderedDeal::cost).sum::<usize>();
            assert!(cost <= ceiling, "batch cost {cost} exceeds ceiling");
            seen.extend(batch.iter().map(|r| r.url.clone()));
        }
        assert_eq!(seen, expected_urls);
    }

    #[test]
    fn oversized_single_deal_gets_its_own_batch() {
        let rendered = vec![RenderedDeal {
            url: "u1".into(),
            text: "x".repeat(5000),
        }];
        let batches = plan_batches(rendered, 1000);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
    }

    #[test]
    fn header_is_numbered_only_with_multiple_batches() {
        let batch = vec![RenderedDeal {
            url: "u1".into(),
            text: "deal".into(),
        }];

        let single = build_payload(&batch, 0, 1, "ctx");
        let Block::Header { text } = &single.blocks[0] else {
            panic!("first block must be the header");
        };
        assert_eq!(text.text, "🎭 Last-minute ticket deals");

        let second_of_three = build_payload(&batch, 1, 3, "ctx");
        let Block::Header { text } = &second_of_three.blocks[0] else {
            panic!("first block must be the header");
        };
        assert_eq!(text.text, "🎭 Last-minute ticket deals (2/3)");
    }

    #[test]
    fn payload_serializes_to_slack_block_kit_shape() {
        let batch = vec![RenderedDeal {
            url: "u1".into(),
            text: "deal text".into(),
        }];
        let payload = build_payload(&batch, 0, 1, "New York • next 3 days • 2 ticket(s)");
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["blocks"][0]["type"], "header");
        assert_eq!(json["blocks"][0]["text"]["type"], "plain_text");
        assert_eq!(json["blocks"][1]["type"], "context");
        assert_eq!(json["blocks"][2]["type"], "divider");
        assert_eq!(json["blocks"][3]["type"], "section");
        assert_eq!(json["blocks"][3]["text"]["type"], "mrkdwn");
        assert_eq!(json["blocks"][3]["text"]["text"], "deal text");
    }

    #[test]
    fn notify_bounds_exclude_unpriced_and_out_of_range() {
        let cheap = classified("u1", "$5", DealStatus::New, None);
        let fine = classified("u2", "$50", DealStatus::New, None);
        let dear = classified("u3", "$500", DealStatus::New, None);
        let unpriced = classified("u4", "garbage", DealStatus::New, None);

        assert!(!within_notify_bounds(&cheap, Some(10), Some(100)));
        assert!(within_notify_bounds(&fine, Some(10), Some(100)));
        assert!(!within_notify_bounds(&dear, Some(10), Some(100)));
        assert!(!within_notify_bounds(&unpriced, None, None));
        assert!(within_notify_bounds(&dear, Some(10), None));
    }

    #[tokio::test]
    async fn dispatch_without_webhook_is_a_logged_no_op() {
        let notifier = WebhookNotifier::new(NotifyConfig::default()).unwrap();
        let deals = vec![classified("u1", "$50", DealStatus::New, None)];
        let outcome = notifier.dispatch(&deals, "ctx").await;
        assert_eq!(outcome.selected, 1);
        assert_eq!(outcome.batches_sent, 0);
        assert_eq!(outcome.batches_failed, 0);
    }

    #[tokio::test]
    async fn dispatch_with_nothing_noteworthy_makes_no_batches() {
        let notifier = WebhookNotifier::new(NotifyConfig {
            webhook_url: Some("http://127.0.0.1:1/webhook".into()),
            ..Default::default()
        })
        .unwrap();
        let deals = vec![classified("u1", "$50", DealStatus::NoChange, Some("$50"))];
        let outcome = notifier.dispatch(&deals, "ctx").await;
        assert_eq!(outcome.selected, 0);
        assert_eq!(outcome.batches_sent + outcome.batches_failed, 0);
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
    }
}
