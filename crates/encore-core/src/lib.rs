//! Core domain model for Encore: listings, classifications, persisted state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "encore-core";

/// Shown when a scrape yielded no usable price for a listing.
pub const PRICE_UNAVAILABLE: &str = "unavailable";

/// Shown when the source page carried no venue for a listing.
pub const VENUE_UNSPECIFIED: &str = "unspecified";

/// How many of the cheapest observed prices a listing keeps.
pub const MAX_TRACKED_PRICES: usize = 3;

/// Raw extractor output, straight off the page. Fields may be empty or messy;
/// the normalizer decides what survives.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawListing {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub venue: String,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub price: String,
    #[serde(default)]
    pub url: String,
    /// Every price string observed for this listing, in page order.
    #[serde(default)]
    pub prices: Vec<String>,
}

/// One canonical ticket-sale opportunity. `url` is the diff key and is unique
/// within a single run's batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub title: String,
    pub venue: String,
    pub date: String,
    pub time: String,
    /// Display price; equals `prices[0]` whenever `prices` is non-empty.
    pub price: String,
    /// Cheapest observed prices, ascending, at most [`MAX_TRACKED_PRICES`],
    /// each formatted like `$1,234`.
    pub prices: Vec<String>,
    pub url: String,
}

impl Listing {
    /// Build a listing from raw parts, establishing the price invariants:
    /// zero and unparseable entries are dropped, the rest are sorted
    /// ascending, truncated to the cheapest [`MAX_TRACKED_PRICES`] and
    /// re-formatted, and `price` mirrors the cheapest one.
    pub fn new(
        title: impl Into<String>,
        venue: impl Into<String>,
        date: impl Into<String>,
        time: impl Into<String>,
        url: impl Into<String>,
        raw_prices: &[String],
    ) -> Self {
        let mut values: Vec<i64> = raw_prices
            .iter()
            .filter_map(|p| parse_price(p))
            .filter(|v| *v > 0)
            .collect();
        values.sort_unstable();
        values.truncate(MAX_TRACKED_PRICES);

        let prices: Vec<String> = values.iter().map(|v| format_price(*v)).collect();
        let price = prices
            .first()
            .cloned()
            .unwrap_or_else(|| PRICE_UNAVAILABLE.to_string());

        let venue = venue.into();
        let venue = if venue.trim().is_empty() {
            VENUE_UNSPECIFIED.to_string()
        } else {
            venue
        };

        Self {
            title: title.into(),
            venue,
            date: date.into(),
            time: time.into(),
            price,
            prices,
            url: url.into(),
        }
    }

    /// Numeric value of the cheapest price, or `None` when no usable price
    /// was captured.
    pub fn cheapest_price(&self) -> Option<i64> {
        self.prices.first().and_then(|p| parse_price(p))
    }
}

/// Diff outcome for one listing relative to the previous run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DealStatus {
    New,
    PriceDrop,
    NoChange,
    PriceIncrease,
}

/// A listing plus its diff status. Assigned exactly once per run and never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedListing {
    #[serde(flatten)]
    pub listing: Listing,
    pub status: DealStatus,
    /// Previous run's display price; only present when `status != new`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_price: Option<String>,
}

/// On-disk record of the most recent successful run, the diff baseline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub last_run: DateTime<Utc>,
    pub deals: Vec<Listing>,
}

/// Parse a currency-formatted price string to its integer dollar value.
///
/// Strips a leading `$` and embedded commas, then takes the leading digit
/// run, so `"$1,234"` -> `1234` and `"From $63"` -> `None` only if nothing
/// numeric leads after stripping -- callers strip prefixes first. Returns
/// `None` for text with no leading digits.
pub fn parse_price(text: &str) -> Option<i64> {
    let cleaned = text.trim().trim_start_matches('$').replace(',', "");
    let digits: String = cleaned.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Format an integer dollar value as `$1,234`.
pub fn format_price(value: i64) -> String {
    let digits = value.abs().to_string();
    let mut grouped = String::new();
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    if value < 0 {
        format!("-${grouped}")
    } else {
        format!("${grouped}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_currency_formatted_prices() {
        assert_eq!(parse_price("$50"), Some(50));
        assert_eq!(parse_price("$1,234"), Some(1234));
        assert_eq!(parse_price("  $88  "), Some(88));
        assert_eq!(parse_price("$5.50"), Some(5));
        assert_eq!(parse_price("$0"), Some(0));
        assert_eq!(parse_price("sold out"), None);
        assert_eq!(parse_price(""), None);
    }

    #[test]
    fn formats_with_thousands_separators() {
        assert_eq!(format_price(5), "$5");
        assert_eq!(format_price(999), "$999");
        assert_eq!(format_price(1234), "$1,234");
        assert_eq!(format_price(1234567), "$1,234,567");
    }

    #[test]
    fn listing_prices_are_ascending_and_truncated() {
        let raw = vec![
            "$120".to_string(),
            "$45".to_string(),
            "garbage".to_string(),
            "$0".to_string(),
            "$99".to_string(),
            "$46".to_string(),
        ];
        let listing = Listing::new("Show", "Venue", "Fri, Aug 29", "7:30 PM", "u1", &raw);
        assert_eq!(listing.prices, vec!["$45", "$46", "$99"]);
        assert_eq!(listing.price, "$45");
        assert_eq!(listing.cheapest_price(), Some(45));
    }

    #[test]
    fn listing_without_usable_prices_gets_sentinel() {
        let listing = Listing::new("Show", "", "Fri, Aug 29", "", "u1", &["$0".to_string()]);
        assert!(listing.prices.is_empty());
        assert_eq!(listing.price, PRICE_UNAVAILABLE);
        assert_eq!(listing.venue, VENUE_UNSPECIFIED);
        assert_eq!(listing.cheapest_price(), None);
    }

    #[test]
    fn deal_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&DealStatus::PriceDrop).unwrap(),
            "\"price_drop\""
        );
        assert_eq!(serde_json::to_string(&DealStatus::New).unwrap(), "\"new\"");
    }

    #[test]
    fn persisted_state_uses_camel_case_keys() {
        let state = PersistedState {
            last_run: "2026-08-29T12:00:00Z".parse().unwrap(),
            deals: vec![],
        };
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"lastRun\""));
        assert!(json.contains("\"deals\""));
    }
}
