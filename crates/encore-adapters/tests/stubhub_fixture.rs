//! The checked-in capture bundle must keep parsing the way the pipeline
//! expects; these run against the workspace fixture on disk.

use std::path::{Path, PathBuf};

use chrono::Utc;
use encore_adapters::{FixtureSource, ListingSource, RunContext};
use uuid::Uuid;

fn workspace_fixture() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .join("fixtures/stubhub/sample/bundle.json")
}

fn ctx() -> RunContext {
    RunContext {
        run_id: Uuid::new_v4(),
        fetched_at: Utc::now(),
    }
}

#[tokio::test]
async fn sample_capture_parses_into_raw_listings() {
    let source = FixtureSource::new(workspace_fixture());
    let records = source.fetch_listings(&ctx()).await.expect("fixture parses");

    assert_eq!(records.len(), 4);

    let hamilton = &records[0];
    assert_eq!(hamilton.title, "Hamilton Fri • Aug 29 • 7:00 PM");
    assert_eq!(hamilton.venue, "Richard Rodgers Theatre");
    assert_eq!(
        hamilton.url,
        "https://www.stubhub.com/hamilton-tickets-new-york-8-29-2026/event/104911407"
    );
    assert_eq!(hamilton.prices, vec!["$163"]);

    // The third card has an empty anchor text; the normalizer recovers the
    // title from the URL, so the raw record passes through untitled.
    assert_eq!(records[2].title, "");
    assert!(records[2]
        .url
        .contains("the-lion-king-tickets-new-york-8-30-2026"));
}

#[tokio::test]
async fn sample_capture_is_onsite_for_new_york() {
    let source = FixtureSource::new(workspace_fixture()).with_expected_location("new-york");
    let records = source
        .fetch_listings(&ctx())
        .await
        .expect("all fixture URLs carry the target slug");
    assert_eq!(records.len(), 4);
}
