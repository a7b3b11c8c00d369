//! End-to-end pipeline runs against captured fixture bundles.

use std::path::{Path, PathBuf};

use chrono::Utc;
use encore_adapters::{CaptureBundle, FixtureSource, RawHtml};
use encore_core::RawListing;
use encore_sync::{Pipeline, WatchConfig};
use tempfile::TempDir;

fn write_bundle(dir: &Path, name: &str, records: Vec<RawListing>) -> PathBuf {
    let bundle = CaptureBundle {
        source_id: "fixture".to_string(),
        captured_from_url: "https://example.com/search?city=new-york".to_string(),
        base_url: "https://example.com".to_string(),
        fetched_at: Utc::now(),
        records,
        raw_html: RawHtml::default(),
        notes: None,
    };
    let path = dir.join(name);
    std::fs::write(&path, serde_json::to_vec_pretty(&bundle).unwrap()).unwrap();
    path
}

fn record(url: &str, prices: &[&str]) -> RawListing {
    RawListing {
        title: "Hamilton".to_string(),
        venue: "Richard Rodgers Theatre".to_string(),
        date: "today".to_string(),
        time: "7:00 PM".to_string(),
        price: prices.first().unwrap_or(&"").to_string(),
        url: url.to_string(),
        prices: prices.iter().map(|p| p.to_string()).collect(),
    }
}

fn test_config(dir: &Path) -> WatchConfig {
    WatchConfig {
        state_file: dir.join("state/previous_deals.json"),
        reports_dir: dir.join("reports"),
        artifacts_dir: dir.join("artifacts"),
        filters_file: dir.join("filters.yaml"),
        webhook_url: None,
        ..Default::default()
    }
}

#[tokio::test]
async fn two_runs_detect_a_price_drop_and_roll_state_forward() {
    let dir = TempDir::new().expect("tempdir");
    let pipeline = Pipeline::new(test_config(dir.path())).expect("pipeline");

    // Run 1: no prior state, one listing at $50/$60.
    let bundle_1 = write_bundle(dir.path(), "run1.json", vec![record("u1", &["$50", "$60"])]);
    let summary_1 = pipeline
        .run_once(&FixtureSource::new(&bundle_1))
        .await
        .expect("run 1");
    assert_eq!(summary_1.kept, 1);
    assert_eq!(summary_1.new_deals, 1);
    assert_eq!(summary_1.price_drops, 0);

    let state_text = std::fs::read_to_string(dir.path().join("state/previous_deals.json")).unwrap();
    let state: serde_json::Value = serde_json::from_str(&state_text).unwrap();
    assert_eq!(state["deals"][0]["url"], "u1");
    assert_eq!(state["deals"][0]["price"], "$50");

    // Run 2: same listing now at $40/$55 -> price drop against $50.
    let bundle_2 = write_bundle(dir.path(), "run2.json", vec![record("u1", &["$40", "$55"])]);
    let summary_2 = pipeline
        .run_once(&FixtureSource::new(&bundle_2))
        .await
        .expect("run 2");
    assert_eq!(summary_2.kept, 1);
    assert_eq!(summary_2.new_deals, 0);
    assert_eq!(summary_2.price_drops, 1);

    let report_path = summary_2.report_path.expect("report written");
    let report: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(report_path).unwrap()).unwrap();
    assert_eq!(report["priceDrops"], 1);
    assert_eq!(report["deals"][0]["status"], "price_drop");
    assert_eq!(report["deals"][0]["previousPrice"], "$50");
    assert_eq!(report["deals"][0]["currentPrice"], "$40");

    // State now carries the run-2 listing.
    let state_text = std::fs::read_to_string(dir.path().join("state/previous_deals.json")).unwrap();
    let state: serde_json::Value = serde_json::from_str(&state_text).unwrap();
    assert_eq!(state["deals"][0]["price"], "$40");
    assert_eq!(state["deals"][0]["prices"][0], "$40");
}

#[tokio::test]
async fn fatal_extraction_leaves_no_state_behind() {
    let dir = TempDir::new().expect("tempdir");
    let pipeline = Pipeline::new(test_config(dir.path())).expect("pipeline");

    let empty_bundle = write_bundle(dir.path(), "empty.json", vec![]);
    let result = pipeline.run_once(&FixtureSource::new(&empty_bundle)).await;
    assert!(result.is_err());
    assert!(!dir.path().join("state/previous_deals.json").exists());
}

#[tokio::test]
async fn zero_listings_after_filtering_is_a_successful_run() {
    let dir = TempDir::new().expect("tempdir");
    let config = WatchConfig {
        min_price: Some(10),
        max_price: Some(100),
        ..test_config(dir.path())
    };
    let pipeline = Pipeline::new(config).expect("pipeline");

    // The listing survives extraction but not the ingestion price filter.
    let bundle = write_bundle(dir.path(), "run.json", vec![record("u1", &["$500"])]);
    let summary = pipeline
        .run_once(&FixtureSource::new(&bundle))
        .await
        .expect("run succeeds with zero kept listings");
    assert_eq!(summary.raw_count, 1);
    assert_eq!(summary.kept, 0);
    assert!(dir.path().join("state/previous_deals.json").exists());
}

#[tokio::test]
async fn classified_deal_flattens_listing_fields_in_report_state_shape() {
    // Guard against serde shape drift between state and report consumers.
    let dir = TempDir::new().expect("tempdir");
    let pipeline = Pipeline::new(test_config(dir.path())).expect("pipeline");
    let bundle = write_bundle(dir.path(), "run.json", vec![record("u1", &["$50"])]);
    let summary = pipeline
        .run_once(&FixtureSource::new(&bundle))
        .await
        .expect("run");

    let report: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(summary.report_path.expect("report")).unwrap(),
    )
    .unwrap();
    let deal = &report["deals"][0];
    assert_eq!(deal["status"], "new");
    assert!(deal.get("previousPrice").is_none() || deal["previousPrice"].is_null());
    assert_eq!(deal["allPrices"][0], "$50");
    assert_eq!(deal["url"], "u1");

    let status_values: Vec<_> = report["deals"]
        .as_array()
        .unwrap()
        .iter()
        .map(|d| d["status"].clone())
        .collect();
    assert_eq!(status_values, vec![serde_json::json!("new")]);
}
