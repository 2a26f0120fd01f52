use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use spend_adapters::catalog::{Organization, Package, Resource, SearchResult};
use spend_adapters::{AdapterContext, AdapterError, CatalogError, CouncilFetcher, FetcherRegistry, SearchBackend};
use spend_core::{CanonicalField, Coordinates, RawRecord};
use spend_storage::{HttpFetcher, PaymentStore};
use spend_sync::{
    FailureStage, GeocodeCache, GeocodeError, GeocodeService, Geocoder, Ingestor, RunOptions, SourceTask,
    SyncConfig, SyncPipeline,
};
use uuid::Uuid;

/// Serves a fixed row set, sleeping `slow_calls` times before answering.
struct FakeCouncil {
    council: &'static str,
    rows: Vec<RawRecord>,
    slow_calls: usize,
    calls: AtomicUsize,
}

impl FakeCouncil {
    fn new(council: &'static str, rows: Vec<RawRecord>) -> Self {
        Self {
            council,
            rows,
            slow_calls: 0,
            calls: AtomicUsize::new(0),
        }
    }

    fn slow(mut self, calls: usize) -> Self {
        self.slow_calls = calls;
        self
    }
}

#[async_trait]
impl CouncilFetcher for FakeCouncil {
    fn council(&self) -> &str {
        self.council
    }

    fn origin(&self) -> &str {
        "https://fake.example/index"
    }

    async fn fetch_records(&self, _http: &HttpFetcher, _ctx: &AdapterContext) -> Result<Vec<RawRecord>, AdapterError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.slow_calls {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        Ok(self.rows.clone())
    }
}

struct BrokenCouncil;

#[async_trait]
impl CouncilFetcher for BrokenCouncil {
    fn council(&self) -> &str {
        "Blaby"
    }

    fn origin(&self) -> &str {
        "https://fake.example/blaby"
    }

    async fn fetch_records(&self, _http: &HttpFetcher, _ctx: &AdapterContext) -> Result<Vec<RawRecord>, AdapterError> {
        Err(AdapterError::NotTabular {
            url: "https://fake.example/blaby.csv".into(),
            content_type: Some("text/html".into()),
            snippet: "<html>maintenance</html>".into(),
        })
    }
}

/// One catalog page naming the given publishers.
struct FakeSearch {
    publishers: Vec<&'static str>,
}

#[async_trait]
impl SearchBackend for FakeSearch {
    async fn search_page(&self, _query: &str, start: u64, _rows: u64) -> Result<SearchResult, CatalogError> {
        let results = if start == 0 {
            self.publishers
                .iter()
                .map(|publisher| Package {
                    title: Some(format!("{publisher} - spend over 500")),
                    organization: Some(Organization {
                        title: Some(publisher.to_string()),
                        name: None,
                    }),
                    resources: Some(vec![Resource {
                        format: Some("CSV".into()),
                        url: Some(format!("https://catalog.example/{publisher}.csv")),
                        ..Resource::default()
                    }]),
                })
                .collect()
        } else {
            Vec::new()
        };
        Ok(SearchResult {
            count: self.publishers.len() as u64,
            results: Some(results),
        })
    }
}

fn row(council: &str, date: &str, supplier: &str, amount: &str) -> RawRecord {
    RawRecord::new()
        .with(CanonicalField::Council, council)
        .with(CanonicalField::PaymentDate, date)
        .with(CanonicalField::Supplier, supplier)
        .with(CanonicalField::AmountGbp, amount)
}

async fn pipeline(registry: FetcherRegistry, config: SyncConfig) -> SyncPipeline {
    let store = PaymentStore::in_memory().await.unwrap();
    let http = Arc::new(HttpFetcher::new(Default::default()).unwrap());
    let search = Arc::new(FakeSearch {
        publishers: vec!["Bristol City Council", "Durham County Council"],
    });
    SyncPipeline::new(config, http, registry, Ingestor::new(store), search)
}

fn fast_config() -> SyncConfig {
    SyncConfig {
        source_timeout: Duration::from_millis(200),
        ..SyncConfig::default()
    }
}

fn task(council: &str) -> SourceTask {
    SourceTask {
        council: council.to_string(),
        url: "https://fake.example/index".to_string(),
        custom: true,
    }
}

#[tokio::test]
async fn rerunning_a_source_is_idempotent() {
    let registry = FetcherRegistry::default().with(Arc::new(FakeCouncil::new(
        "Durham",
        vec![
            row("Durham", "01/03/2024", "Acme Ltd", "£1,234.50"),
            row("Durham", "no date", "Beta Ltd", "10"),
        ],
    )));
    let pipeline = pipeline(registry, fast_config()).await;

    let (first, failures) = pipeline.run_sources(Uuid::new_v4(), vec![task("Durham")], false).await;
    assert!(failures.is_empty());
    assert_eq!(first.sources_succeeded, 1);
    assert_eq!(first.rows_inserted, 1);
    assert_eq!(first.rows_rejected_no_date, 1);
    assert_eq!(first.rows_skipped, 1);

    let (second, _) = pipeline.run_sources(Uuid::new_v4(), vec![task("Durham")], false).await;
    assert_eq!(second.rows_inserted, 0);
    assert_eq!(second.rows_duplicate, 1);
    assert_eq!(second.rows_skipped, 2);
    assert_eq!(pipeline.store().count_payments(Some("Durham")).await.unwrap(), 1);
}

#[tokio::test]
async fn timed_out_sources_are_retried_exactly_once() {
    let recovers = Arc::new(FakeCouncil::new("Durham", vec![row("Durham", "2024-03-01", "Acme", "5")]).slow(1));
    let never = Arc::new(FakeCouncil::new("Stevenage", vec![row("Stevenage", "2024-03-01", "Acme", "5")]).slow(usize::MAX));
    let registry = FetcherRegistry::default()
        .with(recovers.clone())
        .with(never.clone())
        .with(Arc::new(BrokenCouncil));
    let pipeline = pipeline(registry, fast_config()).await;

    let (summary, failures) = pipeline
        .run_sources(
            Uuid::new_v4(),
            vec![task("Durham"), task("Stevenage"), task("Blaby")],
            false,
        )
        .await;

    assert_eq!(summary.sources_attempted, 3);
    assert_eq!(summary.sources_retried, 2);
    assert_eq!(summary.sources_succeeded, 1);
    assert_eq!(summary.sources_timed_out, 1);
    assert_eq!(summary.sources_hard_failed, 1);
    assert_eq!(summary.rows_inserted, 1);

    assert_eq!(recovers.calls.load(Ordering::SeqCst), 2);
    assert_eq!(never.calls.load(Ordering::SeqCst), 2);

    let stevenage: Vec<_> = failures.iter().filter(|f| f.council == "Stevenage").collect();
    assert_eq!(stevenage.len(), 2);
    assert_eq!(stevenage[0].stage, FailureStage::Fetch);
    assert_eq!(stevenage[1].stage, FailureStage::RetryFetch);
    assert!(stevenage.iter().all(|f| f.error_kind == "timeout"));

    let blaby: Vec<_> = failures.iter().filter(|f| f.council == "Blaby").collect();
    assert_eq!(blaby.len(), 1, "hard failures are not retried");
    assert_eq!(blaby[0].error_kind, "not_tabular");
    assert_eq!(blaby[0].content_type.as_deref(), Some("text/html"));
    assert!(blaby[0].is_custom_fetcher);
}

struct SlowGeocoder;

#[async_trait]
impl Geocoder for SlowGeocoder {
    async fn geocode(&self, _query: &str) -> Result<Option<Coordinates>, GeocodeError> {
        tokio::time::sleep(Duration::from_millis(150)).await;
        Ok(Some(Coordinates { lat: 54.7, lon: -1.6 }))
    }
}

#[tokio::test]
async fn slow_geocoding_counts_against_the_source_timeout() {
    let rows = (1..=6)
        .map(|n| row("Durham", "2024-03-01", &format!("Supplier {n}"), "10"))
        .collect();
    let registry = FetcherRegistry::default().with(Arc::new(FakeCouncil::new("Durham", rows)));
    let store = PaymentStore::in_memory().await.unwrap();
    let geocoder = Arc::new(GeocodeService::new(
        Arc::new(SlowGeocoder),
        GeocodeCache::in_memory(),
        Duration::from_millis(1),
        Duration::from_secs(1),
    ));
    let pipeline = SyncPipeline::new(
        fast_config(),
        Arc::new(HttpFetcher::new(Default::default()).unwrap()),
        registry,
        Ingestor::new(store.clone()).with_geocoder(geocoder),
        Arc::new(FakeSearch { publishers: Vec::new() }),
    );

    let started = std::time::Instant::now();
    let (summary, failures) = pipeline.run_sources(Uuid::new_v4(), vec![task("Durham")], true).await;
    assert!(started.elapsed() < Duration::from_millis(900));

    assert_eq!(summary.sources_succeeded, 0);
    assert_eq!(summary.sources_retried, 1);
    assert_eq!(summary.sources_timed_out, 1);
    assert_eq!(summary.rows_inserted, 0);
    assert_eq!(store.count_payments(None).await.unwrap(), 0);
    let stages: Vec<_> = failures.iter().map(|f| f.stage).collect();
    assert_eq!(stages, vec![FailureStage::Insert, FailureStage::RetryInsert]);
}

#[tokio::test]
async fn planning_collapses_catalog_sources_onto_overrides() {
    let registry = FetcherRegistry::default()
        .with(Arc::new(FakeCouncil::new("Bristol", Vec::new())))
        .with(Arc::new(FakeCouncil::new("Worthing", Vec::new())));
    let pipeline = pipeline(registry, fast_config()).await;
    let dir = tempfile::tempdir().unwrap();
    let cache = spend_adapters::CatalogCache::new(dir.path().join("catalog.json"), chrono::Duration::hours(1));
    let search = FakeSearch {
        publishers: vec!["Bristol City Council", "Durham County Council"],
    };
    let build = cache
        .load_or_build(&search, &spend_adapters::CatalogOptions::default(), false)
        .await
        .unwrap();

    let tasks = pipeline.plan_sources(&build.catalog, None);
    let councils: Vec<(&str, bool)> = tasks.iter().map(|t| (t.council.as_str(), t.custom)).collect();
    assert_eq!(
        councils,
        vec![
            ("Bristol", true),
            ("Durham County Council", false),
            ("Worthing", true),
        ]
    );

    let only = pipeline.plan_sources(&build.catalog, Some("Bristol City Council"));
    assert_eq!(only.len(), 1);
    assert_eq!(only[0].council, "Bristol");
}

#[tokio::test]
async fn full_run_writes_reports() {
    let dir = tempfile::tempdir().unwrap();
    let config = SyncConfig {
        catalog_cache_path: dir.path().join("cache/catalog.json"),
        reports_dir: dir.path().join("reports"),
        ..fast_config()
    };
    let registry = FetcherRegistry::default()
        .with(Arc::new(FakeCouncil::new(
            "Bristol",
            vec![row("Bristol", "2024-01-31", "Acme Ltd", "250000")],
        )))
        .with(Arc::new(BrokenCouncil));
    let pipeline = pipeline(registry, config).await;

    let summary = pipeline
        .run_once(&RunOptions {
            council: Some("Bristol".into()),
            ..RunOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(summary.sources_attempted, 1);
    assert_eq!(summary.rows_inserted, 1);
    assert!(!summary.catalog_from_cache);

    let run_dir = dir.path().join("reports").join(summary.run_id.to_string());
    assert!(run_dir.join("run_summary.json").exists());
    assert!(run_dir.join("fetch_failures.csv").exists());
    assert!(dir.path().join("cache/catalog.json").exists());
}
