//! Sync pipeline orchestration: discover sources, fetch them concurrently
//! under a wall-clock timeout, ingest, and write per-run reports.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use spend_adapters::{
    council_key, load_registry, AdapterContext, AdapterError, Catalog, CatalogBuild, CatalogCache,
    CatalogOptions, CkanSearchClient, FetcherRegistry, SearchBackend,
};
use spend_storage::{HttpClientConfig, HttpFetcher, PaymentStore, StoreError};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

pub mod geocode;
pub mod ingest;
pub mod report;

pub use geocode::{
    CachePersistence, GeocodeCache, GeocodeError, GeocodeService, Geocoder, JsonFilePersistence,
    NoPersistence, NominatimGeocoder,
};
pub use ingest::{IngestOutcome, Ingestor};
pub use report::{write_run_reports, FailureStage, FetchFailure, RunSummary};

pub const CRATE_NAME: &str = "spend-sync";

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub catalog_cache_path: PathBuf,
    pub catalog_max_age_hours: i64,
    pub councils_file: Option<PathBuf>,
    pub geocode_cache_path: PathBuf,
    pub geocode_enabled: bool,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub source_timeout: Duration,
    pub source_concurrency: usize,
    pub max_sources: Option<usize>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub reports_dir: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://spend.db?mode=rwc".to_string(),
            catalog_cache_path: PathBuf::from(".cache/councils_catalog.json"),
            catalog_max_age_hours: 24,
            councils_file: None,
            geocode_cache_path: PathBuf::from(".cache/geocode_cache.json"),
            geocode_enabled: false,
            user_agent: "council-spend-tracker/0.1".to_string(),
            http_timeout_secs: 30,
            source_timeout: Duration::from_secs(120),
            source_concurrency: 4,
            max_sources: None,
            scheduler_enabled: false,
            sync_cron: "0 0 5 * * *".to_string(),
            reports_dir: PathBuf::from("./reports"),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: env_or("DATABASE_URL", &defaults.database_url),
            catalog_cache_path: std::env::var("CATALOG_CACHE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.catalog_cache_path),
            catalog_max_age_hours: env_parse("CATALOG_MAX_AGE_HOURS", defaults.catalog_max_age_hours),
            councils_file: std::env::var("COUNCILS_FILE").ok().map(PathBuf::from),
            geocode_cache_path: std::env::var("GEOCODE_CACHE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.geocode_cache_path),
            geocode_enabled: env_flag("SPEND_GEOCODE", defaults.geocode_enabled),
            user_agent: env_or("SPEND_USER_AGENT", &defaults.user_agent),
            http_timeout_secs: env_parse("SPEND_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            source_timeout: Duration::from_secs(env_parse(
                "SPEND_SOURCE_TIMEOUT_SECS",
                defaults.source_timeout.as_secs(),
            )),
            source_concurrency: env_parse("SPEND_SOURCE_CONCURRENCY", defaults.source_concurrency).max(1),
            max_sources: std::env::var("SPEND_MAX_SOURCES")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .filter(|n: &usize| *n > 0),
            scheduler_enabled: env_flag("SPEND_SCHEDULER_ENABLED", defaults.scheduler_enabled),
            sync_cron: env_or("SYNC_CRON", &defaults.sync_cron),
            reports_dir: std::env::var("REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
        }
    }

    pub fn catalog_cache(&self) -> CatalogCache {
        CatalogCache::new(
            self.catalog_cache_path.clone(),
            chrono::Duration::hours(self.catalog_max_age_hours.max(0)),
        )
    }
}

/// Per-invocation knobs layered over `SyncConfig`.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub geocode: bool,
    pub council: Option<String>,
    pub refresh_catalog: bool,
}

/// One unit of fetch work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTask {
    pub council: String,
    pub url: String,
    pub custom: bool,
}

#[derive(Debug)]
enum TaskOutcome {
    Ingested { fetched: usize, outcome: IngestOutcome },
    TimedOut { during_insert: bool },
    FetchFailed(AdapterError),
    InsertFailed(StoreError),
}

#[derive(Debug, Default)]
struct PassResult {
    summary_delta: RunSummary,
    failures: Vec<FetchFailure>,
    timed_out: Vec<SourceTask>,
}

#[derive(Clone)]
pub struct SyncPipeline {
    config: SyncConfig,
    http: Arc<HttpFetcher>,
    registry: Arc<FetcherRegistry>,
    ingestor: Arc<Ingestor>,
    search: Arc<dyn SearchBackend>,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        http: Arc<HttpFetcher>,
        registry: FetcherRegistry,
        ingestor: Ingestor,
        search: Arc<dyn SearchBackend>,
    ) -> Self {
        Self {
            config,
            http,
            registry: Arc::new(registry),
            ingestor: Arc::new(ingestor),
            search,
        }
    }

    /// Wire the production collaborators described by `config`.
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?);
        let store = PaymentStore::connect(&config.database_url)
            .await
            .with_context(|| format!("connecting to {}", config.database_url))?;
        store.migrate().await.context("running migrations")?;
        let registry = load_registry(config.councils_file.as_deref())
            .await
            .context("loading council registry")?;

        let mut ingestor = Ingestor::new(store);
        if config.geocode_enabled {
            let cache = GeocodeCache::open(Box::new(JsonFilePersistence::new(
                config.geocode_cache_path.clone(),
            )))
            .await;
            let geocoder = Arc::new(NominatimGeocoder::new(http.clone(), Uuid::new_v4()));
            ingestor = ingestor.with_geocoder(Arc::new(GeocodeService::new(
                geocoder,
                cache,
                Duration::from_secs(1),
                Duration::from_secs(config.http_timeout_secs),
            )));
        }
        let search = Arc::new(CkanSearchClient::new(http.clone(), Uuid::new_v4()));
        Ok(Self::new(config, http, registry, ingestor, search))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &PaymentStore {
        self.ingestor.store()
    }

    pub fn registry(&self) -> &FetcherRegistry {
        &self.registry
    }

    pub async fn discover(&self, refresh: bool) -> Result<CatalogBuild> {
        self.config
            .catalog_cache()
            .load_or_build(self.search.as_ref(), &CatalogOptions::default(), refresh)
            .await
            .context("building source catalog")
    }

    /// Turn catalog pairs into fetch tasks. A council with an override gets a
    /// single task for the override, including overrides the catalog missed.
    pub fn plan_sources(&self, catalog: &Catalog, council_filter: Option<&str>) -> Vec<SourceTask> {
        let mut tasks = Vec::new();
        let mut overridden = HashSet::new();
        for source in catalog.sources() {
            match self.registry.resolve(&source.council) {
                Some(fetcher) => {
                    if overridden.insert(council_key(fetcher.council())) {
                        tasks.push(SourceTask {
                            council: fetcher.council().to_string(),
                            url: fetcher.origin().to_string(),
                            custom: true,
                        });
                    }
                }
                None => tasks.push(SourceTask {
                    council: source.council.clone(),
                    url: source.url.clone(),
                    custom: false,
                }),
            }
        }
        for fetcher in self.registry.overrides() {
            if overridden.insert(council_key(fetcher.council())) {
                tasks.push(SourceTask {
                    council: fetcher.council().to_string(),
                    url: fetcher.origin().to_string(),
                    custom: true,
                });
            }
        }

        if let Some(filter) = council_filter {
            let wanted = council_key(filter);
            tasks.retain(|t| council_key(&t.council) == wanted);
        }
        if let Some(limit) = self.config.max_sources {
            tasks.truncate(limit);
        }
        tasks
    }

    /// Fetch and insert one source under the wall-clock timeout. A batch
    /// cut off mid-insert is rolled back when its transaction is dropped.
    async fn run_task(&self, ctx: &AdapterContext, task: &SourceTask, geocode: bool) -> TaskOutcome {
        let mut reached_insert = false;
        let work = async {
            let records = match self.registry.fetch(&self.http, ctx, &task.council, &task.url).await {
                Ok(records) => records,
                Err(err) => return TaskOutcome::FetchFailed(err),
            };
            reached_insert = true;
            match self.ingestor.insert(&records, geocode).await {
                Ok(outcome) => TaskOutcome::Ingested {
                    fetched: records.len(),
                    outcome,
                },
                Err(err) => TaskOutcome::InsertFailed(err),
            }
        };
        let finished = tokio::time::timeout(self.config.source_timeout, work).await;
        match finished {
            Ok(outcome) => outcome,
            Err(_) => TaskOutcome::TimedOut {
                during_insert: reached_insert,
            },
        }
    }

    async fn run_pass(&self, ctx: &AdapterContext, tasks: Vec<SourceTask>, geocode: bool, retry: bool) -> PassResult {
        let semaphore = Arc::new(Semaphore::new(self.config.source_concurrency.max(1)));
        let mut set = JoinSet::new();
        for task in tasks {
            let pipeline = self.clone();
            let ctx = ctx.clone();
            let semaphore = semaphore.clone();
            set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (task, TaskOutcome::TimedOut { during_insert: false });
                };
                let outcome = pipeline.run_task(&ctx, &task, geocode).await;
                (task, outcome)
            });
        }

        let mut result = PassResult::default();
        let delta = &mut result.summary_delta;
        while let Some(joined) = set.join_next().await {
            let (task, outcome) = match joined {
                Ok(done) => done,
                Err(err) => {
                    error!(error = %err, "source task panicked");
                    delta.sources_hard_failed += 1;
                    continue;
                }
            };
            match outcome {
                TaskOutcome::Ingested { fetched, outcome } => {
                    info!(council = %task.council, url = %task.url, fetched, inserted = outcome.inserted, "source ingested");
                    delta.sources_succeeded += 1;
                    delta.rows_fetched += fetched;
                    delta.rows_inserted += outcome.inserted;
                    delta.rows_skipped += outcome.skipped;
                    delta.rows_duplicate += outcome.duplicates;
                    delta.rows_rejected_no_date += outcome.rejected_no_date;
                    delta.amounts_defaulted += outcome.amounts_defaulted;
                }
                TaskOutcome::TimedOut { during_insert } => {
                    warn!(council = %task.council, url = %task.url, retry, during_insert, "source timed out");
                    let stage = if during_insert {
                        FailureStage::insert(retry)
                    } else {
                        FailureStage::fetch(retry)
                    };
                    result.failures.push(FetchFailure::timeout(
                        &task.council,
                        &task.url,
                        stage,
                        task.custom,
                        self.config.source_timeout,
                    ));
                    if retry {
                        delta.sources_timed_out += 1;
                    } else {
                        result.timed_out.push(task);
                    }
                }
                TaskOutcome::FetchFailed(err) => {
                    warn!(council = %task.council, url = %task.url, error = %err, "source fetch failed");
                    delta.sources_hard_failed += 1;
                    result.failures.push(FetchFailure::from_adapter(
                        &task.council,
                        &task.url,
                        FailureStage::fetch(retry),
                        task.custom,
                        &err,
                    ));
                }
                TaskOutcome::InsertFailed(err) => {
                    error!(council = %task.council, url = %task.url, error = %err, "source insert failed");
                    delta.sources_hard_failed += 1;
                    result.failures.push(FetchFailure::other(
                        &task.council,
                        &task.url,
                        FailureStage::insert(retry),
                        task.custom,
                        "store",
                        err.to_string(),
                    ));
                }
            }
        }
        result
    }

    /// Fetch and ingest `tasks`. Timed-out sources get exactly one more try;
    /// hard failures are not retried.
    pub async fn run_sources(&self, run_id: Uuid, tasks: Vec<SourceTask>, geocode: bool) -> (RunSummary, Vec<FetchFailure>) {
        let ctx = AdapterContext::new(run_id);
        let attempted = tasks.len();

        let first = self.run_pass(&ctx, tasks, geocode, false).await;
        let mut summary = first.summary_delta;
        let mut failures = first.failures;
        summary.sources_attempted = attempted;
        summary.sources_retried = first.timed_out.len();

        if !first.timed_out.is_empty() {
            info!(sources = first.timed_out.len(), "retrying timed-out sources");
            let second = self.run_pass(&ctx, first.timed_out, geocode, true).await;
            let d = second.summary_delta;
            summary.sources_succeeded += d.sources_succeeded;
            summary.sources_timed_out += d.sources_timed_out;
            summary.sources_hard_failed += d.sources_hard_failed;
            summary.rows_fetched += d.rows_fetched;
            summary.rows_inserted += d.rows_inserted;
            summary.rows_skipped += d.rows_skipped;
            summary.rows_duplicate += d.rows_duplicate;
            summary.rows_rejected_no_date += d.rows_rejected_no_date;
            summary.amounts_defaulted += d.amounts_defaulted;
            failures.extend(second.failures);
        }

        summary.run_id = run_id;
        (summary, failures)
    }

    pub async fn run_once(&self, options: &RunOptions) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, council = ?options.council, "sync run starting");

        let build = self.discover(options.refresh_catalog).await?;
        let tasks = self.plan_sources(&build.catalog, options.council.as_deref());
        if tasks.is_empty() {
            warn!(council = ?options.council, "no sources to fetch");
        }

        let geocode = options.geocode || self.config.geocode_enabled;
        let (mut summary, failures) = self.run_sources(run_id, tasks, geocode).await;
        summary.started_at = started_at;
        summary.finished_at = Utc::now();
        summary.catalog_from_cache = build.from_cache;
        summary.catalog_soft_failures = build.soft_failures;

        let run_dir = self.config.reports_dir.join(run_id.to_string());
        summary.reports_dir = run_dir.display().to_string();
        write_run_reports(&self.config.reports_dir, &summary, &failures).await?;

        info!(
            %run_id,
            attempted = summary.sources_attempted,
            succeeded = summary.sources_succeeded,
            timed_out = summary.sources_timed_out,
            hard_failed = summary.sources_hard_failed,
            inserted = summary.rows_inserted,
            skipped = summary.rows_skipped,
            "sync run finished"
        );
        Ok(summary)
    }

    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let pipeline = self.clone();
        let job = Job::new_async(&cron, move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                match pipeline.run_once(&RunOptions::default()).await {
                    Ok(summary) => info!(run_id = %summary.run_id, inserted = summary.rows_inserted, "scheduled sync finished"),
                    Err(err) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

pub async fn run_sync_once_from_env(options: RunOptions) -> Result<RunSummary> {
    let pipeline = SyncPipeline::from_config(SyncConfig::from_env()).await?;
    pipeline.run_once(&options).await
}
