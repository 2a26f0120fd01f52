//! Spending-dataset discovery against the data.gov.uk CKAN search API, with a
//! JSON cache so runs do not re-page the catalog every time.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use spend_core::SourceRef;
use spend_storage::{url_with_params, FetchError, HttpFetcher};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CKAN_PACKAGE_SEARCH: &str = "https://data.gov.uk/api/3/action/package_search";

pub const QUERY_TERMS: [&str; 10] = [
    "payments to suppliers",
    "spend over 500",
    "spending over 500",
    "expenditure over 500",
    "transparency spending",
    "supplier payments",
    "payments over 250",
    "payments over 500",
    "council spending",
    "local authority spend",
];

const UNKNOWN_PUBLISHER: &str = "Unknown publisher";

/// The OR-combined phrase query used for discovery.
pub fn spending_query() -> String {
    QUERY_TERMS
        .iter()
        .map(|term| format!("\"{term}\""))
        .collect::<Vec<_>>()
        .join(" OR ")
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("invalid search response: {0}")]
    Json(#[from] serde_json::Error),
    #[error("search API reported failure")]
    Unsuccessful,
    #[error("catalog cache {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchResponse {
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub result: Option<SearchResult>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchResult {
    #[serde(default)]
    pub count: u64,
    #[serde(default)]
    pub results: Option<Vec<Package>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Package {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub organization: Option<Organization>,
    #[serde(default)]
    pub resources: Option<Vec<Resource>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Organization {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Resource {
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub last_modified: Option<String>,
    #[serde(default)]
    pub created: Option<String>,
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(|v| v.trim()).filter(|v| !v.is_empty())
}

impl Package {
    pub fn publisher(&self) -> Option<&str> {
        let org = self.organization.as_ref()?;
        non_empty(org.title.as_ref()).or_else(|| non_empty(org.name.as_ref()))
    }

    /// Publisher, else the title up to its first `-`, else a placeholder.
    pub fn council_name(&self) -> String {
        if let Some(publisher) = self.publisher() {
            return publisher.to_string();
        }
        self.title
            .as_deref()
            .and_then(|t| t.split('-').next())
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(UNKNOWN_PUBLISHER)
            .to_string()
    }

    pub fn csv_resources(&self) -> impl Iterator<Item = (&Resource, &str)> {
        self.resources
            .iter()
            .flatten()
            .filter(|r| r.format.as_deref().map(|f| f.trim().eq_ignore_ascii_case("csv")).unwrap_or(false))
            .filter_map(|r| {
                non_empty(r.url.as_ref())
                    .or_else(|| non_empty(r.download_url.as_ref()))
                    .map(|url| (r, url))
            })
    }
}

#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search_page(&self, query: &str, start: u64, rows: u64) -> Result<SearchResult, CatalogError>;
}

/// data.gov.uk `package_search` over the shared HTTP client.
#[derive(Debug, Clone)]
pub struct CkanSearchClient {
    http: Arc<HttpFetcher>,
    base_url: String,
    run_id: Uuid,
}

impl CkanSearchClient {
    pub fn new(http: Arc<HttpFetcher>, run_id: Uuid) -> Self {
        Self::with_base_url(http, run_id, CKAN_PACKAGE_SEARCH)
    }

    pub fn with_base_url(http: Arc<HttpFetcher>, run_id: Uuid, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            run_id,
        }
    }
}

#[async_trait]
impl SearchBackend for CkanSearchClient {
    async fn search_page(&self, query: &str, start: u64, rows: u64) -> Result<SearchResult, CatalogError> {
        let url = url_with_params(
            &self.base_url,
            &[
                ("q", query.to_string()),
                ("start", start.to_string()),
                ("rows", rows.to_string()),
            ],
        )?;
        let response = self.http.fetch_bytes(self.run_id, "data.gov.uk", &url).await?;
        let parsed: SearchResponse = serde_json::from_slice(&response.body)?;
        match parsed {
            SearchResponse {
                success: true,
                result: Some(result),
            } => Ok(result),
            _ => Err(CatalogError::Unsuccessful),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CatalogOptions {
    pub query: String,
    pub rows_per_page: u64,
    pub max_pages: usize,
    pub page_delay: Duration,
}

impl Default for CatalogOptions {
    fn default() -> Self {
        Self {
            query: spending_query(),
            rows_per_page: 1000,
            max_pages: 10,
            page_delay: Duration::from_millis(300),
        }
    }
}

#[derive(Debug)]
pub enum PageOutcome {
    Packages { page: usize, packages: Vec<Package> },
    Failed { page: usize, error: CatalogError },
}

/// Lazily walks search result pages. Finite, and restartable with `restart`.
pub struct DiscoveryPager<'a> {
    backend: &'a dyn SearchBackend,
    query: String,
    rows: u64,
    max_pages: usize,
    page: usize,
    total: Option<u64>,
    finished: bool,
}

impl<'a> DiscoveryPager<'a> {
    pub fn new(backend: &'a dyn SearchBackend, options: &CatalogOptions) -> Self {
        Self {
            backend,
            query: options.query.clone(),
            rows: options.rows_per_page.max(1),
            max_pages: options.max_pages,
            page: 0,
            total: None,
            finished: false,
        }
    }

    pub async fn next_page(&mut self) -> Option<PageOutcome> {
        if self.finished || self.page >= self.max_pages {
            return None;
        }
        let start = self.page as u64 * self.rows;
        if matches!(self.total, Some(total) if start >= total) {
            self.finished = true;
            return None;
        }

        let page = self.page;
        self.page += 1;
        match self.backend.search_page(&self.query, start, self.rows).await {
            Ok(result) => {
                self.total.get_or_insert(result.count);
                let packages = result.results.unwrap_or_default();
                if packages.is_empty() {
                    self.finished = true;
                    return None;
                }
                Some(PageOutcome::Packages { page, packages })
            }
            Err(error) => Some(PageOutcome::Failed { page, error }),
        }
    }

    pub fn restart(&mut self) {
        self.page = 0;
        self.total = None;
        self.finished = false;
    }

    pub fn pages_requested(&self) -> usize {
        self.page
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogResource {
    pub name: Option<String>,
    pub url: String,
    pub format: String,
    pub last_modified: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogDataset {
    pub title: Option<String>,
    pub publisher: Option<String>,
    pub resources: Vec<CatalogResource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub council: String,
    pub csv_urls: Vec<String>,
    pub datasets: Vec<CatalogDataset>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    pub built_at: DateTime<Utc>,
    pub query: String,
    pub councils: Vec<CatalogEntry>,
    /// Every `(council, url)` pair once, in first-seen order.
    pub sources: Vec<SourceRef>,
}

impl Catalog {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            built_at: Utc::now(),
            query: query.into(),
            councils: Vec::new(),
            sources: Vec::new(),
        }
    }

    pub fn entry(&self, council: &str) -> Option<&CatalogEntry> {
        self.councils.iter().find(|e| e.council == council)
    }

    pub fn sources(&self) -> impl Iterator<Item = &SourceRef> + '_ {
        self.sources.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    fn add_package(&mut self, package: &Package, index: &mut HashMap<String, usize>, seen: &mut HashSet<SourceRef>) {
        let council = package.council_name();
        let mut resources = Vec::new();
        for (resource, url) in package.csv_resources() {
            resources.push(CatalogResource {
                name: resource.name.clone(),
                url: url.to_string(),
                format: resource.format.clone().unwrap_or_default(),
                last_modified: resource.last_modified.clone().or_else(|| resource.created.clone()),
            });
        }
        if resources.is_empty() {
            return;
        }

        let slot = *index.entry(council.clone()).or_insert_with(|| {
            self.councils.push(CatalogEntry {
                council: council.clone(),
                csv_urls: Vec::new(),
                datasets: Vec::new(),
            });
            self.councils.len() - 1
        });
        let entry = &mut self.councils[slot];
        for resource in &resources {
            let pair = SourceRef::new(council.clone(), resource.url.clone());
            if seen.insert(pair.clone()) {
                entry.csv_urls.push(resource.url.clone());
                self.sources.push(pair);
            }
        }
        entry.datasets.push(CatalogDataset {
            title: package.title.clone(),
            publisher: package.publisher().map(str::to_string),
            resources,
        });
    }
}

#[derive(Debug, Clone)]
pub struct CatalogBuild {
    pub catalog: Catalog,
    pub soft_failures: usize,
    pub pages_fetched: usize,
    pub from_cache: bool,
}

/// Page through the search API and fold CSV resources into a catalog. Failed
/// pages are logged and counted, never fatal.
pub async fn build_catalog(backend: &dyn SearchBackend, options: &CatalogOptions) -> CatalogBuild {
    let mut catalog = Catalog::new(options.query.clone());
    let mut index = HashMap::new();
    let mut seen = HashSet::new();
    let mut pager = DiscoveryPager::new(backend, options);
    let mut soft_failures = 0usize;
    let mut pages_fetched = 0usize;

    while let Some(outcome) = pager.next_page().await {
        match outcome {
            PageOutcome::Packages { page, packages } => {
                pages_fetched += 1;
                debug!(page, packages = packages.len(), "catalog page");
                for package in &packages {
                    catalog.add_package(package, &mut index, &mut seen);
                }
            }
            PageOutcome::Failed { page, error } => {
                soft_failures += 1;
                warn!(page, error = %error, "catalog page failed; skipping");
            }
        }
        if !options.page_delay.is_zero() {
            tokio::time::sleep(options.page_delay).await;
        }
    }

    info!(
        councils = catalog.councils.len(),
        sources = catalog.sources.len(),
        pages_fetched,
        soft_failures,
        "catalog built"
    );
    CatalogBuild {
        catalog,
        soft_failures,
        pages_fetched,
        from_cache: false,
    }
}

/// Catalog cache on disk. Writes are atomic (temp file then rename).
#[derive(Debug, Clone)]
pub struct CatalogCache {
    path: PathBuf,
    max_age: chrono::Duration,
}

impl CatalogCache {
    pub fn new(path: impl Into<PathBuf>, max_age: chrono::Duration) -> Self {
        Self {
            path: path.into(),
            max_age,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_fresh_at(&self, catalog: &Catalog, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(catalog.built_at) <= self.max_age
    }

    /// A usable cached catalog, or `None` when missing, unreadable, empty or stale.
    pub async fn load(&self) -> Option<Catalog> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!(path = %self.path.display(), error = %err, "no catalog cache");
                return None;
            }
        };
        let catalog: Catalog = match serde_json::from_slice(&bytes) {
            Ok(catalog) => catalog,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "unreadable catalog cache");
                return None;
            }
        };
        if catalog.is_empty() {
            debug!(path = %self.path.display(), "catalog cache is empty");
            return None;
        }
        if !self.is_fresh_at(&catalog, Utc::now()) {
            info!(path = %self.path.display(), built_at = %catalog.built_at, "catalog cache is stale");
            return None;
        }
        Some(catalog)
    }

    pub async fn store(&self, catalog: &Catalog) -> Result<(), CatalogError> {
        let io_err = |source| CatalogError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let json = serde_json::to_vec_pretty(catalog)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_err)?;
        Ok(())
    }

    /// Serve the cache when fresh, otherwise rebuild and rewrite it.
    pub async fn load_or_build(
        &self,
        backend: &dyn SearchBackend,
        options: &CatalogOptions,
        force_refresh: bool,
    ) -> Result<CatalogBuild, CatalogError> {
        if !force_refresh {
            if let Some(catalog) = self.load().await {
                info!(path = %self.path.display(), sources = catalog.sources.len(), "using cached catalog");
                return Ok(CatalogBuild {
                    catalog,
                    soft_failures: 0,
                    pages_fetched: 0,
                    from_cache: true,
                });
            }
        }
        let build = build_catalog(backend, options).await;
        if build.catalog.is_empty() {
            warn!("catalog build found no CSV sources; cache not written");
        } else {
            self.store(&build.catalog).await?;
        }
        Ok(build)
    }
}
