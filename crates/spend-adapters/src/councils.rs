//! Per-council fetch overrides declared in `councils.yaml`.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use spend_core::{CanonicalField, RawRecord};
use spend_storage::{resolve_link, HttpFetcher};
use tracing::{debug, info, warn};

use crate::{
    decode_text, AdapterContext, AdapterError, ColumnAliases, CouncilFetcher, FetcherRegistry,
    GenericCsvFetcher,
};

/// The override registry compiled into the binary.
pub const BUILTIN_COUNCILS_YAML: &str = include_str!("../councils.yaml");

fn default_link_selector() -> String {
    "a[href]".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouncilsFile {
    pub councils: Vec<CouncilOverride>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouncilOverride {
    pub council: String,
    #[serde(flatten)]
    pub strategy: OverrideStrategy,
    #[serde(default)]
    pub columns: BTreeMap<CanonicalField, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OverrideStrategy {
    StaticCsv {
        csv_url: String,
    },
    IndexPage {
        index_url: String,
        #[serde(default)]
        direct_csv_url: Option<String>,
        #[serde(default = "default_link_selector")]
        link_selector: String,
        #[serde(default)]
        href_ends_with: Vec<String>,
        #[serde(default)]
        href_contains: Vec<String>,
    },
}

impl CouncilOverride {
    pub fn aliases(&self) -> ColumnAliases {
        self.columns
            .iter()
            .fold(ColumnAliases::default(), |aliases, (field, extra)| {
                aliases.prepend(*field, extra.iter().cloned())
            })
    }

    pub fn into_fetcher(self) -> Arc<dyn CouncilFetcher> {
        let aliases = self.aliases();
        match self.strategy {
            OverrideStrategy::StaticCsv { csv_url } => {
                Arc::new(StaticCsvFetcher::new(self.council, csv_url, aliases))
            }
            OverrideStrategy::IndexPage {
                index_url,
                direct_csv_url,
                link_selector,
                href_ends_with,
                href_contains,
            } => Arc::new(IndexPageFetcher {
                council: self.council,
                index_url,
                direct_csv_url,
                link_selector,
                href_ends_with,
                href_contains,
                csv: GenericCsvFetcher::new(aliases),
            }),
        }
    }
}

pub fn parse_councils_yaml(text: &str) -> Result<CouncilsFile, AdapterError> {
    serde_yaml::from_str(text)
        .map_err(|e| AdapterError::Message(format!("invalid council registry: {e}")))
}

pub fn registry_from_yaml(text: &str) -> Result<FetcherRegistry, AdapterError> {
    let file = parse_councils_yaml(text)?;
    let mut registry = FetcherRegistry::default();
    for entry in file.councils {
        registry.register(entry.into_fetcher());
    }
    Ok(registry)
}

pub fn builtin_registry() -> Result<FetcherRegistry, AdapterError> {
    registry_from_yaml(BUILTIN_COUNCILS_YAML)
}

/// Load overrides from `path` when given, otherwise the built-in set.
pub async fn load_registry(path: Option<&Path>) -> Result<FetcherRegistry, AdapterError> {
    let Some(path) = path else {
        return builtin_registry();
    };
    let text = tokio::fs::read_to_string(path).await.map_err(|e| {
        AdapterError::Message(format!("reading council registry {}: {e}", path.display()))
    })?;
    let registry = registry_from_yaml(&text)?;
    info!(path = %path.display(), overrides = registry.len(), "loaded council registry");
    Ok(registry)
}

/// One fixed CSV file per council.
#[derive(Debug, Clone)]
pub struct StaticCsvFetcher {
    council: String,
    csv_url: String,
    csv: GenericCsvFetcher,
}

impl StaticCsvFetcher {
    pub fn new(council: impl Into<String>, csv_url: impl Into<String>, aliases: ColumnAliases) -> Self {
        Self {
            council: council.into(),
            csv_url: csv_url.into(),
            csv: GenericCsvFetcher::new(aliases),
        }
    }
}

#[async_trait]
impl CouncilFetcher for StaticCsvFetcher {
    fn council(&self) -> &str {
        &self.council
    }

    fn origin(&self) -> &str {
        &self.csv_url
    }

    async fn fetch_records(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        self.csv.fetch(http, ctx, &self.council, &self.csv_url).await
    }
}

/// Scrapes CSV links from an index page and concatenates every linked file.
#[derive(Debug, Clone)]
pub struct IndexPageFetcher {
    council: String,
    index_url: String,
    direct_csv_url: Option<String>,
    link_selector: String,
    href_ends_with: Vec<String>,
    href_contains: Vec<String>,
    csv: GenericCsvFetcher,
}

impl IndexPageFetcher {
    fn href_matches(&self, href: &str) -> bool {
        let href = href.trim().to_lowercase();
        let path = href.split(['?', '#']).next().unwrap_or_default();
        let ends_ok = if self.href_ends_with.is_empty() && self.href_contains.is_empty() {
            path.ends_with(".csv")
        } else {
            self.href_ends_with.is_empty()
                || self
                    .href_ends_with
                    .iter()
                    .any(|suffix| path.ends_with(&suffix.to_lowercase()))
        };
        ends_ok
            && self
                .href_contains
                .iter()
                .all(|needle| href.contains(&needle.to_lowercase()))
    }

    /// Absolute, de-duplicated CSV links on `html`, in document order.
    pub fn csv_links(&self, page_url: &str, html: &str) -> Result<Vec<String>, AdapterError> {
        let selector = Selector::parse(&self.link_selector)
            .map_err(|e| AdapterError::Message(e.to_string()))?;
        let document = Html::parse_document(html);
        let mut seen = HashSet::new();
        let mut links = Vec::new();
        for element in document.select(&selector) {
            let Some(href) = element.value().attr("href") else {
                continue;
            };
            if !self.href_matches(href) {
                continue;
            }
            if let Some(absolute) = resolve_link(page_url, href) {
                if seen.insert(absolute.clone()) {
                    links.push(absolute);
                }
            }
        }
        Ok(links)
    }

    async fn try_direct(&self, http: &HttpFetcher, ctx: &AdapterContext, url: &str) -> Option<Vec<RawRecord>> {
        match self.csv.fetch(http, ctx, &self.council, url).await {
            Ok(records) if !records.is_empty() => Some(records),
            Ok(_) => {
                debug!(council = %self.council, url, "direct CSV is empty");
                None
            }
            Err(err) => {
                debug!(council = %self.council, url, error = %err, "direct CSV unavailable");
                None
            }
        }
    }
}

#[async_trait]
impl CouncilFetcher for IndexPageFetcher {
    fn council(&self) -> &str {
        &self.council
    }

    fn origin(&self) -> &str {
        &self.index_url
    }

    async fn fetch_records(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<RawRecord>, AdapterError> {
        if let Some(url) = &self.direct_csv_url {
            if let Some(records) = self.try_direct(http, ctx, url).await {
                return Ok(records);
            }
        }

        let page = http.fetch_bytes(ctx.run_id, &self.council, &self.index_url).await?;
        let (html, _) = decode_text(&page.body);
        let links = self.csv_links(&page.final_url, &html)?;
        if links.is_empty() {
            return Err(AdapterError::NoLinks {
                url: page.final_url,
            });
        }

        let mut records = Vec::new();
        let mut failed = 0usize;
        let mut last_error = None;
        for link in &links {
            match self.csv.fetch(http, ctx, &self.council, link).await {
                Ok(mut rows) => records.append(&mut rows),
                Err(err) => {
                    warn!(council = %self.council, url = %link, error = %err, "skipping linked file");
                    failed += 1;
                    last_error = Some(err);
                }
            }
        }

        match last_error {
            Some(last) if failed == links.len() => Err(AdapterError::AllFilesFailed {
                council: self.council.clone(),
                files: failed,
                last: Box::new(last),
            }),
            _ => {
                info!(
                    council = %self.council,
                    files = links.len(),
                    failed,
                    rows = records.len(),
                    "fetched index page files"
                );
                Ok(records)
            }
        }
    }
}
