//! Ways of getting an organic results list for one keyword.
//!
//! Every source implements [`SerpSource`]; the fallback chain tries them in
//! order. Sources report failures as [`FetchError`] so the chain can tell a
//! block page from a network problem when it logs.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::browser::BrowserSession;
use crate::config::Config;
use crate::engine::SearchEngine;
use crate::extract::{domain_of, extract_results, OrganicResult};
use crate::proxy::{HeaderProfile, ProxyRotator};

pub const SCRAPER_API_URL: &str = "http://api.scraperapi.com";
pub const SERPAPI_URL: &str = "https://serpapi.com/search.json";

const SCRAPER_API_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("{0} served a CAPTCHA or block page")]
    Blocked(SearchEngine),
    #[error("{0} is not configured")]
    MissingKey(&'static str),
    #[error("browser error: {0}")]
    Browser(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait SerpSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Organic results for `keyword`, positions numbered from 1. An empty
    /// list is a valid answer and lets the chain move on.
    async fn fetch(&self, keyword: &str) -> Result<Vec<OrganicResult>, FetchError>;
}

/// Extracts results from fetched HTML, turning a block page into an error.
fn results_from_html(
    engine: SearchEngine,
    source: &str,
    html: &str,
    limit: usize,
) -> Result<Vec<OrganicResult>, FetchError> {
    let outcome = extract_results(engine, html);
    if outcome.blocked {
        return Err(FetchError::Blocked(engine));
    }
    debug!(
        source,
        strategy = outcome.strategy.unwrap_or("none"),
        candidates = outcome.candidates,
        kept = outcome.results.len(),
        skipped = outcome.skipped.total(),
        "extracted results"
    );
    let mut results = outcome.results;
    results.truncate(limit);
    Ok(results)
}

/// Plain HTTP GET of the engine's results page.
pub struct DirectHttpSource {
    name: &'static str,
    engine: SearchEngine,
    config: Arc<Config>,
    rotator: Arc<ProxyRotator>,
    profile: HeaderProfile,
    endpoint: String,
}

impl DirectHttpSource {
    pub fn new(engine: SearchEngine, config: Arc<Config>, rotator: Arc<ProxyRotator>) -> Self {
        Self {
            name: "direct",
            engine,
            config,
            rotator,
            profile: HeaderProfile::Standard,
            endpoint: engine.default_endpoint().to_string(),
        }
    }

    /// Same request with the alternate header profile.
    pub fn alternate(engine: SearchEngine, config: Arc<Config>, rotator: Arc<ProxyRotator>) -> Self {
        Self {
            name: "direct-alt",
            profile: HeaderProfile::Alternate,
            ..Self::new(engine, config, rotator)
        }
    }

    #[cfg(test)]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl SerpSource for DirectHttpSource {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn fetch(&self, keyword: &str) -> Result<Vec<OrganicResult>, FetchError> {
        let url = self
            .engine
            .search_url(&self.endpoint, &self.config, keyword)
            .map_err(|e| FetchError::InvalidResponse(e.to_string()))?;
        let client = self.rotator.client(self.profile, self.config.request_timeout)?;

        debug!(source = self.name, %url, "requesting results page");
        let response = client.get(url).send().await?;

        if self.engine.is_blocked_url(response.url().as_str()) {
            return Err(FetchError::Blocked(self.engine));
        }
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let html = response.text().await?;
        results_from_html(self.engine, self.name, &html, self.config.max_results)
    }
}

/// Proxy-rendering service: asks ScraperAPI to fetch the results page.
pub struct ScraperApiSource {
    engine: SearchEngine,
    config: Arc<Config>,
    rotator: Arc<ProxyRotator>,
    api_key: String,
    endpoint: String,
}

impl ScraperApiSource {
    pub fn from_config(
        engine: SearchEngine,
        config: Arc<Config>,
        rotator: Arc<ProxyRotator>,
    ) -> Result<Self, FetchError> {
        let api_key = config
            .scraper_api_key
            .clone()
            .ok_or(FetchError::MissingKey("SCRAPER_API_KEY"))?;
        Ok(Self {
            engine,
            config,
            rotator,
            api_key,
            endpoint: SCRAPER_API_URL.to_string(),
        })
    }

    #[cfg(test)]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl SerpSource for ScraperApiSource {
    fn name(&self) -> &'static str {
        "scraperapi"
    }

    async fn fetch(&self, keyword: &str) -> Result<Vec<OrganicResult>, FetchError> {
        let target = self
            .engine
            .search_url(self.engine.default_endpoint(), &self.config, keyword)
            .map_err(|e| FetchError::InvalidResponse(e.to_string()))?;

        let response = reqwest::Client::builder()
            .user_agent(self.rotator.random_user_agent())
            .timeout(SCRAPER_API_TIMEOUT)
            .build()?
            .get(&self.endpoint)
            .query(&[
                ("api_key", self.api_key.as_str()),
                ("url", target.as_str()),
                ("country_code", self.config.google_region.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        let html = response.text().await?;
        results_from_html(self.engine, self.name(), &html, self.config.max_results)
    }
}

#[derive(Debug, Deserialize)]
struct SerpApiResponse {
    #[serde(default)]
    organic_results: Vec<SerpApiOrganic>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SerpApiOrganic {
    title: Option<String>,
    link: Option<String>,
    snippet: Option<String>,
}

/// Structured SERP API: Google results as JSON, no HTML parsing.
pub struct SerpApiSource {
    config: Arc<Config>,
    api_key: String,
    endpoint: String,
}

impl SerpApiSource {
    pub fn from_config(config: Arc<Config>) -> Result<Self, FetchError> {
        let api_key = config
            .serpapi_key
            .clone()
            .ok_or(FetchError::MissingKey("SERPAPI_KEY"))?;
        Ok(Self {
            config,
            api_key,
            endpoint: SERPAPI_URL.to_string(),
        })
    }

    #[cfg(test)]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

#[async_trait]
impl SerpSource for SerpApiSource {
    fn name(&self) -> &'static str {
        "serpapi"
    }

    async fn fetch(&self, keyword: &str) -> Result<Vec<OrganicResult>, FetchError> {
        let num = self.config.max_results.to_string();
        let response = reqwest::Client::builder()
            .timeout(self.config.request_timeout)
            .build()?
            .get(&self.endpoint)
            .query(&[
                ("engine", "google"),
                ("q", keyword),
                ("api_key", self.api_key.as_str()),
                ("gl", self.config.google_region.as_str()),
                ("hl", self.config.google_language.as_str()),
                ("num", num.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        let body: SerpApiResponse = response
            .json()
            .await
            .map_err(|e| FetchError::InvalidResponse(e.to_string()))?;
        if let Some(error) = body.error {
            return Err(FetchError::InvalidResponse(error));
        }

        let mut seen = HashSet::new();
        let mut results = Vec::new();
        for item in body.organic_results {
            let (Some(title), Some(url)) = (item.title, item.link) else {
                continue;
            };
            let title = title.trim().to_string();
            let Some(domain) = domain_of(&url) else {
                continue;
            };
            if title.is_empty()
                || SearchEngine::Google.is_own_host(&domain)
                || !seen.insert(url.clone())
            {
                continue;
            }
            results.push(OrganicResult {
                position: results.len() as u32 + 1,
                title,
                url,
                domain,
                description: item.snippet.unwrap_or_default().trim().to_string(),
            });
            if results.len() >= self.config.max_results {
                break;
            }
        }
        Ok(results)
    }
}

/// Renders the results page in headless Chrome.
pub struct BrowserSource {
    engine: SearchEngine,
    config: Arc<Config>,
    session: Arc<BrowserSession>,
}

impl BrowserSource {
    pub fn new(engine: SearchEngine, config: Arc<Config>, session: Arc<BrowserSession>) -> Self {
        Self {
            engine,
            config,
            session,
        }
    }
}

#[async_trait]
impl SerpSource for BrowserSource {
    fn name(&self) -> &'static str {
        "browser"
    }

    async fn fetch(&self, keyword: &str) -> Result<Vec<OrganicResult>, FetchError> {
        let url = self
            .engine
            .search_url(self.engine.default_endpoint(), &self.config, keyword)
            .map_err(|e| FetchError::InvalidResponse(e.to_string()))?;

        let (final_url, html) = self.session.render(url.as_str()).await?;
        if self.engine.is_blocked_url(&final_url) {
            return Err(FetchError::Blocked(self.engine));
        }
        results_from_html(self.engine, self.name(), &html, self.config.max_results)
    }
}
