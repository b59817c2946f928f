use std::sync::Arc;
use tracing::{info, warn};

use crate::browser::BrowserSession;
use crate::config::Config;
use crate::engine::SearchEngine;
use crate::extract::OrganicResult;
use crate::fetch::{
    BrowserSource, DirectHttpSource, FetchError, ScraperApiSource, SerpApiSource, SerpSource,
};
use crate::proxy::ProxyRotator;

#[derive(Debug, Default)]
pub struct FallbackOutcome {
    pub results: Vec<OrganicResult>,
    /// Source that produced `results`, `None` when every source came up empty.
    pub source: Option<&'static str>,
}

/// Ordered list of sources for one engine. The first non-empty answer wins.
pub struct FallbackChain {
    engine: SearchEngine,
    sources: Vec<Box<dyn SerpSource>>,
}

impl FallbackChain {
    pub fn new(engine: SearchEngine, sources: Vec<Box<dyn SerpSource>>) -> Self {
        Self { engine, sources }
    }

    /// direct, direct-alt, scraperapi, serpapi, browser. Keyed services are
    /// skipped without a key; with the alternative parser off only direct
    /// fetch and the browser remain.
    pub fn google(
        config: Arc<Config>,
        rotator: Arc<ProxyRotator>,
        browser: Option<Arc<BrowserSession>>,
    ) -> Self {
        let engine = SearchEngine::Google;
        let mut sources: Vec<Box<dyn SerpSource>> = vec![Box::new(DirectHttpSource::new(
            engine,
            config.clone(),
            rotator.clone(),
        ))];

        if config.use_alternative_parser {
            sources.push(Box::new(DirectHttpSource::alternate(
                engine,
                config.clone(),
                rotator.clone(),
            )));
            match ScraperApiSource::from_config(engine, config.clone(), rotator.clone()) {
                Ok(source) => sources.push(Box::new(source)),
                Err(e) => info!("scraperapi fallback disabled: {}", e),
            }
            match SerpApiSource::from_config(config.clone()) {
                Ok(source) => sources.push(Box::new(source)),
                Err(e) => info!("serpapi fallback disabled: {}", e),
            }
        }

        if let Some(session) = browser.filter(|_| config.use_browser) {
            sources.push(Box::new(BrowserSource::new(engine, config, session)));
        }
        Self::new(engine, sources)
    }

    pub fn yandex(
        config: Arc<Config>,
        rotator: Arc<ProxyRotator>,
        browser: Option<Arc<BrowserSession>>,
    ) -> Self {
        let engine = SearchEngine::Yandex;
        let mut sources: Vec<Box<dyn SerpSource>> =
            vec![Box::new(DirectHttpSource::new(engine, config.clone(), rotator))];
        if let Some(session) = browser.filter(|_| config.use_browser) {
            sources.push(Box::new(BrowserSource::new(engine, config, session)));
        }
        Self::new(engine, sources)
    }

    pub fn for_engine(
        engine: SearchEngine,
        config: Arc<Config>,
        rotator: Arc<ProxyRotator>,
        browser: Option<Arc<BrowserSession>>,
    ) -> Self {
        match engine {
            SearchEngine::Google => Self::google(config, rotator, browser),
            SearchEngine::Yandex => Self::yandex(config, rotator, browser),
        }
    }

    pub fn source_names(&self) -> Vec<&'static str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    /// Tries each source in turn. Failures are logged and treated as an
    /// empty answer; later sources are not called once one succeeds.
    pub async fn run(&self, keyword: &str) -> FallbackOutcome {
        for source in &self.sources {
            match source.fetch(keyword).await {
                Ok(results) if !results.is_empty() => {
                    info!(
                        engine = %self.engine,
                        source = source.name(),
                        keyword,
                        count = results.len(),
                        "results found"
                    );
                    return FallbackOutcome {
                        results,
                        source: Some(source.name()),
                    };
                }
                Ok(_) => {
                    info!(engine = %self.engine, source = source.name(), keyword, "no results, trying next source");
                }
                Err(e @ FetchError::Blocked(_)) => {
                    warn!(engine = %self.engine, source = source.name(), keyword, "{}", e);
                }
                Err(e) => {
                    warn!(engine = %self.engine, source = source.name(), keyword, "source failed: {}", e);
                }
            }
        }

        warn!(engine = %self.engine, keyword, "all sources exhausted without results");
        FallbackOutcome::default()
    }
}
