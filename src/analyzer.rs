use anyhow::Result;
use sqlx::PgPool;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::browser::BrowserSession;
use crate::config::Config;
use crate::db::{self, ScrapedResult, SessionStatus};
use crate::engine::SearchEngine;
use crate::export;
use crate::fallback::{FallbackChain, FallbackOutcome};
use crate::page::{analyze_page, PageFetcher};
use crate::proxy::{jitter, ProxyRotator};

/// What one analysis run covers.
#[derive(Debug, Clone, PartialEq)]
pub struct RunPlan {
    pub name: &'static str,
    pub keywords: Vec<String>,
    pub engines: Vec<SearchEngine>,
    pub parse_pages: bool,
    pub use_browser: bool,
    pub export_prefix: &'static str,
    pub report_days: i32,
    pub competitor_limit: i64,
}

impl RunPlan {
    /// Every keyword on both engines.
    pub fn full(config: &Config) -> Self {
        Self {
            name: "analysis",
            keywords: config.keywords.clone(),
            engines: SearchEngine::ALL.to_vec(),
            parse_pages: config.parse_pages,
            use_browser: config.use_browser,
            export_prefix: "seo_results_",
            report_days: 7,
            competitor_limit: 20,
        }
    }

    /// Quick check: first three keywords, Google only, no browser.
    pub fn manual(config: &Config) -> Self {
        Self {
            name: "manual",
            keywords: config.keywords.iter().take(3).cloned().collect(),
            engines: vec![SearchEngine::Google],
            use_browser: false,
            export_prefix: "manual_test_",
            competitor_limit: 10,
            ..Self::full(config)
        }
    }

    pub fn daily(config: &Config) -> Self {
        Self {
            name: "daily",
            use_browser: false,
            ..Self::full(config)
        }
    }

    pub fn weekly(config: &Config) -> Self {
        Self {
            name: "weekly",
            export_prefix: "weekly_analysis_",
            competitor_limit: 50,
            ..Self::full(config)
        }
    }

    pub fn monthly(config: &Config) -> Self {
        Self {
            name: "monthly",
            export_prefix: "monthly_analysis_",
            report_days: 30,
            competitor_limit: 100,
            ..Self::full(config)
        }
    }
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub session_id: i64,
    pub searches: usize,
    pub empty_searches: usize,
    pub results_saved: usize,
    pub failed_saves: usize,
    pub pages_analyzed: usize,
    /// How many searches each source answered.
    pub sources: HashMap<&'static str, usize>,
    pub results_csv: Option<PathBuf>,
    pub competitors_csv: Option<PathBuf>,
    pub report: Option<PathBuf>,
}

/// Final URL and body of a fetched page, `None` when the fetch failed.
type PageCache = HashMap<String, Option<(String, String)>>;

/// Drives a run: search every keyword, analyze the result pages, persist,
/// export.
pub struct Analyzer {
    config: Arc<Config>,
    pool: PgPool,
    rotator: Arc<ProxyRotator>,
    browser: Option<Arc<BrowserSession>>,
    google: FallbackChain,
    yandex: FallbackChain,
    pages: PageFetcher,
}

impl Analyzer {
    pub fn new(config: Arc<Config>, pool: PgPool, use_browser: bool) -> Self {
        let rotator = Arc::new(ProxyRotator::from_config(&config));
        let browser = (use_browser && config.use_browser)
            .then(|| Arc::new(BrowserSession::new(rotator.clone())));

        Self {
            google: FallbackChain::google(config.clone(), rotator.clone(), browser.clone()),
            yandex: FallbackChain::yandex(config.clone(), rotator.clone(), browser.clone()),
            pages: PageFetcher::new(config.clone(), rotator.clone()),
            config,
            pool,
            rotator,
            browser,
        }
    }

    fn chain(&self, engine: SearchEngine) -> &FallbackChain {
        match engine {
            SearchEngine::Google => &self.google,
            SearchEngine::Yandex => &self.yandex,
        }
    }

    /// Searches one keyword on one engine, analyzes the result pages and
    /// saves everything. Returns the fallback outcome and the rows written.
    pub async fn analyze_keyword(
        &self,
        keyword: &str,
        engine: SearchEngine,
        parse_pages: bool,
        cache: &mut PageCache,
    ) -> Result<(FallbackOutcome, usize)> {
        let outcome = self.chain(engine).run(keyword).await;
        if outcome.results.is_empty() {
            return Ok((outcome, 0));
        }

        let mut scraped = Vec::with_capacity(outcome.results.len());
        for result in &outcome.results {
            let page = if parse_pages {
                self.page_for(&result.url, cache)
                    .await
                    .map(|(final_url, html)| analyze_page(&final_url, &html, Some(keyword)))
            } else {
                None
            };
            scraped.push(ScrapedResult {
                result: result.clone(),
                page,
            });
        }

        let region = engine.region(&self.config);
        let saved = db::save_search_results(&self.pool, keyword, engine, region, &scraped).await?;
        info!(keyword, engine = %engine, saved, "keyword analyzed");
        Ok((outcome, saved))
    }

    async fn page_for(&self, url: &str, cache: &mut PageCache) -> Option<(String, String)> {
        if let Some(hit) = cache.get(url) {
            return hit.clone();
        }
        if self.config.delay_max > 0.0 {
            jitter(0.5, 1.5).await;
        }
        let page = self.pages.fetch(url).await;
        cache.insert(url.to_string(), page.clone());
        page
    }

    /// Runs `plan` inside an analysis session. The session ends `failed`
    /// when nothing could be saved or the export step errors.
    pub async fn run(&self, plan: &RunPlan) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("run", plan = plan.name, %run_id);
        self.run_session(plan, run_id).instrument(span).await
    }

    async fn run_session(&self, plan: &RunPlan, run_id: Uuid) -> Result<RunSummary> {
        let session_name = format!("{} {}", plan.name, run_id);
        let session_id = db::create_session(&self.pool, &session_name, plan.keywords.len()).await?;
        info!(
            session_id,
            keywords = plan.keywords.len(),
            engines = plan.engines.len(),
            "analysis started"
        );

        let mut summary = self.search_all(plan).await;
        summary.session_id = session_id;

        let failure = if summary.results_saved == 0 && summary.failed_saves > 0 {
            Some(format!("all {} saves failed", summary.failed_saves))
        } else {
            match self.export(plan, &mut summary).await {
                Ok(()) => None,
                Err(e) => Some(format!("export failed: {:#}", e)),
            }
        };

        let status = if failure.is_some() {
            SessionStatus::Failed
        } else {
            SessionStatus::Completed
        };
        db::finish_session(
            &self.pool,
            session_id,
            status,
            summary.results_saved,
            failure.as_deref(),
        )
        .await?;

        match failure {
            Some(message) => {
                error!(session_id, "analysis failed: {}", message);
                Err(anyhow::anyhow!(message))
            }
            None => {
                info!(
                    session_id,
                    searches = summary.searches,
                    results = summary.results_saved,
                    empty = summary.empty_searches,
                    "analysis completed"
                );
                Ok(summary)
            }
        }
    }

    async fn search_all(&self, plan: &RunPlan) -> RunSummary {
        let mut summary = RunSummary::default();
        let mut cache = PageCache::new();
        let mut first = true;

        for keyword in &plan.keywords {
            for &engine in &plan.engines {
                if !first {
                    self.rotator.random_delay().await;
                }
                first = false;

                summary.searches += 1;
                match self
                    .analyze_keyword(keyword, engine, plan.parse_pages, &mut cache)
                    .await
                {
                    Ok((outcome, saved)) => {
                        match outcome.source {
                            Some(source) => *summary.sources.entry(source).or_default() += 1,
                            None => summary.empty_searches += 1,
                        }
                        summary.results_saved += saved;
                    }
                    Err(e) => {
                        summary.failed_saves += 1;
                        error!(keyword = keyword.as_str(), engine = %engine, "failed to save results: {:#}", e);
                    }
                }
            }
        }

        summary.pages_analyzed = cache.values().filter(|page| page.is_some()).count();
        summary
    }

    async fn export(&self, plan: &RunPlan, summary: &mut RunSummary) -> Result<()> {
        let csv_dir = &self.config.csv_output_dir;
        summary.results_csv =
            Some(export::export_results(&self.pool, csv_dir, plan.export_prefix, plan.report_days).await?);
        summary.competitors_csv = Some(export::export_competitors(&self.pool, csv_dir).await?);

        let (report, _) = export::generate_report(
            &self.pool,
            &self.config.report_output_dir,
            plan.report_days,
            plan.competitor_limit,
        )
        .await?;
        summary.report = Some(report);
        Ok(())
    }

    /// Shuts the browser down if one was started.
    pub async fn close(&self) {
        if let Some(browser) = &self.browser {
            browser.close().await;
        }
    }
}

/// Runs one keyword through the engine's chain without touching the
/// database.
pub async fn smoke_test(config: Arc<Config>, keyword: &str, engine: SearchEngine) -> FallbackOutcome {
    let rotator = Arc::new(ProxyRotator::from_config(&config));
    let browser = config
        .use_browser
        .then(|| Arc::new(BrowserSession::new(rotator.clone())));
    let chain = FallbackChain::for_engine(engine, config, rotator, browser.clone());
    info!(engine = %engine, sources = ?chain.source_names(), keyword, "smoke test");

    let outcome = chain.run(keyword).await;
    if outcome.results.is_empty() {
        warn!(engine = %engine, keyword, "smoke test found no results");
    }
    if let Some(browser) = browser {
        browser.close().await;
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            keywords: vec!["a".into(), "b".into(), "c".into(), "d".into()],
            ..Config::default()
        }
    }

    #[test]
    fn full_plan_covers_everything() {
        let plan = RunPlan::full(&config());
        assert_eq!(plan.keywords.len(), 4);
        assert_eq!(plan.engines, vec![SearchEngine::Google, SearchEngine::Yandex]);
        assert!(plan.use_browser);
        assert_eq!(plan.report_days, 7);
    }

    #[test]
    fn manual_plan_is_reduced() {
        let plan = RunPlan::manual(&config());
        assert_eq!(plan.keywords, vec!["a", "b", "c"]);
        assert_eq!(plan.engines, vec![SearchEngine::Google]);
        assert!(!plan.use_browser);
        assert_eq!(plan.competitor_limit, 10);
    }

    #[test]
    fn scheduled_plans_differ_in_depth() {
        let config = config();
        assert!(!RunPlan::daily(&config).use_browser);
        assert_eq!(RunPlan::weekly(&config).competitor_limit, 50);
        let monthly = RunPlan::monthly(&config);
        assert_eq!(monthly.report_days, 30);
        assert_eq!(monthly.competitor_limit, 100);
        assert_eq!(monthly.export_prefix, "monthly_analysis_");
    }

    #[test]
    fn manual_plan_with_few_keywords_takes_what_exists() {
        let config = Config {
            keywords: vec!["only".into()],
            ..Config::default()
        };
        assert_eq!(RunPlan::manual(&config).keywords, vec!["only"]);
    }
}
