mod analyzer;
mod api;
mod browser;
mod config;
mod db;
mod engine;
mod export;
mod extract;
mod fallback;
mod fetch;
mod page;
mod proxy;
mod scheduler;

use axum::{
    routing::{get, post},
    Router,
};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use std::sync::Arc;
use tower_http::services::ServeDir;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::analyzer::{Analyzer, RunPlan};
use crate::config::Config;
use crate::engine::SearchEngine;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::list_competitors,
        api::recent_results,
        api::keyword_stats,
        api::keyword_positions,
        api::list_sessions,
        api::generate_report,
        api::latest_report,
        api::export_results,
        api::export_competitors,
        api::get_config
    ),
    components(
        schemas(
            db::CompetitorRollup,
            db::RecentResult,
            db::KeywordStats,
            db::KeywordPosition,
            db::AnalysisSession,
            api::ExportResponse,
            api::ReportResponse,
            api::ConfigView,
            api::ErrorBody,
            engine::SearchEngine
        )
    ),
    tags(
        (name = "analytics", description = "Positions and competitor rollups"),
        (name = "reports", description = "CSV exports and JSON reports"),
        (name = "settings", description = "Active configuration")
    )
)]
struct ApiDoc;

#[derive(Parser)]
#[command(name = "serp-crawler", version, about = "SERP competitor analysis for Google and Yandex")]
struct Cli {
    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Full run: every keyword on Google and Yandex, page analysis, export
    Analysis,
    /// Serve the JSON API and dashboard page
    Dashboard,
    /// Fetch one keyword through the fallback chain without saving
    Test {
        #[arg(short, long)]
        keyword: Option<String>,
        #[arg(short, long, value_enum, default_value_t = SearchEngine::Google)]
        engine: SearchEngine,
    },
    /// Run the daily/weekly/monthly schedule until Ctrl-C
    Scheduler,
    /// Reduced run: first three keywords, Google only
    Manual,
    /// Create the database schema
    InitDb,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = Arc::new(Config::from_env());

    match cli.command {
        Command::Analysis => run_plan(config.clone(), RunPlan::full(&config)).await,
        Command::Manual => run_plan(config.clone(), RunPlan::manual(&config)).await,
        Command::Test { keyword, engine } => smoke_test(config, keyword, engine).await,
        Command::InitDb => {
            let pool = db::connect(&config.database_url).await?;
            db::init_db(&pool).await
        }
        Command::Dashboard => serve_dashboard(config).await,
        Command::Scheduler => run_scheduler(config).await,
    }
}

async fn run_plan(config: Arc<Config>, plan: RunPlan) -> anyhow::Result<()> {
    let pool = db::connect(&config.database_url).await?;
    db::init_db(&pool).await?;

    let analyzer = Analyzer::new(config, pool, plan.use_browser);
    let outcome = analyzer.run(&plan).await;
    analyzer.close().await;

    let summary = outcome?;
    info!(
        searches = summary.searches,
        results = summary.results_saved,
        pages = summary.pages_analyzed,
        sources = ?summary.sources,
        "run finished"
    );
    if let Some(report) = &summary.report {
        info!("report: {}", report.display());
    }
    Ok(())
}

async fn smoke_test(config: Arc<Config>, keyword: Option<String>, engine: SearchEngine) -> anyhow::Result<()> {
    let keyword = keyword
        .or_else(|| config.keywords.first().cloned())
        .ok_or_else(|| anyhow::anyhow!("no keyword given and none configured"))?;

    let outcome = analyzer::smoke_test(config, &keyword, engine).await;
    println!(
        "{} results for '{}' on {} (source: {})",
        outcome.results.len(),
        keyword,
        engine,
        outcome.source.unwrap_or("none")
    );
    for result in &outcome.results {
        println!("{:>3}. {} | {}", result.position, result.title, result.url);
    }
    if outcome.results.is_empty() {
        anyhow::bail!("no results for '{}' on {}", keyword, engine);
    }
    Ok(())
}

async fn serve_dashboard(config: Arc<Config>) -> anyhow::Result<()> {
    let pool = db::connect(&config.database_url).await?;
    db::init_db(&pool).await?;

    let addr = config.dashboard_addr();
    let state = Arc::new(api::AppState { pool, config });

    let app = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/api/competitors", get(api::list_competitors))
        .route("/api/results/recent", get(api::recent_results))
        .route("/api/keywords/stats", get(api::keyword_stats))
        .route("/api/keywords/:keyword/positions", get(api::keyword_positions))
        .route("/api/sessions", get(api::list_sessions))
        .route("/api/report", post(api::generate_report).get(api::latest_report))
        .route("/api/export/results", post(api::export_results))
        .route("/api/export/competitors", post(api::export_competitors))
        .route("/api/config", get(api::get_config))
        .fallback_service(ServeDir::new("static"))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("dashboard listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn run_scheduler(config: Arc<Config>) -> anyhow::Result<()> {
    let pool = db::connect(&config.database_url).await?;
    db::init_db(&pool).await?;

    let mut sched = scheduler::start_scheduler(config, pool).await?;
    tokio::signal::ctrl_c().await?;
    warn!("interrupt received, stopping scheduler");
    sched.shutdown().await?;
    Ok(())
}
