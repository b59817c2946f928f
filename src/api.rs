use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::error;
use utoipa::{IntoParams, ToSchema};

use crate::config::Config;
use crate::db::{self, AnalysisSession, CompetitorRollup, KeywordPosition, KeywordStats, RecentResult};
use crate::engine::SearchEngine;
use crate::export;

pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<Config>,
}

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Internal(e)
    }
}

#[derive(Serialize, ToSchema)]
pub struct ErrorBody {
    pub error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            ApiError::Internal(e) => {
                error!("request failed: {:#}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };
        (status, Json(ErrorBody { error: message })).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct LimitQuery {
    /// Maximum rows to return (default 20)
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct RecentQuery {
    /// Look-back window in days (default 7)
    pub days: Option<i32>,
    pub engine: Option<SearchEngine>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct DaysQuery {
    /// Look-back window in days (default 7)
    pub days: Option<i32>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct EngineQuery {
    /// Search engine (default google)
    pub engine: Option<SearchEngine>,
}

#[derive(Serialize, ToSchema)]
pub struct ExportResponse {
    pub path: String,
}

#[derive(Serialize, ToSchema)]
pub struct ReportResponse {
    pub path: String,
    #[schema(value_type = Object)]
    pub report: serde_json::Value,
}

/// Settings safe to show on the dashboard; API keys are reduced to flags.
#[derive(Debug, Serialize, ToSchema)]
pub struct ConfigView {
    pub google_region: String,
    pub google_language: String,
    pub yandex_region: String,
    pub max_results: usize,
    pub keywords: Vec<String>,
    pub parse_pages: bool,
    pub use_proxy: bool,
    pub proxy_count: usize,
    pub scraper_api_configured: bool,
    pub serpapi_configured: bool,
    pub use_browser: bool,
    pub use_alternative_parser: bool,
    pub schedule_daily: String,
    pub schedule_weekly: String,
    pub schedule_monthly: String,
}

impl From<&Config> for ConfigView {
    fn from(config: &Config) -> Self {
        Self {
            google_region: config.google_region.clone(),
            google_language: config.google_language.clone(),
            yandex_region: config.yandex_region.clone(),
            max_results: config.max_results,
            keywords: config.keywords.clone(),
            parse_pages: config.parse_pages,
            use_proxy: config.use_proxy,
            proxy_count: config.proxy_list.len(),
            scraper_api_configured: config.scraper_api_key.is_some(),
            serpapi_configured: config.serpapi_key.is_some(),
            use_browser: config.use_browser,
            use_alternative_parser: config.use_alternative_parser,
            schedule_daily: config.schedule_daily.clone(),
            schedule_weekly: config.schedule_weekly.clone(),
            schedule_monthly: config.schedule_monthly.clone(),
        }
    }
}

fn days_or_default(days: Option<i32>) -> i32 {
    days.filter(|d| *d > 0).unwrap_or(7)
}

/// Domains ranked by how often they appear in results
#[utoipa::path(
    get,
    path = "/api/competitors",
    params(LimitQuery),
    responses((status = 200, description = "Competitor rollups", body = [CompetitorRollup])),
    tag = "analytics"
)]
pub async fn list_competitors(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Vec<CompetitorRollup>> {
    let limit = query.limit.filter(|l| *l > 0).unwrap_or(20);
    Ok(Json(db::competitor_rollups(&state.pool, Some(limit)).await?))
}

/// Results scraped in the last N days
#[utoipa::path(
    get,
    path = "/api/results/recent",
    params(RecentQuery),
    responses((status = 200, description = "Recent results, newest first", body = [RecentResult])),
    tag = "analytics"
)]
pub async fn recent_results(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecentQuery>,
) -> ApiResult<Vec<RecentResult>> {
    let rows = db::recent_results(&state.pool, days_or_default(query.days), query.engine).await?;
    Ok(Json(rows))
}

/// Per-keyword result counts and positions
#[utoipa::path(
    get,
    path = "/api/keywords/stats",
    params(DaysQuery),
    responses((status = 200, description = "Keyword statistics", body = [KeywordStats])),
    tag = "analytics"
)]
pub async fn keyword_stats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DaysQuery>,
) -> ApiResult<Vec<KeywordStats>> {
    Ok(Json(db::keyword_stats(&state.pool, days_or_default(query.days)).await?))
}

#[utoipa::path(
    get,
    path = "/api/keywords/{keyword}/positions",
    params(
        ("keyword" = String, Path, description = "Tracked keyword"),
        EngineQuery
    ),
    responses((status = 200, description = "Positions ordered by rank", body = [KeywordPosition])),
    tag = "analytics"
)]
pub async fn keyword_positions(
    State(state): State<Arc<AppState>>,
    Path(keyword): Path<String>,
    Query(query): Query<EngineQuery>,
) -> ApiResult<Vec<KeywordPosition>> {
    let engine = query.engine.unwrap_or(SearchEngine::Google);
    Ok(Json(db::keyword_positions(&state.pool, &keyword, engine).await?))
}

#[utoipa::path(
    get,
    path = "/api/sessions",
    params(LimitQuery),
    responses((status = 200, description = "Recent analysis sessions", body = [AnalysisSession])),
    tag = "analytics"
)]
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Vec<AnalysisSession>> {
    let limit = query.limit.filter(|l| *l > 0).unwrap_or(20);
    Ok(Json(db::recent_sessions(&state.pool, limit).await?))
}

/// Refreshes the competitor snapshot and writes a new JSON report
#[utoipa::path(
    post,
    path = "/api/report",
    params(DaysQuery),
    responses(
        (status = 200, description = "Report written", body = ReportResponse),
        (status = 500, description = "Database or filesystem error", body = ErrorBody)
    ),
    tag = "reports"
)]
pub async fn generate_report(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DaysQuery>,
) -> ApiResult<ReportResponse> {
    let (path, report) = export::generate_report(
        &state.pool,
        &state.config.report_output_dir,
        days_or_default(query.days),
        20,
    )
    .await?;
    let report = serde_json::to_value(&report).map_err(anyhow::Error::from)?;
    Ok(Json(ReportResponse {
        path: path.display().to_string(),
        report,
    }))
}

#[utoipa::path(
    get,
    path = "/api/report",
    responses(
        (status = 200, description = "Most recent report"),
        (status = 404, description = "No report generated yet", body = ErrorBody)
    ),
    tag = "reports"
)]
pub async fn latest_report(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, ApiError> {
    match export::read_latest_report(&state.config.report_output_dir)? {
        Some(report) => Ok(Json(report)),
        None => Err(ApiError::NotFound("no report has been generated yet".to_string())),
    }
}

#[utoipa::path(
    post,
    path = "/api/export/results",
    params(DaysQuery),
    responses((status = 200, description = "CSV written", body = ExportResponse)),
    tag = "reports"
)]
pub async fn export_results(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DaysQuery>,
) -> ApiResult<ExportResponse> {
    let path = export::export_results(
        &state.pool,
        &state.config.csv_output_dir,
        "seo_results_",
        days_or_default(query.days),
    )
    .await?;
    Ok(Json(ExportResponse {
        path: path.display().to_string(),
    }))
}

#[utoipa::path(
    post,
    path = "/api/export/competitors",
    responses((status = 200, description = "CSV written", body = ExportResponse)),
    tag = "reports"
)]
pub async fn export_competitors(State(state): State<Arc<AppState>>) -> ApiResult<ExportResponse> {
    let path = export::export_competitors(&state.pool, &state.config.csv_output_dir).await?;
    Ok(Json(ExportResponse {
        path: path.display().to_string(),
    }))
}

#[utoipa::path(
    get,
    path = "/api/config",
    responses((status = 200, description = "Active settings without secrets", body = ConfigView)),
    tag = "settings"
)]
pub async fn get_config(State(state): State<Arc<AppState>>) -> Json<ConfigView> {
    Json(ConfigView::from(state.config.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_view_hides_keys() {
        let config = Config {
            scraper_api_key: Some("secret".into()),
            proxy_list: vec!["http://a:1".into(), "http://b:2".into()],
            ..Config::default()
        };
        let view = ConfigView::from(&config);
        assert!(view.scraper_api_configured);
        assert!(!view.serpapi_configured);
        assert_eq!(view.proxy_count, 2);

        let json = serde_json::to_string(&view).unwrap();
        assert!(!json.contains("secret"));
        assert!(!json.contains("http://a:1"));
    }

    #[test]
    fn errors_map_to_status_codes() {
        let not_found = ApiError::NotFound("nothing".into()).into_response();
        assert_eq!(not_found.status(), StatusCode::NOT_FOUND);

        let internal = ApiError::from(anyhow::anyhow!("boom")).into_response();
        assert_eq!(internal.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn non_positive_days_fall_back_to_a_week() {
        assert_eq!(days_or_default(None), 7);
        assert_eq!(days_or_default(Some(0)), 7);
        assert_eq!(days_or_default(Some(-3)), 7);
        assert_eq!(days_or_default(Some(30)), 30);
    }
}
