use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;

use crate::engine::SearchEngine;
use crate::extract::OrganicResult;
use crate::page::PageAnalysis;

const CONNECT_ATTEMPTS: u32 = 15;
const CONNECT_BACKOFF: Duration = Duration::from_secs(2);

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS keywords (
        id BIGSERIAL PRIMARY KEY,
        keyword VARCHAR(500) NOT NULL,
        search_engine VARCHAR(50) NOT NULL,
        region VARCHAR(50) NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        UNIQUE (keyword, search_engine, region)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS search_results (
        id BIGSERIAL PRIMARY KEY,
        keyword_id BIGINT NOT NULL REFERENCES keywords(id),
        position INTEGER NOT NULL CHECK (position > 0),
        title VARCHAR(1000) NOT NULL,
        url VARCHAR(2000) NOT NULL,
        domain VARCHAR(500) NOT NULL,
        description TEXT,
        search_engine VARCHAR(50) NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_search_results_domain ON search_results (domain)",
    "CREATE INDEX IF NOT EXISTS idx_search_results_created_at ON search_results (created_at)",
    r#"
    CREATE TABLE IF NOT EXISTS page_data (
        id BIGSERIAL PRIMARY KEY,
        search_result_id BIGINT NOT NULL UNIQUE REFERENCES search_results(id),
        title VARCHAR(1000),
        description TEXT,
        keywords TEXT,
        h1_tags TEXT,
        h2_tags TEXT,
        h3_tags TEXT,
        word_count INTEGER NOT NULL DEFAULT 0,
        images_count INTEGER NOT NULL DEFAULT 0,
        links_count INTEGER NOT NULL DEFAULT 0,
        has_title BOOLEAN NOT NULL DEFAULT FALSE,
        has_description BOOLEAN NOT NULL DEFAULT FALSE,
        has_keywords BOOLEAN NOT NULL DEFAULT FALSE,
        has_h1 BOOLEAN NOT NULL DEFAULT FALSE,
        has_images_with_alt BOOLEAN NOT NULL DEFAULT FALSE,
        has_canonical BOOLEAN NOT NULL DEFAULT FALSE,
        has_robots BOOLEAN NOT NULL DEFAULT FALSE,
        has_schema BOOLEAN NOT NULL DEFAULT FALSE,
        is_https BOOLEAN NOT NULL DEFAULT FALSE,
        keyword_density DOUBLE PRECISION NOT NULL DEFAULT 0,
        keyword_count INTEGER NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS competitors (
        id BIGSERIAL PRIMARY KEY,
        domain VARCHAR(500) NOT NULL UNIQUE,
        name VARCHAR(500),
        description TEXT,
        website_url VARCHAR(2000),
        total_positions BIGINT NOT NULL DEFAULT 0,
        avg_position DOUBLE PRECISION NOT NULL DEFAULT 0,
        top_3_positions BIGINT NOT NULL DEFAULT 0,
        top_10_positions BIGINT NOT NULL DEFAULT 0,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS analysis_sessions (
        id BIGSERIAL PRIMARY KEY,
        session_name VARCHAR(500) NOT NULL,
        keywords_count INTEGER NOT NULL DEFAULT 0,
        results_count INTEGER NOT NULL DEFAULT 0,
        status VARCHAR(50) NOT NULL DEFAULT 'running',
        started_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        completed_at TIMESTAMPTZ,
        error_message TEXT
    )
    "#,
];

/// Connects with a retry loop; the database container is often still
/// starting when the crawler comes up.
pub async fn connect(database_url: &str) -> Result<PgPool> {
    info!("connecting to database");
    let mut attempts = 0;
    loop {
        match PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
        {
            Ok(pool) => {
                info!("database connected");
                return Ok(pool);
            }
            Err(e) => {
                attempts += 1;
                if attempts >= CONNECT_ATTEMPTS {
                    error!("failed to connect to database after {} attempts", attempts);
                    return Err(e).context("database connection failed");
                }
                warn!(
                    "database connect failed ({}), retrying in {}s (attempt {}/{})",
                    e,
                    CONNECT_BACKOFF.as_secs(),
                    attempts,
                    CONNECT_ATTEMPTS
                );
                tokio::time::sleep(CONNECT_BACKOFF).await;
            }
        }
    }
}

pub async fn init_db(pool: &PgPool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    info!("database schema ready");
    Ok(())
}

/// One scraped result with the analysis of its page, if it was fetched.
#[derive(Debug, Clone)]
pub struct ScrapedResult {
    pub result: OrganicResult,
    pub page: Option<PageAnalysis>,
}

/// Saves one keyword's results in a single transaction. The keyword row is
/// created on first sighting. Returns the number of result rows written.
pub async fn save_search_results(
    pool: &PgPool,
    keyword: &str,
    engine: SearchEngine,
    region: &str,
    results: &[ScrapedResult],
) -> Result<usize> {
    let mut tx = pool.begin().await?;

    let keyword_id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO keywords (keyword, search_engine, region)
        VALUES ($1, $2, $3)
        ON CONFLICT (keyword, search_engine, region)
        DO UPDATE SET keyword = EXCLUDED.keyword
        RETURNING id
        "#,
    )
    .bind(keyword)
    .bind(engine.as_str())
    .bind(region)
    .fetch_one(&mut *tx)
    .await?;

    for scraped in results {
        let result = &scraped.result;
        let result_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO search_results
                (keyword_id, position, title, url, domain, description, search_engine)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(keyword_id)
        .bind(result.position as i32)
        .bind(&result.title)
        .bind(&result.url)
        .bind(&result.domain)
        .bind(&result.description)
        .bind(engine.as_str())
        .fetch_one(&mut *tx)
        .await?;

        if let Some(page) = &scraped.page {
            insert_page_data(&mut tx, result_id, page).await?;
        }
    }

    // Dropping an uncommitted transaction rolls it back.
    tx.commit().await?;
    debug!(keyword, engine = %engine, count = results.len(), "search results saved");
    Ok(results.len())
}

async fn insert_page_data(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    search_result_id: i64,
    page: &PageAnalysis,
) -> Result<()> {
    let meta = &page.metadata;
    let seo = &page.technical;
    let (density, count) = page
        .density
        .as_ref()
        .and_then(|d| d.primary())
        .map(|hit| (hit.density, hit.count as i32))
        .unwrap_or((0.0, 0));

    sqlx::query(
        r#"
        INSERT INTO page_data (
            search_result_id, title, description, keywords, h1_tags, h2_tags, h3_tags,
            word_count, images_count, links_count,
            has_title, has_description, has_keywords, has_h1, has_images_with_alt,
            has_canonical, has_robots, has_schema, is_https,
            keyword_density, keyword_count
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)
        "#,
    )
    .bind(search_result_id)
    .bind(&meta.title)
    .bind(&meta.description)
    .bind(&meta.keywords)
    .bind(serde_json::to_string(&meta.h1)?)
    .bind(serde_json::to_string(&meta.h2)?)
    .bind(serde_json::to_string(&meta.h3)?)
    .bind(meta.word_count as i32)
    .bind(meta.images.len() as i32)
    .bind(meta.links.len() as i32)
    .bind(seo.has_title)
    .bind(seo.has_description)
    .bind(seo.has_keywords)
    .bind(seo.has_h1)
    .bind(seo.has_images_with_alt)
    .bind(seo.has_canonical)
    .bind(seo.has_robots)
    .bind(seo.has_schema)
    .bind(seo.is_https)
    .bind(density)
    .bind(count)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow, ToSchema)]
pub struct CompetitorRollup {
    pub domain: String,
    pub total_positions: i64,
    pub avg_position: f64,
    pub top_3_positions: i64,
    pub top_10_positions: i64,
}

/// Per-domain statistics over every stored result, most frequent first.
pub async fn competitor_rollups(pool: &PgPool, limit: Option<i64>) -> Result<Vec<CompetitorRollup>> {
    let rows = sqlx::query_as::<_, CompetitorRollup>(
        r#"
        SELECT domain,
               COUNT(*) AS total_positions,
               AVG(position)::float8 AS avg_position,
               COUNT(*) FILTER (WHERE position <= 3) AS top_3_positions,
               COUNT(*) FILTER (WHERE position <= 10) AS top_10_positions
        FROM search_results
        GROUP BY domain
        ORDER BY total_positions DESC, domain
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Rewrites the `competitors` snapshot from the current aggregate.
pub async fn refresh_competitors(pool: &PgPool) -> Result<u64> {
    let done = sqlx::query(
        r#"
        INSERT INTO competitors
            (domain, website_url, total_positions, avg_position, top_3_positions, top_10_positions, updated_at)
        SELECT domain,
               'https://' || domain,
               COUNT(*),
               AVG(position)::float8,
               COUNT(*) FILTER (WHERE position <= 3),
               COUNT(*) FILTER (WHERE position <= 10),
               NOW()
        FROM search_results
        GROUP BY domain
        ON CONFLICT (domain) DO UPDATE SET
            total_positions = EXCLUDED.total_positions,
            avg_position = EXCLUDED.avg_position,
            top_3_positions = EXCLUDED.top_3_positions,
            top_10_positions = EXCLUDED.top_10_positions,
            updated_at = NOW()
        "#,
    )
    .execute(pool)
    .await?;
    Ok(done.rows_affected())
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow, ToSchema)]
pub struct KeywordPosition {
    pub position: i32,
    pub domain: String,
    pub title: String,
    pub url: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub async fn keyword_positions(
    pool: &PgPool,
    keyword: &str,
    engine: SearchEngine,
) -> Result<Vec<KeywordPosition>> {
    let rows = sqlx::query_as::<_, KeywordPosition>(
        r#"
        SELECT sr.position, sr.domain, sr.title, sr.url, sr.description, sr.created_at
        FROM search_results sr
        JOIN keywords k ON k.id = sr.keyword_id
        WHERE k.keyword = $1 AND sr.search_engine = $2
        ORDER BY sr.position, sr.created_at DESC
        "#,
    )
    .bind(keyword)
    .bind(engine.as_str())
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow, ToSchema)]
pub struct RecentResult {
    pub keyword: String,
    pub search_engine: String,
    pub position: i32,
    pub domain: String,
    pub title: String,
    pub url: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Results from the last `days` days, newest first.
pub async fn recent_results(
    pool: &PgPool,
    days: i32,
    engine: Option<SearchEngine>,
) -> Result<Vec<RecentResult>> {
    let rows = sqlx::query_as::<_, RecentResult>(
        r#"
        SELECT k.keyword, sr.search_engine, sr.position, sr.domain, sr.title, sr.url,
               sr.description, sr.created_at
        FROM search_results sr
        JOIN keywords k ON k.id = sr.keyword_id
        WHERE sr.created_at >= NOW() - make_interval(days => $1)
          AND ($2::text IS NULL OR sr.search_engine = $2)
        ORDER BY sr.created_at DESC, sr.position
        "#,
    )
    .bind(days)
    .bind(engine.map(|e| e.as_str()))
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow, ToSchema)]
pub struct KeywordStats {
    pub keyword: String,
    pub search_engine: String,
    pub results: i64,
    pub avg_position: f64,
    pub best_position: i32,
}

pub async fn keyword_stats(pool: &PgPool, days: i32) -> Result<Vec<KeywordStats>> {
    let rows = sqlx::query_as::<_, KeywordStats>(
        r#"
        SELECT k.keyword,
               sr.search_engine,
               COUNT(*) AS results,
               AVG(sr.position)::float8 AS avg_position,
               MIN(sr.position) AS best_position
        FROM search_results sr
        JOIN keywords k ON k.id = sr.keyword_id
        WHERE sr.created_at >= NOW() - make_interval(days => $1)
        GROUP BY k.keyword, sr.search_engine
        ORDER BY k.keyword, sr.search_engine
        "#,
    )
    .bind(days)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow, ToSchema)]
pub struct AnalysisSession {
    pub id: i64,
    pub session_name: String,
    pub keywords_count: i32,
    pub results_count: i32,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

pub async fn create_session(pool: &PgPool, name: &str, keywords_count: usize) -> Result<i64> {
    let id = sqlx::query_scalar(
        r#"
        INSERT INTO analysis_sessions (session_name, keywords_count, status)
        VALUES ($1, $2, $3)
        RETURNING id
        "#,
    )
    .bind(name)
    .bind(keywords_count as i32)
    .bind(SessionStatus::Running.as_str())
    .fetch_one(pool)
    .await?;
    Ok(id)
}

/// Marks a session finished. `completed_at` is set for terminal states.
pub async fn finish_session(
    pool: &PgPool,
    id: i64,
    status: SessionStatus,
    results_count: usize,
    error_message: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE analysis_sessions
        SET status = $2,
            results_count = $3,
            error_message = COALESCE($4, error_message),
            completed_at = CASE WHEN $2 = 'running' THEN completed_at ELSE NOW() END
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(status.as_str())
    .bind(results_count as i32)
    .bind(error_message)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn recent_sessions(pool: &PgPool, limit: i64) -> Result<Vec<AnalysisSession>> {
    let rows = sqlx::query_as::<_, AnalysisSession>(
        r#"
        SELECT id, session_name, keywords_count, results_count, status,
               started_at, completed_at, error_message
        FROM analysis_sessions
        ORDER BY started_at DESC
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_statements_are_single_and_idempotent() {
        for statement in SCHEMA {
            let trimmed = statement.trim();
            assert!(trimmed.starts_with("CREATE"));
            assert!(trimmed.contains("IF NOT EXISTS"));
            assert!(!trimmed.trim_end_matches(';').contains(';'));
        }
    }

    fn result(position: u32, domain: &str) -> ScrapedResult {
        ScrapedResult {
            result: OrganicResult {
                position,
                title: format!("{} #{}", domain, position),
                url: format!("https://{}/p{}", domain, position),
                domain: domain.to_string(),
                description: String::new(),
            },
            page: None,
        }
    }

    async fn live_pool() -> PgPool {
        let url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| crate::config::Config::default().database_url);
        let pool = PgPoolOptions::new().max_connections(2).connect(&url).await.unwrap();
        init_db(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    #[ignore] // requires DATABASE_URL pointing at a scratch Postgres
    async fn rollups_count_and_rank_domains() {
        let pool = live_pool().await;
        let tag = uuid::Uuid::new_v4().simple().to_string();
        let busy = format!("busy-{}.kg", tag);
        let rare = format!("rare-{}.kg", tag);

        let first = vec![result(1, &busy), result(2, &rare), result(5, &busy)];
        let second = vec![result(2, &busy), result(12, &busy), result(11, &rare)];
        let saved = save_search_results(&pool, &format!("kw-a-{}", tag), SearchEngine::Google, "kg", &first)
            .await
            .unwrap();
        assert_eq!(saved, 3);
        save_search_results(&pool, &format!("kw-b-{}", tag), SearchEngine::Yandex, "10363", &second)
            .await
            .unwrap();

        let rollups: Vec<_> = competitor_rollups(&pool, None)
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.domain.ends_with(&format!("{}.kg", tag)))
            .collect();
        assert_eq!(rollups.len(), 2);

        let top = &rollups[0];
        assert_eq!(top.domain, busy);
        assert_eq!(top.total_positions, 4);
        assert!((top.avg_position - 5.0).abs() < 1e-9);
        assert_eq!(top.top_3_positions, 2);
        assert_eq!(top.top_10_positions, 3);

        let other = &rollups[1];
        assert_eq!(other.domain, rare);
        assert_eq!(other.total_positions, 2);
        assert_eq!(other.top_3_positions, 1);
        assert_eq!(other.top_10_positions, 1);
    }

    #[tokio::test]
    #[ignore] // requires DATABASE_URL pointing at a scratch Postgres
    async fn failed_insert_rolls_back_the_keyword() {
        let pool = live_pool().await;
        let tag = uuid::Uuid::new_v4().simple().to_string();
        let domain = format!("partial-{}.kg", tag);
        let keyword = format!("kw-rollback-{}", tag);

        // position 0 violates the CHECK constraint on the second row
        let results = vec![result(1, &domain), result(0, &domain)];
        let saved = save_search_results(&pool, &keyword, SearchEngine::Google, "kg", &results).await;
        assert!(saved.is_err());

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM search_results WHERE domain = $1")
            .bind(&domain)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(rows, 0);

        let keywords: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM keywords WHERE keyword = $1")
            .bind(&keyword)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(keywords, 0);
    }

    #[tokio::test]
    #[ignore] // requires DATABASE_URL pointing at a scratch Postgres
    async fn sessions_move_from_running_to_terminal() {
        let pool = live_pool().await;
        let name = format!("session-{}", uuid::Uuid::new_v4());

        let done = create_session(&pool, &name, 3).await.unwrap();
        let failed = create_session(&pool, &name, 1).await.unwrap();

        let find = |sessions: &[AnalysisSession], id: i64| {
            sessions.iter().find(|s| s.id == id).cloned().unwrap()
        };
        let sessions = recent_sessions(&pool, 50).await.unwrap();
        let running = find(&sessions, done);
        assert_eq!(running.status, "running");
        assert!(running.completed_at.is_none());

        finish_session(&pool, done, SessionStatus::Completed, 24, None).await.unwrap();
        finish_session(&pool, failed, SessionStatus::Failed, 0, Some("export failed"))
            .await
            .unwrap();

        let sessions = recent_sessions(&pool, 50).await.unwrap();
        let completed = find(&sessions, done);
        assert_eq!(completed.status, "completed");
        assert_eq!(completed.results_count, 24);
        assert_eq!(completed.keywords_count, 3);
        assert!(completed.completed_at.is_some());
        assert!(completed.error_message.is_none());

        let failed = find(&sessions, failed);
        assert_eq!(failed.status, "failed");
        assert!(failed.completed_at.is_some());
        assert_eq!(failed.error_message.as_deref(), Some("export failed"));
    }

    #[test]
    fn session_status_strings() {
        assert_eq!(SessionStatus::Running.as_str(), "running");
        assert_eq!(SessionStatus::Completed.as_str(), "completed");
        assert_eq!(SessionStatus::Failed.as_str(), "failed");
    }
}
