use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use sqlx::PgPool;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::db::{self, AnalysisSession, CompetitorRollup, KeywordStats};

/// Spreadsheet tools need the BOM to detect UTF-8.
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";
const REPORT_PREFIX: &str = "seo_report_";

const RESULT_HEADERS: &[&str] = &[
    "keyword",
    "search_engine",
    "position",
    "domain",
    "title",
    "url",
    "description",
    "created_at",
];
const COMPETITOR_HEADERS: &[&str] = &[
    "domain",
    "total_positions",
    "avg_position",
    "top_3_positions",
    "top_10_positions",
];

/// `<prefix><YYYYmmdd_HHMMSS_micros>.<ext>` in local time.
pub fn timestamped_name(prefix: &str, ext: &str) -> String {
    format!("{}{}.{}", prefix, Local::now().format("%Y%m%d_%H%M%S_%6f"), ext)
}

/// Reserves a fresh timestamped file in `dir`. A name that is already taken
/// gets a `_<n>` suffix, which still sorts after the unsuffixed one.
pub fn reserve_path(dir: &Path, prefix: &str, ext: &str) -> Result<PathBuf> {
    fs::create_dir_all(dir).with_context(|| format!("cannot create {}", dir.display()))?;
    let base = timestamped_name(prefix, ext);
    let stem = base.trim_end_matches(&format!(".{}", ext));

    let mut attempt = 0u32;
    loop {
        let name = match attempt {
            0 => base.clone(),
            n => format!("{}_{}.{}", stem, n, ext),
        };
        let path = dir.join(name);
        match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => return Ok(path),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => attempt += 1,
            Err(e) => {
                return Err(e).with_context(|| format!("cannot create {}", path.display()));
            }
        }
    }
}

/// Writes `rows` as comma-separated UTF-8 with a BOM and an explicit header
/// row, creating the directory if needed.
pub fn write_csv<T: Serialize>(path: &Path, headers: &[&str], rows: &[T]) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let mut file = File::create(path).with_context(|| format!("cannot create {}", path.display()))?;
    file.write_all(UTF8_BOM)?;

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    writer.write_record(headers)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

pub async fn export_results(pool: &PgPool, dir: &Path, prefix: &str, days: i32) -> Result<PathBuf> {
    let rows = db::recent_results(pool, days, None).await?;
    let path = reserve_path(dir, prefix, "csv")?;
    write_csv(&path, RESULT_HEADERS, &rows)?;
    info!(path = %path.display(), rows = rows.len(), "results exported");
    Ok(path)
}

pub async fn export_competitors(pool: &PgPool, dir: &Path) -> Result<PathBuf> {
    let rows = db::competitor_rollups(pool, None).await?;
    let path = reserve_path(dir, "competitors_", "csv")?;
    write_csv(&path, COMPETITOR_HEADERS, &rows)?;
    info!(path = %path.display(), rows = rows.len(), "competitors exported");
    Ok(path)
}

#[derive(Debug, Serialize)]
pub struct AnalysisReport {
    pub generated_at: DateTime<Utc>,
    pub period_days: i32,
    pub total_results: i64,
    pub unique_domains: usize,
    pub competitors: Vec<CompetitorRollup>,
    pub keywords: Vec<KeywordStats>,
    pub sessions: Vec<AnalysisSession>,
}

/// Refreshes the competitor snapshot and writes a JSON report of the last
/// `days` days into `dir`.
pub async fn generate_report(
    pool: &PgPool,
    dir: &Path,
    days: i32,
    competitor_limit: i64,
) -> Result<(PathBuf, AnalysisReport)> {
    db::refresh_competitors(pool).await?;

    let competitors = db::competitor_rollups(pool, Some(competitor_limit)).await?;
    let keywords = db::keyword_stats(pool, days).await?;
    let sessions = db::recent_sessions(pool, 10).await?;

    let report = AnalysisReport {
        generated_at: Utc::now(),
        period_days: days,
        total_results: keywords.iter().map(|k| k.results).sum(),
        unique_domains: db::competitor_rollups(pool, None).await?.len(),
        competitors,
        keywords,
        sessions,
    };

    let path = reserve_path(dir, REPORT_PREFIX, "json")?;
    write_report(&path, &report)?;
    info!(path = %path.display(), "report generated");
    Ok((path, report))
}

pub fn write_report<T: Serialize>(path: &Path, report: &T) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    fs::write(path, serde_json::to_vec_pretty(report)?)?;
    Ok(())
}

/// Newest report in `dir`, `None` when there is none yet.
pub fn read_latest_report(dir: &Path) -> Result<Option<serde_json::Value>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    // Timestamped names sort chronologically.
    let latest = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .map_or(false, |name| name.starts_with(REPORT_PREFIX) && name.ends_with(".json"))
        })
        .max();

    match latest {
        Some(path) => {
            let raw = fs::read(&path).with_context(|| format!("cannot read {}", path.display()))?;
            Ok(Some(serde_json::from_slice(&raw)?))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    struct Row {
        domain: String,
        total_positions: i64,
        avg_position: f64,
    }

    #[test]
    fn csv_starts_with_bom_and_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.csv");
        let rows = vec![
            Row {
                domain: "кофе.kg".to_string(),
                total_positions: 3,
                avg_position: 1.5,
            },
            Row {
                domain: "shop, kg".to_string(),
                total_positions: 1,
                avg_position: 7.0,
            },
        ];

        write_csv(&path, &["domain", "total_positions", "avg_position"], &rows).unwrap();

        let bytes = fs::read(&path).unwrap();
        assert!(bytes.starts_with(UTF8_BOM));
        let text = String::from_utf8(bytes[UTF8_BOM.len()..].to_vec()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "domain,total_positions,avg_position");
        assert_eq!(lines[1], "кофе.kg,3,1.5");
        assert_eq!(lines[2], "\"shop, kg\",1,7.0");
    }

    #[test]
    fn empty_export_still_has_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.csv");
        write_csv::<Row>(&path, COMPETITOR_HEADERS, &[]).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(
            text.trim_start_matches('\u{feff}').trim_end(),
            COMPETITOR_HEADERS.join(",")
        );
    }

    #[test]
    fn latest_report_is_picked_by_name() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_latest_report(dir.path()).unwrap().is_none());

        write_report(
            &dir.path().join("seo_report_20240101_090000.json"),
            &serde_json::json!({"period_days": 7}),
        )
        .unwrap();
        write_report(
            &dir.path().join("seo_report_20240301_090000.json"),
            &serde_json::json!({"period_days": 30}),
        )
        .unwrap();
        fs::write(dir.path().join("notes.json"), "{}").unwrap();

        let latest = read_latest_report(dir.path()).unwrap().unwrap();
        assert_eq!(latest["period_days"], 30);
    }

    #[test]
    fn missing_report_dir_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        assert!(read_latest_report(&missing).unwrap().is_none());
    }

    #[test]
    fn timestamped_names_have_prefix_and_extension() {
        let name = timestamped_name("competitors_", "csv");
        assert!(name.starts_with("competitors_"));
        assert!(name.ends_with(".csv"));
        assert_eq!(name.len(), "competitors_".len() + 22 + ".csv".len());
    }

    #[test]
    fn back_to_back_exports_get_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let paths: Vec<PathBuf> = (0..5)
            .map(|_| reserve_path(dir.path(), "seo_results_", "csv").unwrap())
            .collect();

        let mut unique = paths.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 5);
        for path in &paths {
            assert!(path.exists());
            write_csv::<Row>(path, COMPETITOR_HEADERS, &[]).unwrap();
        }
        // reservation order matches name order
        assert_eq!(unique, paths);
    }
}
