use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use utoipa::ToSchema;

use crate::config::Config;

pub const GOOGLE_SEARCH_URL: &str = "https://www.google.com/search";
pub const YANDEX_SEARCH_URL: &str = "https://yandex.ru/search/";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum SearchEngine {
    Google,
    Yandex,
}

impl SearchEngine {
    pub const ALL: [SearchEngine; 2] = [SearchEngine::Google, SearchEngine::Yandex];

    pub fn as_str(&self) -> &'static str {
        match self {
            SearchEngine::Google => "google",
            SearchEngine::Yandex => "yandex",
        }
    }

    /// Region value stored alongside every keyword row.
    pub fn region<'a>(&self, config: &'a Config) -> &'a str {
        match self {
            SearchEngine::Google => &config.google_region,
            SearchEngine::Yandex => &config.yandex_region,
        }
    }

    pub fn default_endpoint(&self) -> &'static str {
        match self {
            SearchEngine::Google => GOOGLE_SEARCH_URL,
            SearchEngine::Yandex => YANDEX_SEARCH_URL,
        }
    }

    /// Query parameters for the first results page of `keyword`.
    pub fn query_params(&self, config: &Config, keyword: &str) -> Vec<(&'static str, String)> {
        let num = config.max_results.to_string();
        match self {
            SearchEngine::Google => vec![
                ("q", keyword.to_string()),
                ("num", num),
                ("gl", config.google_region.clone()),
                ("hl", config.google_language.clone()),
                ("start", "0".to_string()),
                ("safe", "off".to_string()),
                ("pws", "0".to_string()),
            ],
            SearchEngine::Yandex => vec![
                ("text", keyword.to_string()),
                ("lr", config.yandex_region.clone()),
                ("p", "0".to_string()),
                ("numdoc", num),
            ],
        }
    }

    /// Full results-page URL on `endpoint`.
    pub fn search_url(&self, endpoint: &str, config: &Config, keyword: &str) -> anyhow::Result<Url> {
        let params = self.query_params(config, keyword);
        Ok(Url::parse_with_params(endpoint, params.iter().map(|(k, v)| (*k, v.as_str())))?)
    }

    /// True when `host` belongs to the engine itself (search, support,
    /// accounts, maps, regional mirrors, ...).
    pub fn is_own_host(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        let mut labels = host.split('.');
        match self {
            SearchEngine::Google => labels.any(|label| label == "google"),
            SearchEngine::Yandex => {
                host == "ya.ru" || host.ends_with(".ya.ru") || labels.any(|label| label == "yandex")
            }
        }
    }

    /// Case-insensitive markers of a CAPTCHA, consent or block page.
    pub fn block_markers(&self) -> &'static [&'static str] {
        match self {
            SearchEngine::Google => &[
                "unusual traffic",
                "our systems have detected",
                "sorry/index",
                "g-recaptcha",
                "captcha-form",
                "before you continue to google",
            ],
            SearchEngine::Yandex => &[
                "showcaptcha",
                "checkbox-captcha",
                "are you a robot",
                "вы не робот",
                "подтвердите, что запросы отправляли вы",
            ],
        }
    }

    /// Markers that show up in the final URL after redirects to a block page.
    pub fn blocked_url_markers(&self) -> &'static [&'static str] {
        match self {
            SearchEngine::Google => &["/sorry/", "consent.google."],
            SearchEngine::Yandex => &["showcaptcha", "/captcha"],
        }
    }

    pub fn is_block_page(&self, html: &str) -> bool {
        let lowered = html.to_lowercase();
        self.block_markers().iter().any(|marker| lowered.contains(marker))
    }

    pub fn is_blocked_url(&self, url: &str) -> bool {
        let lowered = url.to_lowercase();
        self.blocked_url_markers().iter().any(|marker| lowered.contains(marker))
    }
}

impl fmt::Display for SearchEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchEngine {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "google" => Ok(SearchEngine::Google),
            "yandex" => Ok(SearchEngine::Yandex),
            other => Err(anyhow::anyhow!("unknown search engine '{}'", other)),
        }
    }
}
