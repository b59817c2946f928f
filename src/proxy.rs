use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CACHE_CONTROL, REFERER};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use crate::config::Config;

static USER_AGENTS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:124.0) Gecko/20100101 Firefox/124.0",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:124.0) Gecko/20100101 Firefox/124.0",
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    ]
});

const FALLBACK_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36";

const ACCEPT_HTML: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8";
const ACCEPT_LANGUAGE_RU: &str = "ru-RU,ru;q=0.8,en-US;q=0.5,en;q=0.3";

/// Which set of browser-like headers to send with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderProfile {
    Standard,
    /// Adds a Google referer and the fetch-metadata headers a real browser
    /// sends on a top-level navigation.
    Alternate,
}

/// Rotates user agents and proxies and spaces out requests.
///
/// One instance is built from the [`Config`] at startup and shared by every
/// fetcher of a run.
#[derive(Debug)]
pub struct ProxyRotator {
    proxies: Vec<String>,
    cursor: AtomicUsize,
    delay_min: f64,
    delay_max: f64,
}

impl ProxyRotator {
    pub fn from_config(config: &Config) -> Self {
        let proxies = if config.use_proxy {
            config.proxy_list.clone()
        } else {
            Vec::new()
        };
        Self {
            proxies,
            cursor: AtomicUsize::new(0),
            delay_min: config.delay_min.max(0.0),
            delay_max: config.delay_max.max(config.delay_min).max(0.0),
        }
    }

    pub fn random_user_agent(&self) -> &'static str {
        USER_AGENTS
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(FALLBACK_USER_AGENT)
    }

    /// Next proxy in round-robin order, or `None` when proxies are disabled.
    pub fn next_proxy(&self) -> Option<&str> {
        if self.proxies.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.proxies.len();
        Some(self.proxies[index].as_str())
    }

    pub fn headers(&self, profile: HeaderProfile) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_HTML));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static(ACCEPT_LANGUAGE_RU));
        headers.insert("Upgrade-Insecure-Requests", HeaderValue::from_static("1"));

        if profile == HeaderProfile::Alternate {
            headers.insert(REFERER, HeaderValue::from_static("https://www.google.com/"));
            headers.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=0"));
            headers.insert("DNT", HeaderValue::from_static("1"));
            headers.insert("Sec-Fetch-Dest", HeaderValue::from_static("document"));
            headers.insert("Sec-Fetch-Mode", HeaderValue::from_static("navigate"));
            headers.insert("Sec-Fetch-Site", HeaderValue::from_static("none"));
        }
        headers
    }

    /// A fresh client with a random user agent and the next proxy.
    pub fn client(&self, profile: HeaderProfile, timeout: Duration) -> reqwest::Result<reqwest::Client> {
        let user_agent = self.random_user_agent();
        let mut builder = reqwest::Client::builder()
            .user_agent(user_agent)
            .default_headers(self.headers(profile))
            .redirect(reqwest::redirect::Policy::limited(10))
            .timeout(timeout);

        if let Some(proxy) = self.next_proxy() {
            debug!(proxy, "routing request through proxy");
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }
        builder.build()
    }

    pub fn random_delay_duration(&self) -> Duration {
        if self.delay_max <= 0.0 {
            return Duration::ZERO;
        }
        let secs = rand::thread_rng().gen_range(self.delay_min..=self.delay_max);
        Duration::from_secs_f64(secs)
    }

    /// Sleeps for a random interval inside the configured delay range.
    pub async fn random_delay(&self) {
        let delay = self.random_delay_duration();
        if !delay.is_zero() {
            debug!("sleeping {:.2}s before next request", delay.as_secs_f64());
            sleep(delay).await;
        }
    }
}

/// Sleeps for a random interval in `min..=max` seconds.
pub async fn jitter(min: f64, max: f64) {
    let secs = rand::thread_rng().gen_range(min..=max.max(min));
    sleep(Duration::from_secs_f64(secs)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rotator(use_proxy: bool, proxies: &[&str]) -> ProxyRotator {
        let config = Config {
            use_proxy,
            proxy_list: proxies.iter().map(|p| p.to_string()).collect(),
            delay_min: 0.0,
            delay_max: 0.0,
            ..Config::default()
        };
        ProxyRotator::from_config(&config)
    }

    #[test]
    fn proxies_rotate_round_robin() {
        let rotator = rotator(true, &["http://a:1", "http://b:2"]);
        assert_eq!(rotator.next_proxy(), Some("http://a:1"));
        assert_eq!(rotator.next_proxy(), Some("http://b:2"));
        assert_eq!(rotator.next_proxy(), Some("http://a:1"));
    }

    #[test]
    fn proxies_ignored_when_disabled() {
        let rotator = rotator(false, &["http://a:1"]);
        assert_eq!(rotator.next_proxy(), None);
    }

    #[test]
    fn user_agent_comes_from_pool() {
        let rotator = rotator(false, &[]);
        let ua = rotator.random_user_agent();
        assert!(USER_AGENTS.contains(&ua));
    }

    #[test]
    fn alternate_profile_adds_referer() {
        let rotator = rotator(false, &[]);
        let standard = rotator.headers(HeaderProfile::Standard);
        let alternate = rotator.headers(HeaderProfile::Alternate);
        assert!(standard.get(REFERER).is_none());
        assert_eq!(alternate.get(REFERER).unwrap(), "https://www.google.com/");
        assert_eq!(alternate.get(ACCEPT_LANGUAGE).unwrap(), ACCEPT_LANGUAGE_RU);
    }

    #[test]
    fn zero_delay_range_does_not_sleep() {
        let rotator = rotator(false, &[]);
        assert_eq!(rotator.random_delay_duration(), Duration::ZERO);
    }

    #[test]
    fn delay_stays_inside_range() {
        let config = Config {
            delay_min: 0.1,
            delay_max: 0.3,
            ..Config::default()
        };
        let rotator = ProxyRotator::from_config(&config);
        for _ in 0..50 {
            let d = rotator.random_delay_duration().as_secs_f64();
            assert!((0.1..=0.3).contains(&d), "{d}");
        }
    }
}
