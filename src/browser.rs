use headless_chrome::{Browser, LaunchOptions, Tab};
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::fetch::FetchError;
use crate::proxy::ProxyRotator;

const STEALTH_SCRIPT: &str = r#"
    Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
    Object.defineProperty(navigator, 'languages', { get: () => ['ru-RU', 'ru', 'en-US', 'en'] });
    Object.defineProperty(navigator, 'plugins', { get: () => [1, 2, 3, 4, 5] });
    window.chrome = { runtime: {}, loadTimes: function() {}, csi: function() {}, app: {} };
"#;

const BODY_TIMEOUT: Duration = Duration::from_secs(15);
const SETTLE_TIME: Duration = Duration::from_secs(3);

/// A lazily launched headless Chrome shared by every browser-backed fetch of
/// a run. The process is started on first use and killed by [`close`] or when
/// the session is dropped, whichever comes first.
///
/// [`close`]: BrowserSession::close
pub struct BrowserSession {
    rotator: Arc<ProxyRotator>,
    browser: Mutex<Option<Browser>>,
}

impl BrowserSession {
    pub fn new(rotator: Arc<ProxyRotator>) -> Self {
        Self {
            rotator,
            browser: Mutex::new(None),
        }
    }

    async fn handle(&self) -> Result<Browser, FetchError> {
        let mut guard = self.browser.lock().await;
        if let Some(browser) = guard.as_ref() {
            return Ok(browser.clone());
        }
        let rotator = self.rotator.clone();
        let browser = tokio::task::spawn_blocking(move || launch(&rotator))
            .await
            .map_err(|e| FetchError::Browser(e.to_string()))??;
        *guard = Some(browser.clone());
        Ok(browser)
    }

    /// Loads `url` in a fresh tab and returns the final URL and rendered HTML.
    pub async fn render(&self, url: &str) -> Result<(String, String), FetchError> {
        let browser = self.handle().await?;
        let url = url.to_string();

        tokio::task::spawn_blocking(move || render_blocking(&browser, &url))
            .await
            .map_err(|e| FetchError::Browser(e.to_string()))?
    }

    /// Kills the browser process if one was started.
    pub async fn close(&self) {
        if self.browser.lock().await.take().is_some() {
            debug!("browser session closed");
        }
    }
}

fn launch(rotator: &ProxyRotator) -> Result<Browser, FetchError> {
    let user_agent = rotator.random_user_agent();
    let ua_arg = format!("--user-agent={}", user_agent);
    let proxy_arg = rotator
        .next_proxy()
        .map(|proxy| format!("--proxy-server={}", proxy));

    let mut args = vec![
        OsStr::new("--disable-blink-features=AutomationControlled"),
        OsStr::new("--no-sandbox"),
        OsStr::new("--disable-dev-shm-usage"),
        OsStr::new("--disable-infobars"),
        OsStr::new("--disable-gpu"),
        OsStr::new("--lang=ru-RU"),
        OsStr::new(&ua_arg),
    ];
    if let Some(proxy_arg) = proxy_arg.as_deref() {
        args.push(OsStr::new(proxy_arg));
    }

    info!(user_agent, proxy = proxy_arg.is_some(), "launching headless browser");
    Browser::new(LaunchOptions {
        headless: true,
        window_size: Some((1920, 1080)),
        idle_browser_timeout: Duration::from_secs(120),
        args,
        ..Default::default()
    })
    .map_err(|e| FetchError::Browser(e.to_string()))
}

/// Closes the tab when dropped, on success and error paths alike.
struct TabGuard(Arc<Tab>);

impl Drop for TabGuard {
    fn drop(&mut self) {
        if let Err(e) = self.0.close(true) {
            debug!("tab close failed: {}", e);
        }
    }
}

fn render_blocking(browser: &Browser, url: &str) -> Result<(String, String), FetchError> {
    let browser_err = |e: anyhow::Error| FetchError::Browser(e.to_string());

    let guard = TabGuard(browser.new_tab().map_err(browser_err)?);
    let tab = &guard.0;
    tab.call_method(headless_chrome::protocol::cdp::Page::AddScriptToEvaluateOnNewDocument {
        source: STEALTH_SCRIPT.to_string(),
        world_name: None,
        include_command_line_api: None,
        run_immediately: None,
    })
    .map_err(browser_err)?;

    tab.navigate_to(url).map_err(browser_err)?;
    if let Err(e) = tab.wait_for_element_with_custom_timeout("body", BODY_TIMEOUT) {
        warn!(url, "body wait timed out: {}", e);
    }
    std::thread::sleep(SETTLE_TIME);

    let html = tab.get_content().map_err(browser_err)?;
    Ok((tab.get_url(), html))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn open_tabs(browser: &Browser) -> usize {
        browser.get_tabs().lock().map(|tabs| tabs.len()).unwrap_or(0)
    }

    #[tokio::test]
    #[ignore] // requires a local Chrome/Chromium
    async fn failed_render_closes_its_tab() {
        let session = BrowserSession::new(Arc::new(ProxyRotator::from_config(&Config::default())));
        let browser = session.handle().await.unwrap();
        let before = open_tabs(&browser);

        let result = session.render("http://127.0.0.1:9/unreachable").await;
        assert!(result.is_err());

        let mut after = open_tabs(&browser);
        for _ in 0..50 {
            if after <= before {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            after = open_tabs(&browser);
        }
        assert_eq!(after, before);
        session.close().await;
    }
}
