//! Headless-browser fetch tier.
//!
//! Chromium (via CDP) executes the challenge JavaScript that the direct tier
//! cannot. One browser is launched per worker process and reused across URLs;
//! the supervisor's process-group kill guarantees it cannot outlive the job
//! even if cooperative shutdown is skipped.

use chromiumoxide::{Browser, BrowserConfig};
use futures::StreamExt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{FetchError, FetchOutcome};

/// Wall-clock budget for one browser navigation, challenge included.
const BROWSER_FETCH_TIMEOUT_SECS: u64 = 30;
/// Settle time after navigation so challenge scripts can finish.
const CHALLENGE_SETTLE_SECS: u64 = 3;

const CHROME_PATHS: &[&str] = &[
    "/usr/bin/google-chrome",
    "/usr/bin/google-chrome-stable",
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
    "/snap/bin/chromium",
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
    "/opt/google/chrome/google-chrome",
];

pub struct BrowserTier {
    browser: Mutex<Option<Browser>>,
}

impl BrowserTier {
    pub fn new() -> Self {
        BrowserTier {
            browser: Mutex::new(None),
        }
    }

    /// Fetch a URL through headless Chromium and return the rendered DOM.
    pub async fn fetch_html(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, FetchError> {
        let mut guard = self.browser.lock().await;
        if guard.is_none() {
            *guard = Some(launch().await?);
        }
        let browser = guard.as_ref().unwrap();

        let fetch = async {
            let page = browser
                .new_page(url)
                .await
                .map_err(|e| FetchError::Network(e.to_string()))?;
            let _ = page.wait_for_navigation().await;
            tokio::time::sleep(Duration::from_secs(CHALLENGE_SETTLE_SECS)).await;

            let final_url = page
                .url()
                .await
                .ok()
                .flatten()
                .unwrap_or_else(|| url.to_string());
            let content = page
                .content()
                .await
                .map_err(|e| FetchError::Network(e.to_string()))?;
            let _ = page.close().await;

            if content.trim().is_empty() {
                return Err(FetchError::InvalidContent("empty rendered page".into()));
            }

            Ok(FetchOutcome {
                bytes: content.into_bytes(),
                mime: "text/html".to_string(),
                final_url,
            })
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            result = tokio::time::timeout(
                Duration::from_secs(BROWSER_FETCH_TIMEOUT_SECS),
                fetch,
            ) => match result {
                Ok(outcome) => outcome,
                Err(_) => Err(FetchError::Timeout),
            },
        }
    }

    /// Close the browser if it was launched.
    pub async fn shutdown(&self) {
        let mut guard = self.browser.lock().await;
        if let Some(mut browser) = guard.take() {
            let _ = browser.close().await;
            let _ = browser.wait().await;
        }
    }
}

impl Default for BrowserTier {
    fn default() -> Self {
        Self::new()
    }
}

async fn launch() -> Result<Browser, FetchError> {
    let chrome = find_chrome().ok_or_else(|| {
        FetchError::Network("Chrome/Chromium executable not found".to_string())
    })?;
    tracing::info!(chrome = %chrome.display(), "Launching headless browser");

    let config = BrowserConfig::builder()
        .chrome_executable(chrome)
        .arg("--disable-blink-features=AutomationControlled")
        .arg("--disable-infobars")
        .arg("--disable-dev-shm-usage")
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--disable-background-networking")
        .arg("--no-sandbox")
        .arg("--disable-gpu")
        .build()
        .map_err(|e| FetchError::Network(format!("browser config: {e}")))?;

    let (browser, mut handler) = Browser::launch(config)
        .await
        .map_err(|e| FetchError::Network(format!("browser launch: {e}")))?;

    // The CDP handler must be polled for the browser to make progress.
    tokio::spawn(async move {
        while let Some(h) = handler.next().await {
            if h.is_err() {
                break;
            }
        }
    });

    Ok(browser)
}

fn find_chrome() -> Option<PathBuf> {
    for path in CHROME_PATHS {
        let p = std::path::Path::new(path);
        if p.exists() {
            return Some(p.to_path_buf());
        }
    }
    for cmd in &["google-chrome", "google-chrome-stable", "chromium", "chromium-browser"] {
        if let Ok(output) = std::process::Command::new("which").arg(cmd).output() {
            if output.status.success() {
                let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !path.is_empty() {
                    return Some(PathBuf::from(path));
                }
            }
        }
    }
    None
}
