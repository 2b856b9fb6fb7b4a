//! chromiumoxide による [`BrowserDriver`] 実装

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::browser::{
    SetDownloadBehaviorBehavior, SetDownloadBehaviorParams,
};
use chromiumoxide::page::ScreenshotParams;
use chromiumoxide::Page;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::DriverError;
use crate::traits::{BrowserDriver, BrowserLauncher, Locator};

/// Chromium を起動するランチャー
#[derive(Debug, Clone)]
pub struct ChromeLauncher {
    chrome_path: String,
    headless: bool,
    debug: bool,
}

impl ChromeLauncher {
    pub fn new(chrome_path: impl Into<String>, headless: bool) -> Self {
        Self {
            chrome_path: chrome_path.into(),
            headless,
            debug: false,
        }
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

#[async_trait]
impl BrowserLauncher for ChromeLauncher {
    async fn launch(&self, download_dir: &Path) -> Result<Box<dyn BrowserDriver>, DriverError> {
        info!("Initializing browser...");

        std::fs::create_dir_all(download_dir).map_err(|e| DriverError::Launch(e.to_string()))?;
        let download_dir = download_dir
            .canonicalize()
            .unwrap_or_else(|_| download_dir.to_path_buf());

        // 実行ごとに専用のユーザーデータディレクトリを使う
        let unique_id = format!(
            "{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
        );
        let user_data_dir = std::env::temp_dir().join(format!("report-etl-{}", unique_id));

        let mut builder = BrowserConfig::builder()
            .chrome_executable(&self.chrome_path)
            .user_data_dir(&user_data_dir)
            .window_size(1280, 800);

        if !self.headless {
            builder = builder.with_head();
        }

        builder = builder
            .no_sandbox()
            .request_timeout(Duration::from_secs(60))
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu");

        if self.debug {
            builder = builder.arg("--enable-logging=stderr").arg("--v=1");
        }

        let config = builder.build().map_err(DriverError::Launch)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| DriverError::Launch(e.to_string()))?;

        // ブラウザイベントハンドラをバックグラウンドで実行
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser handler event error: {:?}", e);
                }
            }
        });

        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(e) => {
                let mut driver = ChromeDriver {
                    browser,
                    page: None,
                    handler_task,
                    download_dir,
                    user_data_dir,
                };
                let _ = driver.close().await;
                return Err(DriverError::Launch(e.to_string()));
            }
        };

        let mut driver = ChromeDriver {
            browser,
            page: Some(page),
            handler_task,
            download_dir,
            user_data_dir,
        };

        // ダウンロード先を設定（ファイル名はポータルのまま）
        if let Err(e) = driver.allow_downloads().await {
            let _ = driver.close().await;
            return Err(e);
        }

        info!("Browser initialized (downloads -> {:?})", driver.download_dir);
        Ok(Box::new(driver))
    }
}

/// 起動済み Chromium
pub struct ChromeDriver {
    browser: Browser,
    page: Option<Page>,
    handler_task: JoinHandle<()>,
    download_dir: PathBuf,
    user_data_dir: PathBuf,
}

impl ChromeDriver {
    fn page(&self) -> Result<&Page, DriverError> {
        self.page
            .as_ref()
            .ok_or_else(|| DriverError::Navigation("browser page is closed".into()))
    }

    async fn allow_downloads(&self) -> Result<(), DriverError> {
        let params = SetDownloadBehaviorParams::builder()
            .behavior(SetDownloadBehaviorBehavior::Allow)
            .download_path(self.download_dir.to_string_lossy().to_string())
            .events_enabled(true)
            .build()
            .map_err(DriverError::Launch)?;

        self.page()?
            .execute(params)
            .await
            .map_err(|e| DriverError::Launch(format!("download behaviour: {}", e)))?;
        Ok(())
    }

    /// JavaScript を評価して値を取り出す
    async fn eval<T: serde::de::DeserializeOwned>(&self, script: String) -> Result<T, DriverError> {
        self.page()?
            .evaluate(script.as_str())
            .await
            .map_err(|e| DriverError::JavaScript(e.to_string()))?
            .into_value::<T>()
            .map_err(|e| DriverError::JavaScript(e.to_string()))
    }
}

/// 文字列をJavaScriptリテラルへ
fn js_string(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "\"\"".to_string())
}

/// ロケータに一致する要素を返すJavaScript式
fn finder_script(locator: &Locator) -> String {
    match locator {
        Locator::Css(selector) => format!("document.querySelector({})", js_string(selector)),
        Locator::LinkText(text) => format!(
            "Array.from(document.querySelectorAll('a')).find(a => a.textContent.trim() === {})",
            js_string(text)
        ),
        Locator::ButtonText(text) => format!(
            "Array.from(document.querySelectorAll('button')).find(b => b.textContent.indexOf({}) >= 0)",
            js_string(text)
        ),
        Locator::PageText(text) => format!(
            "(document.body && document.body.innerText.indexOf({}) >= 0 ? document.body : null)",
            js_string(text)
        ),
    }
}

/// 表示判定（`display:none` の祖先や `visibility:hidden` を除外）
const IS_VISIBLE_JS: &str = "(el => el.getClientRects().length > 0 && getComputedStyle(el).visibility !== 'hidden')";

/// ロケータに一致する要素のいずれかが表示されているかを返すJavaScript式
fn visible_script(locator: &Locator) -> String {
    match locator {
        Locator::Css(selector) => format!(
            "Array.from(document.querySelectorAll({})).some({})",
            js_string(selector),
            IS_VISIBLE_JS
        ),
        Locator::LinkText(text) => format!(
            "Array.from(document.querySelectorAll('a')).filter(a => a.textContent.trim() === {}).some({})",
            js_string(text),
            IS_VISIBLE_JS
        ),
        Locator::ButtonText(text) => format!(
            "Array.from(document.querySelectorAll('button')).filter(b => b.textContent.indexOf({}) >= 0).some({})",
            js_string(text),
            IS_VISIBLE_JS
        ),
        // innerText は描画されているテキストだけを含む
        Locator::PageText(_) => format!("!!({})", finder_script(locator)),
    }
}

#[async_trait]
impl BrowserDriver for ChromeDriver {
    async fn navigate(&self, url: &str) -> Result<(), DriverError> {
        let page = self.page()?;
        page.goto(url)
            .await
            .map_err(|e| DriverError::Navigation(e.to_string()))?;
        page.wait_for_navigation()
            .await
            .map_err(|e| DriverError::Navigation(e.to_string()))?;
        debug!("Navigated to {}", url);
        Ok(())
    }

    async fn fill_field(&self, locator: &Locator, value: &str) -> Result<(), DriverError> {
        let script = format!(
            r#"
            (function() {{
                var el = {};
                if (!el) return false;
                el.focus();
                el.value = {};
                el.dispatchEvent(new Event('input', {{ bubbles: true }}));
                el.dispatchEvent(new Event('change', {{ bubbles: true }}));
                return true;
            }})()
            "#,
            finder_script(locator),
            js_string(value)
        );
        if !self.eval::<bool>(script).await? {
            return Err(DriverError::ElementNotFound(locator.to_string()));
        }
        Ok(())
    }

    async fn click(&self, locator: &Locator) -> Result<(), DriverError> {
        let script = format!(
            r#"
            (function() {{
                var el = {};
                if (!el) return false;
                el.scrollIntoView({{ block: 'center' }});
                el.click();
                return true;
            }})()
            "#,
            finder_script(locator)
        );
        if !self.eval::<bool>(script).await? {
            return Err(DriverError::ElementNotFound(locator.to_string()));
        }
        debug!("Clicked {}", locator);
        Ok(())
    }

    async fn select_option(&self, locator: &Locator, visible_text: &str) -> Result<(), DriverError> {
        let script = format!(
            r#"
            (function() {{
                var select = {};
                if (!select) return false;
                var options = Array.from(select.options);
                var index = options.findIndex(o => o.text.trim() === {});
                if (index < 0) return false;
                select.selectedIndex = index;
                select.dispatchEvent(new Event('change', {{ bubbles: true }}));
                return true;
            }})()
            "#,
            finder_script(locator),
            js_string(visible_text)
        );
        if !self.eval::<bool>(script).await? {
            return Err(DriverError::ElementNotFound(format!(
                "{} option `{}`",
                locator, visible_text
            )));
        }
        Ok(())
    }

    async fn element_exists(&self, locator: &Locator) -> Result<bool, DriverError> {
        self.eval::<bool>(format!("!!({})", finder_script(locator)))
            .await
    }

    async fn element_visible(&self, locator: &Locator) -> Result<bool, DriverError> {
        self.eval::<bool>(visible_script(locator)).await
    }

    async fn screenshot(&self) -> Result<Vec<u8>, DriverError> {
        self.page()?
            .screenshot(ScreenshotParams::builder().full_page(true).build())
            .await
            .map_err(|e| DriverError::JavaScript(e.to_string()))
    }

    fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        info!("Closing browser...");
        if let Some(page) = self.page.take() {
            if let Err(e) = page.close().await {
                debug!("Failed to close page: {}", e);
            }
        }

        let closed = self.browser.close().await;
        if let Err(e) = &closed {
            warn!("Graceful browser close failed, killing process: {}", e);
            if let Some(Err(kill_err)) = self.browser.kill().await {
                self.handler_task.abort();
                return Err(DriverError::Shutdown(kill_err.to_string()));
            }
        }
        if let Err(e) = self.browser.wait().await {
            debug!("Failed waiting for browser exit: {}", e);
        }
        self.handler_task.abort();

        if let Err(e) = std::fs::remove_dir_all(&self.user_data_dir) {
            debug!("Failed to remove user data dir {:?}: {}", self.user_data_dir, e);
        }

        info!("Browser closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finder_script_escapes_text() {
        let script = finder_script(&Locator::link("Relatório \"de\" Mídia"));
        assert!(script.contains(r#""Relatório \"de\" Mídia""#));

        let css = finder_script(&Locator::css("input[name='user']"));
        assert_eq!(css, r#"document.querySelector("input[name='user']")"#);
    }

    #[test]
    fn test_visible_script_checks_every_match() {
        let script = visible_script(&Locator::css(".alert-danger, .invalid-feedback"));
        assert!(script.starts_with(r#"Array.from(document.querySelectorAll(".alert-danger, .invalid-feedback")).some("#));
        assert!(script.contains("getClientRects().length > 0"));
        assert!(script.contains("visibility !== 'hidden'"));

        let text = visible_script(&Locator::text("inválid"));
        assert!(text.contains("innerText.indexOf(\"inválid\")"));
    }

    #[test]
    fn test_launcher_builder() {
        let launcher = ChromeLauncher::new("/usr/bin/chromium", true).with_debug(true);
        assert_eq!(launcher.chrome_path, "/usr/bin/chromium");
        assert!(launcher.headless);
        assert!(launcher.debug);
    }
}
