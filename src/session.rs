//! ポータルのログインセッション管理

use std::path::PathBuf;
use std::sync::Arc;

use base64::Engine;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::{Credentials, EtlConfig};
use crate::error::{AuthError, DriverError};
use crate::retry::PollPolicy;
use crate::traits::{BrowserDriver, BrowserLauncher, Locator};

const USER_FIELD: &str = "input[name='user']";
const PASSWORD_FIELD: &str = "input[name='password']";
const SUBMIT_BUTTON: &str = ".submit-btn";
/// ログイン成功後に表示されるメニュートグル
const LOGGED_IN_MARKER: &str = "#mobileToggle";
const REJECTION_SELECTOR: &str = ".alert-danger, .error-message, .invalid-feedback";
const REJECTION_TEXT: &str = "inválid";

/// ログイン済みブラウザ
///
/// 実行ごとに1つ。使い終わったら必ず [`Session::release`] で閉じる。
pub struct Session {
    driver: Box<dyn BrowserDriver>,
    acquired_at: DateTime<Utc>,
}

impl Session {
    pub fn new(driver: Box<dyn BrowserDriver>) -> Self {
        Self {
            driver,
            acquired_at: Utc::now(),
        }
    }

    pub fn driver(&self) -> &dyn BrowserDriver {
        self.driver.as_ref()
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// ブラウザプロセスを終了する
    pub async fn release(mut self) -> Result<(), DriverError> {
        info!("Releasing portal session acquired at {}", self.acquired_at);
        self.driver.close().await
    }
}

/// ログイン処理
pub struct SessionManager {
    launcher: Arc<dyn BrowserLauncher>,
    login_url: String,
    download_dir: PathBuf,
    login_poll: PollPolicy,
    debug_screenshots: bool,
}

impl SessionManager {
    pub fn new(launcher: Arc<dyn BrowserLauncher>, config: &EtlConfig) -> Self {
        Self {
            launcher,
            login_url: config.login_url.clone(),
            download_dir: config.download_path.clone(),
            login_poll: config.login_poll(),
            debug_screenshots: config.debug_screenshots,
        }
    }

    /// ブラウザを起動してログインする。失敗時はブラウザを閉じてから返す。
    pub async fn acquire(&self, credentials: &Credentials) -> Result<Session, AuthError> {
        info!("Launching browser for portal login");
        let mut driver = self.launcher.launch(&self.download_dir).await?;

        match self.login(driver.as_ref(), credentials).await {
            Ok(()) => {
                info!("Login successful as {}", credentials.username);
                Ok(Session::new(driver))
            }
            Err(e) => {
                warn!("Login failed: {}", e);
                if self.debug_screenshots {
                    self.log_screenshot(driver.as_ref()).await;
                }
                if let Err(close_err) = driver.close().await {
                    warn!("Failed to close browser after login failure: {}", close_err);
                }
                Err(e)
            }
        }
    }

    /// ログインして成功／拒否の表示を待つ
    async fn login(&self, driver: &dyn BrowserDriver, credentials: &Credentials) -> Result<(), AuthError> {
        driver.navigate(&self.login_url).await?;

        let user_field = Locator::css(USER_FIELD);
        if !driver.wait_for_element(&user_field, &self.login_poll).await? {
            return Err(AuthError::Timeout);
        }
        driver.fill_field(&user_field, &credentials.username).await?;
        driver
            .fill_field(&Locator::css(PASSWORD_FIELD), &credentials.password)
            .await?;
        debug!("Credentials entered, submitting login form");
        driver.click(&Locator::css(SUBMIT_BUTTON)).await?;

        let logged_in = Locator::css(LOGGED_IN_MARKER);
        let rejected = [Locator::css(REJECTION_SELECTOR), Locator::text(REJECTION_TEXT)];
        let mut schedule = self.login_poll.start();
        loop {
            if driver.element_exists(&logged_in).await? {
                return Ok(());
            }
            for marker in &rejected {
                if driver.element_visible(marker).await? {
                    return Err(AuthError::InvalidCredentials);
                }
            }
            if !schedule.tick().await {
                return Err(AuthError::Timeout);
            }
        }
    }

    async fn log_screenshot(&self, driver: &dyn BrowserDriver) {
        match driver.screenshot().await {
            Ok(png) if !png.is_empty() => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(&png);
                debug!("Login screenshot: data:image/png;base64,{}", encoded);
            }
            Ok(_) => {}
            Err(e) => debug!("Failed to capture login screenshot: {}", e),
        }
    }
}
