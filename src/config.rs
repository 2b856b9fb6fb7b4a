use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::report::FetchTimeouts;
use crate::retry::{PollPolicy, RetryPolicy};

/// 実行中に不変の認証情報
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub warehouse_project_id: String,
    pub warehouse_dataset_id: String,
    /// サービスアカウントJSONのパス
    pub warehouse_service_account: PathBuf,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            warehouse_project_id: String::new(),
            warehouse_dataset_id: String::new(),
            warehouse_service_account: PathBuf::new(),
        }
    }
}

// パスワードはログに出さない
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .field("warehouse_project_id", &self.warehouse_project_id)
            .field("warehouse_dataset_id", &self.warehouse_dataset_id)
            .field("warehouse_service_account", &self.warehouse_service_account)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct EtlConfig {
    pub credentials: Credentials,
    pub login_url: String,
    pub download_path: PathBuf,
    pub headless: bool,
    pub chrome_path: String,
    pub table_prefix: String,
    pub retry: RetryPolicy,
    pub login_timeout: Duration,
    pub fetch: FetchTimeouts,
    pub warehouse_timeout: Duration,
    pub debug_screenshots: bool,
    /// BigQueryの代わりにメモリ上のウェアハウスへロード
    pub dry_run: bool,
}

pub const DEFAULT_LOGIN_URL: &str = "https://afiliado.supremaposta.com/login";

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            credentials: Credentials::new("", ""),
            login_url: DEFAULT_LOGIN_URL.to_string(),
            download_path: PathBuf::from("/tmp/scraper"),
            headless: true,
            chrome_path: "chromium".to_string(),
            table_prefix: "relatorio_".to_string(),
            retry: RetryPolicy::default(),
            login_timeout: Duration::from_secs(30),
            fetch: FetchTimeouts::default(),
            warehouse_timeout: Duration::from_secs(120),
            debug_screenshots: false,
            dry_run: false,
        }
    }
}

impl EtlConfig {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            ..Default::default()
        }
    }

    /// 環境変数から設定を読み込む
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// 任意のキー参照関数から設定を読み込む
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let require = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let credentials = Credentials {
            username: require("USERNAME")?,
            password: require("PASSWORD")?,
            warehouse_project_id: require("GCP_PROJECT_ID")?,
            warehouse_dataset_id: require("BQ_DATASET_ID")?,
            warehouse_service_account: PathBuf::from(require("GOOGLE_APPLICATION_CREDENTIALS")?),
        };

        let defaults = Self::default();
        let secs = |key: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            match get(key) {
                Some(v) => v
                    .parse::<u64>()
                    .map(Duration::from_secs)
                    .map_err(|_| ConfigError::Invalid { name: key, value: v }),
                None => Ok(default),
            }
        };
        let flag = |key: &'static str, default: bool| -> Result<bool, ConfigError> {
            match get(key) {
                Some(v) => parse_bool(&v).ok_or(ConfigError::Invalid { name: key, value: v }),
                None => Ok(default),
            }
        };

        let max_attempts = match get("MAX_ATTEMPTS") {
            Some(v) => v
                .parse::<u32>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or(ConfigError::Invalid {
                    name: "MAX_ATTEMPTS",
                    value: v,
                })?,
            None => defaults.retry.max_attempts,
        };
        let retry = RetryPolicy::new(
            max_attempts,
            secs("RETRY_BASE_DELAY_SECS", defaults.retry.base_delay)?,
            secs("RETRY_MAX_DELAY_SECS", defaults.retry.max_delay)?,
        );

        let fetch = FetchTimeouts {
            element: defaults.fetch.element,
            generate: defaults
                .fetch
                .generate
                .with_timeout(secs("GENERATE_TIMEOUT_SECS", defaults.fetch.generate.timeout)?),
            download: defaults
                .fetch
                .download
                .with_timeout(secs("DOWNLOAD_TIMEOUT_SECS", defaults.fetch.download.timeout)?),
        };

        Ok(Self {
            credentials,
            login_url: get("PORTAL_LOGIN_URL").unwrap_or(defaults.login_url),
            download_path: get("DOWNLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.download_path),
            headless: flag("HEADLESS", defaults.headless)?,
            chrome_path: get("CHROME_PATH")
                .or_else(|| get("CHROMIUM_PATH"))
                .unwrap_or(defaults.chrome_path),
            table_prefix: get("BQ_TABLE_PREFIX").unwrap_or(defaults.table_prefix),
            retry,
            login_timeout: secs("LOGIN_TIMEOUT_SECS", defaults.login_timeout)?,
            fetch,
            warehouse_timeout: secs("WAREHOUSE_TIMEOUT_SECS", defaults.warehouse_timeout)?,
            debug_screenshots: flag("DEBUG_SCREENSHOTS", defaults.debug_screenshots)?,
            dry_run: flag("DRY_RUN", defaults.dry_run)?,
        })
    }

    pub fn with_download_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.download_path = path.into();
        self
    }

    pub fn with_headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_login_timeout(mut self, timeout: Duration) -> Self {
        self.login_timeout = timeout;
        self
    }

    pub fn with_fetch_timeouts(mut self, fetch: FetchTimeouts) -> Self {
        self.fetch = fetch;
        self
    }

    pub fn with_warehouse_timeout(mut self, timeout: Duration) -> Self {
        self.warehouse_timeout = timeout;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// ログイン確認のポーリング設定
    pub fn login_poll(&self) -> PollPolicy {
        PollPolicy::element(self.login_timeout)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const REQUIRED: &[(&str, &str)] = &[
        ("USERNAME", "afiliado"),
        ("PASSWORD", "segredo"),
        ("GCP_PROJECT_ID", "proj"),
        ("BQ_DATASET_ID", "reports"),
        ("GOOGLE_APPLICATION_CREDENTIALS", "/secrets/sa.json"),
    ];

    #[test]
    fn test_from_lookup_defaults() {
        let config = EtlConfig::from_lookup(env(REQUIRED)).unwrap();
        assert_eq!(config.credentials.username, "afiliado");
        assert_eq!(
            config.credentials.warehouse_service_account,
            PathBuf::from("/secrets/sa.json")
        );
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.fetch.download.timeout, Duration::from_secs(60));
        assert_eq!(config.table_prefix, "relatorio_");
        assert!(config.headless);
        assert!(!config.dry_run);
    }

    #[test]
    fn test_missing_required_variable() {
        let pairs: Vec<_> = REQUIRED
            .iter()
            .copied()
            .filter(|(k, _)| *k != "BQ_DATASET_ID")
            .collect();
        let err = EtlConfig::from_lookup(env(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("BQ_DATASET_ID")));

        let mut blank = REQUIRED.to_vec();
        blank[1] = ("PASSWORD", "  ");
        let err = EtlConfig::from_lookup(env(&blank)).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("PASSWORD")));
    }

    #[test]
    fn test_overrides_and_invalid_values() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend_from_slice(&[
            ("MAX_ATTEMPTS", "5"),
            ("DOWNLOAD_TIMEOUT_SECS", "90"),
            ("HEADLESS", "false"),
            ("DRY_RUN", "1"),
        ]);
        let config = EtlConfig::from_lookup(env(&pairs)).unwrap();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.fetch.download.timeout, Duration::from_secs(90));
        assert!(!config.headless);
        assert!(config.dry_run);

        let mut bad = REQUIRED.to_vec();
        bad.push(("MAX_ATTEMPTS", "0"));
        assert!(matches!(
            EtlConfig::from_lookup(env(&bad)),
            Err(ConfigError::Invalid { name: "MAX_ATTEMPTS", .. })
        ));
    }

    #[test]
    fn test_debug_redacts_password() {
        let creds = Credentials::new("user", "hunter2");
        let printed = format!("{:?}", creds);
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("user"));
    }
}
