//! エラー定義
//!
//! ステージごとにエラー型を分け、リトライ可否は `is_retryable()` で判定する。

use thiserror::Error;

/// ブラウザ操作エラー
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("browser launch failed: {0}")]
    Launch(String),

    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("element not found: {0}")]
    ElementNotFound(String),

    #[error("javascript evaluation failed: {0}")]
    JavaScript(String),

    #[error("browser shutdown failed: {0}")]
    Shutdown(String),
}

/// ログイン（セッション取得）エラー
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("portal rejected the credentials")]
    InvalidCredentials,

    #[error("login was not confirmed within the timeout")]
    Timeout,

    #[error("browser failure during login: {0}")]
    Browser(#[from] DriverError),
}

impl AuthError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, AuthError::InvalidCredentials)
    }
}

/// レポート取得エラー
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// ポータルが「データなし」を明示した（エラーではなく空ロードになる）
    #[error("portal reported no data for the requested date")]
    NoDataForDate,

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("portal session expired")]
    SessionExpired,

    #[error("no portal date preset for {target_date} on run date {run_date}")]
    UnsupportedDate {
        target_date: chrono::NaiveDate,
        run_date: chrono::NaiveDate,
    },

    #[error(transparent)]
    Browser(#[from] DriverError),

    #[error("download directory error: {0}")]
    Io(String),
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            FetchError::NoDataForDate | FetchError::UnsupportedDate { .. }
        )
    }
}

impl From<std::io::Error> for FetchError {
    fn from(e: std::io::Error) -> Self {
        FetchError::Io(e.to_string())
    }
}

/// 正規化エラー（いずれも致命的）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("required column `{0}` missing from artifact")]
    MissingColumn(String),

    #[error("row {row}: column `{column}` cannot be read as {expected}: {value:?}")]
    TypeMismatch {
        row: usize,
        column: String,
        expected: &'static str,
        value: String,
    },

    #[error("malformed artifact: {0}")]
    Malformed(String),
}

impl ParseError {
    pub fn is_retryable(&self) -> bool {
        false
    }
}

/// ウェアハウスロードエラー
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    #[error("transient warehouse failure: {0}")]
    Transient(String),

    #[error("destination schema mismatch on {table}: {detail}")]
    SchemaMismatch { table: String, detail: String },

    #[error("warehouse rejected the request: {0}")]
    Rejected(String),
}

impl LoadError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, LoadError::Transient(_))
    }
}

/// 起動時設定エラー
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },

    #[error("cannot read service account file {path}: {reason}")]
    ServiceAccount { path: String, reason: String },
}

/// パイプラインの各ステージで発生したエラー
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StageError {
    #[error("auth: {0}")]
    Auth(#[from] AuthError),

    #[error("fetch: {0}")]
    Fetch(#[from] FetchError),

    #[error("parse: {0}")]
    Parse(#[from] ParseError),

    #[error("load: {0}")]
    Load(#[from] LoadError),
}

impl StageError {
    pub fn is_retryable(&self) -> bool {
        match self {
            StageError::Auth(e) => e.is_retryable(),
            StageError::Fetch(e) => e.is_retryable(),
            StageError::Parse(e) => e.is_retryable(),
            StageError::Load(e) => e.is_retryable(),
        }
    }

    /// 次の試行の前にセッションを取り直す必要があるか
    pub fn requires_new_session(&self) -> bool {
        matches!(
            self,
            StageError::Auth(_) | StageError::Fetch(FetchError::SessionExpired)
        )
    }

    /// サマリー用の短いエラー種別名
    pub fn kind_name(&self) -> &'static str {
        match self {
            StageError::Auth(AuthError::InvalidCredentials) => "AuthError::InvalidCredentials",
            StageError::Auth(AuthError::Timeout) => "AuthError::Timeout",
            StageError::Auth(AuthError::Browser(_)) => "AuthError::Browser",
            StageError::Fetch(FetchError::NoDataForDate) => "FetchError::NoDataForDate",
            StageError::Fetch(FetchError::Timeout(_)) => "FetchError::Timeout",
            StageError::Fetch(FetchError::SessionExpired) => "FetchError::SessionExpired",
            StageError::Fetch(FetchError::UnsupportedDate { .. }) => "FetchError::UnsupportedDate",
            StageError::Fetch(FetchError::Browser(_)) => "FetchError::Browser",
            StageError::Fetch(FetchError::Io(_)) => "FetchError::Io",
            StageError::Parse(ParseError::MissingColumn(_)) => "ParseError::MissingColumn",
            StageError::Parse(ParseError::TypeMismatch { .. }) => "ParseError::TypeMismatch",
            StageError::Parse(ParseError::Malformed(_)) => "ParseError::Malformed",
            StageError::Load(LoadError::Transient(_)) => "LoadError::Transient",
            StageError::Load(LoadError::SchemaMismatch { .. }) => "LoadError::SchemaMismatch",
            StageError::Load(LoadError::Rejected(_)) => "LoadError::Rejected",
        }
    }
}
