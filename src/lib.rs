//! アフィリエイトポータル日次レポートETLライブラリ
//!
//! - ポータルにログインして4種類のレポートCSVをダウンロード
//! - 列名・数値・日付を正規化して対象日でスタンプ
//! - BigQuery の日付パーティションを丸ごと置き換え（再実行しても重複しない）
//!
//! # 使用例
//!
//! ```rust,ignore
//! use report_etl_service::{EtlConfig, ReportEtlService, RunRequest, Shutdown};
//! use tower::Service;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = EtlConfig::from_env().unwrap();
//!     let (_trigger, shutdown) = Shutdown::channel();
//!     let mut service = ReportEtlService::from_config(&config, shutdown).unwrap();
//!
//!     let summary = service.call(RunRequest::yesterday()).await.unwrap();
//!     println!("exit code: {}", summary.exit_code());
//! }
//! ```

pub mod browser;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod report;
pub mod retry;
pub mod service;
pub mod session;
pub mod shutdown;
pub mod traits;
pub mod warehouse;

// 主要な型をリエクスポート
pub use config::{Credentials, EtlConfig};
pub use error::{AuthError, ConfigError, DriverError, FetchError, LoadError, ParseError, StageError};
pub use orchestrator::{
    AttemptRecord, Orchestrator, ReportOutcome, ReportState, ReportStatus, RunRequest, RunSummary,
};
pub use report::{NormalizedRecordSet, RawArtifact, ReportKind, Row, Value};
pub use retry::{PollPolicy, RetryPolicy};
pub use service::ReportEtlService;
pub use session::{Session, SessionManager};
pub use shutdown::{Shutdown, ShutdownTrigger};
pub use traits::{BrowserDriver, BrowserLauncher, Locator, Warehouse};
pub use warehouse::{LoadResult, MemoryWarehouse, WarehouseLoader};
