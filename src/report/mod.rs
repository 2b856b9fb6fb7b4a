//! レポート取得・正規化モジュール
//!
//! ポータルから4種類のレポートCSVを取得し、カノニカルスキーマに変換する

mod fetcher;
mod normalizer;
mod schema;
mod types;

pub use fetcher::{date_preset, purge_artifacts, FetchTimeouts, ReportFetcher};
pub use normalizer::{cast, normalize, parse_date, parse_number};
pub use schema::{columns_for, fold_header, ColumnSpec, ColumnType, REPORT_DATE_COLUMN};
pub use types::{ArtifactFormat, NormalizedRecordSet, RawArtifact, ReportKind, Row, Value};
