//! レポート関連の型定義

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::NaiveDate;

use crate::traits::Locator;

use super::schema::{self, ColumnSpec, REPORT_DATE_COLUMN};

/// 取得対象のレポート種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReportKind {
    Media,
    Registros,
    Ganhos,
    Atividades,
}

impl ReportKind {
    /// 処理順
    pub const ALL: [ReportKind; 4] = [
        ReportKind::Media,
        ReportKind::Registros,
        ReportKind::Ganhos,
        ReportKind::Atividades,
    ];

    /// ポータル上のリンクテキスト
    pub fn portal_label(&self) -> &'static str {
        match self {
            ReportKind::Media => "Relatório de Mídia",
            ReportKind::Registros => "Relatório de Registros",
            ReportKind::Ganhos => "Relatório de Ganhos",
            ReportKind::Atividades => "Relatório de atividades",
        }
    }

    /// 出力先テーブル名（プレフィックスなし）
    pub fn table_name(&self) -> &'static str {
        match self {
            ReportKind::Media => "midia",
            ReportKind::Registros => "registros",
            ReportKind::Ganhos => "ganhos",
            ReportKind::Atividades => "atividades",
        }
    }

    /// ダウンロード後にリネームするファイル名
    pub fn artifact_file_name(&self) -> String {
        format!("{}.{}", self.table_name(), self.format().extension())
    }

    pub fn format(&self) -> ArtifactFormat {
        ArtifactFormat::Csv { delimiter: b',' }
    }

    pub fn schema(&self) -> &'static [ColumnSpec] {
        schema::columns_for(*self)
    }

    /// メニューからレポート画面までのクリック順
    pub fn navigation_path(&self) -> [Locator; 3] {
        [
            Locator::css("#mobileToggle"),
            Locator::link("Relatórios"),
            Locator::link(self.portal_label()),
        ]
    }
}

impl fmt::Display for ReportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReportKind::Media => "Media",
            ReportKind::Registros => "Registros",
            ReportKind::Ganhos => "Ganhos",
            ReportKind::Atividades => "Atividades",
        };
        f.write_str(name)
    }
}

/// ダウンロードファイルの形式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactFormat {
    Csv { delimiter: u8 },
}

impl ArtifactFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ArtifactFormat::Csv { .. } => "csv",
        }
    }
}

/// ダウンロードしたままのレポート
#[derive(Debug, Clone)]
pub struct RawArtifact {
    pub kind: ReportKind,
    pub target_date: NaiveDate,
    pub format: ArtifactFormat,
    pub path: PathBuf,
    pub bytes: Vec<u8>,
}

impl RawArtifact {
    /// ファイルを削除して中身だけを返す
    pub fn discard(self) -> Vec<u8> {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove artifact {:?}: {}", self.path, e);
            }
        }
        self.bytes
    }
}

/// 型付きセル値
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Text(String),
    Number(f64),
    Date(NaiveDate),
}

impl Value {
    /// NDJSON ロード用の表現
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Date(d) => serde_json::Value::String(d.format("%Y-%m-%d").to_string()),
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(d) => Some(*d),
            _ => None,
        }
    }
}

/// 正規化済みの1行（カノニカルカラム名 → 値）
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    values: BTreeMap<&'static str, Value>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, column: &'static str, value: Value) {
        self.values.insert(column, value);
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    pub fn report_date(&self) -> Option<NaiveDate> {
        self.get(REPORT_DATE_COLUMN).and_then(Value::as_date)
    }

    pub fn columns(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.values.keys().copied()
    }

    pub fn to_json(&self) -> serde_json::Value {
        let map = self
            .values
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_json()))
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(map)
    }
}

/// 正規化済みレコードセット（1レポート種別・1日付）
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecordSet {
    pub kind: ReportKind,
    pub report_date: NaiveDate,
    pub rows: Vec<Row>,
}

impl NormalizedRecordSet {
    /// 「データなし」の日の空レコードセット
    pub fn empty(kind: ReportKind, report_date: NaiveDate) -> Self {
        Self {
            kind,
            report_date,
            rows: Vec::new(),
        }
    }

    pub fn columns(&self) -> &'static [ColumnSpec] {
        self.kind.schema()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}
