//! ダウンロードしたレポートを型付きレコードセットへ変換

use chrono::{NaiveDate, NaiveDateTime};
use csv::{ReaderBuilder, StringRecord, Trim};
use tracing::{debug, info};

use crate::error::ParseError;

use super::schema::{fold_header, ColumnSpec, ColumnType};
use super::types::{ArtifactFormat, NormalizedRecordSet, RawArtifact, ReportKind, Row, Value};

const DATE_FORMATS: &[&str] = &["%d/%m/%Y", "%Y-%m-%d", "%d-%m-%Y"];
const DATETIME_FORMATS: &[&str] = &[
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
];

/// レポートを正規化する。成功・失敗にかかわらずアーティファクトは削除される。
pub fn normalize(
    artifact: RawArtifact,
    kind: ReportKind,
    target_date: NaiveDate,
) -> Result<NormalizedRecordSet, ParseError> {
    let format = kind.format();
    let path = artifact.path.clone();
    let bytes = artifact.discard();
    debug!("Normalizing {} artifact {:?} ({} bytes)", kind, path, bytes.len());

    let rows = match format {
        ArtifactFormat::Csv { delimiter } => parse_csv(&bytes, delimiter, kind.schema(), target_date)?,
    };

    info!("Normalized {} rows for {} on {}", rows.len(), kind, target_date);
    Ok(NormalizedRecordSet {
        kind,
        report_date: target_date,
        rows,
    })
}

/// UTF-8として読めなければ Latin-1 として解釈
fn decode(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.trim_start_matches('\u{feff}').to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

fn parse_csv(
    bytes: &[u8],
    delimiter: u8,
    columns: &'static [ColumnSpec],
    target_date: NaiveDate,
) -> Result<Vec<Row>, ParseError> {
    let text = decode(bytes);
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(text.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| ParseError::Malformed(e.to_string()))?
        .clone();
    let mapping = resolve_columns(&headers, columns)?;

    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record.map_err(|e| ParseError::Malformed(e.to_string()))?;
        if is_blank(&record) || is_total_row(&record) {
            continue;
        }

        // 見出し行を1行目として数える
        let line = index + 2;
        let mut row = Row::new();
        for (spec, source) in columns.iter().zip(&mapping) {
            if spec.is_stamped() {
                row.set(spec.name, Value::Date(target_date));
                continue;
            }
            let raw = source.and_then(|i| record.get(i)).unwrap_or("");
            let value = cast(raw, spec.ty).ok_or_else(|| ParseError::TypeMismatch {
                row: line,
                column: spec.name.to_string(),
                expected: spec.ty.describe(),
                value: raw.to_string(),
            })?;
            row.set(spec.name, value);
        }
        rows.push(row);
    }

    Ok(rows)
}

/// カノニカルカラムごとにCSVの列番号を決める
fn resolve_columns(
    headers: &StringRecord,
    columns: &[ColumnSpec],
) -> Result<Vec<Option<usize>>, ParseError> {
    let folded: Vec<String> = headers.iter().map(fold_header).collect();

    columns
        .iter()
        .map(|spec| {
            if spec.is_stamped() {
                return Ok(None);
            }
            let found = spec.aliases.iter().find_map(|alias| {
                let alias = fold_header(alias);
                folded.iter().position(|h| *h == alias)
            });
            match found {
                Some(i) => Ok(Some(i)),
                None if spec.required => Err(ParseError::MissingColumn(spec.name.to_string())),
                None => {
                    debug!("Optional column {} not present in artifact", spec.name);
                    Ok(None)
                }
            }
        })
        .collect()
}

fn is_blank(record: &StringRecord) -> bool {
    record.iter().all(|cell| cell.is_empty())
}

/// 先頭セルがちょうど「Total」の集計行。`TOTALBET-01` のような識別子は対象外。
fn is_total_row(record: &StringRecord) -> bool {
    record
        .get(0)
        .map(|first| matches!(fold_header(first).as_str(), "total" | "total:"))
        .unwrap_or(false)
}

/// セル値を型変換。変換できなければ `None`。
pub fn cast(raw: &str, ty: ColumnType) -> Option<Value> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Some(Value::Null);
    }
    match ty {
        ColumnType::Text => Some(Value::Text(raw.to_string())),
        ColumnType::Number => parse_number(raw).map(Value::Number),
        ColumnType::Date => parse_date(raw).map(Value::Date),
    }
}

/// `1.234,56` / `1234.56` / `R$ 10,00` / `12%` を数値に
pub fn parse_number(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim_start_matches("R$")
        .trim_end_matches('%')
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{a0}')
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    let normalized = match (cleaned.rfind(','), cleaned.rfind('.')) {
        // 1.234,56
        (Some(comma), Some(dot)) if comma > dot => cleaned.replace('.', "").replace(',', "."),
        // 1,234.56
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        // 10,5
        (Some(_), None) => cleaned.replace(',', "."),
        // 1.200 (桁区切りのみ)
        (None, Some(_)) if is_thousands_grouped(&cleaned) => cleaned.replace('.', ""),
        _ => cleaned,
    };

    normalized.parse::<f64>().ok().filter(|n| n.is_finite())
}

fn is_thousands_grouped(s: &str) -> bool {
    let digits = s.trim_start_matches('-');
    let mut groups = digits.split('.');
    let head_ok = groups
        .next()
        .map(|g| (1..=3).contains(&g.len()) && g.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false);
    head_ok && groups.all(|g| g.len() == 3 && g.chars().all(|c| c.is_ascii_digit()))
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    DATE_FORMATS
        .iter()
        .find_map(|f| NaiveDate::parse_from_str(raw, f).ok())
        .or_else(|| {
            DATETIME_FORMATS
                .iter()
                .find_map(|f| NaiveDateTime::parse_from_str(raw, f).ok())
                .map(|dt| dt.date())
        })
}
