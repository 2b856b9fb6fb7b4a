//! レコードセットを出力先テーブルへ冪等にロード

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tracing::{info, warn};

use crate::error::LoadError;
use crate::report::{ColumnSpec, NormalizedRecordSet, ReportKind};
use crate::traits::{DeployedColumn, Warehouse};

/// ロード結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadResult {
    pub table: String,
    pub report_date: NaiveDate,
    pub rows_deleted: Option<u64>,
    pub rows_written: u64,
}

pub struct WarehouseLoader {
    warehouse: Arc<dyn Warehouse>,
    table_prefix: String,
    timeout: Duration,
}

impl WarehouseLoader {
    pub fn new(warehouse: Arc<dyn Warehouse>, table_prefix: impl Into<String>, timeout: Duration) -> Self {
        Self {
            warehouse,
            table_prefix: table_prefix.into(),
            timeout,
        }
    }

    pub fn table_for(&self, kind: ReportKind) -> String {
        format!("{}{}", self.table_prefix, kind.table_name())
    }

    /// 同じ日付の既存行を置き換える
    pub async fn load(&self, record_set: &NormalizedRecordSet) -> Result<LoadResult, LoadError> {
        let table = self.table_for(record_set.kind);
        let columns = record_set.columns();

        match self.bounded("schema lookup", self.warehouse.table_schema(&table)).await? {
            Some(deployed) => check_schema(&table, columns, &deployed)?,
            None => {
                info!("Table {} does not exist, creating it", table);
                self.bounded("table creation", self.warehouse.create_table(&table, columns))
                    .await?;
            }
        }

        let write = self
            .bounded(
                "partition replace",
                self.warehouse
                    .replace_partition(&table, record_set.report_date, columns, &record_set.rows),
            )
            .await?;

        info!(
            "Loaded {} rows into {} for {} (deleted {:?})",
            write.rows_written, table, record_set.report_date, write.rows_deleted
        );

        Ok(LoadResult {
            table,
            report_date: record_set.report_date,
            rows_deleted: write.rows_deleted,
            rows_written: write.rows_written,
        })
    }

    async fn bounded<T, F>(&self, what: &str, call: F) -> Result<T, LoadError>
    where
        F: Future<Output = Result<T, LoadError>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Warehouse {} timed out after {:?}", what, self.timeout);
                Err(LoadError::Transient(format!(
                    "{} timed out after {:?}",
                    what, self.timeout
                )))
            }
        }
    }
}

/// デプロイ済みスキーマがカノニカルスキーマを受け入れられるか
pub fn check_schema(
    table: &str,
    columns: &[ColumnSpec],
    deployed: &[DeployedColumn],
) -> Result<(), LoadError> {
    for spec in columns {
        let found = deployed
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(spec.name));
        match found {
            Some(column) if spec.ty.accepts(&column.data_type) => {}
            Some(column) => {
                return Err(LoadError::SchemaMismatch {
                    table: table.to_string(),
                    detail: format!(
                        "column {} is {} but {} is required",
                        spec.name,
                        column.data_type,
                        spec.ty.warehouse_type()
                    ),
                })
            }
            None => {
                return Err(LoadError::SchemaMismatch {
                    table: table.to_string(),
                    detail: format!("column {} is missing", spec.name),
                })
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{Row, Value, REPORT_DATE_COLUMN};
    use crate::warehouse::MemoryWarehouse;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 14).unwrap()
    }

    fn ganhos(amounts: &[f64]) -> NormalizedRecordSet {
        let rows = amounts
            .iter()
            .map(|a| {
                let mut row = Row::new();
                row.set(REPORT_DATE_COLUMN, Value::Date(date()));
                row.set("commission_type", Value::Text("CPA".into()));
                row.set("amount", Value::Number(*a));
                row.set("currency", Value::Null);
                row
            })
            .collect();
        NormalizedRecordSet {
            kind: ReportKind::Ganhos,
            report_date: date(),
            rows,
        }
    }

    #[tokio::test]
    async fn test_load_twice_keeps_single_copy() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        let loader = WarehouseLoader::new(warehouse.clone(), "relatorio_", Duration::from_secs(5));

        let first = loader.load(&ganhos(&[1.0, 2.0])).await.unwrap();
        assert_eq!(first.table, "relatorio_ganhos");
        assert_eq!(first.rows_written, 2);

        let second = loader.load(&ganhos(&[1.0, 2.0])).await.unwrap();
        assert_eq!(second.rows_deleted, Some(2));
        assert_eq!(warehouse.rows_for("relatorio_ganhos", date()).len(), 2);
    }

    #[tokio::test]
    async fn test_schema_mismatch_is_reported() {
        let warehouse = Arc::new(MemoryWarehouse::new());
        warehouse.deploy_table(
            "relatorio_ganhos",
            vec![
                DeployedColumn::new("report_date", "DATE"),
                DeployedColumn::new("commission_type", "STRING"),
                DeployedColumn::new("amount", "STRING"),
                DeployedColumn::new("currency", "STRING"),
            ],
        );
        let loader = WarehouseLoader::new(warehouse.clone(), "relatorio_", Duration::from_secs(5));

        let err = loader.load(&ganhos(&[1.0])).await.unwrap_err();
        assert!(matches!(err, LoadError::SchemaMismatch { .. }));
        assert!(warehouse.rows("relatorio_ganhos").is_empty());
    }

    #[test]
    fn test_check_schema_missing_column() {
        let deployed = vec![DeployedColumn::new("report_date", "DATE")];
        let err = check_schema("t", ReportKind::Ganhos.schema(), &deployed).unwrap_err();
        assert_eq!(
            err,
            LoadError::SchemaMismatch {
                table: "t".into(),
                detail: "column commission_type is missing".into()
            }
        );
    }
}
