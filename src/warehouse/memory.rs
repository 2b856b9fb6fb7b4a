//! プロセス内ウェアハウス（DRY_RUN とテスト用）

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::NaiveDate;
use tracing::debug;

use crate::error::LoadError;
use crate::report::{ColumnSpec, Row};
use crate::traits::{DeployedColumn, PartitionWrite, Warehouse};

#[derive(Debug, Default)]
struct Table {
    columns: Vec<DeployedColumn>,
    rows: Vec<Row>,
}

#[derive(Debug, Default)]
struct State {
    tables: HashMap<String, Table>,
    failures: HashMap<String, VecDeque<LoadError>>,
}

/// 日付単位の削除→挿入を再現するメモリ上のウェアハウス
#[derive(Debug, Default)]
pub struct MemoryWarehouse {
    state: Mutex<State>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // テスト中のパニックで汚染されても中身は使える
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 既存テーブルを用意する（スキーマ不一致の再現用）
    pub fn deploy_table(&self, table: &str, columns: Vec<DeployedColumn>) {
        self.lock().tables.insert(
            table.to_string(),
            Table {
                columns,
                rows: Vec::new(),
            },
        );
    }

    /// 次回の `replace_partition` を失敗させる
    pub fn fail_next(&self, table: &str, error: LoadError) {
        self.lock()
            .failures
            .entry(table.to_string())
            .or_default()
            .push_back(error);
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn rows_for(&self, table: &str, date: NaiveDate) -> Vec<Row> {
        self.rows(table)
            .into_iter()
            .filter(|r| r.report_date() == Some(date))
            .collect()
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().tables.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    async fn table_schema(&self, table: &str) -> Result<Option<Vec<DeployedColumn>>, LoadError> {
        Ok(self.lock().tables.get(table).map(|t| t.columns.clone()))
    }

    async fn create_table(&self, table: &str, columns: &[ColumnSpec]) -> Result<(), LoadError> {
        let columns = columns
            .iter()
            .map(|c| DeployedColumn::new(c.name, c.ty.warehouse_type()))
            .collect();
        self.lock().tables.insert(
            table.to_string(),
            Table {
                columns,
                rows: Vec::new(),
            },
        );
        Ok(())
    }

    async fn replace_partition(
        &self,
        table: &str,
        date: NaiveDate,
        _columns: &[ColumnSpec],
        rows: &[Row],
    ) -> Result<PartitionWrite, LoadError> {
        let mut state = self.lock();
        if let Some(error) = state.failures.get_mut(table).and_then(VecDeque::pop_front) {
            debug!("Injected failure for {}: {}", table, error);
            return Err(error);
        }

        let stored = state
            .tables
            .get_mut(table)
            .ok_or_else(|| LoadError::Rejected(format!("table {} not found", table)))?;

        let before = stored.rows.len();
        stored.rows.retain(|r| r.report_date() != Some(date));
        let deleted = (before - stored.rows.len()) as u64;
        stored.rows.extend_from_slice(rows);

        Ok(PartitionWrite {
            rows_deleted: Some(deleted),
            rows_written: rows.len() as u64,
        })
    }
}
