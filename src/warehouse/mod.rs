//! ウェアハウスロードモジュール
//!
//! 日付パーティション単位で削除→挿入し、再実行しても重複させない

mod bigquery;
mod loader;
mod memory;

pub use bigquery::BigQueryWarehouse;
pub use loader::{check_schema, LoadResult, WarehouseLoader};
pub use memory::MemoryWarehouse;
