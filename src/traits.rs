use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::{DriverError, LoadError};
use crate::report::{ColumnSpec, Row};
use crate::retry::PollPolicy;

/// 画面要素の指定方法
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Locator {
    /// CSSセレクタ
    Css(String),
    /// テキストが完全一致する `<a>`
    LinkText(String),
    /// テキストを含む `<button>`
    ButtonText(String),
    /// ページ本文に含まれるテキスト
    PageText(String),
}

impl Locator {
    pub fn css(selector: impl Into<String>) -> Self {
        Locator::Css(selector.into())
    }

    pub fn link(text: impl Into<String>) -> Self {
        Locator::LinkText(text.into())
    }

    pub fn button(text: impl Into<String>) -> Self {
        Locator::ButtonText(text.into())
    }

    pub fn text(text: impl Into<String>) -> Self {
        Locator::PageText(text.into())
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Css(s) => write!(f, "css `{}`", s),
            Locator::LinkText(s) => write!(f, "link `{}`", s),
            Locator::ButtonText(s) => write!(f, "button `{}`", s),
            Locator::PageText(s) => write!(f, "text `{}`", s),
        }
    }
}

/// ブラウザ操作の抽象化
///
/// 実ブラウザ（chromiumoxide）とテスト用モックの両方がこれを実装する。
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    /// URLへ遷移
    async fn navigate(&self, url: &str) -> Result<(), DriverError>;

    /// 入力欄に値を設定
    async fn fill_field(&self, locator: &Locator, value: &str) -> Result<(), DriverError>;

    /// 要素をクリック
    async fn click(&self, locator: &Locator) -> Result<(), DriverError>;

    /// `<select>` の表示テキストで選択
    async fn select_option(&self, locator: &Locator, visible_text: &str)
        -> Result<(), DriverError>;

    /// 要素が現在存在するか
    async fn element_exists(&self, locator: &Locator) -> Result<bool, DriverError>;

    /// 一致する要素のうち画面に表示されているものがあるか
    ///
    /// 非表示のまま DOM に置かれている要素（バリデーションメッセージ等）は `false`。
    async fn element_visible(&self, locator: &Locator) -> Result<bool, DriverError> {
        self.element_exists(locator).await
    }

    /// 要素が現れるまで待機。期限内に現れなければ `false`。
    async fn wait_for_element(
        &self,
        locator: &Locator,
        poll: &PollPolicy,
    ) -> Result<bool, DriverError> {
        let mut schedule = poll.start();
        loop {
            if self.element_exists(locator).await? {
                return Ok(true);
            }
            if !schedule.tick().await {
                return Ok(false);
            }
        }
    }

    /// デバッグ用スクリーンショット（PNG）
    async fn screenshot(&self) -> Result<Vec<u8>, DriverError>;

    /// ダウンロード先ディレクトリ
    fn download_dir(&self) -> &Path;

    /// ブラウザプロセスを終了
    async fn close(&mut self) -> Result<(), DriverError>;
}

/// ブラウザ起動の抽象化
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self, download_dir: &Path) -> Result<Box<dyn BrowserDriver>, DriverError>;
}

/// デプロイ済みテーブルのカラム定義
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployedColumn {
    pub name: String,
    /// ウェアハウス側の型名（例: STRING, FLOAT64, DATE）
    pub data_type: String,
}

impl DeployedColumn {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

/// パーティション書き込み結果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PartitionWrite {
    /// 削除した既存行数（ウェアハウスが返さない場合は `None`）
    pub rows_deleted: Option<u64>,
    pub rows_written: u64,
}

/// 出力先ウェアハウスの抽象化
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// テーブルのスキーマ。テーブルが無ければ `None`。
    async fn table_schema(&self, table: &str) -> Result<Option<Vec<DeployedColumn>>, LoadError>;

    async fn create_table(&self, table: &str, columns: &[ColumnSpec]) -> Result<(), LoadError>;

    /// `date` のパーティションを `rows` で置き換える。再実行しても行は重複しない。
    async fn replace_partition(
        &self,
        table: &str,
        date: NaiveDate,
        columns: &[ColumnSpec],
        rows: &[Row],
    ) -> Result<PartitionWrite, LoadError>;
}
