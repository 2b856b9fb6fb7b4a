//! ポータルからレポートCSVを取得

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::NaiveDate;
use tracing::{debug, info, warn};

use crate::error::FetchError;
use crate::retry::PollPolicy;
use crate::session::Session;
use crate::traits::{BrowserDriver, Locator};

use super::types::{RawArtifact, ReportKind};

const DATE_FILTER_SELECTOR: &str = "select";
const GENERATE_BUTTON: &str = "Gerar relatório";
const EXPORT_BUTTON: &str = "Exportar relatório";
/// 空レポート時にポータルが表示するメッセージ
const NO_DATA_MARKERS: &[&str] = &["Nenhum dado", "Nenhum registro", "Sem dados"];
/// セッション切れでログイン画面に戻された場合の目印
const LOGIN_FORM_SELECTOR: &str = "input[name='user']";
const IN_PROGRESS_SUFFIXES: &[&str] = &[".crdownload", ".tmp", ".part"];

/// レポート取得の待機設定
#[derive(Debug, Clone, Copy)]
pub struct FetchTimeouts {
    /// 画面要素の出現待ち
    pub element: PollPolicy,
    /// 「Gerar relatório」後の結果待ち
    pub generate: PollPolicy,
    /// ダウンロード完了待ち
    pub download: PollPolicy,
}

impl Default for FetchTimeouts {
    fn default() -> Self {
        Self {
            element: PollPolicy::element(std::time::Duration::from_secs(20)),
            generate: PollPolicy::element(std::time::Duration::from_secs(30)),
            download: PollPolicy::download(),
        }
    }
}

enum Generation {
    Ready,
    NoData,
}

/// レポート取得（1回の実行につき1つ）
pub struct ReportFetcher {
    download_dir: PathBuf,
    run_date: NaiveDate,
    timeouts: FetchTimeouts,
}

impl ReportFetcher {
    pub fn new(download_dir: impl Into<PathBuf>, run_date: NaiveDate, timeouts: FetchTimeouts) -> Self {
        Self {
            download_dir: download_dir.into(),
            run_date,
            timeouts,
        }
    }

    /// レポートを生成・エクスポートしてCSVを取得
    pub async fn fetch(
        &self,
        session: &Session,
        kind: ReportKind,
        target_date: NaiveDate,
    ) -> Result<RawArtifact, FetchError> {
        let preset = date_preset(self.run_date, target_date)?;
        let driver = session.driver();
        info!("Fetching {} report for {} (preset {:?})", kind, target_date, preset);

        // 前回試行の残骸があるとファイル判定を誤るので先に消す
        let removed = purge_artifacts(&self.download_dir)?;
        if removed > 0 {
            debug!("Removed {} stale files from {:?}", removed, self.download_dir);
        }

        self.open_report(driver, kind).await?;

        let date_filter = Locator::css(DATE_FILTER_SELECTOR);
        if !driver.wait_for_element(&date_filter, &self.timeouts.element).await? {
            return Err(FetchError::Timeout(format!("{} date filter", kind)));
        }
        driver.select_option(&date_filter, preset).await?;
        debug!("Date filter set to {}", preset);

        driver.click(&Locator::button(GENERATE_BUTTON)).await?;
        if let Generation::NoData = self.wait_for_generation(driver, kind).await? {
            info!("Portal reports no data for {} on {}", kind, target_date);
            return Err(FetchError::NoDataForDate);
        }

        let before = list_files(&self.download_dir)?;
        driver.click(&Locator::button(EXPORT_BUTTON)).await?;
        debug!("Export requested for {}", kind);

        let downloaded = self.download_wait(kind, &before).await?;
        let path = rename_artifact(&downloaded, kind)?;
        let bytes = std::fs::read(&path)?;
        info!("Downloaded {} report: {:?} ({} bytes)", kind, path, bytes.len());

        Ok(RawArtifact {
            kind,
            target_date,
            format: kind.format(),
            path,
            bytes,
        })
    }

    /// メニューを辿ってレポート画面を開く
    async fn open_report(&self, driver: &dyn BrowserDriver, kind: ReportKind) -> Result<(), FetchError> {
        for step in kind.navigation_path() {
            if !driver.wait_for_element(&step, &self.timeouts.element).await? {
                if driver.element_exists(&Locator::css(LOGIN_FORM_SELECTOR)).await? {
                    warn!("Login form shown while opening {}; session expired", kind);
                    return Err(FetchError::SessionExpired);
                }
                return Err(FetchError::Timeout(format!("{} while opening {}", step, kind)));
            }
            driver.click(&step).await?;
        }
        Ok(())
    }

    /// エクスポートボタンか「データなし」表示のどちらかを待つ
    async fn wait_for_generation(
        &self,
        driver: &dyn BrowserDriver,
        kind: ReportKind,
    ) -> Result<Generation, FetchError> {
        let export = Locator::button(EXPORT_BUTTON);
        let mut schedule = self.timeouts.generate.start();
        loop {
            if driver.element_exists(&export).await? {
                return Ok(Generation::Ready);
            }
            for marker in NO_DATA_MARKERS {
                if driver.element_exists(&Locator::text(*marker)).await? {
                    return Ok(Generation::NoData);
                }
            }
            if !schedule.tick().await {
                return Err(FetchError::Timeout(format!("{} report generation", kind)));
            }
        }
    }

    /// 新しいCSVが現れ、サイズが安定するまでポーリング
    async fn download_wait(
        &self,
        kind: ReportKind,
        before: &HashSet<PathBuf>,
    ) -> Result<PathBuf, FetchError> {
        let extension = kind.format().extension();
        let mut schedule = self.timeouts.download.start();
        let mut last_seen: Option<(PathBuf, u64)> = None;

        loop {
            match newest_download(&self.download_dir, before, extension)? {
                Some(current) => {
                    if last_seen.as_ref() == Some(&current) {
                        return Ok(current.0);
                    }
                    debug!("Download candidate {:?} ({} bytes)", current.0, current.1);
                    last_seen = Some(current);
                }
                None => last_seen = None,
            }

            if !schedule.tick().await {
                return Err(FetchError::Timeout(format!("{} download", kind)));
            }
        }
    }
}

/// 対象日をポータルの日付プリセットに変換
pub fn date_preset(run_date: NaiveDate, target_date: NaiveDate) -> Result<&'static str, FetchError> {
    match (run_date - target_date).num_days() {
        0 => Ok("Hoje"),
        1 => Ok("Ontem"),
        _ => Err(FetchError::UnsupportedDate {
            target_date,
            run_date,
        }),
    }
}

/// ダウンロードディレクトリを空にする（無ければ作成）。削除件数を返す。
pub fn purge_artifacts(dir: &Path) -> std::io::Result<usize> {
    std::fs::create_dir_all(dir)?;
    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            std::fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

fn list_files(dir: &Path) -> std::io::Result<HashSet<PathBuf>> {
    let mut files = HashSet::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            files.insert(path);
        }
    }
    Ok(files)
}

fn is_in_progress(path: &Path) -> bool {
    let name = path.file_name().unwrap_or_default().to_string_lossy();
    IN_PROGRESS_SUFFIXES.iter().any(|s| name.ends_with(s))
}

/// ダウンロード完了済みの最新ファイル（パス, サイズ）
fn newest_download(
    dir: &Path,
    before: &HashSet<PathBuf>,
    extension: &str,
) -> std::io::Result<Option<(PathBuf, u64)>> {
    let mut newest: Option<(PathBuf, u64, SystemTime)> = None;

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        // 書き込み中のファイルがある間は完了とみなさない
        if is_in_progress(&path) {
            return Ok(None);
        }
        let matches_ext = path
            .extension()
            .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case(extension))
            .unwrap_or(false);
        if !matches_ext || before.contains(&path) {
            continue;
        }
        let meta = entry.metadata()?;
        if meta.len() == 0 {
            continue;
        }
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        if newest.as_ref().map(|(_, _, m)| modified >= *m).unwrap_or(true) {
            newest = Some((path, meta.len(), modified));
        }
    }

    Ok(newest.map(|(path, size, _)| (path, size)))
}

/// レポート種別ごとの固定ファイル名へリネーム
fn rename_artifact(downloaded: &Path, kind: ReportKind) -> Result<PathBuf, FetchError> {
    let target = downloaded.with_file_name(kind.artifact_file_name());
    if target == downloaded {
        return Ok(target);
    }
    if target.exists() {
        std::fs::remove_file(&target)?;
    }
    std::fs::rename(downloaded, &target)?;
    debug!("Renamed {:?} -> {:?}", downloaded, target);
    Ok(target)
}
