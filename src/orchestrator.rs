//! 実行オーケストレーター
//!
//! レポート種別ごとに `Pending → Fetching → Normalizing → Loading → Succeeded`
//! の状態遷移を進める。1種別の失敗は他の種別の処理を止めない。

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDate, Utc};
use serde_json::json;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::{Credentials, EtlConfig};
use crate::error::{AuthError, FetchError, StageError};
use crate::report::{
    normalize, purge_artifacts, FetchTimeouts, NormalizedRecordSet, ReportFetcher, ReportKind,
};
use crate::retry::RetryPolicy;
use crate::session::{Session, SessionManager};
use crate::shutdown::Shutdown;
use crate::traits::{BrowserLauncher, Warehouse};
use crate::warehouse::{LoadResult, WarehouseLoader};

/// ブラウザ終了待ちの上限
const SESSION_RELEASE_TIMEOUT: Duration = Duration::from_secs(30);

/// 1種別の処理状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportState {
    Pending,
    Fetching,
    Normalizing,
    Loading,
    Succeeded,
    FailedRetryable,
    FailedFatal,
}

impl fmt::Display for ReportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// 1種別の最終結果
#[derive(Debug, Clone, PartialEq)]
pub enum ReportStatus {
    Succeeded,
    /// リトライ上限まで一時的エラーが続いた
    FailedRetryable(StageError),
    FailedFatal(StageError),
    /// 実行がキャンセルされた
    Cancelled { during: ReportState },
}

impl ReportStatus {
    pub fn label(&self) -> String {
        match self {
            ReportStatus::Succeeded => "Succeeded".to_string(),
            ReportStatus::FailedRetryable(e) => format!("FailedRetryable({})", e.kind_name()),
            ReportStatus::FailedFatal(e) => format!("FailedFatal({})", e.kind_name()),
            ReportStatus::Cancelled { during } => format!("Cancelled(during {})", during),
        }
    }
}

/// 試行ごとの記録
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptRecord {
    pub attempt: u32,
    /// 試行が終わった時点の状態
    pub reached: ReportState,
    pub error: Option<StageError>,
}

#[derive(Debug, Clone)]
pub struct ReportOutcome {
    pub kind: ReportKind,
    pub status: ReportStatus,
    pub attempts: Vec<AttemptRecord>,
    pub load: Option<LoadResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ReportOutcome {
    pub fn is_success(&self) -> bool {
        self.status == ReportStatus::Succeeded
    }

    pub fn attempt_count(&self) -> usize {
        self.attempts.len()
    }

    pub fn rows_loaded(&self) -> u64 {
        self.load.as_ref().map(|l| l.rows_written).unwrap_or(0)
    }
}

/// 実行全体のサマリー
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_date: NaiveDate,
    pub target_date: NaiveDate,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: Vec<ReportOutcome>,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn outcome(&self, kind: ReportKind) -> Option<&ReportOutcome> {
        self.outcomes.iter().find(|o| o.kind == kind)
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_success()).count()
    }

    pub fn all_succeeded(&self) -> bool {
        !self.cancelled
            && self.outcomes.len() == ReportKind::ALL.len()
            && self.outcomes.iter().all(ReportOutcome::is_success)
    }

    /// プロセス終了コード（0: 全成功, 1: 失敗あり, 130: キャンセル）
    pub fn exit_code(&self) -> u8 {
        if self.cancelled {
            130
        } else if self.all_succeeded() {
            0
        } else {
            1
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        let reports: Vec<_> = self
            .outcomes
            .iter()
            .map(|o| {
                json!({
                    "kind": o.kind.to_string(),
                    "status": o.status.label(),
                    "attempts": o.attempt_count(),
                    "rows_loaded": o.rows_loaded(),
                    "table": o.load.as_ref().map(|l| l.table.clone()),
                    "started_at": o.started_at.to_rfc3339(),
                    "finished_at": o.finished_at.to_rfc3339(),
                })
            })
            .collect();
        json!({
            "run_date": self.run_date.to_string(),
            "target_date": self.target_date.to_string(),
            "started_at": self.started_at.to_rfc3339(),
            "finished_at": self.finished_at.to_rfc3339(),
            "succeeded": self.succeeded(),
            "cancelled": self.cancelled,
            "exit_code": self.exit_code(),
            "reports": reports,
        })
    }

    /// レポート種別ごとの結果をログ出力
    pub fn log(&self) {
        for outcome in &self.outcomes {
            if outcome.is_success() {
                info!(
                    "{}: Succeeded ({} rows, {} attempt(s))",
                    outcome.kind,
                    outcome.rows_loaded(),
                    outcome.attempt_count()
                );
            } else {
                error!(
                    "{}: {} after {} attempt(s)",
                    outcome.kind,
                    outcome.status.label(),
                    outcome.attempt_count()
                );
            }
        }
        info!(
            "Run for {} finished: {}/{} succeeded, exit code {}",
            self.target_date,
            self.succeeded(),
            ReportKind::ALL.len(),
            self.exit_code()
        );
        info!(target: "run_summary", "{}", self.to_json());
    }
}

/// 1回分の実行要求
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunRequest {
    pub run_date: NaiveDate,
    pub target_date: NaiveDate,
}

impl RunRequest {
    /// 実行日の前日を対象にする
    pub fn for_run_date(run_date: NaiveDate) -> Self {
        Self {
            run_date,
            target_date: run_date.pred_opt().unwrap_or(run_date),
        }
    }

    /// ローカル時刻で「昨日」を対象にする
    pub fn yesterday() -> Self {
        Self::for_run_date(Local::now().date_naive())
    }
}

/// 実行中に持ち回る状態
#[derive(Default)]
struct RunContext {
    session: Option<Session>,
    /// 認証情報の拒否は以降の種別でも再試行しない
    auth_failure: Option<AuthError>,
}

/// 1種別の状態遷移を記録
struct Tracker {
    kind: ReportKind,
    state: ReportState,
    attempts: Vec<AttemptRecord>,
    started_at: DateTime<Utc>,
}

impl Tracker {
    fn new(kind: ReportKind) -> Self {
        Self {
            kind,
            state: ReportState::Pending,
            attempts: Vec::new(),
            started_at: Utc::now(),
        }
    }

    fn transition(&mut self, next: ReportState) {
        info!("{}: {} -> {}", self.kind, self.state, next);
        self.state = next;
    }

    fn record(&mut self, attempt: u32, error: Option<StageError>) {
        self.attempts.push(AttemptRecord {
            attempt,
            reached: self.state,
            error,
        });
    }

    fn finish(self, status: ReportStatus, load: Option<LoadResult>) -> ReportOutcome {
        ReportOutcome {
            kind: self.kind,
            status,
            attempts: self.attempts,
            load,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}

pub struct Orchestrator {
    sessions: SessionManager,
    credentials: Credentials,
    loader: WarehouseLoader,
    download_dir: PathBuf,
    fetch_timeouts: FetchTimeouts,
    retry: RetryPolicy,
}

impl Orchestrator {
    pub fn new(
        config: &EtlConfig,
        launcher: Arc<dyn BrowserLauncher>,
        warehouse: Arc<dyn Warehouse>,
    ) -> Self {
        Self {
            sessions: SessionManager::new(launcher, config),
            credentials: config.credentials.clone(),
            loader: WarehouseLoader::new(warehouse, config.table_prefix.clone(), config.warehouse_timeout),
            download_dir: config.download_path.clone(),
            fetch_timeouts: config.fetch,
            retry: config.retry,
        }
    }

    /// 4種別を順に処理してサマリーを返す
    pub async fn run(&self, request: RunRequest, mut shutdown: Shutdown) -> RunSummary {
        let started_at = Utc::now();
        info!(
            "Starting report ETL for {} (run date {})",
            request.target_date, request.run_date
        );

        if let Err(e) = purge_artifacts(&self.download_dir) {
            warn!("Failed to prepare download directory {:?}: {}", self.download_dir, e);
        }

        let fetcher = ReportFetcher::new(&self.download_dir, request.run_date, self.fetch_timeouts);
        let mut ctx = RunContext::default();
        let mut outcomes = Vec::with_capacity(ReportKind::ALL.len());
        let mut cancelled = shutdown.is_cancelled();

        for kind in ReportKind::ALL {
            let mut tracker = Tracker::new(kind);
            if cancelled {
                outcomes.push(tracker.finish(ReportStatus::Cancelled { during: ReportState::Pending }, None));
                continue;
            }

            let span = info_span!("report", kind = %kind);
            let processed = tokio::select! {
                biased;
                _ = shutdown.cancelled() => None,
                result = self
                    .process_kind(&fetcher, &mut ctx, &mut tracker, request.target_date)
                    .instrument(span) => Some(result),
            };

            match processed {
                Some((status, load)) => outcomes.push(tracker.finish(status, load)),
                None => {
                    warn!("Run cancelled while {} was {}", kind, tracker.state);
                    cancelled = true;
                    let during = tracker.state;
                    outcomes.push(tracker.finish(ReportStatus::Cancelled { during }, None));
                }
            }
        }

        self.release_session(&mut ctx).await;
        match purge_artifacts(&self.download_dir) {
            Ok(0) => {}
            Ok(n) => info!("Removed {} leftover files from {:?}", n, self.download_dir),
            Err(e) => warn!("Failed to clean download directory {:?}: {}", self.download_dir, e),
        }

        let summary = RunSummary {
            run_date: request.run_date,
            target_date: request.target_date,
            started_at,
            finished_at: Utc::now(),
            outcomes,
            cancelled,
        };
        summary.log();
        summary
    }

    /// 1種別をリトライ込みで処理
    async fn process_kind(
        &self,
        fetcher: &ReportFetcher,
        ctx: &mut RunContext,
        tracker: &mut Tracker,
        target_date: NaiveDate,
    ) -> (ReportStatus, Option<LoadResult>) {
        let kind = tracker.kind;
        let mut attempt = 0;

        loop {
            attempt += 1;
            info!("{}: attempt {}/{}", kind, attempt, self.retry.max_attempts);

            match self.attempt(fetcher, ctx, tracker, target_date).await {
                Ok(load) => {
                    tracker.transition(ReportState::Succeeded);
                    tracker.record(attempt, None);
                    return (ReportStatus::Succeeded, Some(load));
                }
                Err(e) => {
                    tracker.record(attempt, Some(e.clone()));

                    if e.requires_new_session() {
                        self.release_session(ctx).await;
                    }

                    if !e.is_retryable() {
                        error!("{}: fatal error on attempt {}: {}", kind, attempt, e);
                        tracker.transition(ReportState::FailedFatal);
                        return (ReportStatus::FailedFatal(e), None);
                    }

                    tracker.transition(ReportState::FailedRetryable);
                    if !self.retry.allows_another(attempt) {
                        error!("{}: giving up after {} attempts: {}", kind, attempt, e);
                        return (ReportStatus::FailedRetryable(e), None);
                    }

                    let delay = self.retry.delay_after(attempt);
                    warn!(
                        "{}: attempt {} failed, retrying in {:?}: {}",
                        kind, attempt, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Fetching → Normalizing → Loading を1回実行
    async fn attempt(
        &self,
        fetcher: &ReportFetcher,
        ctx: &mut RunContext,
        tracker: &mut Tracker,
        target_date: NaiveDate,
    ) -> Result<LoadResult, StageError> {
        let kind = tracker.kind;
        tracker.transition(ReportState::Fetching);
        let session = self.ensure_session(ctx).await?;

        let record_set = match fetcher.fetch(session, kind, target_date).await {
            Ok(artifact) => {
                tracker.transition(ReportState::Normalizing);
                normalize(artifact, kind, target_date)?
            }
            Err(FetchError::NoDataForDate) => {
                tracker.transition(ReportState::Normalizing);
                NormalizedRecordSet::empty(kind, target_date)
            }
            Err(e) => return Err(e.into()),
        };

        tracker.transition(ReportState::Loading);
        Ok(self.loader.load(&record_set).await?)
    }

    /// セッションが無ければログインする
    async fn ensure_session<'a>(&self, ctx: &'a mut RunContext) -> Result<&'a Session, StageError> {
        if let Some(e) = &ctx.auth_failure {
            return Err(e.clone().into());
        }

        let session = match ctx.session.take() {
            Some(session) => session,
            None => match self.sessions.acquire(&self.credentials).await {
                Ok(session) => session,
                Err(e) => {
                    if !e.is_retryable() {
                        ctx.auth_failure = Some(e.clone());
                    }
                    return Err(e.into());
                }
            },
        };
        Ok(&*ctx.session.insert(session))
    }

    async fn release_session(&self, ctx: &mut RunContext) {
        let Some(session) = ctx.session.take() else {
            return;
        };
        match tokio::time::timeout(SESSION_RELEASE_TIMEOUT, session.release()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Failed to close browser: {}", e),
            Err(_) => error!("Browser did not close within {:?}", SESSION_RELEASE_TIMEOUT),
        }
    }
}
