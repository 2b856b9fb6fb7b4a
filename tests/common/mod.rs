//! 統合テスト用のモックポータル

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;

use report_etl_service::{
    BrowserDriver, BrowserLauncher, Credentials, DriverError, EtlConfig, Locator, MemoryWarehouse,
    Orchestrator, ReportKind, RetryPolicy, RunRequest,
};

pub const USERNAME: &str = "affiliate";
pub const PASSWORD: &str = "s3cret";

pub const MEDIA_CSV: &str = "ID da Mídia,Mídia,Impressões,Cliques,Registros,FTD\n\
M-1,Banner topo,\"1.200\",35,4,1\n\
M-2,Vídeo,980,12,,0\n\
Total,,2180,47,4,1\n";

pub const REGISTROS_CSV: &str = "ID do Jogador,Data de Registro,País,ID da Mídia\n\
P-100,14/03/2024,BR,M-1\n\
P-101,14/03/2024,BR,M-2\n";

pub const GANHOS_CSV: &str = "Tipo de Comissão,Valor,Moeda\n\
CPA,\"R$ 1.500,00\",BRL\n\
RevShare,\"R$ 320,75\",BRL\n";

pub const ATIVIDADES_CSV: &str = "ID do Jogador,Depósitos,Saques,NGR\n\
P-100,\"250,00\",\"100,00\",\"150,00\"\n\
P-101,50,0,50\n";

/// 1回の取得試行でポータルがどう振る舞うか
#[derive(Debug, Clone)]
pub enum Script {
    /// エクスポートでCSVを保存
    Csv(String),
    /// 「Nenhum dado」を表示
    NoData,
    /// 生成が終わらない
    Hang,
    /// ダウンロードが完了しない
    Stall,
    /// レポートを開こうとするとログイン画面に戻る
    ExpireSession,
}

/// ログインボタン押下後にポータルがどう応答するか
#[derive(Debug, Clone, Copy)]
pub enum LoginScript {
    /// すぐにダッシュボードを表示
    Accept,
    /// ログイン後の目印が `n` 回目の確認の後に現れる
    AcceptAfter(usize),
    /// ダッシュボードもエラーも表示されない
    Stall,
}

pub fn default_csv(kind: ReportKind) -> &'static str {
    match kind {
        ReportKind::Media => MEDIA_CSV,
        ReportKind::Registros => REGISTROS_CSV,
        ReportKind::Ganhos => GANHOS_CSV,
        ReportKind::Atividades => ATIVIDADES_CSV,
    }
}

#[derive(Default)]
struct PortalState {
    scripts: HashMap<ReportKind, VecDeque<Script>>,
    fields: HashMap<String, String>,
    logged_in: bool,
    rejected: bool,
    /// ログイン成功までに残っている目印の確認回数
    pending_login: Option<usize>,
    login_scripts: VecDeque<LoginScript>,
    /// 非表示のバリデーションメッセージを常にDOMへ置く
    hidden_feedback: bool,
    current: Option<(ReportKind, Script)>,
    generated: bool,
    presets: Vec<String>,
    exports: usize,
    launches: usize,
    closes: usize,
}

/// ブラウザ越しに見えるポータルの状態
#[derive(Default)]
pub struct Portal {
    state: Mutex<PortalState>,
}

impl Portal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, PortalState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 次回以降の試行の振る舞いを積む（無ければ既定のCSV）
    pub fn script(&self, kind: ReportKind, scripts: Vec<Script>) {
        self.lock().scripts.entry(kind).or_default().extend(scripts);
    }

    /// 正しい認証情報での次回以降のログイン応答を積む（無ければ即時成功）
    pub fn script_login(&self, scripts: Vec<LoginScript>) {
        self.lock().login_scripts.extend(scripts);
    }

    /// ログインフォームに非表示の `.invalid-feedback` を置く
    pub fn show_hidden_feedback(&self) {
        self.lock().hidden_feedback = true;
    }

    pub fn launches(&self) -> usize {
        self.lock().launches
    }

    pub fn closes(&self) -> usize {
        self.lock().closes
    }

    pub fn presets(&self) -> Vec<String> {
        self.lock().presets.clone()
    }

    fn next_script(state: &mut PortalState, kind: ReportKind) -> Script {
        state
            .scripts
            .get_mut(&kind)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Script::Csv(default_csv(kind).to_string()))
    }

    fn reset_login(state: &mut PortalState) {
        state.logged_in = false;
        state.rejected = false;
        state.pending_login = None;
    }

    fn kind_for_label(label: &str) -> Option<ReportKind> {
        ReportKind::ALL.into_iter().find(|k| k.portal_label() == label)
    }
}

pub struct MockDriver {
    portal: Arc<Portal>,
    download_dir: PathBuf,
}

#[async_trait]
impl BrowserDriver for MockDriver {
    async fn navigate(&self, _url: &str) -> Result<(), DriverError> {
        Portal::reset_login(&mut self.portal.lock());
        Ok(())
    }

    async fn fill_field(&self, locator: &Locator, value: &str) -> Result<(), DriverError> {
        self.portal
            .lock()
            .fields
            .insert(locator.to_string(), value.to_string());
        Ok(())
    }

    async fn click(&self, locator: &Locator) -> Result<(), DriverError> {
        let mut state = self.portal.lock();
        match locator {
            Locator::Css(s) if s == ".submit-btn" => {
                let user = state.fields.get("css `input[name='user']`").cloned();
                let pass = state.fields.get("css `input[name='password']`").cloned();
                Portal::reset_login(&mut state);
                if user.as_deref() == Some(USERNAME) && pass.as_deref() == Some(PASSWORD) {
                    match state.login_scripts.pop_front().unwrap_or(LoginScript::Accept) {
                        LoginScript::Accept => state.logged_in = true,
                        LoginScript::AcceptAfter(n) => state.pending_login = Some(n),
                        LoginScript::Stall => {}
                    }
                } else {
                    state.rejected = true;
                }
            }
            Locator::LinkText(label) => {
                if let Some(kind) = Portal::kind_for_label(label) {
                    let script = Portal::next_script(&mut state, kind);
                    state.current = Some((kind, script));
                    state.generated = false;
                }
            }
            Locator::ButtonText(b) if b == "Gerar relatório" => {
                state.generated = true;
            }
            Locator::ButtonText(b) if b == "Exportar relatório" => {
                state.exports += 1;
                let n = state.exports;
                let written = match &state.current {
                    Some((_, Script::Csv(content))) => std::fs::write(
                        self.download_dir.join(format!("export-{}.csv", n)),
                        content,
                    ),
                    Some((_, Script::Stall)) => std::fs::write(
                        self.download_dir.join(format!("export-{}.csv.crdownload", n)),
                        "partial",
                    ),
                    _ => return Err(DriverError::ElementNotFound(locator.to_string())),
                };
                written.map_err(|e| DriverError::JavaScript(e.to_string()))?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn select_option(&self, _locator: &Locator, visible_text: &str) -> Result<(), DriverError> {
        self.portal.lock().presets.push(visible_text.to_string());
        Ok(())
    }

    async fn element_exists(&self, locator: &Locator) -> Result<bool, DriverError> {
        let mut state = self.portal.lock();
        let on_report = state.logged_in && state.current.is_some();
        let exists = match locator {
            Locator::Css(s) if s == "input[name='user']" => !state.logged_in,
            Locator::Css(s) if s == "#mobileToggle" => {
                let pending = state.pending_login;
                match pending {
                    Some(0) => {
                        state.pending_login = None;
                        state.logged_in = true;
                    }
                    Some(n) => state.pending_login = Some(n - 1),
                    None => {}
                }
                state.logged_in
            }
            Locator::Css(s) if s.contains(".invalid-feedback") => {
                state.rejected || (state.hidden_feedback && !state.logged_in)
            }
            Locator::Css(s) if s == "select" => on_report,
            Locator::LinkText(label) if label == "Relatórios" => state.logged_in,
            Locator::LinkText(label) => match Portal::kind_for_label(label) {
                Some(kind) if state.logged_in => {
                    let expires = matches!(
                        state.scripts.get(&kind).and_then(|q| q.front()),
                        Some(Script::ExpireSession)
                    );
                    if expires {
                        if let Some(queue) = state.scripts.get_mut(&kind) {
                            queue.pop_front();
                        }
                        Portal::reset_login(&mut state);
                        state.current = None;
                    }
                    !expires
                }
                _ => false,
            },
            Locator::ButtonText(b) if b == "Gerar relatório" => on_report,
            Locator::ButtonText(b) if b == "Exportar relatório" => {
                state.generated
                    && matches!(state.current, Some((_, Script::Csv(_))) | Some((_, Script::Stall)))
            }
            Locator::PageText(t) if t == "inválid" => state.rejected,
            Locator::PageText(t) if t.starts_with("Nenhum dado") => {
                state.generated && matches!(state.current, Some((_, Script::NoData)))
            }
            _ => false,
        };
        Ok(exists)
    }

    async fn element_visible(&self, locator: &Locator) -> Result<bool, DriverError> {
        match locator {
            Locator::Css(s) if s.contains(".invalid-feedback") => Ok(self.portal.lock().rejected),
            _ => self.element_exists(locator).await,
        }
    }

    async fn screenshot(&self) -> Result<Vec<u8>, DriverError> {
        Ok(Vec::new())
    }

    fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    async fn close(&mut self) -> Result<(), DriverError> {
        self.portal.lock().closes += 1;
        Ok(())
    }
}

pub struct MockLauncher {
    portal: Arc<Portal>,
}

#[async_trait]
impl BrowserLauncher for MockLauncher {
    async fn launch(&self, download_dir: &Path) -> Result<Box<dyn BrowserDriver>, DriverError> {
        std::fs::create_dir_all(download_dir).map_err(|e| DriverError::Launch(e.to_string()))?;
        {
            let mut state = self.portal.lock();
            state.launches += 1;
            Portal::reset_login(&mut state);
            state.current = None;
            state.generated = false;
        }
        Ok(Box::new(MockDriver {
            portal: Arc::clone(&self.portal),
            download_dir: download_dir.to_path_buf(),
        }))
    }
}

pub fn scratch_dir(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "report-etl-it-{}-{}-{}",
        name,
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
    ))
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// 2024-03-15 に実行して 2024-03-14 を取得する
pub fn request() -> RunRequest {
    RunRequest::for_run_date(date(2024, 3, 15))
}

pub struct Harness {
    pub portal: Arc<Portal>,
    pub warehouse: Arc<MemoryWarehouse>,
    pub orchestrator: Orchestrator,
    pub dir: PathBuf,
}

impl Harness {
    pub fn new(name: &str) -> Self {
        Self::with_password(name, PASSWORD)
    }

    pub fn with_password(name: &str, password: &str) -> Self {
        let dir = scratch_dir(name);
        let config = EtlConfig::new(Credentials::new(USERNAME, password))
            .with_download_path(dir.clone())
            .with_retry(RetryPolicy::new(3, Duration::from_secs(5), Duration::from_secs(60)));

        let portal = Portal::new();
        let warehouse = Arc::new(MemoryWarehouse::new());
        let orchestrator = Orchestrator::new(
            &config,
            Arc::new(MockLauncher {
                portal: Arc::clone(&portal),
            }),
            warehouse.clone(),
        );

        Self {
            portal,
            warehouse,
            orchestrator,
            dir,
        }
    }

    /// ダウンロードディレクトリに残っているファイル
    pub fn leftover_files(&self) -> Vec<PathBuf> {
        std::fs::read_dir(&self.dir)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .map(|e| e.path())
                    .filter(|p| p.is_file())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}
