use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tower::Service;
use tracing::info;

use crate::browser::ChromeLauncher;
use crate::config::EtlConfig;
use crate::error::ConfigError;
use crate::orchestrator::{Orchestrator, RunRequest, RunSummary};
use crate::shutdown::Shutdown;
use crate::traits::{BrowserLauncher, Warehouse};
use crate::warehouse::{BigQueryWarehouse, MemoryWarehouse};

/// tower::Serviceを実装したETLサービス
///
/// 失敗はレポート種別ごとに [`RunSummary`] に記録されるため、`call` 自体は失敗しない。
#[derive(Clone)]
pub struct ReportEtlService {
    orchestrator: Arc<Orchestrator>,
    shutdown: Shutdown,
}

impl ReportEtlService {
    pub fn new(orchestrator: Orchestrator, shutdown: Shutdown) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            shutdown,
        }
    }

    /// 設定から本番用の依存（Chromium と BigQuery）を組み立てる
    pub fn from_config(config: &EtlConfig, shutdown: Shutdown) -> Result<Self, ConfigError> {
        let launcher: Arc<dyn BrowserLauncher> = Arc::new(
            ChromeLauncher::new(config.chrome_path.clone(), config.headless)
                .with_debug(config.debug_screenshots),
        );

        let warehouse: Arc<dyn Warehouse> = if config.dry_run {
            info!("DRY_RUN enabled, loading into in-memory warehouse");
            Arc::new(MemoryWarehouse::new())
        } else {
            let credentials = &config.credentials;
            Arc::new(BigQueryWarehouse::from_service_account_file(
                credentials.warehouse_project_id.clone(),
                credentials.warehouse_dataset_id.clone(),
                &credentials.warehouse_service_account,
                config.warehouse_timeout,
            )?)
        };

        Ok(Self::new(Orchestrator::new(config, launcher, warehouse), shutdown))
    }
}

impl Service<RunRequest> for ReportEtlService {
    type Response = RunSummary;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: RunRequest) -> Self::Future {
        info!(
            "ETLリクエスト受信: run_date={}, target_date={}",
            req.run_date, req.target_date
        );

        let orchestrator = Arc::clone(&self.orchestrator);
        let shutdown = self.shutdown.clone();
        Box::pin(async move {
            let summary = orchestrator.run(req, shutdown).await;
            info!(
                "ETL完了: {}/{} succeeded, exit_code={}",
                summary.succeeded(),
                summary.outcomes.len(),
                summary.exit_code()
            );
            Ok(summary)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;

    fn dry_run_config() -> EtlConfig {
        EtlConfig::new(Credentials::new("user", "pass")).with_dry_run(true)
    }

    #[test]
    fn test_from_config_dry_run_skips_service_account() {
        let service = ReportEtlService::from_config(&dry_run_config(), Shutdown::never());
        assert!(service.is_ok());
    }

    #[test]
    fn test_from_config_reports_missing_service_account() {
        let mut config = dry_run_config().with_dry_run(false);
        config.credentials.warehouse_service_account = "/nonexistent/sa.json".into();

        match ReportEtlService::from_config(&config, Shutdown::never()) {
            Err(ConfigError::ServiceAccount { .. }) => {}
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("expected service account error"),
        }
    }
}
