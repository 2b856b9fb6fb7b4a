//! 日次レポートETL
//!
//! 実行方法:
//! ```
//! cargo run --bin report-etl
//! ```
//!
//! 終了コード: 0 = 全レポート成功, 1 = 失敗あり, 2 = 設定エラー, 130 = キャンセル

use std::io;
use std::process::ExitCode;

use tower::Service;
use tracing::{error, info, warn};

use report_etl_service::shutdown::signal_received;
use report_etl_service::{EtlConfig, ReportEtlService, RunRequest, Shutdown, ShutdownTrigger};

const CONFIG_ERROR_EXIT: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    // .env読み込み
    if let Ok(path) = dotenvy::dotenv() {
        eprintln!("Loading .env from: {:?}", path);
    }

    // ログ設定
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match EtlConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {}", e);
            return ExitCode::from(CONFIG_ERROR_EXIT);
        }
    };
    info!(
        "Loaded config: download_dir={:?}, headless={}, dry_run={}",
        config.download_path, config.headless, config.dry_run
    );

    let (trigger, shutdown) = Shutdown::channel();
    let mut service = match ReportEtlService::from_config(&config, shutdown) {
        Ok(service) => service,
        Err(e) => {
            error!("Configuration error: {}", e);
            return ExitCode::from(CONFIG_ERROR_EXIT);
        }
    };
    tokio::spawn(forward_signals(trigger));

    match service.call(RunRequest::yesterday()).await {
        Ok(summary) => ExitCode::from(summary.exit_code()),
        Err(never) => match never {},
    }
}

/// SIGINT / SIGTERM を受けたら実行をキャンセル
async fn forward_signals(trigger: ShutdownTrigger) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                let terminate = async move {
                    sigterm
                        .recv()
                        .await
                        .ok_or_else(|| io::Error::other("SIGTERM stream closed"))
                };
                tokio::select! {
                    _ = signal_received("SIGINT", tokio::signal::ctrl_c()) => {}
                    _ = signal_received("SIGTERM", terminate) => {}
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                signal_received("SIGINT", tokio::signal::ctrl_c()).await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        signal_received("SIGINT", tokio::signal::ctrl_c()).await;
    }

    warn!("Shutdown signal received, cancelling run");
    trigger.trigger();
}
