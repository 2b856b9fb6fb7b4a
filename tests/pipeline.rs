//! モックポータルとメモリウェアハウスを使った実行全体のテスト

mod common;

use std::time::Duration;

use common::{date, request, Harness, LoginScript, Script};
use report_etl_service::{
    AuthError, FetchError, LoadError, ParseError, ReportKind, ReportState, ReportStatus, Shutdown,
    StageError, Value,
};
use report_etl_service::traits::DeployedColumn;

#[tokio::test(start_paused = true)]
async fn test_all_reports_load_for_target_date() {
    let harness = Harness::new("all-ok");

    let summary = harness.orchestrator.run(request(), Shutdown::never()).await;

    assert_eq!(summary.target_date, date(2024, 3, 14));
    assert_eq!(summary.exit_code(), 0);
    assert_eq!(summary.succeeded(), 4);
    for outcome in &summary.outcomes {
        assert_eq!(outcome.status, ReportStatus::Succeeded);
        assert_eq!(outcome.attempt_count(), 1);
        assert_eq!(outcome.attempts[0].reached, ReportState::Succeeded);
        assert_eq!(outcome.rows_loaded(), 2);
    }

    // 1セッションで4種別を処理
    assert_eq!(harness.portal.launches(), 1);
    assert_eq!(harness.portal.closes(), 1);
    assert_eq!(harness.portal.presets(), vec!["Ontem"; 4]);

    let media = harness.warehouse.rows("relatorio_midia");
    assert_eq!(media.len(), 2);
    assert_eq!(media[0].get("impressions"), Some(&Value::Number(1200.0)));
    assert_eq!(media[1].get("registrations"), Some(&Value::Null));

    let ganhos = harness.warehouse.rows("relatorio_ganhos");
    assert_eq!(ganhos[0].get("amount"), Some(&Value::Number(1500.0)));
    assert_eq!(ganhos[1].get("amount"), Some(&Value::Number(320.75)));

    for table in harness.warehouse.table_names() {
        for row in harness.warehouse.rows(&table) {
            assert_eq!(row.report_date(), Some(date(2024, 3, 14)));
        }
    }
    assert!(harness.leftover_files().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_rerun_replaces_partition() {
    let harness = Harness::new("rerun");

    let first = harness.orchestrator.run(request(), Shutdown::never()).await;
    let second = harness.orchestrator.run(request(), Shutdown::never()).await;

    assert_eq!(first.exit_code(), 0);
    assert_eq!(second.exit_code(), 0);
    for table in ["relatorio_midia", "relatorio_registros", "relatorio_ganhos", "relatorio_atividades"] {
        assert_eq!(harness.warehouse.rows(table).len(), 2, "{}", table);
    }
    let load = second
        .outcome(ReportKind::Atividades)
        .and_then(|o| o.load.clone())
        .unwrap();
    assert_eq!(load.rows_deleted, Some(2));
    assert_eq!(load.rows_written, 2);
}

#[tokio::test(start_paused = true)]
async fn test_no_data_clears_partition() {
    let harness = Harness::new("no-data");
    harness.orchestrator.run(request(), Shutdown::never()).await;
    assert_eq!(harness.warehouse.rows("relatorio_registros").len(), 2);

    harness.portal.script(ReportKind::Registros, vec![Script::NoData]);
    let summary = harness.orchestrator.run(request(), Shutdown::never()).await;

    let registros = summary.outcome(ReportKind::Registros).unwrap();
    assert_eq!(registros.status, ReportStatus::Succeeded);
    assert_eq!(registros.rows_loaded(), 0);
    assert!(harness.warehouse.rows("relatorio_registros").is_empty());
    assert_eq!(summary.exit_code(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_missing_column_fails_only_that_report() {
    let harness = Harness::new("missing-column");
    harness.portal.script(
        ReportKind::Ganhos,
        vec![Script::Csv("Tipo de Comissão,Moeda\nCPA,BRL\n".to_string())],
    );

    let summary = harness.orchestrator.run(request(), Shutdown::never()).await;

    let ganhos = summary.outcome(ReportKind::Ganhos).unwrap();
    assert_eq!(
        ganhos.status,
        ReportStatus::FailedFatal(StageError::Parse(ParseError::MissingColumn("amount".into())))
    );
    assert_eq!(ganhos.attempt_count(), 1);
    assert_eq!(ganhos.attempts[0].reached, ReportState::Normalizing);
    assert!(harness.warehouse.rows("relatorio_ganhos").is_empty());

    assert_eq!(summary.succeeded(), 3);
    assert_eq!(summary.exit_code(), 1);
    assert!(harness.leftover_files().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_generation_timeout_is_retried() {
    let harness = Harness::new("retry");
    harness.portal.script(ReportKind::Atividades, vec![Script::Hang]);

    let summary = harness.orchestrator.run(request(), Shutdown::never()).await;

    let atividades = summary.outcome(ReportKind::Atividades).unwrap();
    assert_eq!(atividades.status, ReportStatus::Succeeded);
    assert_eq!(atividades.attempt_count(), 2);
    assert!(matches!(
        atividades.attempts[0].error,
        Some(StageError::Fetch(FetchError::Timeout(_)))
    ));
    assert_eq!(atividades.attempts[0].reached, ReportState::Fetching);
    assert_eq!(summary.exit_code(), 0);
    // タイムアウトではセッションを取り直さない
    assert_eq!(harness.portal.launches(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion() {
    let harness = Harness::new("exhausted");
    harness
        .portal
        .script(ReportKind::Media, vec![Script::Hang, Script::Hang, Script::Hang]);

    let summary = harness.orchestrator.run(request(), Shutdown::never()).await;

    let media = summary.outcome(ReportKind::Media).unwrap();
    assert!(matches!(
        media.status,
        ReportStatus::FailedRetryable(StageError::Fetch(FetchError::Timeout(_)))
    ));
    assert_eq!(media.attempt_count(), 3);
    assert_eq!(summary.succeeded(), 3);
    assert_eq!(summary.exit_code(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_expired_session_is_reacquired() {
    let harness = Harness::new("expired");
    harness.portal.script(ReportKind::Ganhos, vec![Script::ExpireSession]);

    let summary = harness.orchestrator.run(request(), Shutdown::never()).await;

    let ganhos = summary.outcome(ReportKind::Ganhos).unwrap();
    assert_eq!(ganhos.status, ReportStatus::Succeeded);
    assert_eq!(
        ganhos.attempts[0].error,
        Some(StageError::Fetch(FetchError::SessionExpired))
    );
    assert_eq!(ganhos.attempt_count(), 2);
    assert_eq!(harness.portal.launches(), 2);
    assert_eq!(harness.portal.closes(), 2);
    assert_eq!(summary.exit_code(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_credentials_fail_every_report() {
    let harness = Harness::with_password("bad-login", "wrong");

    let summary = harness.orchestrator.run(request(), Shutdown::never()).await;

    for outcome in &summary.outcomes {
        assert_eq!(
            outcome.status,
            ReportStatus::FailedFatal(StageError::Auth(AuthError::InvalidCredentials))
        );
        assert_eq!(outcome.attempt_count(), 1);
    }
    // 拒否された認証情報で再ログインしない
    assert_eq!(harness.portal.launches(), 1);
    assert_eq!(harness.portal.closes(), 1);
    assert!(harness.warehouse.table_names().is_empty());
    assert_eq!(summary.exit_code(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_hidden_validation_message_does_not_reject_login() {
    let harness = Harness::new("hidden-feedback");
    harness.portal.show_hidden_feedback();
    harness.portal.script_login(vec![LoginScript::AcceptAfter(2)]);

    let summary = harness.orchestrator.run(request(), Shutdown::never()).await;

    assert_eq!(summary.exit_code(), 0);
    for outcome in &summary.outcomes {
        assert_eq!(outcome.status, ReportStatus::Succeeded);
        assert_eq!(outcome.attempt_count(), 1);
    }
    assert_eq!(harness.portal.launches(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_login_timeout_reacquires_session() {
    let harness = Harness::new("login-timeout");
    harness
        .portal
        .script_login(vec![LoginScript::Stall, LoginScript::Accept]);

    let summary = harness.orchestrator.run(request(), Shutdown::never()).await;

    let media = summary.outcome(ReportKind::Media).unwrap();
    assert_eq!(media.status, ReportStatus::Succeeded);
    assert_eq!(media.attempt_count(), 2);
    assert_eq!(
        media.attempts[0].error,
        Some(StageError::Auth(AuthError::Timeout))
    );
    // 2回目のセッションを残りの種別でも使い回す
    for kind in [ReportKind::Registros, ReportKind::Ganhos, ReportKind::Atividades] {
        assert_eq!(summary.outcome(kind).unwrap().attempt_count(), 1);
    }
    assert_eq!(harness.portal.launches(), 2);
    assert_eq!(harness.portal.closes(), 2);
    assert_eq!(summary.exit_code(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_schema_mismatch_is_not_retried() {
    let harness = Harness::new("schema");
    harness.warehouse.deploy_table(
        "relatorio_ganhos",
        vec![
            DeployedColumn::new("report_date", "DATE"),
            DeployedColumn::new("commission_type", "STRING"),
            DeployedColumn::new("amount", "STRING"),
            DeployedColumn::new("currency", "STRING"),
        ],
    );

    let summary = harness.orchestrator.run(request(), Shutdown::never()).await;

    let ganhos = summary.outcome(ReportKind::Ganhos).unwrap();
    assert!(matches!(
        ganhos.status,
        ReportStatus::FailedFatal(StageError::Load(LoadError::SchemaMismatch { .. }))
    ));
    assert_eq!(ganhos.attempt_count(), 1);
    assert_eq!(ganhos.attempts[0].reached, ReportState::Loading);
    assert_eq!(summary.succeeded(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_transient_load_failure_is_retried() {
    let harness = Harness::new("transient");
    harness.warehouse.fail_next(
        "relatorio_registros",
        LoadError::Transient("backend error".to_string()),
    );

    let summary = harness.orchestrator.run(request(), Shutdown::never()).await;

    let registros = summary.outcome(ReportKind::Registros).unwrap();
    assert_eq!(registros.status, ReportStatus::Succeeded);
    assert_eq!(registros.attempt_count(), 2);
    assert_eq!(harness.warehouse.rows("relatorio_registros").len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_during_download_cleans_up() {
    let harness = Harness::new("cancel");
    harness.portal.script(ReportKind::Media, vec![Script::Stall]);
    let (trigger, shutdown) = Shutdown::channel();

    let (summary, _) = tokio::join!(harness.orchestrator.run(request(), shutdown), async {
        tokio::time::sleep(Duration::from_secs(10)).await;
        trigger.trigger();
    });

    assert!(summary.cancelled);
    assert_eq!(summary.exit_code(), 130);
    assert_eq!(
        summary.outcome(ReportKind::Media).unwrap().status,
        ReportStatus::Cancelled {
            during: ReportState::Fetching
        }
    );
    for kind in [ReportKind::Registros, ReportKind::Ganhos, ReportKind::Atividades] {
        assert_eq!(
            summary.outcome(kind).unwrap().status,
            ReportStatus::Cancelled {
                during: ReportState::Pending
            }
        );
    }
    assert_eq!(harness.portal.launches(), 1);
    assert_eq!(harness.portal.closes(), 1);
    assert!(harness.leftover_files().is_empty());
    assert!(harness.warehouse.table_names().is_empty());
}
