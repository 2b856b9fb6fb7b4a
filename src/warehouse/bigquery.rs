//! BigQuery REST API による [`Warehouse`] 実装

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, LoadError};
use crate::report::{ColumnSpec, Row, REPORT_DATE_COLUMN};
use crate::retry::PollPolicy;
use crate::traits::{DeployedColumn, PartitionWrite, Warehouse};

const API_BASE: &str = "https://bigquery.googleapis.com/bigquery/v2";
const UPLOAD_BASE: &str = "https://bigquery.googleapis.com/upload/bigquery/v2";
const BIGQUERY_SCOPE: &str = "https://www.googleapis.com/auth/bigquery";
const JWT_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
/// 期限切れ直前のトークンは使わない
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(60);
const JOB_BUDGET_MARGIN: Duration = Duration::from_secs(5);

/// 一時的エラーとして扱うBigQueryのエラー理由
const TRANSIENT_REASONS: &[&str] = &[
    "backendError",
    "internalError",
    "rateLimitExceeded",
    "quotaExceeded",
    "jobRateLimitExceeded",
    "jobBackendError",
    "jobInternalError",
];

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

/// サービスアカウントJSONの必要部分
#[derive(Debug, Clone, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

#[derive(Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

pub struct BigQueryWarehouse {
    client: reqwest::Client,
    project_id: String,
    dataset_id: String,
    client_email: String,
    token_uri: String,
    signing_key: EncodingKey,
    token: Mutex<Option<CachedToken>>,
    job_poll: PollPolicy,
    /// 1回の `replace_partition` に使える時間
    job_budget: Duration,
    /// 完了を確認できていないジョブ（テーブルごと）
    pending_jobs: Mutex<HashMap<String, JobHandle>>,
}

/// 投入済みジョブの参照
#[derive(Debug, Clone, PartialEq, Eq)]
struct JobHandle {
    job_id: String,
    location: Option<String>,
}

impl JobHandle {
    fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            location: None,
        }
    }

    fn url(&self, project_id: &str, action: &str) -> String {
        let mut url = format!("{}/projects/{}/jobs/{}{}", API_BASE, project_id, self.job_id, action);
        if let Some(location) = &self.location {
            url.push_str("?location=");
            url.push_str(location);
        }
        url
    }
}

impl BigQueryWarehouse {
    /// サービスアカウントファイルを読み込んでクライアントを作成
    pub fn from_service_account_file(
        project_id: impl Into<String>,
        dataset_id: impl Into<String>,
        key_path: &Path,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let account_error = |reason: String| ConfigError::ServiceAccount {
            path: key_path.display().to_string(),
            reason,
        };

        let raw = std::fs::read_to_string(key_path).map_err(|e| account_error(e.to_string()))?;
        let key: ServiceAccountKey =
            serde_json::from_str(&raw).map_err(|e| account_error(e.to_string()))?;
        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| account_error(e.to_string()))?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| account_error(e.to_string()))?;

        Ok(Self {
            client,
            project_id: project_id.into(),
            dataset_id: dataset_id.into(),
            client_email: key.client_email,
            token_uri: key.token_uri,
            signing_key,
            token: Mutex::new(None),
            job_poll: PollPolicy::new(Duration::from_secs(1), Duration::from_secs(5), timeout),
            job_budget: job_budget(timeout),
            pending_jobs: Mutex::new(HashMap::new()),
        })
    }

    /// OAuth2 アクセストークン（キャッシュ付き）
    async fn access_token(&self) -> Result<String, LoadError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.value.clone());
            }
        }

        let now = Utc::now().timestamp();
        let claims = Claims {
            iss: &self.client_email,
            scope: BIGQUERY_SCOPE,
            aud: &self.token_uri,
            iat: now,
            exp: now + 3600,
        };
        let assertion = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.signing_key)
            .map_err(|e| LoadError::Rejected(format!("cannot sign token request: {}", e)))?;

        let response = self
            .client
            .post(self.token_uri.as_str())
            .form(&[("grant_type", JWT_GRANT_TYPE), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|e| LoadError::Transient(format!("token request: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status("oauth2", status, &body));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| LoadError::Transient(format!("token response: {}", e)))?;

        debug!("Obtained BigQuery access token (expires in {}s)", token.expires_in);
        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_EXPIRY_MARGIN);
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, LoadError> {
        let token = self.access_token().await?;
        request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| LoadError::Transient(e.to_string()))
    }

    /// 成功レスポンスならJSON、失敗なら分類済みエラー
    async fn into_json(table: &str, response: Response) -> Result<Json, LoadError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(table, status, &body));
        }
        response
            .json::<Json>()
            .await
            .map_err(|e| LoadError::Transient(format!("invalid response body: {}", e)))
    }

    fn dataset_url(&self) -> String {
        format!(
            "{}/projects/{}/datasets/{}",
            API_BASE, self.project_id, self.dataset_id
        )
    }

    fn table_reference(&self, table: &str) -> Json {
        json!({
            "projectId": self.project_id,
            "datasetId": self.dataset_id,
            "tableId": table,
        })
    }

    /// パーティションの既存行を削除（DML）
    async fn delete_partition(
        &self,
        table: &str,
        date: NaiveDate,
        deadline: Instant,
    ) -> Result<Option<u64>, LoadError> {
        let job_id = new_job_id("delete", table, date);
        let query = format!(
            "DELETE FROM `{}.{}.{}` WHERE {} = @report_date",
            self.project_id, self.dataset_id, table, REPORT_DATE_COLUMN
        );
        let body = json!({
            "jobReference": { "projectId": self.project_id, "jobId": job_id },
            "configuration": {
                "query": {
                    "query": query,
                    "useLegacySql": false,
                    "parameterMode": "NAMED",
                    "queryParameters": [{
                        "name": "report_date",
                        "parameterType": { "type": "DATE" },
                        "parameterValue": { "value": date.format("%Y-%m-%d").to_string() },
                    }],
                }
            }
        });

        let url = format!("{}/projects/{}/jobs", API_BASE, self.project_id);
        let request = self.client.post(url).json(&body);
        let job = self.run_job(table, &job_id, request, deadline).await?;
        Ok(parse_count(&job["statistics"]["query"]["numDmlAffectedRows"]))
    }

    /// NDJSON のロードジョブでパーティションを丸ごと置き換える
    async fn truncate_partition(
        &self,
        table: &str,
        date: NaiveDate,
        columns: &[ColumnSpec],
        rows: &[Row],
        deadline: Instant,
    ) -> Result<u64, LoadError> {
        let job_id = new_job_id("load", table, date);
        let metadata = load_job_metadata(&self.project_id, &self.dataset_id, &job_id, table, date, columns);

        let mut data = String::new();
        for row in rows {
            data.push_str(&row.to_json().to_string());
            data.push('\n');
        }

        let boundary = format!("report-etl-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default());
        let body = multipart_related(&boundary, &metadata, &data);

        let url = format!(
            "{}/projects/{}/jobs?uploadType=multipart",
            UPLOAD_BASE, self.project_id
        );
        let request = self
            .client
            .post(url)
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", boundary),
            )
            .body(body);
        let job = self.run_job(table, &job_id, request, deadline).await?;

        Ok(parse_count(&job["statistics"]["load"]["outputRows"]).unwrap_or(rows.len() as u64))
    }

    /// ジョブを投入して完了まで待つ。完了を確認できなかったジョブは次回の書き込み前に取り消す。
    async fn run_job(
        &self,
        table: &str,
        job_id: &str,
        request: RequestBuilder,
        deadline: Instant,
    ) -> Result<Json, LoadError> {
        let mut handle = JobHandle::new(job_id);
        // 応答が失われてもジョブIDから追跡できるよう、投入前に記録する
        self.pending_jobs
            .lock()
            .await
            .insert(table.to_string(), handle.clone());

        let request = request.timeout(remaining(deadline, "job submission")?);
        let job = Self::into_json(table, self.send(request).await?).await?;
        handle.location = job["jobReference"]["location"].as_str().map(str::to_string);
        self.pending_jobs
            .lock()
            .await
            .insert(table.to_string(), handle.clone());

        let job = if is_done(&job) {
            job
        } else {
            self.poll_until_done(table, &handle, deadline).await?
        };
        self.pending_jobs.lock().await.remove(table);
        check_job_status(table, &job)?;
        Ok(job)
    }

    /// 前回の試行で放棄したジョブを取り消し、終了を確認する
    async fn settle_pending_job(&self, table: &str, deadline: Instant) -> Result<(), LoadError> {
        let Some(handle) = self.pending_jobs.lock().await.get(table).cloned() else {
            return Ok(());
        };
        warn!("Job {} on {} was not confirmed, cancelling before rewrite", handle.job_id, table);

        let request = self
            .client
            .get(handle.url(&self.project_id, ""))
            .timeout(remaining(deadline, "job lookup")?);
        let response = self.send(request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            // 投入リクエスト自体が届いていない
            self.pending_jobs.lock().await.remove(table);
            return Ok(());
        }
        let job = Self::into_json(table, response).await?;

        if !is_done(&job) {
            let request = self
                .client
                .post(handle.url(&self.project_id, "/cancel"))
                .timeout(remaining(deadline, "job cancel")?);
            Self::into_json(table, self.send(request).await?).await?;
            self.poll_until_done(table, &handle, deadline).await?;
        }

        self.pending_jobs.lock().await.remove(table);
        info!("Abandoned job {} on {} has finished", handle.job_id, table);
        Ok(())
    }

    /// `DONE` になるまでポーリング（エラー結果は判定しない）
    async fn poll_until_done(
        &self,
        table: &str,
        handle: &JobHandle,
        deadline: Instant,
    ) -> Result<Json, LoadError> {
        let url = handle.url(&self.project_id, "");
        let mut schedule = self
            .job_poll
            .with_timeout(remaining(deadline, "job wait")?)
            .start();
        loop {
            let request = self
                .client
                .get(url.as_str())
                .timeout(remaining(deadline, "job wait")?);
            let job = Self::into_json(table, self.send(request).await?).await?;
            if is_done(&job) {
                return Ok(job);
            }
            debug!("BigQuery job {} still running", handle.job_id);
            if !schedule.tick().await {
                return Err(LoadError::Transient(format!(
                    "job {} did not finish in time",
                    handle.job_id
                )));
            }
        }
    }
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    async fn table_schema(&self, table: &str) -> Result<Option<Vec<DeployedColumn>>, LoadError> {
        let url = format!("{}/tables/{}", self.dataset_url(), table);
        let response = self.send(self.client.get(url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = Self::into_json(table, response).await?;

        let columns = body["schema"]["fields"]
            .as_array()
            .map(|fields| {
                fields
                    .iter()
                    .filter_map(|f| {
                        Some(DeployedColumn::new(f["name"].as_str()?, f["type"].as_str()?))
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(Some(columns))
    }

    async fn create_table(&self, table: &str, columns: &[ColumnSpec]) -> Result<(), LoadError> {
        let body = json!({
            "tableReference": self.table_reference(table),
            "schema": { "fields": schema_fields(columns) },
            "timePartitioning": { "type": "DAY", "field": REPORT_DATE_COLUMN },
        });
        let url = format!("{}/tables", self.dataset_url());
        let response = self.send(self.client.post(url).json(&body)).await?;
        if response.status() == StatusCode::CONFLICT {
            debug!("Table {} was created concurrently", table);
            return Ok(());
        }
        Self::into_json(table, response).await?;
        info!("Created table {}.{}", self.dataset_id, table);
        Ok(())
    }

    async fn replace_partition(
        &self,
        table: &str,
        date: NaiveDate,
        columns: &[ColumnSpec],
        rows: &[Row],
    ) -> Result<PartitionWrite, LoadError> {
        let deadline = Instant::now() + self.job_budget;
        self.settle_pending_job(table, deadline).await?;

        if rows.is_empty() {
            let rows_deleted = self.delete_partition(table, date, deadline).await?;
            debug!("Deleted {:?} rows from {} for {}", rows_deleted, table, date);
            return Ok(PartitionWrite {
                rows_deleted,
                rows_written: 0,
            });
        }

        let rows_written = self
            .truncate_partition(table, date, columns, rows, deadline)
            .await?;
        Ok(PartitionWrite {
            rows_deleted: None,
            rows_written,
        })
    }
}

/// ローダー側のタイムアウトより先にこちらで打ち切る
fn job_budget(timeout: Duration) -> Duration {
    if timeout > JOB_BUDGET_MARGIN * 2 {
        timeout - JOB_BUDGET_MARGIN
    } else {
        timeout / 2
    }
}

fn remaining(deadline: Instant, what: &str) -> Result<Duration, LoadError> {
    let left = deadline.saturating_duration_since(Instant::now());
    if left.is_zero() {
        return Err(LoadError::Transient(format!("{} ran out of time", what)));
    }
    Ok(left)
}

fn is_done(job: &Json) -> bool {
    job["status"]["state"].as_str() == Some("DONE")
}

/// 試行ごとに一意なジョブID（英数字と `_` のみ）
fn new_job_id(action: &str, table: &str, date: NaiveDate) -> String {
    let table: String = table
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!(
        "report_etl_{}_{}_{}_{}",
        action,
        table,
        date.format("%Y%m%d"),
        Utc::now().timestamp_nanos_opt().unwrap_or_default()
    )
}

/// 日付パーティションのデコレータ付きテーブル名
fn partition_decorator(table: &str, date: NaiveDate) -> String {
    format!("{}${}", table, date.format("%Y%m%d"))
}

/// パーティションを WRITE_TRUNCATE で置き換えるロードジョブ定義
fn load_job_metadata(
    project_id: &str,
    dataset_id: &str,
    job_id: &str,
    table: &str,
    date: NaiveDate,
    columns: &[ColumnSpec],
) -> Json {
    json!({
        "jobReference": { "projectId": project_id, "jobId": job_id },
        "configuration": {
            "load": {
                "destinationTable": {
                    "projectId": project_id,
                    "datasetId": dataset_id,
                    "tableId": partition_decorator(table, date),
                },
                "sourceFormat": "NEWLINE_DELIMITED_JSON",
                "writeDisposition": "WRITE_TRUNCATE",
                "createDisposition": "CREATE_NEVER",
                "schema": { "fields": schema_fields(columns) },
            }
        }
    })
}

fn schema_fields(columns: &[ColumnSpec]) -> Json {
    Json::Array(
        columns
            .iter()
            .map(|c| {
                json!({
                    "name": c.name,
                    "type": c.ty.warehouse_type(),
                    "mode": "NULLABLE",
                })
            })
            .collect(),
    )
}

fn multipart_related(boundary: &str, metadata: &Json, data: &str) -> String {
    format!(
        "--{b}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{meta}\r\n\
         --{b}\r\nContent-Type: application/octet-stream\r\n\r\n{data}\r\n--{b}--\r\n",
        b = boundary,
        meta = metadata,
        data = data
    )
}

/// BigQuery は件数を文字列で返す
fn parse_count(value: &Json) -> Option<u64> {
    value
        .as_str()
        .and_then(|s| s.parse().ok())
        .or_else(|| value.as_u64())
}

fn check_job_status(table: &str, job: &Json) -> Result<(), LoadError> {
    let error = &job["status"]["errorResult"];
    if error.is_null() {
        return Ok(());
    }
    let reason = error["reason"].as_str().unwrap_or("unknown");
    let message = error["message"].as_str().unwrap_or("");
    Err(classify_reason(table, reason, message))
}

fn classify_reason(table: &str, reason: &str, message: &str) -> LoadError {
    if TRANSIENT_REASONS.contains(&reason) {
        return LoadError::Transient(format!("{}: {}", reason, message));
    }
    if message.to_ascii_lowercase().contains("schema") {
        return LoadError::SchemaMismatch {
            table: table.to_string(),
            detail: message.to_string(),
        };
    }
    LoadError::Rejected(format!("{}: {}", reason, message))
}

fn classify_status(table: &str, status: StatusCode, body: &str) -> LoadError {
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return LoadError::Transient(format!("HTTP {}: {}", status, body));
    }
    let parsed: Json = serde_json::from_str(body).unwrap_or(Json::Null);
    let reason = parsed["error"]["errors"][0]["reason"]
        .as_str()
        .unwrap_or("http");
    let message = parsed["error"]["message"].as_str().unwrap_or(body);
    classify_reason(table, reason, message)
}
