//! Search engine submission drivers and their HTTP API clients.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use siteindex_core::{BatchResult, Outcome, PerUrlResult, Service, SubmissionReport};
use siteindex_storage::LedgerStore;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "siteindex-engines";

pub const GOOGLE_INDEXING_SCOPE: &str = "https://www.googleapis.com/auth/indexing";
pub const DEFAULT_GOOGLE_INDEXING_ENDPOINT: &str = "https://indexing.googleapis.com/v3";
pub const DEFAULT_GOOGLE_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
pub const DEFAULT_INDEXNOW_ENDPOINT: &str = "https://api.indexnow.org/indexnow";
/// Protocol ceiling for one IndexNow call.
pub const INDEXNOW_MAX_URLS: usize = 10_000;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status}: {message}")]
    HttpStatus { status: u16, message: String },
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("invalid service account credentials: {0}")]
    Credentials(String),
}

/// Where drivers hand each outcome as soon as it is known.
#[async_trait]
pub trait OutcomeSink: Send + Sync {
    async fn record(&self, report: &SubmissionReport);
}

#[async_trait]
impl OutcomeSink for LedgerStore {
    async fn record(&self, report: &SubmissionReport) {
        self.record_report(report).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverSummary {
    pub service: Service,
    pub submitted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl DriverSummary {
    fn new(service: Service) -> Self {
        Self {
            service,
            submitted: 0,
            succeeded: 0,
            failed: 0,
        }
    }

    fn absorb(&mut self, report: &SubmissionReport) {
        let count = report.url_count();
        let succeeded = report.succeeded();
        self.submitted += count;
        self.succeeded += succeeded;
        self.failed += count - succeeded;
    }
}

#[async_trait]
pub trait SubmissionDriver: Send + Sync {
    fn service(&self) -> Service;

    /// Submit every URL once. Failures become reports; this never errors.
    async fn submit(&self, urls: &[String], sink: &dyn OutcomeSink) -> DriverSummary;
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PublishReceipt {
    pub notify_time: Option<String>,
}

#[async_trait]
pub trait GoogleIndexingApi: Send + Sync {
    async fn publish(&self, url: &str) -> Result<PublishReceipt, EngineError>;
}

#[async_trait]
pub trait IndexNowApi: Send + Sync {
    async fn submit(&self, urls: &[String]) -> Result<(), EngineError>;
}

/// One URL per call with a flat pause between calls.
pub struct GoogleDriver<A> {
    api: A,
    delay: Duration,
}

impl<A: GoogleIndexingApi> GoogleDriver<A> {
    pub fn new(api: A, delay: Duration) -> Self {
        Self { api, delay }
    }
}

#[async_trait]
impl<A: GoogleIndexingApi> SubmissionDriver for GoogleDriver<A> {
    fn service(&self) -> Service {
        Service::Google
    }

    async fn submit(&self, urls: &[String], sink: &dyn OutcomeSink) -> DriverSummary {
        let mut summary = DriverSummary::new(Service::Google);
        let total = urls.len();

        for (index, url) in urls.iter().enumerate() {
            info!(service = "google", position = index + 1, total, %url, "submitting url");
            let (outcome, notify_time) = match self.api.publish(url).await {
                Ok(receipt) => (Outcome::Success, receipt.notify_time),
                Err(err) => {
                    warn!(service = "google", %url, error = %err, "submission failed");
                    (Outcome::failure(err.to_string()), None)
                }
            };
            let report = SubmissionReport::PerUrl(PerUrlResult {
                service: Service::Google,
                url: url.clone(),
                outcome,
                notify_time,
            });
            summary.absorb(&report);
            sink.record(&report).await;

            if index + 1 < total && !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
        }

        info!(
            service = "google",
            succeeded = summary.succeeded,
            failed = summary.failed,
            "google submission finished"
        );
        summary
    }
}

/// Fixed-size batches; a batch succeeds or fails as a unit.
pub struct IndexNowDriver<A> {
    api: A,
    batch_size: usize,
    delay: Duration,
}

impl<A: IndexNowApi> IndexNowDriver<A> {
    pub fn new(api: A, batch_size: usize, delay: Duration) -> Self {
        Self {
            api,
            batch_size: batch_size.clamp(1, INDEXNOW_MAX_URLS),
            delay,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

#[async_trait]
impl<A: IndexNowApi> SubmissionDriver for IndexNowDriver<A> {
    fn service(&self) -> Service {
        Service::Bing
    }

    async fn submit(&self, urls: &[String], sink: &dyn OutcomeSink) -> DriverSummary {
        let mut summary = DriverSummary::new(Service::Bing);
        let batches = urls.chunks(self.batch_size).collect::<Vec<_>>();
        let total = batches.len();

        for (index, batch) in batches.into_iter().enumerate() {
            let batch_no = index + 1;
            info!(service = "bing", batch_no, total, urls = batch.len(), "submitting batch");
            let outcome = match self.api.submit(batch).await {
                Ok(()) => Outcome::Success,
                Err(err) => {
                    warn!(service = "bing", batch_no, error = %err, "batch submission failed");
                    Outcome::failure(err.to_string())
                }
            };
            let report = SubmissionReport::Batch(BatchResult {
                service: Service::Bing,
                batch_no,
                urls: batch.to_vec(),
                outcome,
            });
            summary.absorb(&report);
            sink.record(&report).await;

            if batch_no < total && !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
        }

        info!(
            service = "bing",
            succeeded = summary.succeeded,
            failed = summary.failed,
            "indexnow submission finished"
        );
        summary
    }
}

/// Fields read from a Google service-account JSON key.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub token_uri: Option<String>,
}

impl ServiceAccountKey {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading google credentials {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parsing google credentials {}", path.display()))
    }
}

#[derive(Debug, Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_token_lifetime")]
    expires_in: u64,
}

fn default_token_lifetime() -> u64 {
    3600
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    refresh_at: Instant,
}

#[derive(Debug, Serialize)]
struct PublishRequest<'a> {
    url: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
}

/// Google Indexing API v3 client authenticated with a service account.
pub struct GoogleIndexingClient {
    http: reqwest::Client,
    endpoint: String,
    token_uri: String,
    client_email: String,
    signing_key: EncodingKey,
    token: Mutex<Option<CachedToken>>,
}

impl GoogleIndexingClient {
    pub fn new(
        http: reqwest::Client,
        key: ServiceAccountKey,
        endpoint: impl Into<String>,
        token_uri_override: Option<String>,
    ) -> Result<Self, EngineError> {
        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|err| EngineError::Credentials(err.to_string()))?;
        let token_uri = token_uri_override
            .or(key.token_uri)
            .unwrap_or_else(|| DEFAULT_GOOGLE_TOKEN_URI.to_string());
        Ok(Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token_uri,
            client_email: key.client_email,
            signing_key,
            token: Mutex::new(None),
        })
    }

    async fn access_token(&self) -> Result<String, EngineError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let now = Utc::now().timestamp();
        let claims = JwtClaims {
            iss: &self.client_email,
            scope: GOOGLE_INDEXING_SCOPE,
            aud: &self.token_uri,
            iat: now,
            exp: now + 3600,
        };
        let assertion = encode(&Header::new(Algorithm::RS256), &claims, &self.signing_key)
            .map_err(|err| EngineError::Auth(err.to_string()))?;

        let resp = self
            .http
            .post(&self.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(EngineError::Auth(format!(
                "token endpoint returned {}: {}",
                status.as_u16(),
                api_error_message(&body)
            )));
        }
        let token: TokenResponse = resp.json().await?;
        let lifetime = Duration::from_secs(token.expires_in.saturating_sub(60));
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }

    /// Google's latest notification metadata for `url`.
    pub async fn url_metadata(&self, url: &str) -> Result<JsonValue, EngineError> {
        let token = self.access_token().await?;
        let resp = self
            .http
            .get(format!("{}/urlNotifications/metadata", self.endpoint))
            .query(&[("url", url)])
            .bearer_auth(token)
            .send()
            .await?;
        read_json_response(resp).await
    }
}

#[async_trait]
impl GoogleIndexingApi for GoogleIndexingClient {
    async fn publish(&self, url: &str) -> Result<PublishReceipt, EngineError> {
        let token = self.access_token().await?;
        let resp = self
            .http
            .post(format!("{}/urlNotifications:publish", self.endpoint))
            .bearer_auth(token)
            .json(&PublishRequest {
                url,
                kind: "URL_UPDATED",
            })
            .send()
            .await?;
        let body = read_json_response(resp).await?;
        Ok(PublishReceipt {
            notify_time: body
                .pointer("/urlNotificationMetadata/latestUpdate/notifyTime")
                .and_then(JsonValue::as_str)
                .map(str::to_string),
        })
    }
}

async fn read_json_response(resp: reqwest::Response) -> Result<JsonValue, EngineError> {
    let status = resp.status();
    let body = resp.text().await?;
    if !status.is_success() {
        return Err(EngineError::HttpStatus {
            status: status.as_u16(),
            message: api_error_message(&body),
        });
    }
    if body.trim().is_empty() {
        return Ok(JsonValue::Null);
    }
    Ok(serde_json::from_str(&body).unwrap_or(JsonValue::String(body)))
}

/// Pull `error.message` (or `error_description`) out of a Google-style error body.
fn api_error_message(body: &str) -> String {
    let parsed = serde_json::from_str::<JsonValue>(body).ok();
    let message = parsed.as_ref().and_then(|value| {
        value
            .pointer("/error/message")
            .or_else(|| value.get("error_description"))
            .and_then(JsonValue::as_str)
            .map(str::to_string)
    });
    message.unwrap_or_else(|| {
        let trimmed = body.trim();
        if trimmed.chars().count() > 200 {
            format!("{}...", trimmed.chars().take(200).collect::<String>())
        } else {
            trimmed.to_string()
        }
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexNowSettings {
    pub endpoint: String,
    pub host: String,
    pub key: String,
    pub key_location: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexNowPayload<'a> {
    pub host: &'a str,
    pub key: &'a str,
    pub key_location: &'a str,
    pub url_list: &'a [String],
}

#[derive(Debug, Clone)]
pub struct IndexNowClient {
    http: reqwest::Client,
    settings: IndexNowSettings,
}

impl IndexNowClient {
    pub fn new(http: reqwest::Client, settings: IndexNowSettings) -> Self {
        Self { http, settings }
    }

    pub fn payload<'a>(&'a self, urls: &'a [String]) -> IndexNowPayload<'a> {
        IndexNowPayload {
            host: &self.settings.host,
            key: &self.settings.key,
            key_location: &self.settings.key_location,
            url_list: &urls[..urls.len().min(INDEXNOW_MAX_URLS)],
        }
    }
}

#[async_trait]
impl IndexNowApi for IndexNowClient {
    async fn submit(&self, urls: &[String]) -> Result<(), EngineError> {
        if urls.len() > INDEXNOW_MAX_URLS {
            warn!(
                urls = urls.len(),
                limit = INDEXNOW_MAX_URLS,
                "indexnow batch truncated to protocol limit"
            );
        }
        let resp = self
            .http
            .post(&self.settings.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json; charset=utf-8")
            .json(&self.payload(urls))
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body = resp.text().await.unwrap_or_default();
        Err(EngineError::HttpStatus {
            status: status.as_u16(),
            message: api_error_message(&body),
        })
    }
}
