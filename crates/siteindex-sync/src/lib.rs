//! Index run orchestration: configuration, driver wiring and run sequencing.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use siteindex_catalog::{CatalogSource, PgCatalog, SiteLayout, SnapshotCatalog, UniverseGenerator};
use siteindex_core::{
    IndexedUrlRecord, LedgerStats, RetryPolicy, Service, ServiceSelector, SubmissionStatus,
};
use siteindex_engines::{
    GoogleDriver, GoogleIndexingClient, IndexNowClient, IndexNowDriver, IndexNowSettings,
    ServiceAccountKey, SubmissionDriver, DEFAULT_GOOGLE_INDEXING_ENDPOINT,
    DEFAULT_INDEXNOW_ENDPOINT, INDEXNOW_MAX_URLS,
};
use siteindex_storage::{HttpClientConfig, LedgerStore, DEFAULT_LEDGER_FILE};
use tracing::{info, info_span, Instrument};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "siteindex-sync";

pub const DEFAULT_BASE_URL: &str = "https://newkenyan.com";
pub const DEFAULT_GOOGLE_CREDENTIALS: &str = "google-service-account.json";

#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub base_url: String,
    pub workspace_root: PathBuf,
    pub ledger_path: PathBuf,
    pub google_credentials_path: PathBuf,
    pub google_indexing_endpoint: String,
    pub google_token_uri: Option<String>,
    pub indexnow_key: Option<String>,
    pub indexnow_endpoint: String,
    pub indexnow_key_location: Option<String>,
    pub database_url: Option<String>,
    pub catalog_snapshot: Option<PathBuf>,
    pub http_timeout_secs: u64,
    pub user_agent: Option<String>,
    pub google_delay: Duration,
    pub indexnow_batch_size: usize,
    pub indexnow_delay: Duration,
    pub retry: RetryPolicy,
    pub lock_stale_after: Duration,
}

impl IndexerConfig {
    /// Process environment, after `.env.local` and `.env` (neither overrides a set variable).
    pub fn from_env() -> Self {
        let _ = dotenvy::from_filename(".env.local");
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let number = |key: &str, default: u64| {
            var(key)
                .and_then(|value| value.parse::<u64>().ok())
                .unwrap_or(default)
        };

        let retry_tuned = [
            "SITEINDEX_RETRY_MAX_ATTEMPTS",
            "SITEINDEX_RETRY_BASE_SECS",
            "SITEINDEX_RETRY_MAX_SECS",
        ]
        .iter()
        .any(|key| var(key).is_some());
        let retry = if retry_tuned {
            RetryPolicy::bounded(
                u32::try_from(number("SITEINDEX_RETRY_MAX_ATTEMPTS", 0)).unwrap_or(u32::MAX),
                Duration::from_secs(number("SITEINDEX_RETRY_BASE_SECS", 3600)),
                Duration::from_secs(number("SITEINDEX_RETRY_MAX_SECS", 604_800)),
            )
        } else {
            RetryPolicy::unbounded()
        };
        let batch_size = number("SITEINDEX_INDEXNOW_BATCH_SIZE", 100);

        Self {
            base_url: var("SITEINDEX_BASE_URL")
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            workspace_root: var("SITEINDEX_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            ledger_path: var("SITEINDEX_LEDGER_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_LEDGER_FILE)),
            google_credentials_path: var("GOOGLE_APPLICATION_CREDENTIALS")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_GOOGLE_CREDENTIALS)),
            google_indexing_endpoint: var("GOOGLE_INDEXING_ENDPOINT")
                .unwrap_or_else(|| DEFAULT_GOOGLE_INDEXING_ENDPOINT.to_string()),
            google_token_uri: var("GOOGLE_TOKEN_URI"),
            indexnow_key: var("INDEXNOW_KEY"),
            indexnow_endpoint: var("INDEXNOW_ENDPOINT")
                .unwrap_or_else(|| DEFAULT_INDEXNOW_ENDPOINT.to_string()),
            indexnow_key_location: var("INDEXNOW_KEY_LOCATION"),
            database_url: var("DATABASE_URL"),
            catalog_snapshot: var("SITEINDEX_CATALOG_SNAPSHOT").map(PathBuf::from),
            http_timeout_secs: number("SITEINDEX_HTTP_TIMEOUT_SECS", 20),
            user_agent: var("SITEINDEX_USER_AGENT"),
            google_delay: Duration::from_millis(number("SITEINDEX_GOOGLE_DELAY_MS", 1000)),
            indexnow_batch_size: usize::try_from(batch_size)
                .unwrap_or(INDEXNOW_MAX_URLS)
                .clamp(1, INDEXNOW_MAX_URLS),
            indexnow_delay: Duration::from_millis(number("SITEINDEX_INDEXNOW_DELAY_MS", 1000)),
            retry,
            lock_stale_after: Duration::from_secs(number("SITEINDEX_LOCK_STALE_SECS", 21_600)),
        }
    }

    pub fn site_host(&self) -> Result<String> {
        let parsed = Url::parse(&self.base_url)
            .with_context(|| format!("parsing base url {}", self.base_url))?;
        parsed
            .host_str()
            .map(str::to_string)
            .with_context(|| format!("base url {} has no host", self.base_url))
    }

    pub fn indexnow_settings(&self) -> Result<IndexNowSettings> {
        let key = self
            .indexnow_key
            .clone()
            .context("INDEXNOW_KEY must be set to submit to bing")?;
        let key_location = self
            .indexnow_key_location
            .clone()
            .unwrap_or_else(|| format!("{}/{}.txt", self.base_url, key));
        Ok(IndexNowSettings {
            endpoint: self.indexnow_endpoint.clone(),
            host: self.site_host()?,
            key,
            key_location,
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: self.user_agent.clone(),
        }
    }
}

pub fn google_client(config: &IndexerConfig) -> Result<GoogleIndexingClient> {
    let path = &config.google_credentials_path;
    let key = ServiceAccountKey::from_file(path)?;
    let http = config.http_client_config().build_client()?;
    GoogleIndexingClient::new(
        http,
        key,
        config.google_indexing_endpoint.clone(),
        config.google_token_uri.clone(),
    )
    .with_context(|| format!("loading google credentials {}", path.display()))
}

/// Drivers for every selected service. Missing credentials or keys fail here, before any
/// submission starts.
pub fn build_drivers(
    config: &IndexerConfig,
    selector: ServiceSelector,
) -> Result<Vec<Box<dyn SubmissionDriver>>> {
    let mut drivers: Vec<Box<dyn SubmissionDriver>> = Vec::new();
    for service in selector.services() {
        match service {
            Service::Google => {
                let client = google_client(config)?;
                drivers.push(Box::new(GoogleDriver::new(client, config.google_delay)));
            }
            Service::Bing => {
                let http = config.http_client_config().build_client()?;
                let client = IndexNowClient::new(http, config.indexnow_settings()?);
                drivers.push(Box::new(IndexNowDriver::new(
                    client,
                    config.indexnow_batch_size,
                    config.indexnow_delay,
                )));
            }
        }
    }
    Ok(drivers)
}

/// The snapshot file wins over the database when both are configured.
pub fn build_catalog(config: &IndexerConfig) -> Result<Option<Box<dyn CatalogSource>>> {
    if let Some(path) = &config.catalog_snapshot {
        return Ok(Some(Box::new(SnapshotCatalog::new(path.clone()))));
    }
    match &config.database_url {
        Some(url) => Ok(Some(Box::new(PgCatalog::connect_lazy(url)?))),
        None => Ok(None),
    }
}

pub fn build_universe(config: &IndexerConfig) -> Result<UniverseGenerator> {
    let layout = SiteLayout::load_or_default(&config.workspace_root)?;
    Ok(UniverseGenerator::new(
        config.base_url.clone(),
        config.workspace_root.clone(),
        layout,
        build_catalog(config)?,
    ))
}

pub async fn open_ledger(config: &IndexerConfig) -> Result<LedgerStore> {
    LedgerStore::open(
        config.ledger_path.clone(),
        config.retry,
        config.lock_stale_after,
    )
    .await
    .with_context(|| format!("opening ledger {}", config.ledger_path.display()))
}

pub async fn open_ledger_read_only(config: &IndexerConfig) -> LedgerStore {
    LedgerStore::open_read_only(config.ledger_path.clone(), config.retry).await
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub selector: ServiceSelector,
    pub force: bool,
    pub reindex_after_days: Option<u32>,
    pub dry_run: bool,
    pub show_stats: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServiceOutcome {
    NothingToDo,
    DryRun,
    Submitted { succeeded: usize, failed: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceRun {
    pub service: Service,
    pub eligible: usize,
    pub outcome: ServiceOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub forced: bool,
    pub universe_size: usize,
    pub skipped_sections: Vec<&'static str>,
    pub services: Vec<ServiceRun>,
    pub before_stats: Option<LedgerStats>,
    pub after_stats: Option<LedgerStats>,
    pub ledger_writes: usize,
}

impl RunSummary {
    pub fn service(&self, service: Service) -> Option<&ServiceRun> {
        self.services.iter().find(|run| run.service == service)
    }
}

pub struct IndexingPipeline {
    ledger: LedgerStore,
    universe: UniverseGenerator,
    drivers: Vec<Box<dyn SubmissionDriver>>,
}

impl IndexingPipeline {
    pub fn new(
        ledger: LedgerStore,
        universe: UniverseGenerator,
        drivers: Vec<Box<dyn SubmissionDriver>>,
    ) -> Self {
        Self {
            ledger,
            universe,
            drivers,
        }
    }

    pub fn ledger(&self) -> &LedgerStore {
        &self.ledger
    }

    fn driver_for(&self, service: Service) -> Option<&dyn SubmissionDriver> {
        self.drivers
            .iter()
            .find(|driver| driver.service() == service)
            .map(|driver| driver.as_ref())
    }

    pub async fn run_once(&self, options: &RunOptions) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "index_run",
            %run_id,
            services = %options.selector,
            dry_run = options.dry_run,
            force = options.force
        );
        self.run_inner(run_id, options).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, options: &RunOptions) -> Result<RunSummary> {
        let started_at = Utc::now();
        let writes_before = self.ledger.write_count();

        let before_stats = if options.show_stats {
            Some(self.ledger.stats().await)
        } else {
            None
        };

        let universe = self.universe.generate().await;
        info!(
            urls = universe.urls.len(),
            duplicates = universe.duplicates_removed,
            skipped = ?universe.skipped_sections,
            "url universe ready"
        );

        let mut services = Vec::new();
        for service in options.selector.services() {
            let candidates = if options.force {
                universe.urls.clone()
            } else {
                self.ledger
                    .urls_to_index(
                        &universe.urls,
                        service,
                        options.reindex_after_days,
                        Utc::now(),
                    )
                    .await
            };
            info!(%service, eligible = candidates.len(), "selected urls");

            let outcome = if candidates.is_empty() {
                ServiceOutcome::NothingToDo
            } else if options.dry_run {
                info!(%service, "dry run: would index {} URLs", candidates.len());
                ServiceOutcome::DryRun
            } else {
                let driver = self
                    .driver_for(service)
                    .with_context(|| format!("no submission driver configured for {service}"))?;
                let summary = driver.submit(&candidates, &self.ledger).await;
                ServiceOutcome::Submitted {
                    succeeded: summary.succeeded,
                    failed: summary.failed,
                }
            };
            services.push(ServiceRun {
                service,
                eligible: candidates.len(),
                outcome,
            });
        }

        let submitted_any = services
            .iter()
            .any(|run| matches!(run.outcome, ServiceOutcome::Submitted { .. }));
        let after_stats = if submitted_any {
            Some(self.ledger.stats().await)
        } else {
            None
        };

        Ok(RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            dry_run: options.dry_run,
            forced: options.force,
            universe_size: universe.urls.len(),
            skipped_sections: universe.skipped_sections,
            services,
            before_stats,
            after_stats,
            ledger_writes: self.ledger.write_count() - writes_before,
        })
    }
}

/// Full run against the live configuration. A dry run opens the ledger read-only and builds
/// no drivers, so it needs no credentials.
pub async fn run_once_with_config(
    config: &IndexerConfig,
    options: &RunOptions,
) -> Result<RunSummary> {
    let universe = build_universe(config)?;
    let pipeline = if options.dry_run {
        IndexingPipeline::new(open_ledger_read_only(config).await, universe, Vec::new())
    } else {
        let drivers = build_drivers(config, options.selector)?;
        IndexingPipeline::new(open_ledger(config).await?, universe, drivers)
    };
    pipeline.run_once(options).await
}

/// Ledger statistics as they stand now, read without taking the writer lock.
pub async fn current_stats(config: &IndexerConfig) -> LedgerStats {
    open_ledger_read_only(config).await.stats().await
}

fn status_label(status: SubmissionStatus) -> &'static str {
    match status {
        SubmissionStatus::Pending => "pending",
        SubmissionStatus::Indexed => "indexed",
        SubmissionStatus::Failed => "failed",
        SubmissionStatus::Abandoned => "abandoned",
    }
}

pub fn render_stats(title: &str, stats: &LedgerStats) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{title}");
    let _ = writeln!(out, "  total urls: {}", stats.total);
    for service in Service::ALL {
        let entry = stats.for_service(service);
        let _ = writeln!(
            out,
            "  {service}: indexed {}, failed {}, pending {}, abandoned {}",
            entry.indexed, entry.failed, entry.pending, entry.abandoned
        );
    }
    out
}

pub fn render_summary(summary: &RunSummary) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "run {}: {} candidate urls{}",
        summary.run_id,
        summary.universe_size,
        if summary.forced { " (forced)" } else { "" }
    );
    if !summary.skipped_sections.is_empty() {
        let _ = writeln!(
            out,
            "  skipped sources: {}",
            summary.skipped_sections.join(", ")
        );
    }
    for run in &summary.services {
        let _ = match run.outcome {
            ServiceOutcome::NothingToDo => writeln!(out, "[{}] nothing to index", run.service),
            ServiceOutcome::DryRun => {
                writeln!(out, "[{}] would index {} URLs", run.service, run.eligible)
            }
            ServiceOutcome::Submitted { succeeded, failed } => writeln!(
                out,
                "[{}] submitted {} URLs: {} succeeded, {} failed",
                run.service, run.eligible, succeeded, failed
            ),
        };
    }
    if summary.dry_run {
        let _ = writeln!(out, "dry run: ledger not modified");
    }
    out
}

pub fn render_recent(records: &[IndexedUrlRecord]) -> String {
    if records.is_empty() {
        return "no urls recorded yet\n".to_string();
    }
    let mut out = String::new();
    for record in records {
        let services = Service::ALL
            .iter()
            .map(|service| format!("{service}={}", status_label(record.status(*service))))
            .collect::<Vec<_>>()
            .join(" ");
        let _ = writeln!(
            out,
            "{}  {}  {}  (submitted {}x)",
            record.last_indexed.format("%Y-%m-%d %H:%M:%S"),
            record.url,
            services,
            record.index_count
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use siteindex_core::{Outcome, ServiceStats};
    use std::collections::HashMap;

    fn config_with(vars: &[(&str, &str)]) -> IndexerConfig {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        IndexerConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_match_live_site() {
        let config = config_with(&[]);
        assert_eq!(config.base_url, "https://newkenyan.com");
        assert_eq!(config.ledger_path, PathBuf::from("indexing-tracker.json"));
        assert_eq!(config.indexnow_batch_size, 100);
        assert_eq!(config.google_delay, Duration::from_millis(1000));
        assert_eq!(config.retry, RetryPolicy::unbounded());
        assert!(config.database_url.is_none());
        assert_eq!(config.site_host().unwrap(), "newkenyan.com");
    }

    #[test]
    fn overrides_and_clamps() {
        let config = config_with(&[
            ("SITEINDEX_BASE_URL", "https://staging.example.org/"),
            ("SITEINDEX_INDEXNOW_BATCH_SIZE", "50000"),
            ("SITEINDEX_RETRY_MAX_ATTEMPTS", "0"),
            ("SITEINDEX_GOOGLE_DELAY_MS", "not-a-number"),
            ("DATABASE_URL", "  "),
        ]);
        assert_eq!(config.base_url, "https://staging.example.org");
        assert_eq!(config.indexnow_batch_size, INDEXNOW_MAX_URLS);
        assert_eq!(config.retry.max_attempts, None);
        assert_eq!(config.google_delay, Duration::from_millis(1000));
        assert!(config.database_url.is_none());
    }

    #[test]
    fn default_retry_keeps_a_recent_failure_eligible() {
        let policy = config_with(&[]).retry;
        let now = Utc::now();
        let url = "https://x/a".to_string();
        let mut doc = siteindex_core::LedgerDocument::empty(now);
        for _ in 0..10 {
            doc.record_attempt(
                &url,
                Service::Google,
                &Outcome::failure("quota exceeded"),
                now - chrono::Duration::minutes(5),
                &policy,
            );
        }

        let eligible = doc.urls_to_index(&[url.clone()], Service::Google, None, &policy, now);
        assert_eq!(eligible, vec![url]);
    }

    #[test]
    fn retry_backoff_is_opt_in() {
        let config = config_with(&[("SITEINDEX_RETRY_MAX_ATTEMPTS", "8")]);
        assert_eq!(config.retry.max_attempts, Some(8));
        assert_eq!(config.retry.base_delay, Duration::from_secs(3600));
        assert_eq!(config.retry.max_delay, Duration::from_secs(604_800));

        let config = config_with(&[("SITEINDEX_RETRY_BASE_SECS", "60")]);
        assert_eq!(config.retry.max_attempts, None);
        assert_eq!(config.retry.base_delay, Duration::from_secs(60));
    }

    #[test]
    fn indexnow_settings_need_a_key() {
        let err = config_with(&[]).indexnow_settings().unwrap_err();
        assert!(err.to_string().contains("INDEXNOW_KEY"));

        let settings = config_with(&[("INDEXNOW_KEY", "abc123")])
            .indexnow_settings()
            .unwrap();
        assert_eq!(settings.host, "newkenyan.com");
        assert_eq!(settings.key_location, "https://newkenyan.com/abc123.txt");
        assert_eq!(settings.endpoint, DEFAULT_INDEXNOW_ENDPOINT);
    }

    #[test]
    fn missing_google_credentials_fail_driver_construction() {
        let config = config_with(&[(
            "GOOGLE_APPLICATION_CREDENTIALS",
            "/nonexistent/siteindex/credentials.json",
        )]);
        let err = build_drivers(&config, ServiceSelector::Google)
            .err()
            .expect("credentials are required");
        assert!(format!("{err:#}").contains("/nonexistent/siteindex/credentials.json"));

        let drivers = build_drivers(
            &config_with(&[("INDEXNOW_KEY", "k")]),
            ServiceSelector::Bing,
        )
        .unwrap();
        assert_eq!(drivers.len(), 1);
        assert_eq!(drivers[0].service(), Service::Bing);
    }

    #[test]
    fn summary_lists_each_service() {
        let summary = RunSummary {
            run_id: Uuid::nil(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            dry_run: false,
            forced: false,
            universe_size: 12,
            skipped_sections: vec!["properties"],
            services: vec![
                ServiceRun {
                    service: Service::Google,
                    eligible: 0,
                    outcome: ServiceOutcome::NothingToDo,
                },
                ServiceRun {
                    service: Service::Bing,
                    eligible: 12,
                    outcome: ServiceOutcome::Submitted {
                        succeeded: 10,
                        failed: 2,
                    },
                },
            ],
            before_stats: None,
            after_stats: None,
            ledger_writes: 1,
        };
        let text = render_summary(&summary);
        assert!(text.contains("12 candidate urls"));
        assert!(text.contains("skipped sources: properties"));
        assert!(text.contains("[google] nothing to index"));
        assert!(text.contains("[bing] submitted 12 URLs: 10 succeeded, 2 failed"));
    }

    #[test]
    fn stats_and_recent_rendering() {
        let stats = LedgerStats {
            total: 3,
            google: ServiceStats {
                indexed: 2,
                failed: 1,
                pending: 0,
                abandoned: 0,
            },
            bing: ServiceStats {
                indexed: 0,
                failed: 0,
                pending: 3,
                abandoned: 0,
            },
        };
        let text = render_stats("Indexing stats", &stats);
        assert!(text.contains("google: indexed 2, failed 1, pending 0, abandoned 0"));
        assert!(text.contains("bing: indexed 0, failed 0, pending 3, abandoned 0"));

        let at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0).single().unwrap();
        let mut doc = siteindex_core::LedgerDocument::empty(at);
        doc.record_attempt(
            "https://x/a",
            Service::Google,
            &Outcome::Success,
            at,
            &RetryPolicy::default(),
        );
        let records = doc.recent(None, 5).into_iter().cloned().collect::<Vec<_>>();
        let text = render_recent(&records);
        assert!(text.contains("2026-03-01 09:30:00  https://x/a  google=indexed bing=pending"));
        assert_eq!(render_recent(&[]), "no urls recorded yet\n");
    }
}
