//! Core ledger model, eligibility rules and submission result types for siteindex.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "siteindex-core";

/// Search engine a URL can be submitted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    Google,
    Bing,
}

impl Service {
    pub const ALL: [Service; 2] = [Service::Google, Service::Bing];

    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Google => "google",
            Service::Bing => "bing",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Service {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "google" => Ok(Service::Google),
            "bing" => Ok(Service::Bing),
            other => Err(format!("unknown service `{other}` (expected google or bing)")),
        }
    }
}

/// Which services a run targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServiceSelector {
    Google,
    Bing,
    #[default]
    Both,
}

impl ServiceSelector {
    pub fn includes(self, service: Service) -> bool {
        match self {
            ServiceSelector::Google => service == Service::Google,
            ServiceSelector::Bing => service == Service::Bing,
            ServiceSelector::Both => true,
        }
    }

    pub fn services(self) -> Vec<Service> {
        Service::ALL
            .into_iter()
            .filter(|service| self.includes(*service))
            .collect()
    }
}

impl fmt::Display for ServiceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServiceSelector::Google => "google",
            ServiceSelector::Bing => "bing",
            ServiceSelector::Both => "both",
        })
    }
}

/// Latest submission attempt for one URL at one service.
///
/// `attempted` only says an attempt was recorded; `success` is the indexed/failed signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceState {
    #[serde(alias = "indexed")]
    pub attempted: bool,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "is_false")]
    pub abandoned: bool,
}

fn is_zero(value: &u32) -> bool {
    *value == 0
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionStatus {
    Pending,
    Indexed,
    Failed,
    Abandoned,
}

impl ServiceState {
    pub fn status(&self) -> SubmissionStatus {
        if self.success {
            SubmissionStatus::Indexed
        } else if self.abandoned {
            SubmissionStatus::Abandoned
        } else {
            SubmissionStatus::Failed
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedUrlRecord {
    pub url: String,
    pub first_indexed: DateTime<Utc>,
    pub last_indexed: DateTime<Utc>,
    #[serde(default)]
    pub services: BTreeMap<Service, ServiceState>,
    pub index_count: u64,
}

impl IndexedUrlRecord {
    pub fn new(url: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            url: url.into(),
            first_indexed: now,
            last_indexed: now,
            services: BTreeMap::new(),
            index_count: 0,
        }
    }

    pub fn service(&self, service: Service) -> Option<&ServiceState> {
        self.services.get(&service)
    }

    pub fn status(&self, service: Service) -> SubmissionStatus {
        self.service(service)
            .map(ServiceState::status)
            .unwrap_or(SubmissionStatus::Pending)
    }
}

/// The whole persisted ledger. `total_urls` is derived and refreshed on every save.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerDocument {
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub total_urls: usize,
    #[serde(default)]
    pub urls: BTreeMap<String, IndexedUrlRecord>,
}

impl LedgerDocument {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            last_updated: now,
            total_urls: 0,
            urls: BTreeMap::new(),
        }
    }

    pub fn refresh_derived(&mut self, now: DateTime<Utc>) {
        self.last_updated = now;
        self.total_urls = self.urls.len();
    }

    pub fn record(&self, url: &str) -> Option<&IndexedUrlRecord> {
        self.urls.get(url)
    }

    /// True only when the latest attempt for `service` succeeded.
    pub fn is_url_indexed(&self, url: &str, service: Service) -> bool {
        self.record(url)
            .and_then(|record| record.service(service))
            .map(|state| state.attempted && state.success)
            .unwrap_or(false)
    }

    /// Record one submission attempt. Creates the record lazily; `first_indexed` is never
    /// touched afterwards and `last_indexed` never moves backwards.
    pub fn record_attempt(
        &mut self,
        url: &str,
        service: Service,
        outcome: &Outcome,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) {
        let record = self
            .urls
            .entry(url.to_string())
            .or_insert_with(|| IndexedUrlRecord::new(url, now));
        record.last_indexed = record.last_indexed.max(now);
        record.index_count += 1;

        let previous_failures = record
            .service(service)
            .map(|state| state.consecutive_failures)
            .unwrap_or(0);

        let state = match outcome {
            Outcome::Success => ServiceState {
                attempted: true,
                timestamp: now,
                success: true,
                error: None,
                consecutive_failures: 0,
                abandoned: false,
            },
            Outcome::Failure { error } => {
                let consecutive_failures = previous_failures.saturating_add(1);
                ServiceState {
                    attempted: true,
                    timestamp: now,
                    success: false,
                    error: Some(error.clone()),
                    consecutive_failures,
                    abandoned: policy.is_exhausted(consecutive_failures),
                }
            }
        };
        record.services.insert(service, state);
    }

    /// Apply a driver report; batch outcomes land on every member URL. Returns URLs touched.
    pub fn apply_report(
        &mut self,
        report: &SubmissionReport,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> usize {
        let service = report.service();
        let outcome = report.outcome().clone();
        let urls = report.urls();
        for url in &urls {
            self.record_attempt(url, service, &outcome, now, policy);
        }
        urls.len()
    }

    pub fn eligibility(
        &self,
        url: &str,
        service: Service,
        reindex_after_days: Option<u32>,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Eligibility {
        let Some(state) = self.record(url).and_then(|record| record.service(service)) else {
            return Eligibility::NeverSubmitted;
        };
        let age = now.signed_duration_since(state.timestamp);

        if !state.success {
            if state.abandoned {
                return Eligibility::Abandoned;
            }
            let wait = policy.delay_for_attempt(state.consecutive_failures.saturating_sub(1));
            let wait = chrono::Duration::from_std(wait)
                .unwrap_or_else(|_| chrono::Duration::days(36_500));
            if age >= wait {
                return Eligibility::RetryFailed;
            }
            return Eligibility::BackingOff {
                retry_at: state.timestamp + wait,
            };
        }

        match reindex_after_days {
            Some(days) if age >= chrono::Duration::days(i64::from(days)) => Eligibility::Reindex,
            _ => Eligibility::UpToDate,
        }
    }

    /// The subset of `all_urls` (order preserved) that should be submitted to `service`.
    pub fn urls_to_index(
        &self,
        all_urls: &[String],
        service: Service,
        reindex_after_days: Option<u32>,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Vec<String> {
        all_urls
            .iter()
            .filter(|url| {
                self.eligibility(url, service, reindex_after_days, policy, now)
                    .is_eligible()
            })
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> LedgerStats {
        let mut stats = LedgerStats {
            total: self.urls.len(),
            ..Default::default()
        };
        for record in self.urls.values() {
            for service in Service::ALL {
                let entry = stats.for_service_mut(service);
                match record.status(service) {
                    SubmissionStatus::Pending => entry.pending += 1,
                    SubmissionStatus::Indexed => entry.indexed += 1,
                    SubmissionStatus::Failed => entry.failed += 1,
                    SubmissionStatus::Abandoned => entry.abandoned += 1,
                }
            }
        }
        stats
    }

    /// Most recently touched records, optionally limited to those with an attempt at `service`.
    pub fn recent(&self, service: Option<Service>, limit: usize) -> Vec<&IndexedUrlRecord> {
        let mut records = self
            .urls
            .values()
            .filter(|record| match service {
                Some(service) => record
                    .service(service)
                    .map(|state| state.attempted)
                    .unwrap_or(false),
                None => true,
            })
            .collect::<Vec<_>>();
        records.sort_by(|a, b| b.last_indexed.cmp(&a.last_indexed));
        records.truncate(limit);
        records
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    NeverSubmitted,
    RetryFailed,
    Reindex,
    BackingOff { retry_at: DateTime<Utc> },
    Abandoned,
    UpToDate,
}

impl Eligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(
            self,
            Eligibility::NeverSubmitted | Eligibility::RetryFailed | Eligibility::Reindex
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServiceStats {
    pub indexed: usize,
    pub failed: usize,
    pub pending: usize,
    pub abandoned: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LedgerStats {
    pub total: usize,
    pub google: ServiceStats,
    pub bing: ServiceStats,
}

impl LedgerStats {
    pub fn for_service(&self, service: Service) -> &ServiceStats {
        match service {
            Service::Google => &self.google,
            Service::Bing => &self.bing,
        }
    }

    fn for_service_mut(&mut self, service: Service) -> &mut ServiceStats {
        match service {
            Service::Google => &mut self.google,
            Service::Bing => &mut self.bing,
        }
    }
}

/// Backoff and give-up rules for failed submissions.
///
/// The default retries every failed URL on every run with no cap. Backoff and
/// abandonment only apply once a caller opts in with [`RetryPolicy::bounded`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: Option<u32>,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::unbounded()
    }
}

impl RetryPolicy {
    /// Retry every run, forever.
    pub fn unbounded() -> Self {
        Self {
            max_attempts: None,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Exponential backoff from `base_delay` capped at `max_delay`, giving up
    /// after `max_attempts` consecutive failures (`0` never gives up).
    pub fn bounded(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: Some(max_attempts).filter(|max| *max > 0),
            base_delay,
            max_delay,
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn is_exhausted(&self, consecutive_failures: u32) -> bool {
        self.max_attempts
            .map(|max| max > 0 && consecutive_failures >= max)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure { error: String },
}

impl Outcome {
    pub fn failure(error: impl Into<String>) -> Self {
        Outcome::Failure {
            error: error.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Outcome::Success => None,
            Outcome::Failure { error } => Some(error),
        }
    }
}

/// Outcome reported for exactly one URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerUrlResult {
    pub service: Service,
    pub url: String,
    pub outcome: Outcome,
    pub notify_time: Option<String>,
}

/// Outcome reported for a whole batch; the protocol gives no per-URL detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchResult {
    pub service: Service,
    pub batch_no: usize,
    pub urls: Vec<String>,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionReport {
    PerUrl(PerUrlResult),
    Batch(BatchResult),
}

impl SubmissionReport {
    pub fn service(&self) -> Service {
        match self {
            SubmissionReport::PerUrl(result) => result.service,
            SubmissionReport::Batch(result) => result.service,
        }
    }

    pub fn outcome(&self) -> &Outcome {
        match self {
            SubmissionReport::PerUrl(result) => &result.outcome,
            SubmissionReport::Batch(result) => &result.outcome,
        }
    }

    pub fn urls(&self) -> Vec<&str> {
        match self {
            SubmissionReport::PerUrl(result) => vec![result.url.as_str()],
            SubmissionReport::Batch(result) => result.urls.iter().map(String::as_str).collect(),
        }
    }

    pub fn url_count(&self) -> usize {
        match self {
            SubmissionReport::PerUrl(_) => 1,
            SubmissionReport::Batch(result) => result.urls.len(),
        }
    }

    pub fn succeeded(&self) -> usize {
        if self.outcome().is_success() {
            self.url_count()
        } else {
            0
        }
    }
}

static NON_SLUG_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-z0-9 -]").expect("valid slug regex"));
static NON_SLUG_CHARS_WS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^a-z0-9\s-]").expect("valid slug regex"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid slug regex"));
static DASH_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"-+").expect("valid slug regex"));
static PRICE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"ksh\s*\d+[,\d]*(\.\d+)?").expect("valid price regex"));
static FILLER_WORDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(for|rent|sale|available|modern|spacious|beautiful|excellent)\b")
        .expect("valid filler regex")
});

pub fn slugify(text: &str) -> String {
    let lowered = text.to_lowercase();
    let stripped = NON_SLUG_CHARS.replace_all(&lowered, "");
    let dashed = WHITESPACE.replace_all(&stripped, "-");
    let collapsed = DASH_RUNS.replace_all(&dashed, "-");
    collapsed.trim().trim_matches('-').to_string()
}

/// Listing fields a property detail URL is derived from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyListing {
    pub property_title: String,
    pub property_type: String,
    pub city: String,
    #[serde(default)]
    pub bedrooms: Option<i64>,
    #[serde(default)]
    pub price_type: Option<String>,
}

/// Slug used by property detail pages: bedrooms, type, city, then up to three title words.
///
/// `price_type` is not part of the slug; live pages are routed without it.
pub fn property_slug(listing: &PropertyListing) -> String {
    let mut elements = Vec::new();
    if let Some(bedrooms) = listing.bedrooms.filter(|b| *b > 0) {
        elements.push(format!("{bedrooms}-bedroom"));
    }
    elements.push(listing.property_type.to_lowercase());
    elements.push(listing.city.to_lowercase());

    let title = listing.property_title.to_lowercase();
    let title = PRICE.replace_all(&title, "");
    let title = FILLER_WORDS.replace_all(&title, "");
    elements.extend(
        title
            .split_whitespace()
            .filter(|word| word.chars().count() > 2)
            .take(3)
            .map(str::to_string),
    );

    let joined = elements.join(" ").to_lowercase();
    let stripped = NON_SLUG_CHARS_WS.replace_all(&joined, "");
    let dashed = WHITESPACE.replace_all(&stripped, "-");
    let collapsed = DASH_RUNS.replace_all(&dashed, "-");
    collapsed.trim_matches('-').to_string()
}
