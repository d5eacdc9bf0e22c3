//! Ledger persistence (atomic whole-document writes behind a single-writer lock) and HTTP
//! client construction for siteindex.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use siteindex_core::{
    IndexedUrlRecord, LedgerDocument, LedgerStats, Outcome, RetryPolicy, Service,
    SubmissionReport,
};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "siteindex-storage";

pub const DEFAULT_LEDGER_FILE: &str = "indexing-tracker.json";

/// The ledger JSON document on disk.
#[derive(Debug, Clone)]
pub struct LedgerFile {
    path: PathBuf,
}

impl LedgerFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or unreadable ledgers load as a fresh empty document.
    pub async fn load(&self) -> LedgerDocument {
        let text = match fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return LedgerDocument::empty(Utc::now());
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "could not read ledger, starting a new one");
                return LedgerDocument::empty(Utc::now());
            }
        };

        match serde_json::from_str::<LedgerDocument>(&text) {
            Ok(doc) => doc,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "could not parse ledger, starting a new one");
                LedgerDocument::empty(Utc::now())
            }
        }
    }

    /// Refresh derived fields and replace the ledger via temp-file rename.
    pub async fn try_save(&self, doc: &mut LedgerDocument) -> anyhow::Result<()> {
        doc.refresh_derived(Utc::now());
        let bytes = serde_json::to_vec_pretty(doc).context("serializing ledger")?;

        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating ledger directory {}", parent.display()))?;

        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| DEFAULT_LEDGER_FILE.to_string());
        let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp ledger file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp ledger file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp ledger file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &self.path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp ledger {} -> {}",
                    temp_path.display(),
                    self.path.display()
                )
            });
        }
        Ok(())
    }

    /// Like [`LedgerFile::try_save`], but failures are only logged.
    pub async fn save(&self, doc: &mut LedgerDocument) -> bool {
        match self.try_save(doc).await {
            Ok(()) => true,
            Err(err) => {
                error!(path = %self.path.display(), error = %format!("{err:#}"), "saving ledger failed");
                false
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum LedgerLockError {
    #[error(
        "ledger {path} is locked by {} since {since}",
        .pid.map(|pid| format!("pid {pid}")).unwrap_or_else(|| "another process".to_string())
    )]
    Held {
        path: String,
        pid: Option<u32>,
        since: DateTime<Utc>,
    },
    #[error("ledger lock {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// What a lock file says about its holder. A file whose contents are not yet written
/// is dated by its mtime.
#[derive(Debug)]
struct LockHolder {
    info: Option<LockInfo>,
    modified: Option<DateTime<Utc>>,
}

impl LockHolder {
    fn read(path: &Path) -> Self {
        let info = std::fs::read_to_string(path)
            .ok()
            .and_then(|text| serde_json::from_str::<LockInfo>(&text).ok());
        let modified = std::fs::metadata(path)
            .and_then(|meta| meta.modified())
            .ok()
            .map(DateTime::<Utc>::from);
        Self { info, modified }
    }

    fn pid(&self) -> Option<u32> {
        self.info.as_ref().map(|info| info.pid)
    }

    fn since(&self) -> Option<DateTime<Utc>> {
        self.info.as_ref().map(|info| info.acquired_at).or(self.modified)
    }

    /// A holder with no readable date is gone; the rename below settles who replaces it.
    fn is_stale(&self, stale_after: chrono::Duration, now: DateTime<Utc>) -> bool {
        self.since().map_or(true, |since| now - since >= stale_after)
    }
}

/// Exclusive claim on a ledger; the lock file is removed on drop.
#[derive(Debug)]
pub struct LedgerLock {
    path: PathBuf,
}

impl LedgerLock {
    pub fn lock_path_for(ledger_path: &Path) -> PathBuf {
        let mut name = ledger_path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_else(|| DEFAULT_LEDGER_FILE.into());
        name.push(".lock");
        ledger_path.with_file_name(name)
    }

    /// Take the lock, replacing it when the holder has been silent longer than `stale_after`.
    ///
    /// A stale lock is renamed aside before it is deleted, so of several processes racing
    /// for the same stale lock only one moves it. Whoever finds a live lock at the moved
    /// path puts it back and reports it as held.
    pub fn acquire(ledger_path: &Path, stale_after: Duration) -> Result<Self, LedgerLockError> {
        let path = Self::lock_path_for(ledger_path);
        let io_err = |source| LedgerLockError::Io {
            path: path.display().to_string(),
            source,
        };
        let held = |holder: &LockHolder| LedgerLockError::Held {
            path: path.display().to_string(),
            pid: holder.pid(),
            since: holder.since().unwrap_or_else(Utc::now),
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|err| io_err(err))?;
        }
        let stale_after =
            chrono::Duration::from_std(stale_after).unwrap_or_else(|_| chrono::Duration::days(1));

        for _ in 0..3 {
            match std::fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&path)
            {
                Ok(file) => {
                    let info = LockInfo {
                        pid: std::process::id(),
                        acquired_at: Utc::now(),
                    };
                    serde_json::to_writer(file, &info)
                        .map_err(|err| io_err(std::io::Error::other(err)))?;
                    return Ok(Self { path: path.clone() });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = LockHolder::read(&path);
                    if !holder.is_stale(stale_after, Utc::now()) {
                        return Err(held(&holder));
                    }

                    let mut aside = path.clone().into_os_string();
                    aside.push(format!(".{}.stale", Uuid::new_v4()));
                    let aside = PathBuf::from(aside);
                    match std::fs::rename(&path, &aside) {
                        Ok(()) => {}
                        Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                        Err(err) => return Err(io_err(err)),
                    }

                    let moved = LockHolder::read(&aside);
                    if !moved.is_stale(stale_after, Utc::now()) {
                        // A new holder re-created the lock between the read and the rename.
                        let _ = std::fs::hard_link(&aside, &path);
                        let _ = std::fs::remove_file(&aside);
                        return Err(held(&moved));
                    }
                    warn!(
                        lock = %path.display(),
                        holder_pid = ?moved.pid(),
                        since = ?moved.since(),
                        "taking over stale ledger lock"
                    );
                    let _ = std::fs::remove_file(&aside);
                }
                Err(err) => return Err(io_err(err)),
            }
        }

        Err(io_err(std::io::Error::new(
            std::io::ErrorKind::WouldBlock,
            "lock file reappeared while taking over",
        )))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LedgerLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Single-writer handle over the ledger. The document stays in memory behind a mutex and
/// every mutation rewrites the whole file.
#[derive(Debug)]
pub struct LedgerStore {
    file: LedgerFile,
    doc: Mutex<LedgerDocument>,
    policy: RetryPolicy,
    writes: AtomicUsize,
    lock: Option<LedgerLock>,
}

impl LedgerStore {
    pub async fn open(
        path: impl Into<PathBuf>,
        policy: RetryPolicy,
        stale_lock_after: Duration,
    ) -> Result<Self, LedgerLockError> {
        let file = LedgerFile::new(path);
        let lock = LedgerLock::acquire(file.path(), stale_lock_after)?;
        let doc = file.load().await;
        Ok(Self {
            file,
            doc: Mutex::new(doc),
            policy,
            writes: AtomicUsize::new(0),
            lock: Some(lock),
        })
    }

    /// Open without taking the lock. Mutations stay in memory and are never written.
    pub async fn open_read_only(path: impl Into<PathBuf>, policy: RetryPolicy) -> Self {
        let file = LedgerFile::new(path);
        let doc = file.load().await;
        Self {
            file,
            doc: Mutex::new(doc),
            policy,
            writes: AtomicUsize::new(0),
            lock: None,
        }
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn is_read_only(&self) -> bool {
        self.lock.is_none()
    }

    /// Completed ledger writes since this store was opened.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn snapshot(&self) -> LedgerDocument {
        self.doc.lock().await.clone()
    }

    pub async fn stats(&self) -> LedgerStats {
        self.doc.lock().await.stats()
    }

    pub async fn is_url_indexed(&self, url: &str, service: Service) -> bool {
        self.doc.lock().await.is_url_indexed(url, service)
    }

    pub async fn recent(&self, service: Option<Service>, limit: usize) -> Vec<IndexedUrlRecord> {
        self.doc
            .lock()
            .await
            .recent(service, limit)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn urls_to_index(
        &self,
        all_urls: &[String],
        service: Service,
        reindex_after_days: Option<u32>,
        now: DateTime<Utc>,
    ) -> Vec<String> {
        self.doc
            .lock()
            .await
            .urls_to_index(all_urls, service, reindex_after_days, &self.policy, now)
    }

    pub async fn mark_url_indexed(
        &self,
        url: &str,
        service: Service,
        success: bool,
        error: Option<&str>,
    ) {
        let outcome = if success {
            Outcome::Success
        } else {
            Outcome::failure(error.unwrap_or("submission failed"))
        };
        let mut doc = self.doc.lock().await;
        doc.record_attempt(url, service, &outcome, Utc::now(), &self.policy);
        self.persist(&mut doc).await;
    }

    /// Apply a driver report and write the ledger once, however many URLs it covers.
    pub async fn record_report(&self, report: &SubmissionReport) {
        let mut doc = self.doc.lock().await;
        doc.apply_report(report, Utc::now(), &self.policy);
        self.persist(&mut doc).await;
    }

    /// Wipe all tracking history.
    pub async fn clear(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            !self.is_read_only(),
            "ledger {} was opened read-only",
            self.path().display()
        );
        let mut doc = self.doc.lock().await;
        *doc = LedgerDocument::empty(Utc::now());
        self.file.try_save(&mut doc).await?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn persist(&self, doc: &mut LedgerDocument) {
        if self.is_read_only() {
            warn!(path = %self.path().display(), "ledger is read-only; change kept in memory");
            return;
        }
        if self.file.save(doc).await {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

impl HttpClientConfig {
    pub fn build_client(&self) -> anyhow::Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(self.timeout);

        if let Some(user_agent) = &self.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        builder.build().context("building reqwest client")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test]
    async fn missing_and_corrupt_ledgers_load_empty() {
        let dir = tempdir().expect("tempdir");
        let missing = LedgerFile::new(dir.path().join("absent.json")).load().await;
        assert!(missing.urls.is_empty());
        assert_eq!(missing.total_urls, 0);

        let corrupt_path = dir.path().join("corrupt.json");
        std::fs::write(&corrupt_path, "{ not json").expect("write");
        let corrupt = LedgerFile::new(&corrupt_path).load().await;
        assert!(corrupt.urls.is_empty());
    }

    #[tokio::test]
    async fn save_recomputes_total_and_round_trips_urls() {
        let dir = tempdir().expect("tempdir");
        let file = LedgerFile::new(dir.path().join("nested").join("ledger.json"));

        let mut doc = LedgerDocument::empty(Utc::now());
        doc.record_attempt(
            "https://x/a",
            Service::Google,
            &Outcome::Success,
            Utc::now(),
            &RetryPolicy::default(),
        );
        doc.total_urls = 99;
        file.try_save(&mut doc).await.expect("save");
        assert_eq!(doc.total_urls, 1);

        let mut loaded = file.load().await;
        assert_eq!(loaded.urls, doc.urls);
        file.try_save(&mut loaded).await.expect("resave");
        assert_eq!(file.load().await.urls, doc.urls);

        let text = std::fs::read_to_string(file.path()).expect("read");
        assert!(text.starts_with("{\n  \"lastUpdated\""));
        assert!(text.contains("\"totalUrls\": 1"));
    }

    #[tokio::test]
    async fn second_writer_is_rejected_until_first_drops() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("ledger.json");

        let first = LedgerStore::open(&path, RetryPolicy::default(), HOUR)
            .await
            .expect("first open");
        let second = LedgerStore::open(&path, RetryPolicy::default(), HOUR).await;
        assert!(matches!(second, Err(LedgerLockError::Held { .. })));

        drop(first);
        assert!(!LedgerLock::lock_path_for(&path).exists());
        LedgerStore::open(&path, RetryPolicy::default(), HOUR)
            .await
            .expect("reopen after drop");
    }

    #[tokio::test]
    async fn stale_lock_is_taken_over() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("ledger.json");
        let stale = LockInfo {
            pid: 1,
            acquired_at: Utc::now() - chrono::Duration::hours(12),
        };
        std::fs::write(
            LedgerLock::lock_path_for(&path),
            serde_json::to_string(&stale).expect("json"),
        )
        .expect("write lock");

        let store = LedgerStore::open(&path, RetryPolicy::default(), HOUR)
            .await
            .expect("stale lock should be replaced");
        assert!(!store.is_read_only());
        let leftovers = std::fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".stale"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn unwritten_lock_is_held_until_its_mtime_goes_stale() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("ledger.json");
        let lock_path = LedgerLock::lock_path_for(&path);
        std::fs::write(&lock_path, "").expect("write lock");

        let err = LedgerLock::acquire(&path, HOUR).expect_err("fresh empty lock is held");
        match &err {
            LedgerLockError::Held { pid, .. } => assert_eq!(*pid, None),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("locked by another process"));
        assert!(lock_path.exists());

        std::fs::File::options()
            .write(true)
            .open(&lock_path)
            .expect("open lock")
            .set_modified(std::time::SystemTime::now() - 2 * HOUR)
            .expect("backdate lock");

        let lock = LedgerLock::acquire(&path, HOUR).expect("old empty lock is replaced");
        let info: LockInfo =
            serde_json::from_str(&std::fs::read_to_string(lock.path()).expect("read lock"))
                .expect("lock json");
        assert_eq!(info.pid, std::process::id());
    }

    #[tokio::test]
    async fn marking_twice_counts_both_attempts_and_persists_each() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("ledger.json");
        let store = LedgerStore::open(&path, RetryPolicy::default(), HOUR)
            .await
            .expect("open");

        store.mark_url_indexed("https://x/a", Service::Google, true, None).await;
        let first = store.snapshot().await.urls["https://x/a"].clone();
        store.mark_url_indexed("https://x/a", Service::Google, true, None).await;
        let second = store.snapshot().await.urls["https://x/a"].clone();

        assert_eq!(second.first_indexed, first.first_indexed);
        assert_eq!(second.index_count, 2);
        assert!(second.last_indexed >= first.last_indexed);
        assert_eq!(store.write_count(), 2);

        let on_disk = LedgerFile::new(&path).load().await;
        assert_eq!(on_disk.urls["https://x/a"].index_count, 2);
        assert!(store.is_url_indexed("https://x/a", Service::Google).await);
    }

    #[tokio::test]
    async fn read_only_store_never_writes() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("ledger.json");
        let store = LedgerStore::open_read_only(&path, RetryPolicy::default()).await;

        store
            .mark_url_indexed("https://x/a", Service::Bing, false, Some("timeout"))
            .await;
        assert_eq!(store.write_count(), 0);
        assert!(!path.exists());
        assert!(store.clear().await.is_err());
    }

    #[tokio::test]
    async fn clear_wipes_history() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("ledger.json");
        let store = LedgerStore::open(&path, RetryPolicy::default(), HOUR)
            .await
            .expect("open");
        store.mark_url_indexed("https://x/a", Service::Bing, true, None).await;
        store.clear().await.expect("clear");

        assert_eq!(store.stats().await.total, 0);
        assert!(LedgerFile::new(&path).load().await.urls.is_empty());
    }
}
