//! Per-host failure backoff.
//!
//! Every failed download (and, by policy, every failed conversion) bumps a
//! counter for the origin host. Once a host reaches the threshold inside the
//! block window it is refused without a network call. After the recheck
//! interval one probe request is let through; success clears the host, a
//! failure re-blocks it straight away. Records expire on their own once the
//! block window passes without new failures.
//!
//! ```text
//!            failure x threshold                 recheck elapsed
//!   Clear ─────────────────────────▶ Blocked ─────────────────────▶ Probation
//!     ▲                                 ▲                              │
//!     │            failure              └──────────────────────────────┤
//!     └──────── success / block window expired ◀───────────────────────┘
//! ```
//!
//! Records live behind the [`HostStore`] trait. All read-modify-write cycles
//! for one host run under a per-host async lock, so concurrent failures are
//! never lost inside one process.

use crate::config::BlocklistPolicy;
use crate::error::Pdf2JpgError;
use crate::janitor;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

// ── Clock ────────────────────────────────────────────────────────────────

/// Source of "now" for the state machine.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> SystemTime;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<SystemTime>,
}

impl ManualClock {
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(SystemTime::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Records & storage ────────────────────────────────────────────────────

/// Failure history of one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostRecord {
    pub failures: u32,
    pub last_failure: SystemTime,
}

/// Where host records are persisted.
#[async_trait]
pub trait HostStore: Send + Sync + std::fmt::Debug {
    async fn load(&self, host: &str) -> Result<Option<HostRecord>, Pdf2JpgError>;

    async fn save(&self, host: &str, record: HostRecord) -> Result<(), Pdf2JpgError>;

    /// Delete the record; `true` if one existed.
    async fn remove(&self, host: &str) -> Result<bool, Pdf2JpgError>;

    /// Delete every record, returning how many went.
    async fn clear(&self) -> Result<usize, Pdf2JpgError>;
}

/// One `<urlencoded host>.status` file per host.
///
/// The file holds the decimal failure count; its mtime is the time of the
/// last failure. Writes go to a temp file that is renamed over the old one.
#[derive(Debug, Clone)]
pub struct FileHostStore {
    dir: PathBuf,
}

impl FileHostStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, Pdf2JpgError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| Pdf2JpgError::io("Failed to create blocklist directory", &dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn status_path(&self, host: &str) -> PathBuf {
        self.dir.join(format!("{}.status", urlencoding::encode(host)))
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, Pdf2JpgError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, Pdf2JpgError> + Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|e| Pdf2JpgError::Internal(format!("Blocklist task panicked: {e}")))?
    }
}

fn load_status_file(path: &Path) -> Result<Option<HostRecord>, Pdf2JpgError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Pdf2JpgError::io("Failed to read host status", path, e)),
    };
    let last_failure = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|e| Pdf2JpgError::io("Failed to stat host status", path, e))?;

    match raw.trim().parse::<u32>() {
        Ok(failures) => Ok(Some(HostRecord {
            failures,
            last_failure,
        })),
        Err(_) => {
            warn!(path = %path.display(), "Unreadable host status file, ignoring");
            Ok(None)
        }
    }
}

fn write_status_file(dir: &Path, path: &Path, record: HostRecord) -> Result<(), Pdf2JpgError> {
    let mut tmp = tempfile::Builder::new()
        .prefix(".status-")
        .tempfile_in(dir)
        .map_err(|e| Pdf2JpgError::io("Failed to create temp file in", dir, e))?;
    write!(tmp.as_file_mut(), "{}", record.failures)
        .map_err(|e| Pdf2JpgError::io("Failed to write host status", tmp.path(), e))?;
    tmp.as_file()
        .set_modified(record.last_failure)
        .map_err(|e| Pdf2JpgError::io("Failed to stamp host status", tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| Pdf2JpgError::io("Failed to save host status", path, e.error))?;
    Ok(())
}

#[async_trait]
impl HostStore for FileHostStore {
    async fn load(&self, host: &str) -> Result<Option<HostRecord>, Pdf2JpgError> {
        let path = self.status_path(host);
        self.blocking(move || load_status_file(&path)).await
    }

    async fn save(&self, host: &str, record: HostRecord) -> Result<(), Pdf2JpgError> {
        let path = self.status_path(host);
        let dir = self.dir.clone();
        self.blocking(move || write_status_file(&dir, &path, record))
            .await
    }

    async fn remove(&self, host: &str) -> Result<bool, Pdf2JpgError> {
        let path = self.status_path(host);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Pdf2JpgError::io("Failed to remove host status", path, e)),
        }
    }

    async fn clear(&self) -> Result<usize, Pdf2JpgError> {
        Ok(janitor::clear_dir(&self.dir).await)
    }
}

/// Records kept in process memory only.
#[derive(Debug, Default)]
pub struct MemoryHostStore {
    records: Mutex<HashMap<String, HostRecord>>,
}

impl MemoryHostStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> std::sync::MutexGuard<'_, HashMap<String, HostRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl HostStore for MemoryHostStore {
    async fn load(&self, host: &str) -> Result<Option<HostRecord>, Pdf2JpgError> {
        Ok(self.records().get(host).copied())
    }

    async fn save(&self, host: &str, record: HostRecord) -> Result<(), Pdf2JpgError> {
        self.records().insert(host.to_string(), record);
        Ok(())
    }

    async fn remove(&self, host: &str) -> Result<bool, Pdf2JpgError> {
        Ok(self.records().remove(host).is_some())
    }

    async fn clear(&self) -> Result<usize, Pdf2JpgError> {
        let mut records = self.records();
        let n = records.len();
        records.clear();
        Ok(n)
    }
}

// ── Per-host locking ─────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct HostLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

struct HostGuard<'a> {
    locks: &'a HostLocks,
    host: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl HostLocks {
    async fn acquire(&self, host: &str) -> HostGuard<'_> {
        let lock = {
            let mut map = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(map.entry(host.to_string()).or_default())
        };
        let guard = lock.lock_owned().await;
        HostGuard {
            locks: self,
            host: host.to_string(),
            guard: Some(guard),
        }
    }
}

impl Drop for HostGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut map = self
            .locks
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Only the map still holds it: nobody is waiting, drop the entry.
        if map.get(&self.host).is_some_and(|l| Arc::strong_count(l) == 1) {
            map.remove(&self.host);
        }
    }
}

// ── State machine ────────────────────────────────────────────────────────

/// Where a host currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    /// No record.
    Clear,
    /// Some failures, still under the threshold.
    Failing { failures: u32 },
    /// Refused until the recheck interval passes.
    Blocked { failures: u32, retry_in: Duration },
    /// Over the threshold but past the recheck interval.
    Probation { failures: u32 },
}

/// The host failure state machine over a [`HostStore`].
#[derive(Debug)]
pub struct HostBlocklist {
    store: Arc<dyn HostStore>,
    policy: BlocklistPolicy,
    clock: Arc<dyn Clock>,
    locks: HostLocks,
    /// Hosts with a probation request in flight, and since when.
    probes: Mutex<HashMap<String, SystemTime>>,
}

impl HostBlocklist {
    pub fn new(store: Arc<dyn HostStore>, policy: BlocklistPolicy) -> Self {
        Self::with_clock(store, policy, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn HostStore>,
        policy: BlocklistPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            policy,
            clock,
            locks: HostLocks::default(),
            probes: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &BlocklistPolicy {
        &self.policy
    }

    fn elapsed_since(&self, record: &HostRecord) -> Duration {
        self.clock
            .now()
            .duration_since(record.last_failure)
            .unwrap_or(Duration::ZERO)
    }

    fn probes(&self) -> std::sync::MutexGuard<'_, HashMap<String, SystemTime>> {
        self.probes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Should a request to `host` be refused right now?
    ///
    /// Expired records are deleted as a side effect. In probation a single
    /// request is let through; others are refused until that probe reports
    /// back or the claim goes stale after one recheck interval.
    pub async fn is_blocked(&self, host: &str) -> Result<bool, Pdf2JpgError> {
        let _guard = self.locks.acquire(host).await;

        let Some(record) = self.store.load(host).await? else {
            return Ok(false);
        };
        let elapsed = self.elapsed_since(&record);

        if elapsed >= self.policy.block_duration() {
            self.store.remove(host).await?;
            self.probes().remove(host);
            warn!(host, "Host has been unblocked");
            return Ok(false);
        }

        if record.failures < self.policy.failure_threshold {
            return Ok(false);
        }

        if elapsed < self.policy.recheck_interval() {
            debug!(host, failures = record.failures, "Host is blocked");
            return Ok(true);
        }

        let now = self.clock.now();
        let mut probes = self.probes();
        let stale = probes.get(host).map_or(true, |since| {
            now.duration_since(*since).unwrap_or(Duration::ZERO) >= self.policy.recheck_interval()
        });
        if stale {
            probes.insert(host.to_string(), now);
            warn!(host, "Host has been tentatively unblocked");
            Ok(false)
        } else {
            debug!(host, "Probe already in flight, host stays blocked");
            Ok(true)
        }
    }

    /// Count a failure for `host`, returning the new counter.
    pub async fn record_failure(&self, host: &str) -> Result<u32, Pdf2JpgError> {
        let _guard = self.locks.acquire(host).await;

        let failures = match self.store.load(host).await? {
            Some(record) if self.elapsed_since(&record) < self.policy.block_duration() => {
                record.failures.saturating_add(1)
            }
            _ => 1,
        };
        self.store
            .save(
                host,
                HostRecord {
                    failures,
                    last_failure: self.clock.now(),
                },
            )
            .await?;
        self.probes().remove(host);

        warn!(host, failures, "Host failure recorded");
        Ok(failures)
    }

    /// Forget every failure recorded for `host`.
    pub async fn record_success(&self, host: &str) -> Result<(), Pdf2JpgError> {
        let _guard = self.locks.acquire(host).await;
        self.probes().remove(host);
        if self.store.remove(host).await? {
            info!(host, "Host success, failure count cleared");
        }
        Ok(())
    }

    /// Inspect a host without changing anything.
    pub async fn state(&self, host: &str) -> Result<HostState, Pdf2JpgError> {
        let Some(record) = self.store.load(host).await? else {
            return Ok(HostState::Clear);
        };
        let elapsed = self.elapsed_since(&record);
        let failures = record.failures;

        Ok(if elapsed >= self.policy.block_duration() {
            HostState::Clear
        } else if failures < self.policy.failure_threshold {
            HostState::Failing { failures }
        } else if elapsed < self.policy.recheck_interval() {
            HostState::Blocked {
                failures,
                retry_in: self.policy.recheck_interval() - elapsed,
            }
        } else {
            HostState::Probation { failures }
        })
    }

    /// Drop every record.
    pub async fn clear(&self) -> Result<usize, Pdf2JpgError> {
        self.probes().clear();
        self.store.clear().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: &str = "docs.example.org";

    fn policy() -> BlocklistPolicy {
        BlocklistPolicy::default()
    }

    fn memory_list() -> (HostBlocklist, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let list = HostBlocklist::with_clock(
            Arc::new(MemoryHostStore::new()),
            policy(),
            clock.clone(),
        );
        (list, clock)
    }

    async fn fail_n(list: &HostBlocklist, n: u32) {
        for _ in 0..n {
            list.record_failure(HOST).await.unwrap();
        }
    }

    #[tokio::test]
    async fn blocks_exactly_at_threshold() {
        let (list, _clock) = memory_list();
        fail_n(&list, 9).await;
        assert!(!list.is_blocked(HOST).await.unwrap());
        assert_eq!(
            list.state(HOST).await.unwrap(),
            HostState::Failing { failures: 9 }
        );

        list.record_failure(HOST).await.unwrap();
        assert!(list.is_blocked(HOST).await.unwrap());
    }

    #[tokio::test]
    async fn success_resets_counter() {
        let (list, _clock) = memory_list();
        fail_n(&list, 9).await;
        list.record_success(HOST).await.unwrap();
        assert_eq!(list.state(HOST).await.unwrap(), HostState::Clear);

        assert_eq!(list.record_failure(HOST).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn record_expires_after_block_duration() {
        let (list, clock) = memory_list();
        fail_n(&list, 10).await;
        assert!(list.is_blocked(HOST).await.unwrap());

        clock.advance(Duration::from_secs(3600));
        assert!(!list.is_blocked(HOST).await.unwrap());
        // Removed as a side effect, so the state is clear even if time rewinds.
        assert!(list.store.load(HOST).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_record_restarts_count() {
        let (list, clock) = memory_list();
        fail_n(&list, 5).await;
        clock.advance(Duration::from_secs(3601));
        assert_eq!(list.record_failure(HOST).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn probation_lets_one_request_through() {
        let (list, clock) = memory_list();
        fail_n(&list, 10).await;
        clock.advance(Duration::from_secs(61));

        assert_eq!(
            list.state(HOST).await.unwrap(),
            HostState::Probation { failures: 10 }
        );
        assert!(!list.is_blocked(HOST).await.unwrap(), "probe allowed");
        assert!(list.is_blocked(HOST).await.unwrap(), "second request refused");
        // Record survives probation.
        assert!(list.store.load(HOST).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failed_probe_reblocks_immediately() {
        let (list, clock) = memory_list();
        fail_n(&list, 10).await;
        clock.advance(Duration::from_secs(61));
        assert!(!list.is_blocked(HOST).await.unwrap());

        assert_eq!(list.record_failure(HOST).await.unwrap(), 11);
        assert!(list.is_blocked(HOST).await.unwrap());
    }

    #[tokio::test]
    async fn successful_probe_clears_host() {
        let (list, clock) = memory_list();
        fail_n(&list, 10).await;
        clock.advance(Duration::from_secs(61));
        assert!(!list.is_blocked(HOST).await.unwrap());

        list.record_success(HOST).await.unwrap();
        assert!(!list.is_blocked(HOST).await.unwrap());
        assert_eq!(list.state(HOST).await.unwrap(), HostState::Clear);
    }

    #[tokio::test]
    async fn abandoned_probe_claim_goes_stale() {
        let (list, clock) = memory_list();
        fail_n(&list, 10).await;
        clock.advance(Duration::from_secs(61));
        assert!(!list.is_blocked(HOST).await.unwrap());
        assert!(list.is_blocked(HOST).await.unwrap());

        clock.advance(Duration::from_secs(60));
        assert!(!list.is_blocked(HOST).await.unwrap());
    }

    #[tokio::test]
    async fn hosts_are_independent() {
        let (list, _clock) = memory_list();
        fail_n(&list, 10).await;
        assert!(list.is_blocked(HOST).await.unwrap());
        assert!(!list.is_blocked("other.example.org").await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_failures_are_not_lost() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(FileHostStore::open(tmp.path()).unwrap());
        let list = Arc::new(HostBlocklist::new(store, policy()));

        let tasks: Vec<_> = (0..25)
            .map(|_| {
                let list = Arc::clone(&list);
                tokio::spawn(async move { list.record_failure(HOST).await.unwrap() })
            })
            .collect();
        for t in tasks {
            t.await.unwrap();
        }

        assert_eq!(list.store.load(HOST).await.unwrap().unwrap().failures, 25);
        assert!(list.locks.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn file_store_round_trips_count_and_mtime() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileHostStore::open(tmp.path()).unwrap();
        let when = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);

        store
            .save(
                "[::1]",
                HostRecord {
                    failures: 7,
                    last_failure: when,
                },
            )
            .await
            .unwrap();

        let path = store.status_path("[::1]");
        assert_eq!(path.file_name().unwrap(), "%5B%3A%3A1%5D.status");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "7");

        let record = store.load("[::1]").await.unwrap().unwrap();
        assert_eq!(record.failures, 7);
        assert_eq!(record.last_failure, when);

        assert!(store.remove("[::1]").await.unwrap());
        assert!(!store.remove("[::1]").await.unwrap());
        assert!(store.load("[::1]").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_store_ignores_garbage() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileHostStore::open(tmp.path()).unwrap();
        std::fs::write(store.status_path(HOST), "lots").unwrap();
        assert!(store.load(HOST).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clear_drops_all_records() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(FileHostStore::open(tmp.path()).unwrap());
        let list = HostBlocklist::new(store, policy());
        list.record_failure("a.example").await.unwrap();
        list.record_failure("b.example").await.unwrap();

        assert_eq!(list.clear().await.unwrap(), 2);
        assert_eq!(list.state("a.example").await.unwrap(), HostState::Clear);
    }
}
