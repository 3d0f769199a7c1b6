//! Request orchestration: URL in, JPEG bytes out.
//!
//! ## Why coalesce?
//!
//! A thumbnail embedded on a busy page is requested by many clients at once
//! before the first conversion finishes. Without coordination each request
//! would download and rasterize the same document. Concurrent requests for
//! one fingerprint therefore share a single job, and the job runs on its own
//! task so a client hanging up does not abort it for everyone else.
//!
//! ## Job flow
//!
//! ```text
//! parse ─▶ cache hit? ─▶ join/start job ─▶ blocklist ─▶ fetch ─▶ sniff ─▶ rasterize ─▶ publish
//!              │ yes                                      │ fail              │ fail
//!              ▼                                          ▼                   ▼
//!          cached bytes                           record_failure     record_failure (policy)
//! ```

use crate::blocklist::{FileHostStore, HostBlocklist};
use crate::cache::CacheStore;
use crate::config::ServiceConfig;
use crate::error::Pdf2JpgError;
use crate::fingerprint::Fingerprint;
use crate::janitor::{self, Scope};
use crate::pipeline::fetch::{FetchOutcome, Fetcher};
use crate::pipeline::rasterize::Rasterizer;
use crate::pipeline::sniff;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, warn};
use url::Url;

type JobResult = Result<PathBuf, Arc<Pdf2JpgError>>;
type SharedJob = Shared<BoxFuture<'static, JobResult>>;

/// A finished thumbnail.
#[derive(Debug, Clone)]
pub struct Thumbnail {
    pub bytes: Vec<u8>,
    pub fingerprint: Fingerprint,
    /// `true` when served straight from the cache.
    pub cached: bool,
}

/// Owns the cache, the blocklist and the pipeline stages.
///
/// Cheap to clone; clones share all state.
#[derive(Debug, Clone)]
pub struct ConversionService {
    inner: Arc<Inner>,
}

struct Inner {
    config: ServiceConfig,
    cache: CacheStore,
    blocklist: HostBlocklist,
    fetcher: Fetcher,
    rasterizer: Rasterizer,
    inflight: Mutex<HashMap<Fingerprint, SharedJob>>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .field("blocklist", &self.blocklist)
            .field("jobs_in_flight", &self.inflight().len())
            .finish_non_exhaustive()
    }
}

impl ConversionService {
    /// Create the state directories and a file-backed blocklist under `config`.
    pub fn new(config: ServiceConfig) -> Result<Self, Pdf2JpgError> {
        config.ensure_dirs()?;
        let store = Arc::new(FileHostStore::open(&config.blocklist_dir)?);
        let blocklist = HostBlocklist::new(store, config.blocklist);
        Self::with_blocklist(config, blocklist)
    }

    /// Like [`new`](Self::new) but with a caller-supplied blocklist.
    pub fn with_blocklist(
        config: ServiceConfig,
        blocklist: HostBlocklist,
    ) -> Result<Self, Pdf2JpgError> {
        config.ensure_dirs()?;
        let cache = CacheStore::open(&config.cache_dir)?;
        let fetcher = Fetcher::new(&config)?;
        let rasterizer = Rasterizer::new(config.rasterizer.clone(), &config.staging_dir);

        info!(
            cache = %config.cache_dir.display(),
            staging = %config.staging_dir.display(),
            rasterizer = %config.rasterizer.program.display(),
            "Conversion service ready"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                cache,
                blocklist,
                fetcher,
                rasterizer,
                inflight: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &CacheStore {
        &self.inner.cache
    }

    pub fn blocklist(&self) -> &HostBlocklist {
        &self.inner.blocklist
    }

    /// Number of jobs currently running.
    pub fn jobs_in_flight(&self) -> usize {
        self.inner.inflight().len()
    }

    /// Return the thumbnail for `raw_url`, converting it on a cache miss.
    pub async fn convert_url(&self, raw_url: &str) -> Result<Thumbnail, Pdf2JpgError> {
        let url = parse_url(raw_url)?;
        let fingerprint = Fingerprint::of(raw_url);

        if self.inner.cache.exists(&fingerprint).await {
            match self.inner.cache.read(&fingerprint).await {
                Ok(bytes) => {
                    debug!(url = raw_url, fingerprint = %fingerprint, "Cache hit");
                    return Ok(Thumbnail {
                        bytes,
                        fingerprint,
                        cached: true,
                    });
                }
                // Cleared between the lookup and the read; convert again.
                Err(Pdf2JpgError::NotCached { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let job = self.job_for(&fingerprint, url);
        let path = job.await.map_err(unshare)?;

        let bytes = tokio::fs::read(&path)
            .await
            .map_err(|e| Pdf2JpgError::io("Failed to read published image", &path, e))?;
        Ok(Thumbnail {
            bytes,
            fingerprint,
            cached: false,
        })
    }

    /// Join the running job for `fingerprint` or start one.
    fn job_for(&self, fingerprint: &Fingerprint, url: Url) -> SharedJob {
        let mut inflight = self.inner.inflight();
        if let Some(job) = inflight.get(fingerprint) {
            debug!(fingerprint = %fingerprint, "Joining in-flight conversion");
            return job.clone();
        }

        let inner = Arc::clone(&self.inner);
        let fp = fingerprint.clone();
        let handle = tokio::spawn(async move {
            let result = inner.produce(&fp, &url).await.map_err(Arc::new);
            inner.inflight().remove(&fp);
            result
        });

        let job = async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(Arc::new(Pdf2JpgError::Internal(format!(
                    "Conversion task failed: {e}"
                )))),
            }
        }
        .boxed()
        .shared();

        inflight.insert(fingerprint.clone(), job.clone());
        job
    }

    /// Convert a local PDF to `output` without touching cache or blocklist.
    ///
    /// The document is copied into the staging directory first so the
    /// rasterizer's path allowlist applies unchanged.
    pub async fn convert_file(&self, pdf: &Path, output: &Path) -> Result<PathBuf, Pdf2JpgError> {
        let fingerprint = Fingerprint::of(&pdf.to_string_lossy());
        let staging = StagingGuard::new(
            self.inner
                .config
                .staging_dir
                .join(fingerprint.staging_file_name()),
        );

        tokio::fs::copy(pdf, staging.path())
            .await
            .map_err(|e| Pdf2JpgError::io("Failed to stage", pdf, e))?;
        sniff::check_pdf_file(staging.path()).await?;
        self.inner.rasterizer.convert(staging.path(), output).await
    }

    /// Empty the directories covered by `scope`, returning the entry count.
    pub async fn clear(&self, scope: Scope) -> usize {
        let mut removed = 0;
        for part in scope.expand() {
            removed += match part {
                Scope::Images => janitor::clear_dir(&self.inner.config.cache_dir).await,
                Scope::Staging => janitor::clear_dir(&self.inner.config.staging_dir).await,
                Scope::Blocklist => match self.inner.blocklist.clear().await {
                    Ok(n) => n,
                    Err(e) => {
                        warn!(error = %e, "Failed to clear blocklist");
                        0
                    }
                },
                Scope::All => 0,
            };
        }
        info!(scope = %scope, removed, "Cleared");
        removed
    }
}

impl Inner {
    fn inflight(&self) -> std::sync::MutexGuard<'_, HashMap<Fingerprint, SharedJob>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one conversion job and log its failure, if any.
    async fn produce(&self, fingerprint: &Fingerprint, url: &Url) -> Result<PathBuf, Pdf2JpgError> {
        let result = self.run_job(fingerprint, url).await;
        if let Err((stage, e)) = &result {
            let stage = *stage;
            if e.status_code() >= 500 {
                error!(url = %url, fingerprint = %fingerprint, stage, error = %e, "Conversion request failed");
            } else {
                warn!(url = %url, fingerprint = %fingerprint, stage, error = %e, "Conversion request failed");
            }
        }
        result.map_err(|(_, e)| e)
    }

    async fn run_job(
        &self,
        fingerprint: &Fingerprint,
        url: &Url,
    ) -> Result<PathBuf, (&'static str, Pdf2JpgError)> {
        // Another request may have finished this one between our cache
        // lookup and the job starting.
        if self.cache.exists(fingerprint).await {
            return Ok(self.cache.artifact_path(fingerprint));
        }

        let host = url.host_str().unwrap_or_default().to_owned();

        // ── Step 1: Blocklist ────────────────────────────────────────────
        let blocked = self
            .blocklist
            .is_blocked(&host)
            .await
            .map_err(|e| ("blocklist", e))?;
        if blocked {
            return Err(("blocklist", Pdf2JpgError::HostBlocked { host }));
        }

        // ── Step 2: Fetch ────────────────────────────────────────────────
        let staging = StagingGuard::new(
            self.config
                .staging_dir
                .join(fingerprint.staging_file_name()),
        );
        // With conversion failures penalised, the host is only cleared once
        // its document made it into the cache.
        let penalize = self.config.blocklist.penalize_conversion_failures;
        let downloaded = match self.fetcher.fetch(url.as_str(), staging.path()).await {
            Ok(FetchOutcome::Downloaded { .. }) => {
                if !penalize {
                    self.note_success(&host).await;
                }
                true
            }
            Ok(FetchOutcome::Reused) => false,
            Err(e) => {
                if e.is_host_failure() {
                    self.note_failure(&host).await;
                }
                return Err(("fetch", e));
            }
        };

        // ── Step 3: Validate + rasterize ─────────────────────────────────
        let scratch = self.cache.scratch_path(fingerprint);
        let converted = match sniff::check_pdf_file(staging.path()).await {
            Ok(()) => self.rasterizer.convert(staging.path(), &scratch).await,
            Err(e) => Err(e),
        };
        if let Err(e) = converted {
            if penalize && matches!(e, Pdf2JpgError::ConversionFailed { .. }) {
                self.note_failure(&host).await;
            }
            return Err(("convert", e));
        }

        // ── Step 4: Publish ──────────────────────────────────────────────
        match self.cache.publish(fingerprint, &scratch).await {
            Ok(path) => {
                info!(url = %url, fingerprint = %fingerprint, "Thumbnail published");
                if penalize && downloaded {
                    self.note_success(&host).await;
                }
                Ok(path)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&scratch).await;
                Err(("publish", e))
            }
        }
    }

    async fn note_failure(&self, host: &str) {
        if let Err(e) = self.blocklist.record_failure(host).await {
            warn!(host, error = %e, "Failed to record host failure");
        }
    }

    async fn note_success(&self, host: &str) {
        if let Err(e) = self.blocklist.record_success(host).await {
            warn!(host, error = %e, "Failed to record host success");
        }
    }
}

/// Check that `raw` is an absolute http(s) URL with a host.
pub fn parse_url(raw: &str) -> Result<Url, Pdf2JpgError> {
    let invalid = |reason: String| Pdf2JpgError::InvalidRequest { reason };

    if raw.trim().is_empty() {
        return Err(invalid("missing url".into()));
    }
    let url = Url::parse(raw).map_err(|e| invalid(format!("invalid url: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(invalid("url has no host".into()));
    }
    Ok(url)
}

fn unshare(err: Arc<Pdf2JpgError>) -> Pdf2JpgError {
    Arc::try_unwrap(err).unwrap_or_else(|shared| shared.duplicate())
}

/// Deletes the staging file when the job ends, however it ends.
struct StagingGuard {
    path: PathBuf,
}

impl StagingGuard {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed staging file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove staging file"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_url_accepts_http_and_https() {
        assert!(parse_url("http://example.com/a.pdf").is_ok());
        assert!(parse_url("https://example.com/a.pdf?x=1").is_ok());
    }

    #[test]
    fn parse_url_rejects_garbage() {
        for raw in ["", "   ", "not a url", "ftp://example.com/a.pdf", "file:///etc/passwd"] {
            let err = parse_url(raw).unwrap_err();
            assert!(
                matches!(err, Pdf2JpgError::InvalidRequest { .. }),
                "{raw:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn staging_guard_removes_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("x.pdf");
        std::fs::write(&path, b"%PDF-").unwrap();
        {
            let _guard = StagingGuard::new(path.clone());
        }
        assert!(!path.exists());
        // Missing file is fine.
        drop(StagingGuard::new(path));
    }

    #[tokio::test]
    async fn invalid_url_touches_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let service = ConversionService::new(ServiceConfig::with_base_dir(tmp.path())).unwrap();

        let err = service.convert_url("javascript:alert(1)").await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        assert_eq!(service.jobs_in_flight(), 0);
        assert_eq!(std::fs::read_dir(&service.config().staging_dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn cache_hit_skips_network() {
        let tmp = tempfile::tempdir().unwrap();
        let service = ConversionService::new(ServiceConfig::with_base_dir(tmp.path())).unwrap();
        let url = "http://192.0.2.1:9/cached.pdf";
        let fp = Fingerprint::of(url);
        std::fs::write(service.cache().artifact_path(&fp), b"\xFF\xD8\xFFcached").unwrap();

        let thumb = service.convert_url(url).await.unwrap();
        assert!(thumb.cached);
        assert_eq!(thumb.bytes, b"\xFF\xD8\xFFcached");
        assert_eq!(thumb.fingerprint, fp);
    }

    #[tokio::test]
    async fn clear_all_sums_scopes() {
        let tmp = tempfile::tempdir().unwrap();
        let service = ConversionService::new(ServiceConfig::with_base_dir(tmp.path())).unwrap();
        let cfg = service.config().clone();
        std::fs::write(cfg.cache_dir.join("a.jpg"), b"x").unwrap();
        std::fs::write(cfg.staging_dir.join("a.pdf"), b"x").unwrap();
        service.blocklist().record_failure("h.example").await.unwrap();

        assert_eq!(service.clear(Scope::Images).await, 1);
        assert_eq!(service.clear(Scope::All).await, 2);
    }
}
