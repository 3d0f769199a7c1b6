//! Configuration types for the conversion service.
//!
//! All service behaviour is controlled through [`ServiceConfig`], built via
//! its [`ServiceConfigBuilder`]. The config is created once at startup,
//! [`ServiceConfig::ensure_dirs`] prepares the state directories, and from
//! then on it is only read: every component receives the values it needs at
//! construction time instead of consulting globals.

use crate::error::Pdf2JpgError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the conversion service.
///
/// # Example
/// ```rust
/// use pdf2jpg::ServiceConfig;
///
/// let config = ServiceConfig::builder()
///     .base_dir("/var/lib/pdf2jpg")
///     .download_timeout_secs(10)
///     .failure_threshold(5)
///     .build()
///     .unwrap();
/// assert!(config.cache_dir.ends_with("out"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Downloaded PDFs, one `<fingerprint>.pdf` per in-flight request.
    pub staging_dir: PathBuf,

    /// Finished thumbnails, one `<fingerprint>.jpg` per URL.
    pub cache_dir: PathBuf,

    /// One `<host>.status` file per failing host.
    pub blocklist_dir: PathBuf,

    /// Directory served by `GET /log?file=`.
    pub log_dir: PathBuf,

    /// Upper bound on the whole download, headers and body. Default: 20.
    pub download_timeout_secs: u64,

    /// Largest body accepted from an origin. Default: 100 MiB.
    ///
    /// An origin streaming forever would otherwise keep a request alive until
    /// the timeout while filling the staging disk.
    pub max_download_bytes: u64,

    /// Redirect hops followed before giving up. Default: 5.
    pub max_redirects: usize,

    /// `User-Agent` sent to origins.
    pub user_agent: String,

    /// External rasterizer settings.
    pub rasterizer: RasterizerConfig,

    /// Host failure backoff settings.
    pub blocklist: BlocklistPolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::with_base_dir(std::env::temp_dir().join("pdf2jpg"))
    }
}

impl ServiceConfig {
    /// Create a new builder for `ServiceConfig`.
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder {
            config: Self::default(),
        }
    }

    /// Defaults with every state directory placed under `base`.
    pub fn with_base_dir(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        Self {
            staging_dir: base.join("in"),
            cache_dir: base.join("out"),
            blocklist_dir: base.join("status"),
            log_dir: base.join("logs"),
            download_timeout_secs: 20,
            max_download_bytes: 100 * 1024 * 1024,
            max_redirects: 5,
            user_agent: concat!("pdf2jpg/", env!("CARGO_PKG_VERSION")).to_string(),
            rasterizer: RasterizerConfig::default(),
            blocklist: BlocklistPolicy::default(),
        }
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    /// Create the staging, cache, blocklist and log directories.
    pub fn ensure_dirs(&self) -> Result<(), Pdf2JpgError> {
        for dir in [
            &self.staging_dir,
            &self.cache_dir,
            &self.blocklist_dir,
            &self.log_dir,
        ] {
            std::fs::create_dir_all(dir)
                .map_err(|e| Pdf2JpgError::io("Failed to create directory", dir, e))?;
        }
        Ok(())
    }
}

/// Builder for [`ServiceConfig`].
#[derive(Debug)]
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
}

impl ServiceConfigBuilder {
    /// Re-derive all four state directories from `base`.
    pub fn base_dir(mut self, base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        self.config.staging_dir = base.join("in");
        self.config.cache_dir = base.join("out");
        self.config.blocklist_dir = base.join("status");
        self.config.log_dir = base.join("logs");
        self
    }

    pub fn staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.staging_dir = dir.into();
        self
    }

    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.cache_dir = dir.into();
        self
    }

    pub fn blocklist_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.blocklist_dir = dir.into();
        self
    }

    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.log_dir = dir.into();
        self
    }

    pub fn download_timeout_secs(mut self, secs: u64) -> Self {
        self.config.download_timeout_secs = secs.max(1);
        self
    }

    pub fn max_download_bytes(mut self, bytes: u64) -> Self {
        self.config.max_download_bytes = bytes;
        self
    }

    pub fn max_redirects(mut self, n: usize) -> Self {
        self.config.max_redirects = n;
        self
    }

    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.config.user_agent = ua.into();
        self
    }

    pub fn rasterizer(mut self, rasterizer: RasterizerConfig) -> Self {
        self.config.rasterizer = rasterizer;
        self
    }

    pub fn rasterizer_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.config.rasterizer.program = program.into();
        self
    }

    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.rasterizer.dpi = dpi.clamp(36, 600);
        self
    }

    pub fn conversion_timeout_secs(mut self, secs: u64) -> Self {
        self.config.rasterizer.timeout_secs = secs.max(1);
        self
    }

    pub fn blocklist(mut self, policy: BlocklistPolicy) -> Self {
        self.config.blocklist = policy;
        self
    }

    pub fn failure_threshold(mut self, n: u32) -> Self {
        self.config.blocklist.failure_threshold = n.max(1);
        self
    }

    pub fn block_duration_secs(mut self, secs: u64) -> Self {
        self.config.blocklist.block_duration_secs = secs;
        self
    }

    pub fn recheck_secs(mut self, secs: u64) -> Self {
        self.config.blocklist.recheck_secs = secs;
        self
    }

    pub fn penalize_conversion_failures(mut self, v: bool) -> Self {
        self.config.blocklist.penalize_conversion_failures = v;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ServiceConfig, Pdf2JpgError> {
        let c = &self.config;
        if c.rasterizer.program.as_os_str().is_empty() {
            return Err(Pdf2JpgError::InvalidConfig(
                "rasterizer program must not be empty".into(),
            ));
        }
        if c.blocklist.recheck_secs > c.blocklist.block_duration_secs {
            return Err(Pdf2JpgError::InvalidConfig(format!(
                "recheck interval ({}s) must not exceed block duration ({}s)",
                c.blocklist.recheck_secs, c.blocklist.block_duration_secs
            )));
        }
        if c.max_download_bytes == 0 {
            return Err(Pdf2JpgError::InvalidConfig(
                "max download size must be > 0".into(),
            ));
        }
        Ok(self.config)
    }
}

/// How the external rasterizer is invoked.
///
/// The default targets Ghostscript. Any tool that accepts the same
/// `-o <output> <input>` shape and writes a JPEG can be swapped in through
/// `program` and `extra_args`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RasterizerConfig {
    /// Executable, looked up on `PATH` when not absolute. Default: `gs`.
    pub program: PathBuf,

    /// Render resolution. Default: 150.
    pub dpi: u32,

    /// Hard wall-clock deadline for one conversion. Default: 60.
    pub timeout_secs: u64,

    /// Extra arguments inserted before `-o`.
    pub extra_args: Vec<String>,
}

impl Default for RasterizerConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("gs"),
            dpi: 150,
            timeout_secs: 60,
            extra_args: Vec::new(),
        }
    }
}

impl RasterizerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Parameters of the per-host failure backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlocklistPolicy {
    /// Failures inside one block window before a host is blocked. Default: 10.
    pub failure_threshold: u32,

    /// Seconds after the last failure at which a record expires. Default: 3600.
    pub block_duration_secs: u64,

    /// Seconds after the last failure at which one retry is let through. Default: 60.
    pub recheck_secs: u64,

    /// Whether a failed conversion also counts as a host failure. Default: true.
    ///
    /// A host that keeps serving PDFs the rasterizer chokes on costs a full
    /// download plus a conversion deadline per request.
    pub penalize_conversion_failures: bool,
}

impl Default for BlocklistPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 10,
            block_duration_secs: 3600,
            recheck_secs: 60,
            penalize_conversion_failures: true,
        }
    }
}

impl BlocklistPolicy {
    pub fn block_duration(&self) -> Duration {
        Duration::from_secs(self.block_duration_secs)
    }

    pub fn recheck_interval(&self) -> Duration {
        Duration::from_secs(self.recheck_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = ServiceConfig::default();
        assert_eq!(c.download_timeout_secs, 20);
        assert_eq!(c.rasterizer.dpi, 150);
        assert_eq!(c.rasterizer.timeout_secs, 60);
        assert_eq!(c.blocklist.failure_threshold, 10);
        assert_eq!(c.blocklist.block_duration_secs, 3600);
        assert_eq!(c.blocklist.recheck_secs, 60);
        assert!(c.blocklist.penalize_conversion_failures);
    }

    #[test]
    fn base_dir_derives_all_scopes() {
        let c = ServiceConfig::builder().base_dir("/srv/p2j").build().unwrap();
        assert_eq!(c.staging_dir, PathBuf::from("/srv/p2j/in"));
        assert_eq!(c.cache_dir, PathBuf::from("/srv/p2j/out"));
        assert_eq!(c.blocklist_dir, PathBuf::from("/srv/p2j/status"));
        assert_eq!(c.log_dir, PathBuf::from("/srv/p2j/logs"));
    }

    #[test]
    fn recheck_longer_than_block_is_rejected() {
        let err = ServiceConfig::builder()
            .block_duration_secs(30)
            .recheck_secs(60)
            .build()
            .unwrap_err();
        assert!(matches!(err, Pdf2JpgError::InvalidConfig(_)));
    }

    #[test]
    fn ensure_dirs_creates_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let c = ServiceConfig::with_base_dir(tmp.path());
        c.ensure_dirs().unwrap();
        assert!(c.staging_dir.is_dir());
        assert!(c.cache_dir.is_dir());
        assert!(c.blocklist_dir.is_dir());
        assert!(c.log_dir.is_dir());
    }
}
