//! Error types for the pdf2jpg library.
//!
//! Every stage of a `/convert` request reports failure through a single
//! [`Pdf2JpgError`] enum. Each variant knows which HTTP status it maps to
//! ([`Pdf2JpgError::status_code`]) and whether it counts against the origin
//! host in the blocklist ([`Pdf2JpgError::is_host_failure`]), so the request
//! boundary never has to guess.

use std::path::PathBuf;
use thiserror::Error;

/// All errors returned by the pdf2jpg library.
#[derive(Debug, Error)]
pub enum Pdf2JpgError {
    // ── Request errors ────────────────────────────────────────────────────
    /// Missing or syntactically invalid URL. No state is touched.
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// The origin host is currently blocked; no network call was made.
    #[error("Host '{host}' is temporarily blocked after repeated failures")]
    HostBlocked { host: String },

    // ── Pipeline errors ───────────────────────────────────────────────────
    /// Network error, timeout, oversized body or non-PDF payload.
    #[error("Failed to download '{url}': {reason}")]
    DownloadFailed { url: String, reason: String },

    /// The rasterizer rejected the input, timed out or exited non-zero.
    #[error("Conversion failed: {reason}")]
    ConversionFailed { reason: String },

    /// The cache holds no artifact for this fingerprint.
    #[error("No cached image for fingerprint {fingerprint}")]
    NotCached { fingerprint: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Filesystem failure around staging, publish or cleanup.
    #[error("{context} '{path}': {source}")]
    Io {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Pdf2JpgError {
    /// Shorthand for a [`Pdf2JpgError::DownloadFailed`].
    pub fn download(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DownloadFailed {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a [`Pdf2JpgError::ConversionFailed`].
    pub fn conversion(reason: impl Into<String>) -> Self {
        Self::ConversionFailed {
            reason: reason.into(),
        }
    }

    /// Wrap an `io::Error` with what was being done and to which path.
    pub fn io(context: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            context,
            path: path.into(),
            source,
        }
    }

    /// A copy of this error for another waiter on the same job.
    ///
    /// `io::Error` is not `Clone`; its kind and message are carried over.
    pub fn duplicate(&self) -> Self {
        match self {
            Self::InvalidRequest { reason } => Self::InvalidRequest {
                reason: reason.clone(),
            },
            Self::HostBlocked { host } => Self::HostBlocked { host: host.clone() },
            Self::DownloadFailed { url, reason } => Self::download(url.clone(), reason.clone()),
            Self::ConversionFailed { reason } => Self::conversion(reason.clone()),
            Self::NotCached { fingerprint } => Self::NotCached {
                fingerprint: fingerprint.clone(),
            },
            Self::Io {
                context,
                path,
                source,
            } => Self::io(
                *context,
                path.clone(),
                std::io::Error::new(source.kind(), source.to_string()),
            ),
            Self::InvalidConfig(msg) => Self::InvalidConfig(msg.clone()),
            Self::Internal(msg) => Self::Internal(msg.clone()),
        }
    }

    /// HTTP status the request boundary answers with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest { .. } | Self::HostBlocked { .. } | Self::DownloadFailed { .. } => {
                400
            }
            Self::ConversionFailed { .. } | Self::NotCached { .. } => 404,
            Self::Io { .. } | Self::InvalidConfig(_) | Self::Internal(_) => 500,
        }
    }

    /// Whether this failure was caused by the remote document or its host.
    ///
    /// Only download failures qualify unconditionally; conversion failures
    /// are penalised according to
    /// [`crate::config::BlocklistPolicy::penalize_conversion_failures`].
    pub fn is_host_failure(&self) -> bool {
        matches!(self, Self::DownloadFailed { .. })
    }

    /// Short machine-friendly reason, e.g. `"timeout"` or `"not a pdf"`.
    pub fn reason(&self) -> String {
        match self {
            Self::InvalidRequest { reason }
            | Self::DownloadFailed { reason, .. }
            | Self::ConversionFailed { reason } => reason.clone(),
            Self::HostBlocked { .. } => "host blocked".into(),
            Self::NotCached { .. } => "not cached".into(),
            Self::Io { context, .. } => (*context).into(),
            Self::InvalidConfig(msg) | Self::Internal(msg) => msg.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(
            Pdf2JpgError::InvalidRequest {
                reason: "missing url".into()
            }
            .status_code(),
            400
        );
        assert_eq!(
            Pdf2JpgError::HostBlocked {
                host: "example.com".into()
            }
            .status_code(),
            400
        );
        assert_eq!(Pdf2JpgError::download("u", "timeout").status_code(), 400);
        assert_eq!(Pdf2JpgError::conversion("nonzero exit").status_code(), 404);
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        assert_eq!(Pdf2JpgError::io("Failed to publish", "/x", io).status_code(), 500);
    }

    #[test]
    fn only_download_failures_count_against_host() {
        assert!(Pdf2JpgError::download("u", "not a pdf").is_host_failure());
        assert!(!Pdf2JpgError::conversion("timeout").is_host_failure());
        assert!(!Pdf2JpgError::HostBlocked { host: "h".into() }.is_host_failure());
    }

    #[test]
    fn duplicate_keeps_variant_and_message() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        let first = Pdf2JpgError::io("Failed to publish", "/out/x.jpg", io);
        let copy = first.duplicate();
        assert_eq!(copy.to_string(), first.to_string());
        assert_eq!(copy.status_code(), 500);

        let blocked = Pdf2JpgError::HostBlocked { host: "h".into() }.duplicate();
        assert!(matches!(blocked, Pdf2JpgError::HostBlocked { host } if host == "h"));
    }

    #[test]
    fn download_failed_display() {
        let e = Pdf2JpgError::download("https://example.com/a.pdf", "not a pdf");
        let msg = e.to_string();
        assert!(msg.contains("example.com/a.pdf"), "got: {msg}");
        assert!(msg.contains("not a pdf"), "got: {msg}");
        assert_eq!(e.reason(), "not a pdf");
    }
}
