//! Filesystem-backed thumbnail cache.
//!
//! An entry is "ready" exactly when `<cache_dir>/<fingerprint>.jpg` exists.
//! There is no index or manifest to drift out of sync: the directory listing
//! is the cache. Artifacts only ever appear at their canonical path through a
//! rename, so a reader sees either nothing or a complete JPEG.

use crate::error::Pdf2JpgError;
use crate::fingerprint::Fingerprint;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Content-addressed store of finished thumbnails.
#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    /// Wrap an existing directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Wrap `dir`, creating it when missing.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, Pdf2JpgError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|e| Pdf2JpgError::io("Failed to create cache directory", &dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The one path an artifact for `fp` may live at.
    pub fn artifact_path(&self, fp: &Fingerprint) -> PathBuf {
        self.dir.join(fp.artifact_file_name())
    }

    /// Scratch path the rasterizer writes to before [`publish`](Self::publish).
    ///
    /// Lives inside the cache directory so the final rename never crosses a
    /// filesystem boundary. The leading dot keeps it out of any `*.jpg` glob.
    pub fn scratch_path(&self, fp: &Fingerprint) -> PathBuf {
        self.dir
            .join(format!(".{}.{}.partial.jpg", fp, std::process::id()))
    }

    pub async fn exists(&self, fp: &Fingerprint) -> bool {
        tokio::fs::metadata(self.artifact_path(fp))
            .await
            .is_ok_and(|m| m.is_file())
    }

    pub async fn read(&self, fp: &Fingerprint) -> Result<Vec<u8>, Pdf2JpgError> {
        let path = self.artifact_path(fp);
        tokio::fs::read(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => Pdf2JpgError::NotCached {
                fingerprint: fp.to_string(),
            },
            _ => Pdf2JpgError::io("Failed to read cached image", path, e),
        })
    }

    /// Atomically install `artifact` as the cache entry for `fp`.
    ///
    /// Publishing the same fingerprint twice is fine; the later rename wins.
    /// When `artifact` sits on another filesystem it is first copied into a
    /// temp file inside the cache directory and that file is renamed instead.
    pub async fn publish(&self, fp: &Fingerprint, artifact: &Path) -> Result<PathBuf, Pdf2JpgError> {
        let dest = self.artifact_path(fp);

        match tokio::fs::rename(artifact, &dest).await {
            Ok(()) => {
                debug!(fingerprint = %fp, path = %dest.display(), "Published artifact");
                Ok(dest)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(Pdf2JpgError::io("Artifact to publish is missing", artifact, e))
            }
            Err(e) => {
                warn!(
                    fingerprint = %fp,
                    error = %e,
                    "Rename into cache failed, falling back to copy"
                );
                self.publish_by_copy(artifact, &dest).await?;
                if let Err(e) = tokio::fs::remove_file(artifact).await {
                    warn!(path = %artifact.display(), error = %e, "Failed to remove published source");
                }
                Ok(dest)
            }
        }
    }

    async fn publish_by_copy(&self, artifact: &Path, dest: &Path) -> Result<(), Pdf2JpgError> {
        let artifact = artifact.to_path_buf();
        let dest = dest.to_path_buf();
        let dir = self.dir.clone();

        tokio::task::spawn_blocking(move || {
            let mut tmp = tempfile::Builder::new()
                .prefix(".publish-")
                .tempfile_in(&dir)
                .map_err(|e| Pdf2JpgError::io("Failed to create temp file in", &dir, e))?;
            let mut src = std::fs::File::open(&artifact)
                .map_err(|e| Pdf2JpgError::io("Failed to open artifact", &artifact, e))?;
            std::io::copy(&mut src, tmp.as_file_mut())
                .map_err(|e| Pdf2JpgError::io("Failed to copy artifact", &artifact, e))?;
            tmp.as_file()
                .sync_all()
                .map_err(|e| Pdf2JpgError::io("Failed to sync artifact", tmp.path(), e))?;
            tmp.persist(&dest)
                .map_err(|e| Pdf2JpgError::io("Failed to publish artifact", &dest, e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| Pdf2JpgError::Internal(format!("Publish task panicked: {e}")))?
    }
}
