//! Bulk cleanup of the runtime directories.

use crate::error::Pdf2JpgError;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Which runtime directory to empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Cached thumbnails.
    Images,
    /// Downloaded PDFs.
    Staging,
    /// Host failure records.
    Blocklist,
    /// All of the above.
    All,
}

impl Scope {
    /// The concrete scopes this one covers.
    pub fn expand(self) -> &'static [Scope] {
        match self {
            Scope::Images => &[Scope::Images],
            Scope::Staging => &[Scope::Staging],
            Scope::Blocklist => &[Scope::Blocklist],
            Scope::All => &[Scope::Images, Scope::Staging, Scope::Blocklist],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scope::Images => "images",
            Scope::Staging => "staging",
            Scope::Blocklist => "blocklist",
            Scope::All => "all",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = Pdf2JpgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "images" | "img" => Ok(Scope::Images),
            "staging" | "pdf" => Ok(Scope::Staging),
            "blocklist" | "blocks" => Ok(Scope::Blocklist),
            "all" => Ok(Scope::All),
            other => Err(Pdf2JpgError::InvalidRequest {
                reason: format!("unknown scope '{other}'"),
            }),
        }
    }
}

/// Delete every entry in `dir`, returning how many were removed.
///
/// Best effort: an entry that cannot be removed is logged and skipped. A
/// missing directory counts as already empty.
pub async fn clear_dir(dir: &Path) -> usize {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(dir = %dir.display(), "Nothing to clear");
            return 0;
        }
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Failed to list directory");
            return 0;
        }
    };

    let mut removed = 0;
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Failed to read directory entry");
                break;
            }
        };
        let path = entry.path();
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        let result = if is_dir {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match result {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete"),
        }
    }

    info!(dir = %dir.display(), removed, "Cleared directory");
    removed
}
