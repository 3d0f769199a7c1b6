//! Structured outcome of one conversion, for callers on the far side of a
//! process boundary.
//!
//! The CLI `convert` subcommand prints this as a single JSON line on stdout,
//! so a supervisor that runs conversions out of process can parse the result
//! instead of scraping logs.

use crate::error::Pdf2JpgError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Exit code reported for a successful conversion.
pub const CODE_OK: i32 = 0;
/// Exit code reported for any failure.
pub const CODE_FAILED: i32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionReport {
    pub success: bool,
    pub message: String,
    pub code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_file: Option<PathBuf>,
}

impl ConversionReport {
    pub fn success(subject: &str, saved_file: PathBuf) -> Self {
        Self {
            success: true,
            message: format!("{subject} image conversion success."),
            code: CODE_OK,
            saved_file: Some(saved_file),
        }
    }

    pub fn failure(err: &Pdf2JpgError) -> Self {
        Self {
            success: false,
            message: err.to_string(),
            code: CODE_FAILED,
            saved_file: None,
        }
    }

    /// Build a report from the result of converting `subject`.
    pub fn from_result(subject: &str, result: &Result<PathBuf, Pdf2JpgError>) -> Self {
        match result {
            Ok(path) => Self::success(subject, path.clone()),
            Err(e) => Self::failure(e),
        }
    }

    pub fn to_json(&self) -> Result<String, Pdf2JpgError> {
        serde_json::to_string(self)
            .map_err(|e| Pdf2JpgError::Internal(format!("Failed to serialise report: {e}")))
    }
}
