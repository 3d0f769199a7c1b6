//! Download Fetcher: pull a remote PDF into its staging path.
//!
//! ## Why stream to a `.part` file?
//!
//! Origins are untrusted. Streaming the body chunk by chunk keeps memory flat
//! no matter what a server sends, and writing to `<dest>.part` means the
//! staging path only ever holds a complete, validated download. Any failure
//! (timeout, oversize body, wrong content type) deletes the partial file.

use crate::config::ServiceConfig;
use crate::error::Pdf2JpgError;
use crate::pipeline::sniff;
use futures::StreamExt;
use reqwest::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// What [`Fetcher::fetch`] did to satisfy the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The staging file already existed; no network call was made.
    Reused,
    /// The document was downloaded and validated.
    Downloaded { bytes: u64 },
}

/// HTTP downloader with a hard overall deadline and a body size cap.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    timeout: Duration,
    max_bytes: u64,
}

impl Fetcher {
    pub fn new(config: &ServiceConfig) -> Result<Self, Pdf2JpgError> {
        let timeout = config.download_timeout();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| Pdf2JpgError::Internal(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            timeout,
            max_bytes: config.max_download_bytes,
        })
    }

    /// Download `url` into `dest`.
    ///
    /// An existing `dest` is taken as a finished earlier download and reused
    /// without touching the network.
    pub async fn fetch(&self, url: &str, dest: &Path) -> Result<FetchOutcome, Pdf2JpgError> {
        if tokio::fs::try_exists(dest).await.unwrap_or(false) {
            debug!(url, path = %dest.display(), "Staging file present, skipping download");
            return Ok(FetchOutcome::Reused);
        }

        info!(url, "Downloading PDF");
        let part = part_path(dest);

        let streamed = match tokio::time::timeout(self.timeout, self.stream_to(url, &part)).await {
            Ok(result) => result,
            Err(_elapsed) => Err(Pdf2JpgError::download(url, "timeout")),
        };

        let (bytes, header_checked) = match streamed {
            Ok(v) => v,
            Err(e) => {
                discard(&part).await;
                return Err(e);
            }
        };

        if !header_checked {
            let sniffed = sniff::sniff_file_mime(&part).await;
            match sniffed {
                Ok(Some("application/pdf")) => {}
                Ok(other) => {
                    warn!(url, sniffed = ?other, "Header-less response is not a PDF");
                    discard(&part).await;
                    return Err(Pdf2JpgError::download(url, "not a pdf"));
                }
                Err(e) => {
                    discard(&part).await;
                    return Err(e);
                }
            }
        }

        if let Err(e) = tokio::fs::rename(&part, dest).await {
            discard(&part).await;
            return Err(Pdf2JpgError::io("Failed to move download into", dest, e));
        }

        info!(url, bytes, path = %dest.display(), "Downloaded PDF");
        Ok(FetchOutcome::Downloaded { bytes })
    }

    /// Issue the GET and stream the body into `part`.
    ///
    /// Returns the byte count and whether the `Content-Type` header already
    /// vouched for the payload.
    async fn stream_to(&self, url: &str, part: &Path) -> Result<(u64, bool), Pdf2JpgError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| request_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Pdf2JpgError::download(url, format!("HTTP {status}")));
        }

        // Reject on the header alone when possible; no point pulling the body.
        let header_checked = match declared_pdf(response.headers().get(CONTENT_TYPE)) {
            Ok(checked) => checked,
            Err(ct) => {
                warn!(url, content_type = %ct, "Origin did not serve a PDF");
                return Err(Pdf2JpgError::download(url, "not a pdf"));
            }
        };

        let declared = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        if declared.is_some_and(|len| len > self.max_bytes) {
            return Err(Pdf2JpgError::download(url, "too large"));
        }

        let mut file = tokio::fs::File::create(part)
            .await
            .map_err(|e| Pdf2JpgError::io("Failed to create staging file", part, e))?;

        let mut written: u64 = 0;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| request_error(url, e))?;
            written += chunk.len() as u64;
            if written > self.max_bytes {
                return Err(Pdf2JpgError::download(url, "too large"));
            }
            file.write_all(&chunk)
                .await
                .map_err(|e| Pdf2JpgError::io("Failed to write staging file", part, e))?;
        }
        file.flush()
            .await
            .map_err(|e| Pdf2JpgError::io("Failed to flush staging file", part, e))?;

        Ok((written, header_checked))
    }
}

/// What the `Content-Type` header says about the body.
///
/// `Ok(true)` if it names a PDF, `Ok(false)` if there is no header and the
/// body has to be sniffed. Any other value, including one that is not valid
/// text, comes back as `Err` for the log.
fn declared_pdf(value: Option<&HeaderValue>) -> Result<bool, String> {
    let Some(value) = value else {
        return Ok(false);
    };
    match value.to_str() {
        Ok(ct) if sniff::is_pdf_content_type(ct) => Ok(true),
        Ok(ct) => Err(ct.to_owned()),
        Err(_) => Err(String::from_utf8_lossy(value.as_bytes()).into_owned()),
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

fn request_error(url: &str, e: reqwest::Error) -> Pdf2JpgError {
    if e.is_timeout() {
        Pdf2JpgError::download(url, "timeout")
    } else {
        Pdf2JpgError::download(url, e.to_string())
    }
}

async fn discard(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove partial download"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_path_is_sibling() {
        let p = part_path(Path::new("/tmp/in/abc.pdf"));
        assert_eq!(p, PathBuf::from("/tmp/in/abc.pdf.part"));
    }

    #[test]
    fn content_type_header_decides_or_defers() {
        assert_eq!(declared_pdf(None), Ok(false));
        assert_eq!(
            declared_pdf(Some(&HeaderValue::from_static("application/pdf"))),
            Ok(true)
        );
        assert!(declared_pdf(Some(&HeaderValue::from_static("text/html"))).is_err());
    }

    #[test]
    fn unreadable_content_type_is_not_treated_as_missing() {
        let raw = HeaderValue::from_bytes(b"application/pdf\xff").unwrap();
        assert!(raw.to_str().is_err());
        assert!(declared_pdf(Some(&raw)).is_err());
    }

    #[tokio::test]
    async fn existing_destination_is_reused_without_network() {
        let tmp = tempfile::tempdir().unwrap();
        let dest = tmp.path().join("x.pdf");
        std::fs::write(&dest, b"%PDF-1.4\n%%EOF").unwrap();

        let fetcher = Fetcher::new(&ServiceConfig::with_base_dir(tmp.path())).unwrap();
        // Port 9 (discard) on a reserved TEST-NET address: would fail if dialled.
        let outcome = fetcher.fetch("http://192.0.2.1:9/x.pdf", &dest).await.unwrap();
        assert_eq!(outcome, FetchOutcome::Reused);
    }
}
