//! Cheap content checks: is this plausibly a PDF?
//!
//! None of this parses PDF structure. The header check catches HTML error
//! pages served with a 200, and the `%%EOF` check catches truncated
//! downloads, which is enough to keep obviously broken input away from the
//! rasterizer.

use crate::error::Pdf2JpgError;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt};

const PDF_MAGIC: &[u8] = b"%PDF-";
const PDF_EOF: &[u8] = b"%%EOF";

/// Read size used when scanning a staged file for the trailer.
const SCAN_CHUNK: usize = 64 * 1024;

/// MIME types origins use for PDF documents.
const PDF_MIME_TYPES: &[&str] = &["application/pdf", "application/x-pdf"];

/// `true` if `buf` starts with `%PDF-` and carries an `%%EOF` marker later on.
pub fn is_plausible_pdf(buf: &[u8]) -> bool {
    buf.starts_with(PDF_MAGIC)
        && buf[PDF_MAGIC.len()..]
            .windows(PDF_EOF.len())
            .any(|w| w == PDF_EOF)
}

/// Apply [`is_plausible_pdf`] to a file on disk.
///
/// Only the header is read up front; the rest is scanned for `%%EOF` in
/// fixed-size chunks, so memory stays flat for large documents.
pub async fn check_pdf_file(path: &Path) -> Result<(), Pdf2JpgError> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| Pdf2JpgError::io("Failed to open staged PDF", path, e))?;
    let plausible = scan_pdf(file, SCAN_CHUNK)
        .await
        .map_err(|e| Pdf2JpgError::io("Failed to read staged PDF", path, e))?;
    if plausible {
        Ok(())
    } else {
        Err(Pdf2JpgError::conversion("corrupt pdf"))
    }
}

/// Streaming form of [`is_plausible_pdf`].
async fn scan_pdf<R>(mut reader: R, chunk: usize) -> std::io::Result<bool>
where
    R: AsyncRead + Unpin,
{
    let mut head = [0u8; PDF_MAGIC.len()];
    match reader.read_exact(&mut head).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(false),
        Err(e) => return Err(e),
    }
    if head[..] != *PDF_MAGIC {
        return Ok(false);
    }

    // Keep the last `PDF_EOF.len() - 1` bytes so a marker split across two
    // reads is still found.
    let keep = PDF_EOF.len() - 1;
    let mut buf = vec![0u8; keep + chunk.max(1)];
    let mut carried = 0;
    loop {
        let n = reader.read(&mut buf[carried..]).await?;
        if n == 0 {
            return Ok(false);
        }
        let filled = carried + n;
        if buf[..filled].windows(PDF_EOF.len()).any(|w| w == PDF_EOF) {
            return Ok(true);
        }
        carried = filled.min(keep);
        buf.copy_within(filled - carried..filled, 0);
    }
}

/// Whether a `Content-Type` header value denotes a PDF.
///
/// Parameters such as `; charset=binary` are ignored, as is case.
pub fn is_pdf_content_type(value: &str) -> bool {
    let essence = value.split(';').next().unwrap_or(value).trim();
    PDF_MIME_TYPES
        .iter()
        .any(|m| essence.eq_ignore_ascii_case(m))
}

/// MIME type detected from the leading bytes, if recognised.
pub fn sniff_mime(head: &[u8]) -> Option<&'static str> {
    infer::get(head).map(|kind| kind.mime_type())
}

/// Sniff the first 8 KiB of a file.
pub async fn sniff_file_mime(path: &Path) -> Result<Option<&'static str>, Pdf2JpgError> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| Pdf2JpgError::io("Failed to open download", path, e))?;
    let mut head = vec![0u8; 8192];
    let mut filled = 0;
    while filled < head.len() {
        let n = file
            .read(&mut head[filled..])
            .await
            .map_err(|e| Pdf2JpgError::io("Failed to read download", path, e))?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(sniff_mime(&head[..filled]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_header_and_trailer() {
        assert!(is_plausible_pdf(b"%PDF-1.4\n1 0 obj\n<<>>\nendobj\n%%EOF\n"));
    }

    #[test]
    fn rejects_missing_eof() {
        assert!(!is_plausible_pdf(b"%PDF-1.7\n1 0 obj\n<<>>\nendobj\n"));
    }

    #[test]
    fn rejects_signature_not_at_offset_zero() {
        assert!(!is_plausible_pdf(b"\n%PDF-1.4\n%%EOF"));
        assert!(!is_plausible_pdf(b"<html>%PDF-1.4 %%EOF</html>"));
    }

    #[test]
    fn eof_marker_must_follow_header() {
        // "%PDF-%%EOF" has the marker right after the header
        assert!(is_plausible_pdf(b"%PDF-%%EOF"));
        assert!(!is_plausible_pdf(b"%PDF-"));
        assert!(!is_plausible_pdf(b""));
    }

    #[test]
    fn content_type_matching() {
        assert!(is_pdf_content_type("application/pdf"));
        assert!(is_pdf_content_type("Application/PDF; charset=binary"));
        assert!(is_pdf_content_type("application/x-pdf"));
        assert!(!is_pdf_content_type("text/html"));
        assert!(!is_pdf_content_type("application/octet-stream"));
        assert!(!is_pdf_content_type(""));
    }

    #[test]
    fn sniffs_pdf_bytes() {
        assert_eq!(sniff_mime(b"%PDF-1.5\n%%EOF"), Some("application/pdf"));
        assert_ne!(sniff_mime(b"<!doctype html><html></html>"), Some("application/pdf"));
    }

    #[tokio::test]
    async fn scan_agrees_with_in_memory_check() {
        for buf in [
            &b"%PDF-1.4\n1 0 obj\n<<>>\nendobj\n%%EOF\n"[..],
            b"%PDF-1.7\n1 0 obj\n<<>>\nendobj\n",
            b"\n%PDF-1.4\n%%EOF",
            b"%PDF-%%EOF",
            b"%PDF-",
            b"%PD",
            b"",
        ] {
            for chunk in [1, 2, 3, 7, 4096] {
                assert_eq!(
                    scan_pdf(buf, chunk).await.unwrap(),
                    is_plausible_pdf(buf),
                    "{:?} with chunk {chunk}",
                    String::from_utf8_lossy(buf)
                );
            }
        }
    }

    #[tokio::test]
    async fn trailer_split_across_reads_is_found() {
        let mut buf = b"%PDF-1.4\n".to_vec();
        // After the header, the first read holds SCAN_CHUNK + 4 bytes and
        // ends in the middle of the marker.
        buf.resize(SCAN_CHUNK + 7, b' ');
        buf.extend_from_slice(b"%%EOF");
        assert!(scan_pdf(&buf[..], SCAN_CHUNK).await.unwrap());
        assert!(!scan_pdf(&buf[..buf.len() - 1], SCAN_CHUNK).await.unwrap());
    }

    #[tokio::test]
    async fn check_pdf_file_flags_truncation() {
        let tmp = tempfile::tempdir().unwrap();
        let good = tmp.path().join("good.pdf");
        let bad = tmp.path().join("bad.pdf");
        std::fs::write(&good, b"%PDF-1.4\n%%EOF").unwrap();
        std::fs::write(&bad, b"%PDF-1.4\nstream...").unwrap();

        assert!(check_pdf_file(&good).await.is_ok());
        let err = check_pdf_file(&bad).await.unwrap_err();
        assert_eq!(err.reason(), "corrupt pdf");
    }
}
