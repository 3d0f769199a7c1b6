//! Stable cache keys for request URLs.

use sha2::{Digest, Sha256};
use std::fmt;

/// SHA-256 of the raw URL string, as 64 lowercase hex characters.
///
/// The URL is hashed byte for byte: no case folding, no percent-decoding, no
/// trailing-slash cleanup. Two spellings of the same document are two cache
/// entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(url: &str) -> Self {
        Self(hex::encode(Sha256::digest(url.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name of the downloaded PDF in the staging directory.
    pub fn staging_file_name(&self) -> String {
        format!("{}.pdf", self.0)
    }

    /// File name of the finished thumbnail in the cache directory.
    pub fn artifact_file_name(&self) -> String {
        format!("{}.jpg", self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_url_same_fingerprint() {
        let url = "https://example.com/docs/report.pdf?v=2";
        assert_eq!(Fingerprint::of(url), Fingerprint::of(url));
    }

    #[test]
    fn known_digest() {
        // sha256("abc")
        assert_eq!(
            Fingerprint::of("abc").as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn case_and_spelling_matter() {
        let a = Fingerprint::of("https://example.com/a.pdf");
        assert_ne!(a, Fingerprint::of("https://example.com/A.pdf"));
        assert_ne!(a, Fingerprint::of("https://example.com/a.pdf/"));
        assert_ne!(a, Fingerprint::of("https://EXAMPLE.com/a.pdf"));
    }

    #[test]
    fn fixed_length_hex() {
        for url in ["", "x", "https://example.com/a/very/long/path.pdf"] {
            let fp = Fingerprint::of(url);
            assert_eq!(fp.as_str().len(), 64);
            assert!(fp.as_str().bytes().all(|b| b.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn file_names() {
        let fp = Fingerprint::of("abc");
        assert!(fp.staging_file_name().ends_with(".pdf"));
        assert!(fp.artifact_file_name().ends_with(".jpg"));
        assert!(fp.artifact_file_name().starts_with(fp.as_str()));
    }
}
