//! # pdf2jpg
//!
//! Turn the first page of a remote PDF into a cached JPEG thumbnail.
//!
//! ## Why this crate?
//!
//! Sites that list documents want a preview image per PDF, but the PDFs
//! live on other people's servers. This crate fetches each document once,
//! renders page one with an external rasterizer (Ghostscript by default) and
//! keeps the JPEG on disk keyed by the URL. Origins are treated as hostile:
//! non-PDF payloads, hanging responses, endless bodies and hosts that keep
//! failing are all contained without taking the process down.
//!
//! ## Pipeline Overview
//!
//! ```text
//! GET /convert?url=…
//!  │
//!  ├─ 1. Fingerprint  SHA-256 of the URL; cache hit ⇒ done
//!  ├─ 2. Coalesce     identical in-flight requests share one job
//!  ├─ 3. Blocklist    hosts over the failure threshold are refused
//!  ├─ 4. Fetch        stream to staging, deadline + size cap + type check
//!  ├─ 5. Rasterize    child process, argv only, hard deadline
//!  └─ 6. Publish      atomic rename into the cache
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pdf2jpg::{ConversionService, ServiceConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServiceConfig::builder()
//!         .base_dir("/var/lib/pdf2jpg")
//!         .dpi(100)
//!         .build()?;
//!     let service = ConversionService::new(config)?;
//!     let thumb = service.convert_url("https://example.com/report.pdf").await?;
//!     std::fs::write("report.jpg", &thumb.bytes)?;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdf2jpg` binary (clap + anyhow + tracing-subscriber) |
//!
//! Disable `cli` when embedding only the library:
//! ```toml
//! pdf2jpg = { version = "0.3", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod blocklist;
pub mod cache;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod janitor;
pub mod pipeline;
pub mod report;
pub mod server;
pub mod service;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use blocklist::{Clock, HostBlocklist, HostState, HostStore, ManualClock, SystemClock};
pub use cache::CacheStore;
pub use config::{BlocklistPolicy, RasterizerConfig, ServiceConfig, ServiceConfigBuilder};
pub use error::Pdf2JpgError;
pub use fingerprint::Fingerprint;
pub use janitor::Scope;
pub use report::ConversionReport;
pub use server::{serve, AppState};
pub use service::{ConversionService, Thumbnail};
