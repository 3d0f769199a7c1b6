//! Pipeline stages for URL-to-thumbnail conversion.
//!
//! Each submodule implements exactly one step and knows nothing about the
//! cache, the blocklist or the HTTP surface. [`crate::service`] strings them
//! together.
//!
//! ## Data Flow
//!
//! ```text
//! url ──▶ fetch ──▶ sniff ──▶ rasterize
//!       (reqwest)  (magic)   (child process)
//! ```
//!
//! 1. [`fetch`]     stream the remote document into its staging path,
//!    bounded by a deadline and a size cap; the only stage with network I/O
//! 2. [`sniff`]     cheap signature checks that keep HTML error pages and
//!    truncated downloads away from the rasterizer
//! 3. [`rasterize`] render page one to JPEG in a guarded child process with
//!    a hard deadline and no shell in between

pub mod fetch;
pub mod rasterize;
pub mod sniff;
