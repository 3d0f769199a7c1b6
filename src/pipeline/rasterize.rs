//! Conversion Worker: render page 1 of a staged PDF to JPEG with an external tool.
//!
//! ## Why a child process?
//!
//! Rasterizing untrusted PDFs is where things hang, balloon or crash. Running
//! the tool as a separate process per request keeps that blast radius out of
//! the server: a hung renderer is killed at the deadline, a crashing one just
//! exits non-zero.
//!
//! ## Input paths
//!
//! The tool is spawned from an argument vector, never through a shell.
//! Paths are still checked twice before any argument is built: a denylist of
//! shell metacharacters, then an allowlist requiring the canonical input
//! path to sit inside the staging directory.

use crate::config::RasterizerConfig;
use crate::error::Pdf2JpgError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

static RE_SHELL_META: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[!"';|`$()&<>\\\r\n\x00]"#).unwrap());

/// Bytes of rasterizer stderr kept for the failure log.
const STDERR_TAIL: usize = 4096;

/// `true` if the path contains a character a shell would interpret.
///
/// Paths that are not valid UTF-8 count as unsafe.
pub fn has_shell_metacharacters(path: &Path) -> bool {
    match path.to_str() {
        Some(s) => RE_SHELL_META.is_match(s),
        None => true,
    }
}

/// Runs the configured rasterizer against files in one staging directory.
#[derive(Debug, Clone)]
pub struct Rasterizer {
    config: RasterizerConfig,
    staging_dir: PathBuf,
}

impl Rasterizer {
    pub fn new(config: RasterizerConfig, staging_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            staging_dir: staging_dir.into(),
        }
    }

    pub fn config(&self) -> &RasterizerConfig {
        &self.config
    }

    /// Argument vector for rendering page 1 of `input` into `output`.
    pub fn build_args(&self, input: &Path, output: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = [
            "-dQUIET",
            "-dSAFER",
            "-dBATCH",
            "-dNOPAUSE",
            "-dNOPROMPT",
            "-dMaxBitmap=500000000",
            "-dAlignToPixels=0",
            "-dGridFitTT=2",
            "-dTextAlphaBits=4",
            "-dGraphicsAlphaBits=4",
        ]
        .iter()
        .map(OsString::from)
        .collect();

        args.push(format!("-r{}", self.config.dpi).into());
        args.push("-dFirstPage=1".into());
        args.push("-dLastPage=1".into());
        args.push("-dUseCropBox".into());
        args.push("-sDEVICE=jpeg".into());
        args.extend(self.config.extra_args.iter().map(OsString::from));
        args.push("-o".into());
        args.push(output.as_os_str().to_owned());
        args.push(input.as_os_str().to_owned());
        args
    }

    /// Reject `input` unless it is free of metacharacters and lives in the
    /// staging directory. Returns the canonical path.
    pub async fn validate_input(&self, input: &Path) -> Result<PathBuf, Pdf2JpgError> {
        if has_shell_metacharacters(input) {
            warn!(path = %input.display(), "Rejected input path with shell metacharacters");
            return Err(Pdf2JpgError::conversion("unsafe input path"));
        }

        let staging = tokio::fs::canonicalize(&self.staging_dir)
            .await
            .map_err(|e| Pdf2JpgError::io("Failed to resolve staging directory", &self.staging_dir, e))?;
        let resolved = match tokio::fs::canonicalize(input).await {
            Ok(p) => p,
            Err(e) => {
                warn!(path = %input.display(), error = %e, "Input path does not resolve");
                return Err(Pdf2JpgError::conversion("unsafe input path"));
            }
        };

        if !resolved.starts_with(&staging) || has_shell_metacharacters(&resolved) {
            warn!(
                path = %resolved.display(),
                staging = %staging.display(),
                "Rejected input path outside the staging directory"
            );
            return Err(Pdf2JpgError::conversion("unsafe input path"));
        }
        Ok(resolved)
    }

    /// Render page 1 of `input` to a JPEG at `output`.
    ///
    /// The tool writes to an intermediate file next to `output`; that file
    /// is renamed into place on success and removed on every other path.
    pub async fn convert(&self, input: &Path, output: &Path) -> Result<PathBuf, Pdf2JpgError> {
        let input = self.validate_input(input).await?;
        // Ghostscript treats '%' in an output name as a page-number template.
        if has_shell_metacharacters(output) || output.to_string_lossy().contains('%') {
            warn!(path = %output.display(), "Rejected unsafe output path");
            return Err(Pdf2JpgError::conversion("unsafe output path"));
        }

        let intermediate = intermediate_path(output);
        let result = self.run(&input, &intermediate).await;
        let result = match result {
            Ok(()) => finish_output(&intermediate, output).await,
            Err(e) => Err(e),
        };

        remove_if_present(&intermediate).await;
        if result.is_err() {
            remove_if_present(output).await;
        }
        result.map(|()| output.to_path_buf())
    }

    /// Spawn the tool, enforce the deadline and reap it on every path.
    async fn run(&self, input: &Path, out: &Path) -> Result<(), Pdf2JpgError> {
        let deadline = self.config.timeout();
        let mut child = Command::new(&self.config.program)
            .args(self.build_args(input, out))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                warn!(program = %self.config.program.display(), error = %e, "Failed to spawn rasterizer");
                Pdf2JpgError::conversion("spawn failed")
            })?;

        debug!(pid = ?child.id(), input = %input.display(), "Rasterizer started");

        // Drain stderr concurrently so a chatty tool never blocks on a full pipe.
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut tail = Vec::new();
            if let Some(mut pipe) = stderr {
                let mut buf = [0u8; 1024];
                while let Ok(n) = pipe.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    tail.extend_from_slice(&buf[..n]);
                    if tail.len() > STDERR_TAIL {
                        tail.drain(..tail.len() - STDERR_TAIL);
                    }
                }
            }
            tail
        });

        let status = match tokio::time::timeout(deadline, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to wait for rasterizer");
                let _ = child.kill().await;
                stderr_task.abort();
                return Err(Pdf2JpgError::conversion("wait failed"));
            }
            Err(_elapsed) => {
                // kill() sends SIGKILL and reaps the child.
                if let Err(e) = child.kill().await {
                    warn!(error = %e, "Failed to kill timed-out rasterizer");
                }
                stderr_task.abort();
                warn!(
                    input = %input.display(),
                    secs = deadline.as_secs(),
                    "Rasterizer exceeded deadline, killed"
                );
                return Err(Pdf2JpgError::conversion("timeout"));
            }
        };

        // A grandchild could keep the pipe open after the tool itself exited.
        let tail = match tokio::time::timeout(std::time::Duration::from_secs(1), stderr_task).await {
            Ok(joined) => joined.unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        if !status.success() {
            warn!(
                input = %input.display(),
                code = ?status.code(),
                stderr = %String::from_utf8_lossy(&tail).trim(),
                "Rasterizer exited with failure"
            );
            return Err(Pdf2JpgError::conversion("nonzero exit"));
        }

        info!(input = %input.display(), "Rasterizer finished");
        Ok(())
    }
}

/// Where the tool is told to write before the result is moved to `output`.
fn intermediate_path(output: &Path) -> PathBuf {
    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    output.with_file_name(format!(".{name}.render.jpg"))
}

/// Check the intermediate really is a JPEG, then move it to `output`.
async fn finish_output(intermediate: &Path, output: &Path) -> Result<(), Pdf2JpgError> {
    let mut head = [0u8; 16];
    let n = match tokio::fs::File::open(intermediate).await {
        Ok(mut f) => f
            .read(&mut head)
            .await
            .map_err(|e| Pdf2JpgError::io("Failed to read rasterizer output", intermediate, e))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %intermediate.display(), "Rasterizer succeeded but wrote nothing");
            return Err(Pdf2JpgError::conversion("missing output"));
        }
        Err(e) => {
            return Err(Pdf2JpgError::io("Failed to open rasterizer output", intermediate, e));
        }
    };

    if !matches!(image::guess_format(&head[..n]), Ok(image::ImageFormat::Jpeg)) {
        warn!(path = %intermediate.display(), "Rasterizer output is not a JPEG");
        return Err(Pdf2JpgError::conversion("not a jpeg"));
    }

    tokio::fs::rename(intermediate, output)
        .await
        .map_err(|e| Pdf2JpgError::io("Failed to move rasterizer output to", output, e))
}

async fn remove_if_present(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove file"),
    }
}
