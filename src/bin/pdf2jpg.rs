//! CLI binary for pdf2jpg.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `ServiceConfig` and runs the server, a one-off conversion or a cleanup.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pdf2jpg::{AppState, ConversionReport, ConversionService, Scope, ServiceConfig};
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const AFTER_HELP: &str = r#"EXAMPLES:
  # Serve thumbnails on port 8080
  pdf2jpg serve --port 8080

  # Then, from anywhere
  curl -o thumb.jpg 'http://localhost:8080/convert?url=https://example.com/a.pdf'

  # Convert a local file and print a JSON report
  pdf2jpg convert report.pdf report.jpg

  # Drop every cached thumbnail
  pdf2jpg clear images

ENVIRONMENT VARIABLES:
  PDF2JPG_BASE_DIR        Root for in/, out/, status/ and logs/
  PDF2JPG_RASTERIZER      Rasterizer program (default: gs)
  RUST_LOG                Overrides the log filter
"#;

/// Serve first-page JPEG thumbnails of remote PDFs.
#[derive(Parser, Debug)]
#[command(
    name = "pdf2jpg",
    version,
    about = "Serve first-page JPEG thumbnails of remote PDFs",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Root directory for staging, cache, blocklist and logs.
    #[arg(long, global = true, env = "PDF2JPG_BASE_DIR")]
    base_dir: Option<PathBuf>,

    /// Rasterizer executable, invoked with Ghostscript-style arguments.
    #[arg(long, global = true, env = "PDF2JPG_RASTERIZER", default_value = "gs")]
    rasterizer: PathBuf,

    /// Rendering DPI (36–600).
    #[arg(long, global = true, env = "PDF2JPG_DPI", default_value_t = 150,
          value_parser = clap::value_parser!(u32).range(36..=600))]
    dpi: u32,

    /// Rasterizer deadline in seconds.
    #[arg(long, global = true, env = "PDF2JPG_CONVERSION_TIMEOUT", default_value_t = 60)]
    conversion_timeout: u64,

    /// HTTP download deadline in seconds.
    #[arg(long, global = true, env = "PDF2JPG_DOWNLOAD_TIMEOUT", default_value_t = 20)]
    download_timeout: u64,

    /// Largest accepted PDF in bytes.
    #[arg(long, global = true, env = "PDF2JPG_MAX_DOWNLOAD_BYTES", default_value_t = 100 * 1024 * 1024)]
    max_download_bytes: u64,

    /// Failures before a host is blocked.
    #[arg(long, global = true, env = "PDF2JPG_FAILURE_THRESHOLD", default_value_t = 10)]
    failure_threshold: u32,

    /// Seconds a blocked host stays on record.
    #[arg(long, global = true, env = "PDF2JPG_BLOCK_DURATION", default_value_t = 3600)]
    block_duration: u64,

    /// Seconds before a blocked host gets a probe request.
    #[arg(long, global = true, env = "PDF2JPG_RECHECK", default_value_t = 60)]
    recheck: u64,

    /// Do not count conversion failures against the origin host.
    #[arg(long, global = true, env = "PDF2JPG_NO_CONVERSION_PENALTY")]
    no_conversion_penalty: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "PDF2JPG_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "PDF2JPG_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server.
    Serve {
        #[arg(long, env = "PDF2JPG_HOST", default_value = "127.0.0.1")]
        host: String,

        #[arg(short, long, env = "PDF2JPG_PORT", default_value_t = 8080)]
        port: u16,
    },
    /// Convert the first page of a local PDF and print a JSON report.
    Convert {
        input: PathBuf,
        output: PathBuf,
    },
    /// Empty one of the state directories.
    Clear {
        #[arg(value_enum)]
        scope: ScopeArg,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ScopeArg {
    Images,
    Staging,
    Blocklist,
    All,
}

impl From<ScopeArg> for Scope {
    fn from(v: ScopeArg) -> Self {
        match v {
            ScopeArg::Images => Scope::Images,
            ScopeArg::Staging => Scope::Staging,
            ScopeArg::Blocklist => Scope::Blocklist,
            ScopeArg::All => Scope::All,
        }
    }
}

fn build_config(cli: &Cli) -> Result<ServiceConfig> {
    let mut builder = ServiceConfig::builder();
    if let Some(ref base) = cli.base_dir {
        builder = builder.base_dir(base);
    }
    builder
        .rasterizer_program(&cli.rasterizer)
        .dpi(cli.dpi)
        .conversion_timeout_secs(cli.conversion_timeout)
        .download_timeout_secs(cli.download_timeout)
        .max_download_bytes(cli.max_download_bytes)
        .failure_threshold(cli.failure_threshold)
        .block_duration_secs(cli.block_duration)
        .recheck_secs(cli.recheck)
        .penalize_conversion_failures(!cli.no_conversion_penalty)
        .build()
        .context("Invalid configuration")
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load .env file if present (before anything else)
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let config = build_config(&cli)?;

    // ── Logging setup ────────────────────────────────────────────────────
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };

    // Only the server keeps a log file; one-off commands log to stderr.
    let (file_layer, _log_guard) = if matches!(cli.command, Command::Serve { .. }) {
        std::fs::create_dir_all(&config.log_dir).with_context(|| {
            format!("Failed to create log directory {}", config.log_dir.display())
        })?;
        let appender =
            tracing_appender::rolling::never(&config.log_dir, pdf2jpg::server::DEFAULT_LOG_FILE);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .init();

    // ── Dispatch ─────────────────────────────────────────────────────────
    match cli.command {
        Command::Serve { ref host, port } => {
            let addr: SocketAddr = format!("{host}:{port}")
                .parse()
                .with_context(|| format!("Invalid listen address {host}:{port}"))?;
            let service =
                ConversionService::new(config).context("Failed to start conversion service")?;
            pdf2jpg::serve(AppState::new(service), addr)
                .await
                .context("Server failed")?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Convert {
            ref input,
            ref output,
        } => {
            let service =
                ConversionService::new(config).context("Failed to start conversion service")?;
            let result = service.convert_file(input, output).await;
            let report = ConversionReport::from_result(&input.display().to_string(), &result);
            println!("{}", report.to_json().context("Failed to encode report")?);
            Ok(if report.success {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Command::Clear { scope } => {
            let service =
                ConversionService::new(config).context("Failed to start conversion service")?;
            let removed = service.clear(scope.into()).await;
            println!("{removed}");
            Ok(ExitCode::SUCCESS)
        }
    }
}
