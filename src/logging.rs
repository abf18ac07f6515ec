use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Transport mode for the MCP server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    /// stdio transport (default) - for local MCP clients
    Stdio,
    /// Streamable HTTP transport - for remote/web access
    Stream,
}

/// Initialize logging based on transport mode
///
/// # stdio mode
/// - NO stderr output (any stderr noise during the handshake makes MCP
///   clients drop the connection)
/// - File logging only when `log_file` is given
///
/// # Stream mode
/// - Console (stderr) logging, plus the file when `log_file` is given
///
/// Filtering follows `RUST_LOG`, default `info`.
pub fn init_logging(mode: TransportMode, log_file: Option<&Path>) -> Result<()> {
    let file_layer = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(fmt::layer().with_writer(Mutex::new(file)).with_ansi(false))
        }
        None => None,
    };
    let console_layer =
        (mode == TransportMode::Stream).then(|| fmt::layer().with_writer(std::io::stderr));

    if file_layer.is_none() && console_layer.is_none() {
        return Ok(());
    }

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to initialize logging")?;
    Ok(())
}
