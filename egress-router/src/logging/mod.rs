//! Log setup for the plugin binary.
//!
//! `RUST_LOG` wins when set. Otherwise the level comes from the network
//! configuration, then defaults to `info`. Output goes to the configured
//! file (appended) or stderr, since stdout carries the CNI result.

use std::fs::OpenOptions;
use std::io;
use std::sync::Arc;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

const DEFAULT_LEVEL: &str = "info";

/// Map the level names accepted in network configuration to filter
/// directives. Unknown names fall back to the default.
pub fn level_directive(level: Option<&str>) -> &'static str {
    match level.map(|l| l.trim().to_ascii_lowercase()).as_deref() {
        Some("panic" | "fatal" | "error") => "error",
        Some("warn" | "warning") => "warn",
        Some("info" | "verbose") => "info",
        Some("debug") => "debug",
        Some("trace") => "trace",
        _ => DEFAULT_LEVEL,
    }
}

/// Install the global subscriber. A second call is a no-op.
pub fn init(level: Option<&str>, log_file: Option<&str>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_directive(level)));

    let writer = match log_file.filter(|f| !f.is_empty()) {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            BoxMakeWriter::new(Arc::new(file))
        }
        None => BoxMakeWriter::new(io::stderr),
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init();
    Ok(())
}
