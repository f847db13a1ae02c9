use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::{LogFormat, LoggingConfig};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level when set. Output goes to
/// stderr unless `file_path` is configured, in which case it is appended
/// to that file.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let log_level = parse_log_level(&config.level)?;

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    let registry = tracing_subscriber::registry().with(env_filter);

    let file = match &config.file_path {
        Some(path) => Some(std::sync::Arc::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?,
        )),
        None => None,
    };

    match config.format {
        LogFormat::Json => {
            let layer = fmt::layer()
                .json()
                .with_span_events(FmtSpan::CLOSE)
                .with_current_span(true)
                .with_target(true)
                .with_line_number(true);
            match file {
                Some(file) => registry.with(layer.with_writer(file)).try_init()?,
                None => registry.with(layer.with_writer(std::io::stderr)).try_init()?,
            }
        }
        LogFormat::Pretty => {
            let layer = fmt::layer()
                .pretty()
                .with_target(true)
                .with_line_number(true)
                .with_file(false);
            match file {
                Some(file) => registry
                    .with(layer.with_ansi(false).with_writer(file))
                    .try_init()?,
                None => registry.with(layer.with_writer(std::io::stderr)).try_init()?,
            }
        }
        LogFormat::Compact => {
            let layer = fmt::layer().compact().with_target(false);
            match file {
                Some(file) => registry
                    .with(layer.with_ansi(false).with_writer(file))
                    .try_init()?,
                None => registry.with(layer.with_writer(std::io::stderr)).try_init()?,
            }
        }
    }

    Ok(())
}

fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    // Directive strings like "covoice=debug,webrtc=warn" fall back to INFO;
    // EnvFilter parses them itself.
    if level.contains('=') || level.contains(',') {
        return Ok(Level::INFO);
    }
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(anyhow::anyhow!("Invalid log level: {level}")),
    }
}
