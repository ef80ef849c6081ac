use anyhow::{Context, Result};
use std::fs::{self, File};
use std::path::Path;
use std::sync::Mutex;
use tracing::Subscriber;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Builds a console subscriber, plus a plain-text file layer when `log_file`
/// is given. The caller decides where it applies, either scoped with
/// `tracing::subscriber::with_default` / `WithSubscriber` or installed once
/// by a binary.
pub fn build_subscriber(
    level: &str,
    log_file: Option<&Path>,
) -> Result<impl Subscriber + Send + Sync + 'static> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("invalid log level: {}", level))?;

    let console = tracing_subscriber::fmt::layer()
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
        .with_target(false)
        .with_writer(std::io::stdout);

    let file = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = File::create(path)
                .with_context(|| format!("failed to create log file: {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    Ok(tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file))
}
