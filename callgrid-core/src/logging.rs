use std::sync::Arc;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Initialize structured logging based on configuration.
///
/// JSON format for production, pretty format for development, with an
/// optional append-mode log file. `RUST_LOG` overrides the configured level.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);

    let file = match &config.file_path {
        Some(path) => Some(Arc::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?,
        )),
        None => None,
    };

    match (config.format.as_str(), file) {
        ("json", Some(file)) => {
            registry.with(fmt::layer().json().with_writer(file)).init();
        }
        ("json", None) => {
            registry.with(fmt::layer().json()).init();
        }
        (_, Some(file)) => {
            registry.with(fmt::layer().pretty().with_writer(file)).init();
        }
        (_, None) => {
            registry.with(fmt::layer().pretty()).init();
        }
    }

    Ok(())
}
