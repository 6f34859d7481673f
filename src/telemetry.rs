use crate::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Installs the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_tracing(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    let result = match config.format.as_deref() {
        Some("json") => builder.json().try_init(),
        _ => builder.try_init(),
    };

    if let Err(e) = result {
        eprintln!("Tracing already initialized: {}", e);
    }
}
