use tracing::level_filters::LevelFilter;
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn env_filter(default_level: LevelFilter) -> EnvFilter {
    let rust_log =
        std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| default_level.to_string());
    EnvFilter::try_new(rust_log).unwrap_or_else(|err| {
        eprintln!(
            "invalid {}, falling back to level '{}' - {}",
            EnvFilter::DEFAULT_ENV,
            default_level,
            err,
        );
        EnvFilter::new(default_level.to_string())
    })
}

/// Installs the process-wide subscriber. Also captures `log` records emitted
/// by actix-web's request logger.
pub fn init_logger() {
    let subscriber = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter(LevelFilter::INFO));
    if let Err(err) = subscriber.try_init() {
        eprintln!("Failed to set global tracing subscriber: {}", err);
    }
}

#[must_use]
pub fn init_test_logger() -> DefaultGuard {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .with(env_filter(LevelFilter::DEBUG))
        .set_default()
}
