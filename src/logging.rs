use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Installs the global subscriber: log lines go through the progress bars'
/// writer so the two never tear each other apart. The level defaults to
/// `info` and can be overridden with `RUST_LOG`.
///
/// Does nothing if a subscriber is already installed.
pub fn init_logging() {
    let indicatif = IndicatifLayer::new();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(indicatif.get_stderr_writer()),
        )
        .with(indicatif)
        .try_init();

    if installed.is_err() {
        tracing::debug!("a tracing subscriber is already installed");
    }
}
