use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static TRACING_INIT: OnceLock<()> = OnceLock::new();

const DEFAULT_FILTER: &str = "info";

/// Precedence: `FILESERVER_LOG`, `RUST_LOG`, config `logging.level`, then `info`.
/// An unparsable filter falls back to the default rather than the next source.
fn build_env_filter_from(
    fileserver_log: Option<&str>,
    rust_log: Option<&str>,
    config_level: Option<&str>,
) -> EnvFilter {
    let default = || EnvFilter::new(DEFAULT_FILTER);

    let chosen = [fileserver_log, rust_log, config_level]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|v| !v.is_empty());
    match chosen {
        Some(v) => EnvFilter::try_new(v).unwrap_or_else(|_| default()),
        None => default(),
    }
}

fn build_env_filter(config_level: Option<&str>) -> EnvFilter {
    build_env_filter_from(
        std::env::var("FILESERVER_LOG").ok().as_deref(),
        std::env::var("RUST_LOG").ok().as_deref(),
        config_level,
    )
}

/// Installs the JSON stderr subscriber once per process.
pub fn init_logging(config_level: Option<&str>) {
    TRACING_INIT.get_or_init(|| {
        let env_filter = build_env_filter(config_level);

        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
            .with_writer(std::io::stderr);

        let subscriber = tracing_subscriber::registry().with(env_filter).with(layer);
        let _ = subscriber.try_init();
    });
}
