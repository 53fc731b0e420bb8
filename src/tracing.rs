use tracing::error;
use tracing_subscriber::{filter::LevelFilter, layer::SubscriberExt, EnvFilter, Layer};

use crate::{config::ServerConfig, workers::subprocess::WORKER_LOG_TARGET};

// HTTP plumbing is noisy at INFO and says nothing about the host.
const QUIET_TARGETS: &[&str] = &["h2=warn", "hyper=warn", "tower=warn", "tonic=warn"];

/// Directives used when RUST_LOG is unset. Worker output gets its own level
/// so a chatty runtime can be silenced without hiding host logs.
pub fn default_directives(config: &ServerConfig) -> String {
    let mut directives: Vec<String> = QUIET_TARGETS.iter().map(|d| d.to_string()).collect();
    directives.push(format!(
        "{}={}",
        WORKER_LOG_TARGET, config.telemetry.worker_log_level
    ));
    directives.join(",")
}

pub fn get_env_filter(config: &ServerConfig) -> EnvFilter {
    // RUST_LOG used to control logging level.
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .parse_lossy(default_directives(config))
    })
}

pub fn get_log_layer<S>(config: &ServerConfig) -> Box<dyn Layer<S> + Send + Sync>
where
    S: for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    S: tracing::Subscriber,
{
    if config.structured_logging() {
        return Box::new(
            tracing_subscriber::fmt::layer()
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(false),
        );
    }

    Box::new(tracing_subscriber::fmt::layer().compact().with_target(true))
}

pub fn setup_tracing(config: &ServerConfig) {
    let subscriber = tracing_subscriber::Registry::default()
        .with(get_log_layer(config).with_filter(get_env_filter(config)));

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        error!("logger was already initiated, continuing: {:?}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_carry_worker_level() {
        let mut config = ServerConfig::default();
        config.telemetry.worker_log_level = "error".to_string();
        let directives = default_directives(&config);
        assert!(directives.contains("funchost::worker=error"));
        assert!(directives.starts_with("h2=warn"));
    }
}
