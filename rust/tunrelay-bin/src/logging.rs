use anyhow::{Context, Result};
use std::sync::Once;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use tunrelay_stack::LogLevel;

static INIT: Once = Once::new();

/// Initialize the global subscriber. Later calls are no-ops.
pub fn init_logging(level: LogLevel) -> Result<()> {
    let mut result = Ok(());
    INIT.call_once(|| {
        result = init_logging_inner(level);
    });
    result
}

fn init_logging_inner(level: LogLevel) -> Result<()> {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::from_default_env()
        .add_directive(
            format!("tunrelay_stack={}", level.as_str())
                .parse()
                .context("invalid log directive")?,
        )
        .add_directive(
            format!("tunrelay={}", level.as_str())
                .parse()
                .context("invalid log directive")?,
        );

    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_thread_names(true)
        .compact()
        .with_filter(filter);

    if tracing_subscriber::registry().with(fmt_layer).try_init().is_ok() {
        tracing::info!("Logging initialized at level: {}", level.as_str());
    }
    Ok(())
}
