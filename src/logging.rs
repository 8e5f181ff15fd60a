//! Tracing setup.
//!
//! All diagnostics go to stderr: stdout carries exactly one result line
//! and nothing else. `RUST_LOG` controls filtering (default "info"),
//! e.g. `RUST_LOG=natprobe=debug,reqwest=warn`.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize the tracing subscriber. Safe to call more than once; later
/// calls are no-ops.
pub fn init() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_default();

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact()
        .with_filter(env_filter);

    let _ = tracing_subscriber::registry().with(stderr_layer).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init();
        init();
        tracing::debug!("still alive after double init");
    }
}
