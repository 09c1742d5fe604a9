//! Default `tracing` subscriber
//!
//! Embedding applications usually install their own subscriber; this one
//! reads `RUST_LOG` (default `info`) and writes to stderr.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the default subscriber, plain or JSON
///
/// Returns `false` if a global subscriber was already set.
pub fn init(json: bool) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
    result.is_ok()
}

#[cfg(test)]
mod tests {
    #[test]
    fn second_init_is_refused() {
        let first = super::init(false);
        assert!(!super::init(true) || !first);
    }
}
