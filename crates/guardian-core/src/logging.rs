//! `tracing` subscriber setup.

use tracing_subscriber::EnvFilter;

/// Default filter directive for `debug`.
#[must_use]
pub fn default_directive(debug: bool) -> &'static str {
    if debug {
        "debug"
    } else {
        "info"
    }
}

/// Installs a formatted stderr subscriber filtered by `RUST_LOG`, falling
/// back to `debug` or `info`. Returns false if a global subscriber was
/// already installed.
pub fn init_logging(debug: bool) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive() {
        assert_eq!(default_directive(true), "debug");
        assert_eq!(default_directive(false), "info");
    }

    #[test]
    fn test_second_init_is_refused() {
        let _ = init_logging(false);
        assert!(!init_logging(true));
    }
}
