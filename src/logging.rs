//! tracing subscriber setup.
//!
//! Logs go to stderr: stdout belongs to the terminal stream when the binary
//! relays btop over stdio.

use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `filter` overrides `RUST_LOG`; both fall back to `info`.
/// Safe to call more than once: later calls are ignored.
pub fn init(filter: Option<&str>) {
    let filter = filter
        .and_then(|f| EnvFilter::try_new(f).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_twice_is_harmless() {
        init(Some("debug"));
        init(None);
        tracing::info!("still logging");
    }

    #[test]
    fn init_ignores_bad_filter() {
        init(Some("[[[not a filter"));
    }
}
