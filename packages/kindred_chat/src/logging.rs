use tracing_subscriber::prelude::*;

/// Default filter when `RUST_LOG` is unset, e.g. `default_directive("debug")`
pub fn default_directive(level: &str) -> String {
    format!("kindred_chat={level},kindred_realtime={level},kindred_sim={level},warn")
}

/// Install the global subscriber: fmt layer filtered by `RUST_LOG`, falling
/// back to [`default_directive`] for `level`.
pub fn init_tracing(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive(level)));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directive_parses() {
        let directive = default_directive("debug");
        assert!(directive.starts_with("kindred_chat=debug"));
        assert!(tracing_subscriber::EnvFilter::try_new(directive).is_ok());
    }
}
