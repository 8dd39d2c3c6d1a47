//! Tracing subscriber setup.
//!
//! The engine only emits `tracing` events; embedding applications choose
//! whether to install a subscriber. These helpers install the usual console
//! one: stderr output, level driven by `RUST_LOG`.

use tracing_subscriber::{fmt, prelude::*, registry::Registry, util::SubscriberInitExt, EnvFilter};

/// Installs a stderr subscriber with `info` as the default level. Does
/// nothing if a global subscriber is already set.
pub fn init_tracing() {
    let _ = try_init_tracing("info");
}

/// Installs a stderr subscriber, falling back to `default_directive` when
/// `RUST_LOG` is unset or invalid.
///
/// # Example
/// ```ignore
/// rao_algo::logging::try_init_tracing("rao_algo=debug")?;
/// ```
pub fn try_init_tracing(default_directive: &str) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_directive))?;

    Registry::default()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
        .try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_init_is_harmless() {
        init_tracing();
        init_tracing();
        assert!(try_init_tracing("debug").is_err());
    }
}
