//! Logging bootstrap. The teacher (`flux::logging`) built a `sloggers`
//! config from an inline TOML snippet and handed back a `slog::Logger`;
//! this workspace standardizes on `tracing` instead (see `SPEC_FULL.md` §B
//! for why), but keeps the same shape: one `init` entry point binaries call
//! once at startup, configurable by an environment filter rather than a
//! bespoke config struct.

use tracing_subscriber::{fmt, EnvFilter};

/// Initializes the global `tracing` subscriber. `default_directive` is used
/// when `RUST_LOG` is unset (e.g. `"tunnox=info,warn"`).
pub fn init(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .ok();
}
