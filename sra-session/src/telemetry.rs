//! Tracing initialization.
//!
//! Log output goes to stderr through a `tracing_subscriber` fmt layer. Verbosity is
//! controlled with the standard `RUST_LOG` variable and defaults to `info`:
//!
//! ```bash
//! RUST_LOG=sra_session=debug sra-session -u analyst
//! ```

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install the global subscriber. Fails if one is already installed.
pub fn init_telemetry() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()?;

    Ok(())
}
