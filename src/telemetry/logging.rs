//! Logging initialization.
//!
//! The stack traces administrative events (lifecycle, address changes,
//! discovered routers) at info/debug and the dataplane (ingress dispatch,
//! DAD probes, RA processing) at trace, all under the `rustack::stack`
//! targets. `init_logging` installs a global subscriber honoring the
//! `[logging]` table of the stack configuration; `RUST_LOG`, when set,
//! overrides the configured filter.

use crate::config::{LogFormat, LoggingConfigurations};
use crate::{Error, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Install the global trace subscriber for the stack.
///
/// Fails with `Error::Config` when a subscriber is already installed, so
/// an embedding application that set up its own logging keeps it.
pub fn init_logging(config: &LoggingConfigurations) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.filter));

    let format_layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Full => tracing_subscriber::fmt::layer().boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer().compact().boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
    };

    Registry::default()
        .with(format_layer)
        .with(filter)
        .try_init()
        .map_err(|err| Error::Config(err.to_string()))
}
