use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingSection;

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
///
/// Returns `false` when a subscriber was already installed, which leaves the
/// existing one in place.
pub fn init(logging: &LoggingSection) -> bool {
  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));

  let installed = if logging.json {
    tracing_subscriber::registry()
      .with(filter)
      .with(fmt::layer().json())
      .try_init()
  } else {
    tracing_subscriber::registry()
      .with(filter)
      .with(fmt::layer().with_target(true))
      .try_init()
  };
  installed.is_ok()
}
