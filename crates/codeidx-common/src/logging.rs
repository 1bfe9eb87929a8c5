//! Tracing subscriber setup

use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{Error, Result};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` directives take precedence; `config.level` applies to the
/// `codeidx` targets otherwise. Output goes to stderr so command output
/// on stdout stays machine readable.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let directive: Directive = format!("codeidx={}", config.level)
        .parse()
        .map_err(|e| Error::Config(format!("Invalid log level {:?}: {}", config.level, e)))?;
    let filter = EnvFilter::from_default_env().add_directive(directive);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| Error::Internal(format!("Failed to install tracing subscriber: {}", e)))
}
