use anyhow::Context;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` directives are honoured; the configured level is added on top.
/// A subscriber that is already installed is left in place.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let directive = config
        .level
        .parse::<Directive>()
        .with_context(|| format!("invalid log level '{}'", config.level))?;
    let filter = EnvFilter::from_default_env().add_directive(directive);

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_line_number(config.line_numbers);

    let installed = match config.format.as_str() {
        "json" => builder.json().try_init(),
        "text" => builder.try_init(),
        other => anyhow::bail!("unknown log format '{}'", other),
    };

    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_level() {
        let config = LoggingConfig {
            level: "loud=".to_string(),
            ..LoggingConfig::default()
        };
        assert!(init_logging(&config).is_err());
    }

    #[test]
    fn second_init_is_harmless() {
        let config = LoggingConfig::default();
        init_logging(&config).unwrap();
        init_logging(&config).unwrap();
    }
}
