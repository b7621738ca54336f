//! Structured logging.
//!
//! With `logging.json` enabled every entry is one JSON object, fields nested
//! under `fields`:
//!
//! ```json
//! {"timestamp":"2024-01-15T10:30:00.000Z","level":"WARN","target":"rsroles_server::sync::permissions","fields":{"message":"Scope not found, skipping endpoint","method":"PATCH","path":"/foo/{id}"}}
//! ```
//!
//! `RUST_LOG`, when set, overrides the configured level.

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::{self, MakeWriter};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingSettings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub json_format: bool,
    /// Used when `RUST_LOG` is not set.
    pub default_level: Level,
    /// Log span enter/exit, useful when following a dual write.
    pub include_spans: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig::from(&LoggingSettings::default())
    }
}

impl From<&LoggingSettings> for LoggingConfig {
    fn from(settings: &LoggingSettings) -> Self {
        // Unknown levels were rejected by ServiceConfig::validate.
        let default_level = Level::from_str(&settings.level).unwrap_or(Level::INFO);
        Self {
            json_format: settings.json,
            default_level,
            include_spans: false,
        }
    }
}

impl LoggingConfig {
    pub fn with_spans(mut self) -> Self {
        self.include_spans = true;
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.default_level.as_str().to_lowercase()))
    }

    fn span_events(&self) -> FmtSpan {
        if self.include_spans {
            FmtSpan::ENTER | FmtSpan::EXIT
        } else {
            FmtSpan::NONE
        }
    }
}

/// Installs the global subscriber. Only the first call has an effect.
pub fn init_logging(config: LoggingConfig) {
    let registry = tracing_subscriber::registry().with(config.filter());
    let installed = if config.json_format {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(config.span_events())
                    .with_current_span(true)
                    .with_file(false)
                    .with_line_number(false),
            )
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_span_events(config.span_events()))
            .try_init()
    };

    if installed.is_err() {
        tracing::debug!("Global subscriber already installed");
    }
}

/// JSON subscriber writing to `writer` at every level, for capturing logs.
pub fn create_json_layer<W>(writer: W) -> impl tracing::Subscriber + Send + Sync
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    tracing_subscriber::registry().with(EnvFilter::new("trace")).with(
        fmt::layer()
            .json()
            .with_writer(writer)
            .with_current_span(true),
    )
}
