//! Logging setup shared by the Cadence binaries
//!
//! The scheduler daemon usually runs under a supervisor that ships stderr
//! to a log pipeline, so JSON output is first class. Operators running the
//! queue tool interactively get plain text.
//!
//! ```no_run
//! use libcadence::logging::{LogFormat, LoggingConfig};
//!
//! LoggingConfig::new(LogFormat::Json, "info".to_string(), false).init();
//! ```

use std::str::FromStr;

use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Plain text, no colors
    Text,
    /// One JSON object per line
    Json,
    /// Colored multi-line output for development
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            _ => Err(format!(
                "Invalid log format: '{}'. Valid options: text, json, pretty",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
            LogFormat::Pretty => write!(f, "pretty"),
        }
    }
}

pub struct LoggingConfig {
    pub format: LogFormat,
    pub level: String,
    pub verbose: bool,
}

impl LoggingConfig {
    pub fn new(format: LogFormat, level: String, verbose: bool) -> Self {
        Self {
            format,
            level,
            verbose,
        }
    }

    /// Read `CADENCE_LOG_FORMAT` and `CADENCE_LOG_LEVEL`, falling back to
    /// text at `info`
    pub fn from_env(verbose: bool) -> Self {
        let format = std::env::var("CADENCE_LOG_FORMAT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(LogFormat::Text);
        let level = std::env::var("CADENCE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        Self::new(format, level, verbose)
    }

    /// Filter directive used when `RUST_LOG` is not set
    ///
    /// sqlx logs every statement at `info`, which drowns the pass summaries,
    /// so it is capped at `warn` unless verbose.
    pub fn directive(&self) -> String {
        if self.verbose {
            "debug,sqlx=info".to_string()
        } else {
            format!("{},sqlx=warn", self.level)
        }
    }

    /// Install the global subscriber. Call once per process.
    pub fn init(&self) {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(self.directive()));

        let result = match self.format {
            LogFormat::Json => tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_current_span(true)
                .flatten_event(true)
                .with_target(true)
                .try_init(),
            LogFormat::Pretty => tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_line_number(true)
                .with_file(true)
                .try_init(),
            LogFormat::Text => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .try_init(),
        };

        if let Err(e) = result {
            eprintln!("cadence: logging already initialized: {}", e);
        }
    }
}
