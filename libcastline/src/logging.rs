//! Logging setup shared by the Castline binaries
//!
//! Output goes to stderr in one of three formats. `CASTLINE_LOG_FORMAT`
//! picks the format and `CASTLINE_LOG_LEVEL` the default level; `RUST_LOG`
//! still wins when set, so per-module filters keep working:
//!
//! ```bash
//! CASTLINE_LOG_FORMAT=json RUST_LOG=libcastline::pipeline=debug castline-send
//! ```

use std::str::FromStr;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Plain lines, no colors
    Text,
    /// One JSON object per line, for log shippers
    Json,
    /// Multi-line colored output for local development
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
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
        let name = match self {
            LogFormat::Text => "text",
            LogFormat::Json => "json",
            LogFormat::Pretty => "pretty",
        };
        f.write_str(name)
    }
}

/// Configuration for logging initialization
#[derive(Debug, Clone)]
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

    /// Read format and level from the environment, falling back to text/info
    pub fn from_env(verbose: bool) -> Self {
        Self::from_env_or(verbose, "info")
    }

    /// Like [`LoggingConfig::from_env`] with a different fallback level,
    /// for tools that should stay quiet unless asked
    pub fn from_env_or(verbose: bool, default_level: &str) -> Self {
        let format = std::env::var("CASTLINE_LOG_FORMAT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(LogFormat::Text);

        let level =
            std::env::var("CASTLINE_LOG_LEVEL").unwrap_or_else(|_| default_level.to_string());

        Self::new(format, level, verbose)
    }

    /// Level used when `RUST_LOG` is not set
    pub fn effective_level(&self) -> &str {
        if self.verbose {
            "debug"
        } else {
            &self.level
        }
    }

    /// Install the global subscriber.
    ///
    /// # Panics
    ///
    /// Panics if a global subscriber was already installed.
    pub fn init(&self) {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.effective_level()));

        match self.format {
            LogFormat::Json => {
                tracing_subscriber::fmt()
                    .json()
                    .with_env_filter(filter)
                    .with_writer(std::io::stderr)
                    .with_current_span(true)
                    .with_span_list(true)
                    .flatten_event(true)
                    .with_target(true)
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::fmt()
                    .pretty()
                    .with_env_filter(filter)
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_line_number(true)
                    .with_file(true)
                    .init();
            }
            LogFormat::Text => {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(std::io::stderr)
                    .with_ansi(false)
                    .with_target(false)
                    .init();
            }
        }
    }
}

/// Initialize logging from `CASTLINE_LOG_FORMAT` / `CASTLINE_LOG_LEVEL`
pub fn init_default(verbose: bool) {
    LoggingConfig::from_env(verbose).init();
}
