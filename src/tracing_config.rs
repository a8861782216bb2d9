//! Tracing subscriber setup for the server binary
//!
//! The library only emits events; the binary installs the subscriber. `log` records
//! from the ONNX backends are bridged into the same subscriber.

#[cfg(feature = "server")]
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TracingFormat {
    /// Human-readable output with colors
    #[default]
    Console,
    /// Plain single-line output for CI and containers without a TTY
    Compact,
    /// One JSON object per event for log aggregation
    #[cfg(feature = "tracing-json")]
    Json,
}

/// Subscriber configuration
#[derive(Debug, Clone, Default)]
pub struct TracingConfig {
    /// Verbosity level from repeated `-v` flags
    pub verbosity: u8,
    pub format: TracingFormat,
    /// Explicit filter directive; `RUST_LOG` takes precedence over both
    pub env_filter: Option<String>,
}

impl TracingConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: TracingFormat) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub fn with_env_filter<S: Into<String>>(mut self, filter: S) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    /// Filter directive for the configured verbosity
    #[must_use]
    pub fn verbosity_to_filter(&self) -> &'static str {
        match self.verbosity {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }

    /// Directive actually applied: `RUST_LOG`, then the explicit filter, then verbosity
    #[must_use]
    pub fn resolve_filter(&self, rust_log: Option<&str>) -> String {
        rust_log
            .filter(|value| !value.trim().is_empty())
            .map(str::to_string)
            .or_else(|| self.env_filter.clone())
            .unwrap_or_else(|| self.verbosity_to_filter().to_string())
    }

    /// Install the global subscriber
    ///
    /// # Errors
    /// - Invalid filter directive
    /// - A global subscriber is already installed
    #[cfg(feature = "server")]
    pub fn init(self) -> anyhow::Result<()> {
        use tracing_subscriber::fmt;

        let rust_log = std::env::var("RUST_LOG").ok();
        let filter = EnvFilter::try_new(self.resolve_filter(rust_log.as_deref()))?;
        let registry = Registry::default().with(filter);

        match self.format {
            TracingFormat::Console => {
                let layer = fmt::layer()
                    .with_ansi(true)
                    .with_target(false)
                    .with_level(true)
                    .compact();
                registry.with(layer).try_init()?;
            },
            TracingFormat::Compact => {
                let layer = fmt::layer().with_ansi(false).with_target(true).compact();
                registry.with(layer).try_init()?;
            },
            #[cfg(feature = "tracing-json")]
            TracingFormat::Json => {
                let layer = fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false);
                registry.with(layer).try_init()?;
            },
        }

        tracing::debug!(verbosity = self.verbosity, format = ?self.format, "Tracing initialized");
        Ok(())
    }
}

/// Install the subscriber used by the server binary
///
/// # Errors
/// - See [`TracingConfig::init`]
#[cfg(feature = "server")]
pub fn init_server_tracing(verbosity: u8, json: bool) -> anyhow::Result<()> {
    let format = if json {
        json_format()
    } else {
        TracingFormat::Console
    };
    TracingConfig::new()
        .with_verbosity(verbosity)
        .with_format(format)
        .init()
}

#[cfg(all(feature = "server", feature = "tracing-json"))]
fn json_format() -> TracingFormat {
    TracingFormat::Json
}

#[cfg(all(feature = "server", not(feature = "tracing-json")))]
fn json_format() -> TracingFormat {
    eprintln!("JSON logs need the `tracing-json` feature, using compact output");
    TracingFormat::Compact
}
