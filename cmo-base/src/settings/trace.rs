use serde::Deserialize;
use tracing_subscriber::filter::EnvFilter;

/// Log output style.
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Style {
    /// Human-oriented single-line output.
    #[default]
    Compact,
    /// Multi-line output with full span context.
    Pretty,
    /// Newline-delimited JSON for log shippers.
    Json,
}

/// Tracing subscriber configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TracingConfig {
    /// Output style.
    #[serde(default)]
    pub fmt: Style,
}

impl TracingConfig {
    /// Install the global tracing subscriber.
    ///
    /// `directives` is an `EnvFilter` string, typically the `LOG_LEVEL`
    /// setting. Returns an error if a subscriber is already installed.
    pub fn start_tracing(&self, directives: &str) -> eyre::Result<()> {
        let filter = EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new("info"));
        let builder = tracing_subscriber::fmt().with_env_filter(filter);
        match self.fmt {
            Style::Compact => builder.compact().try_init(),
            Style::Pretty => builder.pretty().try_init(),
            Style::Json => builder.json().try_init(),
        }
        .map_err(|e| eyre::eyre!("failed to install tracing subscriber: {e}"))
    }
}
