//! Settings and configuration for CMO agents.
//!
//! Agents read settings from an optional JSON config file plus flat
//! environment variables. The recognized variables map 1:1 onto the fields
//! of [`Settings`] (uppercased), e.g. `REDIS_URL`, `PG_URL`,
//! `QSCORE_ACCEPT_THRESHOLD`.
//!
//! Config values are loaded in the following precedence order, later
//! sources winning:
//!
//! 1. The file `./config/$RUN_ENV/base.json`, when present.
//! 2. The file `./config/$RUN_ENV/<agent>-partial.json`, when present.
//! 3. Flat environment variables.
//!
//! Numeric options are carried as strings so that they can always be set
//! from the environment; the typed accessors parse them and fall back to
//! the documented defaults.

use std::env;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

pub use trace::{Style, TracingConfig};

mod trace;

/// Settings shared by every CMO agent.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Redis connection string for the broker.
    #[serde(default = "defaults::redis_url")]
    pub redis_url: String,
    /// Prefix for consumer-group names on the broker.
    #[serde(default = "defaults::redis_consumer_group_prefix")]
    pub redis_consumer_group_prefix: String,
    /// Postgres connection string for the checkpointer and registry.
    #[serde(default = "defaults::pg_url")]
    pub pg_url: String,
    /// Max connections in the Postgres pool.
    #[serde(default)]
    pub pg_max_connections: Option<String>,
    /// Postgres connect timeout, seconds.
    #[serde(default)]
    pub pg_conn_timeout: Option<String>,
    /// Postgres statement timeout, seconds.
    #[serde(default)]
    pub pg_query_timeout: Option<String>,
    /// Object-store location: `memory://` or `file://<dir>`.
    #[serde(default = "defaults::blob_store_url")]
    pub blob_store_url: String,
    /// Payloads above this many bytes are externalized to the object store.
    #[serde(default)]
    pub blob_max_inline_bytes: Option<String>,
    /// `HS256` or `RS256`.
    #[serde(default = "defaults::jwt_algorithm")]
    pub jwt_algorithm: String,
    /// HMAC secret or PEM public key, depending on the algorithm.
    #[serde(default)]
    pub jwt_secret_or_public_key: String,
    /// Expected `iss` claim, when set.
    #[serde(default)]
    pub jwt_issuer: Option<String>,
    /// Expected `aud` claim, when set.
    #[serde(default)]
    pub jwt_audience: Option<String>,
    /// Secret for envelope HMAC-SHA256 signatures. Distinct from the JWT
    /// key: envelopes and identity tokens are separate mechanisms.
    #[serde(default)]
    pub envelope_signing_secret: String,
    /// Replay freshness window, seconds.
    #[serde(default)]
    pub replay_freshness_seconds: Option<String>,
    /// Tolerated future clock skew, seconds.
    #[serde(default)]
    pub clock_skew_tolerance_seconds: Option<String>,
    /// Agent lease duration, seconds.
    #[serde(default)]
    pub lease_duration_seconds: Option<String>,
    /// Heartbeat publication interval, seconds.
    #[serde(default)]
    pub heartbeat_interval_seconds: Option<String>,
    /// Lease-reaper interval, seconds.
    #[serde(default)]
    pub reaper_interval_seconds: Option<String>,
    /// Days an UNAVAILABLE agent is kept before cleanup.
    #[serde(default)]
    pub agent_retention_days: Option<String>,
    /// Days a terminal run is kept before checkpoint cleanup.
    #[serde(default)]
    pub checkpoint_retention_days: Option<String>,
    /// Calibrated QScore at or above which a result is accepted.
    #[serde(default)]
    pub qscore_accept_threshold: Option<String>,
    /// Max retries before a decision escalates.
    #[serde(default)]
    pub max_retries: Option<String>,
    /// Tracing filter, e.g. `info` or `cmo=debug`.
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    /// Port for the metrics/health HTTP server.
    #[serde(default)]
    pub metrics_port: Option<String>,
    /// Tracing output configuration.
    #[serde(default)]
    pub tracing: TracingConfig,
}

mod defaults {
    pub(super) fn redis_url() -> String {
        "redis://localhost:6379".into()
    }
    pub(super) fn redis_consumer_group_prefix() -> String {
        "cmo".into()
    }
    pub(super) fn pg_url() -> String {
        "postgres://localhost:5432/cmo".into()
    }
    pub(super) fn blob_store_url() -> String {
        "memory://".into()
    }
    pub(super) fn jwt_algorithm() -> String {
        "HS256".into()
    }
    pub(super) fn log_level() -> String {
        "info".into()
    }
}

fn parse_or<T: std::str::FromStr>(value: &Option<String>, default: T) -> T {
    value
        .as_deref()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Settings {
    /// Max connections in the Postgres pool (default 10).
    pub fn pg_max_connections(&self) -> u32 {
        parse_or(&self.pg_max_connections, 10)
    }

    /// Postgres connect timeout (default 10 s).
    pub fn pg_conn_timeout(&self) -> Duration {
        Duration::from_secs(parse_or(&self.pg_conn_timeout, 10))
    }

    /// Postgres statement timeout (default 30 s).
    pub fn pg_query_timeout(&self) -> Duration {
        Duration::from_secs(parse_or(&self.pg_query_timeout, 30))
    }

    /// Inline-payload threshold (default 1 MiB).
    pub fn blob_max_inline_bytes(&self) -> usize {
        parse_or(&self.blob_max_inline_bytes, 1_048_576)
    }

    /// Replay freshness window (default 300 s).
    pub fn replay_freshness(&self) -> Duration {
        Duration::from_secs(parse_or(&self.replay_freshness_seconds, 300))
    }

    /// Tolerated future clock skew (default 30 s).
    pub fn clock_skew_tolerance(&self) -> Duration {
        Duration::from_secs(parse_or(&self.clock_skew_tolerance_seconds, 30))
    }

    /// Agent lease duration (default 60 s).
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(parse_or(&self.lease_duration_seconds, 60))
    }

    /// Heartbeat interval (default `lease/3` = 20 s).
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(parse_or(
            &self.heartbeat_interval_seconds,
            self.lease_duration().as_secs() / 3,
        ))
    }

    /// Reaper interval (default 10 s).
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(parse_or(&self.reaper_interval_seconds, 10))
    }

    /// Agent retention (default 7 days).
    pub fn agent_retention_days(&self) -> u32 {
        parse_or(&self.agent_retention_days, 7)
    }

    /// Checkpoint retention (default 30 days).
    pub fn checkpoint_retention_days(&self) -> u32 {
        parse_or(&self.checkpoint_retention_days, 30)
    }

    /// Accept threshold (default 0.75).
    pub fn qscore_accept_threshold(&self) -> f64 {
        parse_or(&self.qscore_accept_threshold, 0.75)
    }

    /// Max retries (default 2).
    pub fn max_retries(&self) -> u32 {
        parse_or(&self.max_retries, 2)
    }

    /// Metrics/health server port (default 9090).
    pub fn metrics_port(&self) -> u16 {
        parse_or(&self.metrics_port, 9090)
    }

    /// JWT verification configuration.
    pub fn jwt_conf(&self) -> crate::security::JwtConf {
        crate::security::JwtConf {
            algorithm: self.jwt_algorithm.clone(),
            secret_or_public_key: self.jwt_secret_or_public_key.clone(),
            issuer: self.jwt_issuer.clone(),
            audience: self.jwt_audience.clone(),
        }
    }

    /// The envelope signer over the configured secret.
    pub fn envelope_signer(&self) -> crate::security::EnvelopeSigner {
        crate::security::EnvelopeSigner::new(&self.envelope_signing_secret)
    }

    /// The replay guard with the configured windows, signature check
    /// included.
    pub fn replay_guard(&self) -> crate::security::ReplayGuard {
        crate::security::ReplayGuard::new(self.replay_freshness(), self.clock_skew_tolerance())
            .with_signer(self.envelope_signer())
    }

    /// The blob store named by `blob_store_url`.
    pub fn blob_store(
        &self,
    ) -> Result<std::sync::Arc<dyn cmo_core::traits::ObjectStore>, cmo_core::CheckpointError> {
        crate::blob::blob_store_from_url(&self.blob_store_url)
    }

    /// The live broker transport, blob externalization wired in.
    pub fn transport(&self) -> eyre::Result<crate::transport::RedisStreamTransport> {
        let blob = self.blob_store().map_err(|e| eyre::eyre!(e))?;
        Ok(crate::transport::RedisStreamTransport::new(
            &self.redis_url,
            self.redis_consumer_group_prefix.clone(),
        )?
        .with_blob_store(blob, self.blob_max_inline_bytes()))
    }

    /// The shared database handle.
    pub async fn db(&self) -> eyre::Result<crate::db::Db> {
        crate::db::Db::connect(
            &self.pg_url,
            self.pg_max_connections(),
            self.pg_conn_timeout(),
            self.pg_query_timeout(),
        )
        .await
    }
}

/// Load a settings object from the config locations.
///
/// Reads `./config/$RUN_ENV/base.json` and
/// `./config/$RUN_ENV/<agent>-partial.json` when present, then applies flat
/// environment variables on top.
pub fn load_settings_object<'de, T: Deserialize<'de>>(agent_prefix: &str) -> eyre::Result<T> {
    let run_env = env::var("RUN_ENV").unwrap_or_else(|_| "default".into());

    let config_deserializer = Config::builder()
        .add_source(File::with_name(&format!("./config/{run_env}/base")).required(false))
        .add_source(
            File::with_name(&format!(
                "./config/{run_env}/{}-partial",
                agent_prefix.to_lowercase()
            ))
            .required(false),
        )
        .add_source(Environment::default())
        .build()?;

    Ok(config_deserializer.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_settings() -> Settings {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }

    #[test]
    fn documented_defaults() {
        let settings = empty_settings();
        assert_eq!(settings.redis_url, "redis://localhost:6379");
        assert_eq!(settings.replay_freshness(), Duration::from_secs(300));
        assert_eq!(settings.clock_skew_tolerance(), Duration::from_secs(30));
        assert_eq!(settings.lease_duration(), Duration::from_secs(60));
        assert_eq!(settings.heartbeat_interval(), Duration::from_secs(20));
        assert_eq!(settings.reaper_interval(), Duration::from_secs(10));
        assert_eq!(settings.agent_retention_days(), 7);
        assert_eq!(settings.qscore_accept_threshold(), 0.75);
        assert_eq!(settings.max_retries(), 2);
        assert_eq!(settings.blob_max_inline_bytes(), 1_048_576);
    }

    #[test]
    fn numeric_strings_parse() {
        let settings: Settings = serde_json::from_value(serde_json::json!({
            "replay_freshness_seconds": "60",
            "max_retries": "4",
            "qscore_accept_threshold": "0.9",
        }))
        .unwrap();
        assert_eq!(settings.replay_freshness(), Duration::from_secs(60));
        assert_eq!(settings.max_retries(), 4);
        assert_eq!(settings.qscore_accept_threshold(), 0.9);
    }

    #[test]
    fn heartbeat_tracks_lease_when_unset() {
        let settings: Settings = serde_json::from_value(serde_json::json!({
            "lease_duration_seconds": "90",
        }))
        .unwrap();
        assert_eq!(settings.heartbeat_interval(), Duration::from_secs(30));
    }
}
