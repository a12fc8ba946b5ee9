//! # Configuration Management Module
//!
//! TOML configuration for the companion link, reconnection, send tracking,
//! metadata refresh, the simulated provider and logging.
//!
//! ## Configuration Structure
//!
//! - [`CompanionConfig`] - transport kind, endpoint, device and refresh cadence
//! - [`ReconnectConfig`] - backoff bounds and retry ceiling for the supervisor
//! - [`SendConfig`] - ACK timeout, retry schedule and text limits
//! - [`SyncConfig`] - drain limits and contact staleness
//! - [`SimulatorConfig`] - synthetic traffic cadence
//! - [`LoggingConfig`] - log level and optional log file
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshchat::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // Creates config.toml from config.example.toml (or defaults) if missing
//!     let config = Config::load_or_init("config.toml", "config.example.toml").await?;
//!     println!("Transport: {}", config.companion.transport);
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [companion]
//! transport = "tcp"
//! endpoint = "meshcore-dev.local:5000"
//! device = "auto"
//! channel_refresh_seconds = 30
//!
//! [send]
//! ack_timeout_seconds = 15
//! max_attempts = 3
//! retry_backoff_seconds = [4, 8, 16]
//! ```
//!
//! Every section and field has a default, so a partial file is valid. Values
//! outside safe bounds are clamped by [`Config::sanitized`] with a warning.

use anyhow::{anyhow, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;

use crate::validation::DEFAULT_MAX_TEXT_BYTES;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub version: u32,
    pub companion: CompanionConfig,
    pub reconnect: ReconnectConfig,
    pub send: SendConfig,
    pub sync: SyncConfig,
    pub simulator: SimulatorConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompanionConfig {
    /// One of "bluetooth", "serial", "tcp" or "fake".
    pub transport: String,
    /// TCP `host:port`, or a Bluetooth MAC / advertised name.
    pub endpoint: String,
    /// Serial device path, rfcomm bridge path, Bluetooth MAC or "auto".
    /// Bluetooth LE needs the `ble` feature; without it only rfcomm bridges work.
    pub device: String,
    pub baud_rate: u32,
    pub channel_refresh_seconds: u64,
    pub liveness_interval_seconds: u64,
    pub liveness_timeout_seconds: u64,
    pub command_timeout_seconds: u64,
    /// Trace-level hex dumps of every frame.
    pub log_packets: bool,
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            transport: "tcp".to_string(),
            endpoint: "meshcore-dev.local:5000".to_string(),
            device: "auto".to_string(),
            baud_rate: 115200,
            channel_refresh_seconds: 30,
            liveness_interval_seconds: 30,
            liveness_timeout_seconds: 10,
            command_timeout_seconds: 5,
            log_packets: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the nominal delay added as random jitter, 0.0..=1.0.
    pub jitter: f64,
    /// Give up and enter `Failed` after this many attempts; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
            jitter: 0.2,
            max_attempts: Some(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SendConfig {
    pub ack_timeout_seconds: u64,
    pub max_attempts: u8,
    /// Delay before each retry, e.g. [4, 8, 16]; the last entry repeats.
    pub retry_backoff_seconds: Vec<u64>,
    pub max_text_bytes: usize,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            ack_timeout_seconds: 15,
            max_attempts: 3,
            retry_backoff_seconds: vec![4, 8, 16],
            max_text_bytes: DEFAULT_MAX_TEXT_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub drain_limit: usize,
    pub stale_after_hours: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            drain_limit: 200,
            stale_after_hours: 24,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Seconds between synthetic messages; 0 disables the ticker.
    pub interval_seconds: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: Some("meshchat.log".to_string()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            version: 1,
            companion: CompanionConfig::default(),
            reconnect: ReconnectConfig::default(),
            send: SendConfig::default(),
            sync: SyncConfig::default(),
            simulator: SimulatorConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config.sanitized())
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        Config::default().save(path).await
    }

    /// Load `path`, creating it first from `example_path` (when that exists)
    /// or from defaults.
    pub async fn load_or_init(path: &str, example_path: &str) -> Result<Self> {
        if !Path::new(path).exists() {
            if let Some(parent) = Path::new(path).parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)
                        .await
                        .map_err(|e| anyhow!("Failed to create {}: {}", parent.display(), e))?;
                }
            }
            if Path::new(example_path).exists() {
                fs::copy(example_path, path)
                    .await
                    .map_err(|e| anyhow!("Failed to copy {} to {}: {}", example_path, path, e))?;
            } else {
                Config::create_default(path).await?;
            }
        }
        Config::load(path).await
    }

    /// Persist this configuration to `path`.
    pub async fn save(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| anyhow!("Failed to serialize config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Re-read `path`, replacing this value on success and leaving it untouched on error.
    ///
    /// A running [`LiveSession`](crate::sync::LiveSession) resolved its
    /// settings once at start and does not see the new values; restart the
    /// session to apply them.
    pub async fn reload(&mut self, path: &str) -> Result<()> {
        *self = Config::load(path).await?;
        Ok(())
    }

    /// Apply `f` and persist the result.
    pub async fn mutate<F>(&mut self, path: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut Config),
    {
        f(self);
        *self = self.clone().sanitized();
        self.save(path).await
    }

    /// Clamp values to safe bounds, warning about each adjustment.
    pub fn sanitized(mut self) -> Self {
        let c = &mut self.companion;
        if c.channel_refresh_seconds < 5 {
            warn!(
                "companion.channel_refresh_seconds {} below minimum; clamping to 5",
                c.channel_refresh_seconds
            );
            c.channel_refresh_seconds = 5;
        }
        if c.liveness_interval_seconds == 0 {
            warn!("companion.liveness_interval_seconds must be > 0; using 30");
            c.liveness_interval_seconds = 30;
        }
        if c.liveness_timeout_seconds == 0 {
            warn!("companion.liveness_timeout_seconds must be > 0; using 10");
            c.liveness_timeout_seconds = 10;
        }
        if c.command_timeout_seconds == 0 {
            warn!("companion.command_timeout_seconds must be > 0; using 5");
            c.command_timeout_seconds = 5;
        }

        let r = &mut self.reconnect;
        if r.initial_delay_ms == 0 {
            warn!("reconnect.initial_delay_ms must be > 0; using 100");
            r.initial_delay_ms = 100;
        }
        if r.max_delay_ms < r.initial_delay_ms {
            warn!(
                "reconnect.max_delay_ms {} below initial delay; raising to {}",
                r.max_delay_ms, r.initial_delay_ms
            );
            r.max_delay_ms = r.initial_delay_ms;
        }
        if !(0.0..=1.0).contains(&r.jitter) || r.jitter.is_nan() {
            let clamped = if r.jitter.is_nan() { 0.0 } else { r.jitter.clamp(0.0, 1.0) };
            warn!("reconnect.jitter {} outside 0..=1; using {}", r.jitter, clamped);
            r.jitter = clamped;
        }
        if r.max_attempts == Some(0) {
            warn!("reconnect.max_attempts = 0 would never connect; using 1");
            r.max_attempts = Some(1);
        }

        let s = &mut self.send;
        if s.max_attempts == 0 {
            warn!("send.max_attempts must be >= 1; using 1");
            s.max_attempts = 1;
        }
        if s.ack_timeout_seconds == 0 {
            warn!("send.ack_timeout_seconds must be > 0; using 15");
            s.ack_timeout_seconds = 15;
        }
        if s.retry_backoff_seconds.is_empty() {
            warn!("send.retry_backoff_seconds is empty; using [4, 8, 16]");
            s.retry_backoff_seconds = vec![4, 8, 16];
        }
        if s.max_text_bytes == 0 || s.max_text_bytes > 160 {
            warn!(
                "send.max_text_bytes {} outside 1..=160; using {}",
                s.max_text_bytes, DEFAULT_MAX_TEXT_BYTES
            );
            s.max_text_bytes = DEFAULT_MAX_TEXT_BYTES;
        }

        if self.sync.drain_limit == 0 {
            warn!("sync.drain_limit must be > 0; using 200");
            self.sync.drain_limit = 200;
        }
        self
    }
}

impl CompanionConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.channel_refresh_seconds.max(5))
    }
    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_seconds)
    }
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_seconds)
    }
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }
}

impl SendConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_seconds)
    }

    /// Delay before retry number `retry` (1-based); the last entry repeats.
    pub fn retry_delay(&self, retry: u8) -> Duration {
        let idx = (retry.max(1) as usize - 1).min(self.retry_backoff_seconds.len().saturating_sub(1));
        Duration::from_secs(self.retry_backoff_seconds.get(idx).copied().unwrap_or(4))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.companion.transport, "tcp");
        assert_eq!(config.companion.endpoint, "meshcore-dev.local:5000");
        assert_eq!(config.companion.channel_refresh_seconds, 30);
        assert_eq!(config.send.max_attempts, 3);
        assert_eq!(config.send.retry_backoff_seconds, vec![4, 8, 16]);
        assert_eq!(config.send.ack_timeout_seconds, 15);
        assert_eq!(config.sync.drain_limit, 200);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [companion]
            transport = "tcp"
            endpoint = "10.0.0.5:5000"
            "#,
        )
        .unwrap();
        assert_eq!(config.companion.transport, "tcp");
        assert_eq!(config.companion.device, "auto");
        assert_eq!(config.send, SendConfig::default());
    }

    #[test]
    fn sanitize_clamps_out_of_range_values() {
        let mut config = Config::default();
        config.companion.channel_refresh_seconds = 1;
        config.reconnect.jitter = 3.0;
        config.reconnect.max_delay_ms = 10;
        config.send.max_attempts = 0;
        config.send.retry_backoff_seconds.clear();
        config.send.max_text_bytes = 999;
        let config = config.sanitized();
        assert_eq!(config.companion.channel_refresh_seconds, 5);
        assert_eq!(config.reconnect.jitter, 1.0);
        assert_eq!(config.reconnect.max_delay_ms, config.reconnect.initial_delay_ms);
        assert_eq!(config.send.max_attempts, 1);
        assert_eq!(config.send.retry_backoff_seconds, vec![4, 8, 16]);
        assert_eq!(config.send.max_text_bytes, DEFAULT_MAX_TEXT_BYTES);
    }

    #[test]
    fn retry_delay_repeats_last_entry() {
        let send = SendConfig::default();
        assert_eq!(send.retry_delay(1), Duration::from_secs(4));
        assert_eq!(send.retry_delay(2), Duration::from_secs(8));
        assert_eq!(send.retry_delay(3), Duration::from_secs(16));
        assert_eq!(send.retry_delay(7), Duration::from_secs(16));
    }

    #[tokio::test]
    async fn load_or_init_writes_defaults_then_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conf").join("config.toml");
        let path = path.to_str().unwrap();
        let missing_example = dir.path().join("nope.toml");

        let mut config = Config::load_or_init(path, missing_example.to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config, Config::default());

        config
            .mutate(path, |c| c.companion.transport = "serial".into())
            .await
            .unwrap();
        let mut reread = Config::default();
        reread.reload(path).await.unwrap();
        assert_eq!(reread.companion.transport, "serial");
    }

    #[tokio::test]
    async fn reloaded_values_apply_to_the_next_session_only() {
        use crate::sync::SessionSettings;

        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let path = path.to_str().unwrap();
        let mut config = Config::default();
        config.save(path).await.unwrap();
        let running = SessionSettings::from_config(&config);

        std::fs::write(
            path,
            "[companion]\nliveness_interval_seconds = 7\n\n[reconnect]\nmax_attempts = 4\n",
        )
        .unwrap();
        config.reload(path).await.unwrap();

        let next = SessionSettings::from_config(&config);
        assert_eq!(next.liveness_interval, Duration::from_secs(7));
        assert_eq!(next.reconnect_max_attempts, Some(4));
        assert_eq!(running.reconnect_max_attempts, Some(10));

        std::fs::write(path, "not = [valid").unwrap();
        assert!(config.reload(path).await.is_err());
        assert_eq!(config.reconnect.max_attempts, Some(4));
    }

    #[tokio::test]
    async fn load_or_init_copies_example_file() {
        let dir = tempdir().unwrap();
        let example = dir.path().join("config.example.toml");
        std::fs::write(&example, "[companion]\ntransport = \"fake\"\n").unwrap();
        let path = dir.path().join("config.toml");

        let config = Config::load_or_init(path.to_str().unwrap(), example.to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(config.companion.transport, "fake");
        assert!(path.exists());
    }
}
