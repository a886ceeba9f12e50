//! Session configuration.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{HubError, Result};
use crate::transport::DEFAULT_MAX_MESSAGE_SIZE;
use crate::writer::WriterConfig;

/// Default limit on concurrently running client-result handlers.
pub const DEFAULT_MAX_CONCURRENT_CLIENT_RESULTS: usize = 256;

/// Tunables of a hub session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HubConfig {
    /// Client heartbeat interval (default: disabled)
    pub heartbeat_interval: Option<Duration>,
    /// Time allowed for a client heartbeat to be answered (default: disabled)
    pub heartbeat_timeout: Option<Duration>,
    /// Outbound queue settings
    pub writer: WriterConfig,
    /// Largest inbound message accepted, in bytes (default: 4 MiB)
    pub max_message_size: u32,
    /// Concurrent client-result handlers before requests are rejected (default: 256)
    pub max_concurrent_client_results: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: None,
            heartbeat_timeout: None,
            writer: WriterConfig::default(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_concurrent_client_results: DEFAULT_MAX_CONCURRENT_CLIENT_RESULTS,
        }
    }
}

fn parse_var<T: FromStr>(
    lookup: &dyn Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| HubError::Config(format!("invalid {name}: {e}"))),
    }
}

/// Zero disables.
fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl HubConfig {
    /// Load configuration from environment variables, starting from defaults.
    ///
    /// # Optional Environment Variables
    /// - `STREAMINGHUB_HEARTBEAT_INTERVAL_MS` - Client heartbeat interval (0 disables)
    /// - `STREAMINGHUB_HEARTBEAT_TIMEOUT_MS` - Client heartbeat timeout (0 disables)
    /// - `STREAMINGHUB_MAX_PENDING_FRAMES` - Backpressure threshold (default: 1024)
    /// - `STREAMINGHUB_CHANNEL_CAPACITY` - Outbound queue capacity (default: 1024)
    /// - `STREAMINGHUB_BACKPRESSURE_TIMEOUT_MS` - Backpressure wait (default: 5000)
    /// - `STREAMINGHUB_MAX_MESSAGE_SIZE` - Inbound message limit in bytes (default: 4194304)
    /// - `STREAMINGHUB_MAX_CONCURRENT_CLIENT_RESULTS` - Handler limit (default: 256)
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(ms) = parse_var::<u64>(&lookup, "STREAMINGHUB_HEARTBEAT_INTERVAL_MS")? {
            config.heartbeat_interval = millis(ms);
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "STREAMINGHUB_HEARTBEAT_TIMEOUT_MS")? {
            config.heartbeat_timeout = millis(ms);
        }
        if let Some(n) = parse_var(&lookup, "STREAMINGHUB_MAX_PENDING_FRAMES")? {
            config.writer.max_pending_frames = n;
        }
        if let Some(n) = parse_var(&lookup, "STREAMINGHUB_CHANNEL_CAPACITY")? {
            config.writer.channel_capacity = n;
        }
        if let Some(ms) = parse_var(&lookup, "STREAMINGHUB_BACKPRESSURE_TIMEOUT_MS")? {
            config.writer.backpressure_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var(&lookup, "STREAMINGHUB_MAX_MESSAGE_SIZE")? {
            config.max_message_size = n;
        }
        if let Some(n) = parse_var(&lookup, "STREAMINGHUB_MAX_CONCURRENT_CLIENT_RESULTS")? {
            config.max_concurrent_client_results = n;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the session cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.writer.channel_capacity == 0 {
            return Err(HubError::Config("channel capacity must be positive".into()));
        }
        if self.writer.max_pending_frames == 0 {
            return Err(HubError::Config("max pending frames must be positive".into()));
        }
        if self.max_message_size == 0 {
            return Err(HubError::Config("max message size must be positive".into()));
        }
        if self.max_concurrent_client_results == 0 {
            return Err(HubError::Config(
                "max concurrent client results must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Set the client heartbeat interval and timeout.
    pub fn with_heartbeat(mut self, interval: Duration, timeout: Option<Duration>) -> Self {
        self.heartbeat_interval = Some(interval);
        self.heartbeat_timeout = timeout;
        self
    }

    /// Set the writer settings.
    pub fn with_writer(mut self, writer: WriterConfig) -> Self {
        self.writer = writer;
        self
    }

    /// Set the inbound message size limit.
    pub fn with_max_message_size(mut self, size: u32) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set the client-result concurrency limit.
    pub fn with_max_concurrent_client_results(mut self, limit: usize) -> Self {
        self.max_concurrent_client_results = limit;
        self
    }
}
