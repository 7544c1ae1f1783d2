/*
[INPUT]:  Caller-chosen session tuning (timeouts, heartbeat, back-off, endpoints)
[OUTPUT]: Validated SessionConfig consumed by the session supervisor
[POS]:    Configuration layer - session policy knobs
[UPDATE]: When adding session options or changing defaults
*/

use std::time::Duration;

use crate::error::{Result, SessionError};
use crate::region::{self, Endpoint};

const DEFAULT_ORIGIN: &str = "https://pocketoption.com";
const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Reconnect back-off bounds
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub min: Duration,
    pub max: Duration,
    /// Fraction of the delay randomly added or removed, in `0.0..=1.0`
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

/// Session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub auto_reconnect: bool,
    /// Send keep-alive probes and expire silent connections
    pub keep_alive: bool,
    pub heartbeat_interval: Duration,
    pub heartbeat_miss_threshold: u32,
    pub backoff: BackoffConfig,
    pub command_timeout_default: Duration,
    /// Bound on one transport open
    pub connect_attempt_timeout: Duration,
    /// Bound on the handshake after the transport opened
    pub auth_timeout: Duration,
    /// Bound on the whole `connect()` call
    pub connect_timeout: Duration,
    /// Malformed frames tolerated per connection before it is recycled
    pub decode_error_tolerance: u32,
    /// Hold commands until the next CONNECTED instead of failing fast
    pub queue_while_disconnected: bool,
    pub outbound_capacity: usize,
    pub endpoints: Vec<Endpoint>,
    /// Extra WebSocket upgrade headers
    pub headers: Vec<(String, String)>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::demo()
    }
}

impl SessionConfig {
    /// Defaults with an explicit endpoint list.
    pub fn with_endpoints(endpoints: Vec<Endpoint>) -> Self {
        Self {
            auto_reconnect: true,
            keep_alive: true,
            heartbeat_interval: Duration::from_secs(20),
            heartbeat_miss_threshold: 3,
            backoff: BackoffConfig::default(),
            command_timeout_default: Duration::from_secs(30),
            connect_attempt_timeout: Duration::from_secs(10),
            auth_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(60),
            decode_error_tolerance: 8,
            queue_while_disconnected: false,
            outbound_capacity: 100,
            endpoints,
            headers: vec![
                ("Origin".to_string(), DEFAULT_ORIGIN.to_string()),
                ("User-Agent".to_string(), DEFAULT_USER_AGENT.to_string()),
            ],
        }
    }

    /// Defaults against the venue's demo regions.
    pub fn demo() -> Self {
        Self::with_endpoints(region::demo_endpoints())
    }

    /// Defaults against the venue's live regions.
    pub fn live() -> Self {
        Self::with_endpoints(region::live_endpoints())
    }

    /// Add or replace an upgrade header.
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers
            .retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
        self.headers.push((name.to_string(), value.into()));
        self
    }

    /// Silence tolerated before the connection is declared dead.
    pub fn liveness_timeout(&self) -> Duration {
        self.heartbeat_interval * self.heartbeat_miss_threshold
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(SessionError::Config("no endpoints configured".to_string()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(SessionError::Config(
                "heartbeat_interval must be positive".to_string(),
            ));
        }
        if self.heartbeat_miss_threshold == 0 {
            return Err(SessionError::Config(
                "heartbeat_miss_threshold must be at least 1".to_string(),
            ));
        }
        if self.backoff.min.is_zero() || self.backoff.min > self.backoff.max {
            return Err(SessionError::Config(format!(
                "backoff bounds invalid: min {:?}, max {:?}",
                self.backoff.min, self.backoff.max
            )));
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter) {
            return Err(SessionError::Config(format!(
                "backoff jitter {} outside 0.0..=1.0",
                self.backoff.jitter
            )));
        }
        if self.command_timeout_default.is_zero()
            || self.connect_attempt_timeout.is_zero()
            || self.auth_timeout.is_zero()
            || self.connect_timeout.is_zero()
        {
            return Err(SessionError::Config("timeouts must be positive".to_string()));
        }
        if self.outbound_capacity == 0 {
            return Err(SessionError::Config(
                "outbound_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
