/*
[INPUT]:  YAML configuration file, optional SSID override
[OUTPUT]: Session configuration, credentials, and monitoring options
[POS]:    Configuration layer - runner setup
[UPDATE]: When adding new configuration options
*/

use std::time::Duration;

use anyhow::{Context, Result, bail};
use pocket_session::config::BackoffConfig;
use pocket_session::{Credentials, Endpoint, SessionConfig, region};
use serde::{Deserialize, Serialize};

/// Top-level configuration for the session runner
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunnerConfig {
    /// Raw auth frame captured from a browser session; the environment wins
    #[serde(default)]
    pub ssid: Option<String>,
    /// Picks the demo or live region set; defaults to the flag inside the ssid
    #[serde(default)]
    pub demo: Option<bool>,
    /// Region names from the built-in catalog
    #[serde(default)]
    pub regions: Vec<String>,
    /// Explicit endpoint URLs; take precedence over `regions`
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub session: SessionTuning,
    /// Push event tags to log
    #[serde(default)]
    pub watch: Vec<String>,
    /// Price streams to request on every connect
    #[serde(default)]
    pub symbols: Vec<SymbolConfig>,
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

/// Session knobs, in seconds
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionTuning {
    pub auto_reconnect: bool,
    pub keep_alive: bool,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_miss_threshold: u32,
    pub backoff_min_secs: u64,
    pub backoff_max_secs: u64,
    pub command_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub queue_while_disconnected: bool,
}

impl Default for SessionTuning {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            keep_alive: true,
            heartbeat_interval_secs: 20,
            heartbeat_miss_threshold: 3,
            backoff_min_secs: 1,
            backoff_max_secs: 30,
            command_timeout_secs: 30,
            connect_timeout_secs: 60,
            queue_while_disconnected: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SymbolConfig {
    /// Asset name (e.g., "EURUSD_otc")
    pub asset: String,
    /// Candle period
    #[serde(default = "default_period_secs")]
    pub period_secs: u64,
}

fn default_stats_interval_secs() -> u64 {
    60
}

fn default_period_secs() -> u64 {
    60
}

impl RunnerConfig {
    /// Load configuration from YAML file
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// Credentials from `ssid_override` (CLI/env) or the file.
    pub fn credentials(&self, ssid_override: Option<&str>) -> Result<Credentials> {
        let ssid = ssid_override
            .or(self.ssid.as_deref())
            .context("no ssid: set POCKET_OPTION_SSID or `ssid` in the config")?;
        Credentials::from_ssid(ssid).context("parse ssid")
    }

    /// Whether the default region set should be the demo one.
    pub fn is_demo(&self, credentials: &Credentials) -> bool {
        self.demo.unwrap_or_else(|| credentials.is_demo())
    }

    /// Session config for an account that is demo or live.
    pub fn session_config(&self, is_demo: bool) -> Result<SessionConfig> {
        let endpoints = if !self.endpoints.is_empty() {
            self.endpoints
                .iter()
                .enumerate()
                .map(|(index, url)| Endpoint::new(url, format!("CUSTOM{index}"), index as u32))
                .collect::<pocket_session::Result<Vec<_>>>()
                .context("parse endpoints")?
        } else if !self.regions.is_empty() {
            region::endpoints_for(&self.regions).context("resolve regions")?
        } else if is_demo {
            region::demo_endpoints()
        } else {
            region::live_endpoints()
        };

        let tuning = &self.session;
        let mut config = SessionConfig::with_endpoints(endpoints);
        config.auto_reconnect = tuning.auto_reconnect;
        config.keep_alive = tuning.keep_alive;
        config.heartbeat_interval = Duration::from_secs(tuning.heartbeat_interval_secs);
        config.heartbeat_miss_threshold = tuning.heartbeat_miss_threshold;
        config.backoff = BackoffConfig {
            min: Duration::from_secs(tuning.backoff_min_secs),
            max: Duration::from_secs(tuning.backoff_max_secs),
            ..BackoffConfig::default()
        };
        config.command_timeout_default = Duration::from_secs(tuning.command_timeout_secs);
        config.connect_timeout = Duration::from_secs(tuning.connect_timeout_secs);
        config.queue_while_disconnected = tuning.queue_while_disconnected;

        config.validate().context("invalid session settings")?;
        Ok(config)
    }

    pub fn stats_interval(&self) -> Result<Duration> {
        if self.stats_interval_secs == 0 {
            bail!("stats_interval_secs must be positive");
        }
        Ok(Duration::from_secs(self.stats_interval_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    const SSID: &str = r#"42["auth",{"session":"abc","isDemo":1,"uid":99,"platform":2}]"#;

    #[test]
    fn minimal_config_uses_defaults() {
        let config = RunnerConfig::from_yaml("watch: [successupdateBalance]\n").unwrap();
        assert!(config.ssid.is_none());
        assert_eq!(config.stats_interval_secs, 60);
        assert_eq!(config.session.heartbeat_interval_secs, 20);

        let session = config.session_config(true).unwrap();
        assert!(!session.endpoints.is_empty());
        assert!(session.endpoints.iter().all(|endpoint| endpoint.region.starts_with("DEMO")));
    }

    #[test]
    fn explicit_endpoints_win_over_regions() {
        let yaml = r#"
regions: [EUROPA]
endpoints:
  - "ws://127.0.0.1:9000/socket.io/?EIO=4&transport=websocket"
session:
  heartbeat_interval_secs: 5
  auto_reconnect: false
symbols:
  - asset: EURUSD_otc
"#;
        let config = RunnerConfig::from_yaml(yaml).unwrap();
        let session = config.session_config(false).unwrap();
        assert_eq!(session.endpoints.len(), 1);
        assert_eq!(session.endpoints[0].region, "CUSTOM0");
        assert_eq!(session.heartbeat_interval, Duration::from_secs(5));
        assert!(!session.auto_reconnect);
        assert_eq!(config.symbols[0].period_secs, 60);
    }

    #[test]
    fn unknown_region_is_an_error() {
        let config = assert_ok!(RunnerConfig::from_yaml("regions: [ATLANTIS]\n"));
        assert_err!(config.session_config(true));
    }

    #[test]
    fn ssid_override_beats_file() {
        let config = RunnerConfig::from_yaml(&format!("ssid: '{SSID}'\n")).unwrap();
        assert_eq!(config.credentials(None).unwrap().uid(), 99);

        let other = r#"42["auth",{"session":"xyz","isDemo":0,"uid":5}]"#;
        let credentials = config.credentials(Some(other)).unwrap();
        assert_eq!(credentials.uid(), 5);
        assert!(!credentials.is_demo());

        let empty = RunnerConfig::from_yaml("{}").unwrap();
        assert!(empty.credentials(None).is_err());
    }

    #[test]
    fn demo_flag_overrides_ssid() {
        let config = RunnerConfig::from_yaml(&format!("ssid: '{SSID}'\n")).unwrap();
        let credentials = config.credentials(None).unwrap();
        assert!(config.is_demo(&credentials));

        let live = RunnerConfig::from_yaml(&format!("ssid: '{SSID}'\ndemo: false\n")).unwrap();
        assert!(!live.is_demo(&credentials));
    }

    #[test]
    fn zero_stats_interval_is_rejected() {
        let config = assert_ok!(RunnerConfig::from_yaml("stats_interval_secs: 0\n"));
        assert_err!(config.stats_interval());
    }
}
