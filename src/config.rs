//! Runtime Configuration
//!
//! Defaults match the reference timings; every field can be overridden from
//! `DUEL_*` environment variables.

use std::time::Duration;
use tracing::warn;

use crate::replication::map::MapGenConfig;
use crate::session::negotiator::NegotiatorConfig;
use crate::session::relay::{IceServerConfig, DEFAULT_STUN_URLS};

/// Tunables for one client.
#[derive(Debug, Clone)]
pub struct DuelConfig {
    /// Pose replication rate (`DUEL_TICK_RATE_HZ`).
    pub tick_rate_hz: u32,
    /// Candidate gathering ceiling (`DUEL_GATHER_TIMEOUT_MS`).
    pub gather_timeout: Duration,
    /// Session connect timeout (`DUEL_CONNECT_TIMEOUT_MS`).
    pub connect_timeout: Duration,
    /// Delay between death and respawn (`DUEL_RESPAWN_DELAY_MS`).
    pub respawn_delay: Duration,
    /// How long a finished match waits for late deaths before presenting
    /// (`DUEL_RESULT_SETTLE_MS`).
    pub result_settle: Duration,
    /// STUN URLs (`DUEL_STUN_URLS`, comma separated).
    pub stun_urls: Vec<String>,
    /// TURN credential endpoint (`DUEL_RELAY_CREDENTIALS_URL`).
    pub relay_credentials_url: Option<String>,
    /// Limit on the credential request (`DUEL_RELAY_TIMEOUT_MS`).
    pub relay_timeout: Duration,
    /// Data channel label.
    pub channel_label: String,
    /// Arena generation parameters.
    pub map: MapGenConfig,
}

impl Default for DuelConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: crate::DEFAULT_TICK_RATE,
            gather_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(30),
            respawn_delay: Duration::from_millis(crate::DEFAULT_RESPAWN_DELAY_MS),
            result_settle: Duration::from_millis(1000),
            stun_urls: DEFAULT_STUN_URLS.iter().map(|s| s.to_string()).collect(),
            relay_credentials_url: None,
            relay_timeout: Duration::from_secs(5),
            channel_label: "tank-duel".to_string(),
            map: MapGenConfig::default(),
        }
    }
}

impl DuelConfig {
    /// Load from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from any key lookup. Unset or unparsable values keep the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        let millis = |key: &str| -> Option<Duration> {
            let raw = lookup(key)?;
            match raw.trim().parse::<u64>() {
                Ok(ms) => Some(Duration::from_millis(ms)),
                Err(_) => {
                    warn!("Ignoring {}={:?}: not a number of milliseconds", key, raw);
                    None
                }
            }
        };

        if let Some(raw) = lookup("DUEL_TICK_RATE_HZ") {
            match raw.trim().parse::<u32>() {
                Ok(hz) if hz > 0 => config.tick_rate_hz = hz,
                _ => warn!("Ignoring DUEL_TICK_RATE_HZ={:?}", raw),
            }
        }
        if let Some(d) = millis("DUEL_GATHER_TIMEOUT_MS") {
            config.gather_timeout = d;
        }
        if let Some(d) = millis("DUEL_CONNECT_TIMEOUT_MS") {
            config.connect_timeout = d;
        }
        if let Some(d) = millis("DUEL_RESPAWN_DELAY_MS") {
            config.respawn_delay = d;
        }
        if let Some(d) = millis("DUEL_RESULT_SETTLE_MS") {
            config.result_settle = d;
        }
        if let Some(d) = millis("DUEL_RELAY_TIMEOUT_MS") {
            config.relay_timeout = d;
        }
        if let Some(raw) = lookup("DUEL_STUN_URLS") {
            let urls: Vec<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            if !urls.is_empty() {
                config.stun_urls = urls;
            }
        }
        config.relay_credentials_url = lookup("DUEL_RELAY_CREDENTIALS_URL")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        config
    }

    /// Interval between pose updates.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(1) / self.tick_rate_hz.max(1)
    }

    /// Negotiator settings for the given ICE servers.
    pub fn negotiator_config(&self, ice_servers: Vec<IceServerConfig>) -> NegotiatorConfig {
        NegotiatorConfig {
            gather_timeout: self.gather_timeout,
            connect_timeout: self.connect_timeout,
            ice_servers,
            channel_label: self.channel_label.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = DuelConfig::default();
        assert_eq!(config.tick_interval(), Duration::from_millis(50));
        assert_eq!(config.gather_timeout, Duration::from_secs(10));
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.respawn_delay, Duration::from_secs(2));
        assert_eq!(config.result_settle, Duration::from_secs(1));
        assert_eq!(config.relay_timeout, Duration::from_secs(5));
        assert!(!config.stun_urls.is_empty());
        assert!(config.relay_credentials_url.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = DuelConfig::from_lookup(lookup(&[
            ("DUEL_TICK_RATE_HZ", "30"),
            ("DUEL_CONNECT_TIMEOUT_MS", "5000"),
            ("DUEL_RELAY_TIMEOUT_MS", "1500"),
            ("DUEL_STUN_URLS", "stun:a:1, stun:b:2"),
            ("DUEL_RELAY_CREDENTIALS_URL", "https://relay.example.com/creds"),
        ]));
        assert_eq!(config.tick_rate_hz, 30);
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.relay_timeout, Duration::from_millis(1500));
        assert_eq!(config.stun_urls, vec!["stun:a:1".to_string(), "stun:b:2".to_string()]);
        assert_eq!(config.relay_credentials_url.as_deref(), Some("https://relay.example.com/creds"));
    }

    #[test]
    fn test_bad_values_keep_defaults() {
        let config = DuelConfig::from_lookup(lookup(&[
            ("DUEL_TICK_RATE_HZ", "0"),
            ("DUEL_RESPAWN_DELAY_MS", "soon"),
            ("DUEL_STUN_URLS", " , "),
        ]));
        assert_eq!(config.tick_rate_hz, 20);
        assert_eq!(config.respawn_delay, Duration::from_secs(2));
        assert_eq!(config.stun_urls, DuelConfig::default().stun_urls);
    }

    #[test]
    fn test_negotiator_config_carries_timeouts() {
        let config = DuelConfig { gather_timeout: Duration::from_secs(3), ..Default::default() };
        let negotiator = config.negotiator_config(vec![]);
        assert_eq!(negotiator.gather_timeout, Duration::from_secs(3));
        assert_eq!(negotiator.channel_label, "tank-duel");
    }
}
