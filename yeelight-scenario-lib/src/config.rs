use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::scenario::{Scenario, ScenarioTable};
use crate::util::discovery::{DEFAULT_BOUNCE_WINDOW, DISCOVERY_MULTICAST_ADDRESS, DISCOVERY_PORT};

/// Port the probe socket binds to when `localAddress` names only a host.
pub const DEFAULT_PROBE_PORT: u16 = 8001;

/// Longest accepted listening phase: one week.
pub const MAX_REFRESH_MINUTES: u64 = 7 * 24 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn default_listen_address() -> String {
    DISCOVERY_MULTICAST_ADDRESS.to_string()
}

fn default_local_address() -> String {
    format!("0.0.0.0:{}", DEFAULT_PROBE_PORT)
}

fn default_refresh_minutes() -> u64 {
    5
}

fn default_bounce_seconds() -> u64 {
    DEFAULT_BOUNCE_WINDOW.as_secs()
}

fn default_discovery_port() -> u16 {
    DISCOVERY_PORT
}

/// Network parameters of the controller, usually read from `main.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    /// Multicast group the listener joins.
    #[serde(rename = "udpAddress", default = "default_listen_address")]
    pub listen_address: String,
    /// Address the probe socket binds to.
    #[serde(default = "default_local_address")]
    pub local_address: String,
    /// Length of the listening phase, in minutes.
    #[serde(rename = "refreshTimer", default = "default_refresh_minutes")]
    pub refresh_minutes: u64,
    #[serde(default = "default_bounce_seconds")]
    pub bounce_seconds: u64,
    /// Port probes are sent to on each scenario's device.
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            listen_address: default_listen_address(),
            local_address: default_local_address(),
            refresh_minutes: default_refresh_minutes(),
            bounce_seconds: default_bounce_seconds(),
            discovery_port: default_discovery_port(),
        }
    }
}

impl NetworkConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: NetworkConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.refresh_minutes == 0 {
            return Err(ConfigError::Invalid(
                "refreshTimer must be at least one minute".to_string(),
            ));
        }
        if self.refresh_minutes > MAX_REFRESH_MINUTES {
            return Err(ConfigError::Invalid(format!(
                "refreshTimer must not exceed {} minutes",
                MAX_REFRESH_MINUTES
            )));
        }
        if self.listen_address.trim().is_empty() {
            return Err(ConfigError::Invalid("udpAddress is empty".to_string()));
        }
        if self.local_address.trim().is_empty() {
            return Err(ConfigError::Invalid("localAddress is empty".to_string()));
        }
        Ok(())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_minutes.saturating_mul(60))
    }

    pub fn bounce_window(&self) -> Duration {
        Duration::from_secs(self.bounce_seconds)
    }

    /// The probe bind address, with [`DEFAULT_PROBE_PORT`] appended when
    /// `localAddress` is a bare host.
    pub fn probe_local_address(&self) -> String {
        join_host_port(&self.local_address, DEFAULT_PROBE_PORT)
    }

    /// Where to send the probe for the bulb known as `identity`.
    pub fn probe_remote_address(&self, identity: &str) -> String {
        join_host_port(identity, self.discovery_port)
    }
}

/// Appends `port` to `host` unless it already carries one.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.parse::<SocketAddr>().is_ok() {
        return host.to_string();
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return SocketAddr::new(ip, port).to_string();
    }
    if host.contains(':') {
        host.to_string()
    } else {
        format!("{}:{}", host, port)
    }
}

/// Decodes the scenario list, usually read from `scenarios.yaml`.
pub fn scenarios_from_yaml_str(yaml: &str) -> Result<ScenarioTable, ConfigError> {
    let scenarios: Vec<Scenario> = serde_yaml::from_str(yaml)?;
    if let Some(unnamed) = scenarios
        .iter()
        .position(|scenario| scenario.device_identity.trim().is_empty())
    {
        return Err(ConfigError::Invalid(format!(
            "scenario #{} has an empty hostAddress",
            unnamed + 1
        )));
    }
    Ok(ScenarioTable::new(scenarios))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_config_from_yaml() {
        let yaml = "udpAddress: 239.255.255.250:1982\nlocalAddress: 192.168.1.5\nrefreshTimer: 10\n";
        let config = NetworkConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.listen_address, "239.255.255.250:1982");
        assert_eq!(config.refresh_interval(), Duration::from_secs(600));
        assert_eq!(config.bounce_window(), Duration::from_secs(30));
        assert_eq!(config.probe_local_address(), "192.168.1.5:8001");
        assert_eq!(config.probe_remote_address("10.0.0.7"), "10.0.0.7:1982");
    }

    #[test]
    fn test_network_config_defaults() {
        let config = NetworkConfig::from_yaml_str("bounceSeconds: 5\n").unwrap();
        assert_eq!(
            config,
            NetworkConfig {
                bounce_seconds: 5,
                ..NetworkConfig::default()
            }
        );
        assert_eq!(config.probe_local_address(), "0.0.0.0:8001");
    }

    #[test]
    fn test_zero_refresh_is_invalid() {
        let err = NetworkConfig::from_yaml_str("refreshTimer: 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_huge_refresh_is_invalid() {
        let err = NetworkConfig::from_yaml_str("refreshTimer: 18446744073709551615\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(NetworkConfig::from_yaml_str("refreshTimer: 10080\n").is_ok());

        let unchecked = NetworkConfig {
            refresh_minutes: u64::MAX,
            ..NetworkConfig::default()
        };
        assert_eq!(unchecked.refresh_interval(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn test_join_host_port() {
        assert_eq!(join_host_port("bulb.lan", 1982), "bulb.lan:1982");
        assert_eq!(join_host_port("bulb.lan:7", 1982), "bulb.lan:7");
        assert_eq!(join_host_port("fe80::1", 1982), "[fe80::1]:1982");
    }

    #[test]
    fn test_scenarios_require_host() {
        let yaml = "- hostAddress: \"\"\n  actions: []\n";
        assert!(matches!(
            scenarios_from_yaml_str(yaml),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_scenarios_from_yaml() {
        let yaml = "- hostAddress: 192.168.1.239\n  actions:\n    - timer: \"07:15\"\n      colorTemperature: 4000\n      brightness: 80\n";
        let table = scenarios_from_yaml_str(yaml).unwrap();
        assert_eq!(table.identities(), vec!["192.168.1.239"]);
    }
}
