//! Configuration data types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Port the proxy listens on
    pub port: u16,

    /// Port the administrative API listens on
    pub admin_port: u16,

    /// Interface both listeners bind to
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// Backend selection strategy
    #[serde(default)]
    pub strategy: Strategy,

    /// How backends are probed: tcp or http
    #[serde(default)]
    pub health_check_method: HealthCheckMethod,

    /// How often to probe backends
    #[serde(default = "default_health_frequency", with = "humantime_serde")]
    pub health_check_frequency: Duration,

    /// Per-probe timeout (defaults to the backend timeout)
    #[serde(default, with = "option_humantime_serde")]
    pub health_check_timeout: Option<Duration>,

    /// Response timeout for forwarded requests
    #[serde(default = "default_backend_timeout", with = "humantime_serde")]
    pub backend_timeout: Duration,

    /// Backends registered at startup
    #[serde(default)]
    pub backends: Vec<BackendEntry>,

    /// Pin clients to the backend that served them first
    #[serde(default)]
    pub enable_sticky_sessions: bool,

    /// Idle lifetime of a sticky binding
    #[serde(default = "default_sticky_ttl", with = "humantime_serde")]
    pub sticky_session_ttl: Duration,

    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: json or pretty
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Config {
    /// Address the proxy listener binds to.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    /// Address the admin listener binds to.
    pub fn admin_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.admin_port)
    }

    /// Timeout applied to each individual health probe.
    pub fn probe_timeout(&self) -> Duration {
        self.health_check_timeout.unwrap_or(self.backend_timeout)
    }
}

/// One backend entry from the configuration file.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct BackendEntry {
    /// Base URL of the backend, e.g. `http://10.0.0.5:8080`
    pub url: String,

    /// Weight for weighted round-robin (0 or absent means 1)
    #[serde(default)]
    pub weight: u32,
}

impl BackendEntry {
    /// Weight with the zero/absent case normalized to 1.
    pub fn effective_weight(&self) -> u32 {
        self.weight.max(1)
    }
}

/// Backend selection strategy.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    #[default]
    RoundRobin,
    LeastConn,
    Weighted,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::RoundRobin => f.write_str("round-robin"),
            Strategy::LeastConn => f.write_str("least-conn"),
            Strategy::Weighted => f.write_str("weighted"),
        }
    }
}

/// How the health checker probes a backend.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckMethod {
    #[default]
    Tcp,
    Http,
}

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

// Default value functions
fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_health_frequency() -> Duration {
    Duration::from_secs(10)
}

fn default_backend_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_sticky_ttl() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Custom serde module for humantime durations.
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// Custom serde module for optional humantime durations.
mod option_humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => {
                let s = humantime::format_duration(*d).to_string();
                serializer.serialize_some(&s)
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<String> = Option::deserialize(deserializer)?;
        opt.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_defaults() {
        let config: Config = serde_json::from_str(r#"{"port": 8080, "admin_port": 8081}"#).unwrap();
        assert_eq!(config.strategy, Strategy::RoundRobin);
        assert_eq!(config.health_check_method, HealthCheckMethod::Tcp);
        assert_eq!(config.health_check_frequency, Duration::from_secs(10));
        assert_eq!(config.sticky_session_ttl, Duration::from_secs(1800));
        assert!(config.backends.is_empty());
        assert!(!config.enable_sticky_sessions);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.listen_addr(), "0.0.0.0:8080".parse().unwrap());
    }

    #[test]
    fn test_strategy_serde() {
        let s: Strategy = serde_json::from_str(r#""round-robin""#).unwrap();
        assert_eq!(s, Strategy::RoundRobin);

        let s: Strategy = serde_json::from_str(r#""least-conn""#).unwrap();
        assert_eq!(s, Strategy::LeastConn);

        assert!(serde_json::from_str::<Strategy>(r#""random""#).is_err());
    }

    #[test]
    fn test_durations_parse_humantime() {
        let config: Config = serde_json::from_str(
            r#"{
                "port": 8080,
                "admin_port": 8081,
                "health_check_frequency": "2s",
                "backend_timeout": "500ms",
                "sticky_session_ttl": "1m"
            }"#,
        )
        .unwrap();
        assert_eq!(config.health_check_frequency, Duration::from_secs(2));
        assert_eq!(config.backend_timeout, Duration::from_millis(500));
        assert_eq!(config.sticky_session_ttl, Duration::from_secs(60));
        assert_eq!(config.probe_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_bad_duration_rejected() {
        let result = serde_json::from_str::<Config>(
            r#"{"port": 8080, "admin_port": 8081, "backend_timeout": "soon"}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_weight_normalized() {
        let entry = BackendEntry {
            url: "http://127.0.0.1:9000".to_string(),
            weight: 0,
        };
        assert_eq!(entry.effective_weight(), 1);
    }
}
