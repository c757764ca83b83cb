//! Configuration validation.

use crate::backend::parse_backend_url;
use crate::config::Config;
use std::collections::HashSet;

/// Validate the configuration.
///
/// Checks for:
/// - Non-zero, distinct proxy and admin ports
/// - Positive health check frequency and timeouts
/// - Probe timeout strictly shorter than the probe interval
/// - Well-formed, unique backend URLs
/// - A positive sticky session TTL when sticky sessions are enabled
/// - A known log level
///
/// # Returns
///
/// `Ok(())` if valid, or an error message describing every problem found.
pub fn validate_config(config: &Config) -> Result<(), String> {
    let mut errors = Vec::new();

    if config.port == 0 {
        errors.push("invalid port: must be between 1-65535".to_string());
    }

    if config.admin_port == 0 {
        errors.push("invalid admin_port: must be between 1-65535".to_string());
    }

    if config.port == config.admin_port {
        errors.push("port and admin_port cannot be the same".to_string());
    }

    if config.health_check_frequency.is_zero() {
        errors.push("health_check_frequency must be positive".to_string());
    }

    if config.backend_timeout.is_zero() {
        errors.push("backend_timeout must be positive".to_string());
    }

    let probe_timeout = config.probe_timeout();
    if probe_timeout.is_zero() {
        errors.push("health_check_timeout must be positive".to_string());
    } else if probe_timeout >= config.health_check_frequency {
        errors.push(format!(
            "health check timeout ({}) must be shorter than health_check_frequency ({})",
            humantime::format_duration(probe_timeout),
            humantime::format_duration(config.health_check_frequency)
        ));
    }

    // Duplicates are detected on the normalized form, matching registry lookups
    let mut seen = HashSet::new();
    for entry in &config.backends {
        match parse_backend_url(&entry.url) {
            Ok(url) => {
                if !seen.insert(url.to_string()) {
                    errors.push(format!("duplicate backend url: {}", entry.url));
                }
            }
            Err(e) => errors.push(format!("invalid backend url '{}': {}", entry.url, e)),
        }
    }

    if config.enable_sticky_sessions && config.sticky_session_ttl.is_zero() {
        errors.push("sticky_session_ttl must be positive when sticky sessions are enabled".to_string());
    }

    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.log_level.to_lowercase().as_str()) {
        errors.push(format!(
            "invalid log level '{}', must be one of: {}",
            config.log_level,
            valid_levels.join(", ")
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::*;
    use std::time::Duration;

    fn minimal_config() -> Config {
        serde_json::from_value(serde_json::json!({
            "port": 8080,
            "admin_port": 8081,
            "health_check_frequency": "10s",
            "backend_timeout": "2s",
            "backends": [
                { "url": "http://127.0.0.1:9001" },
                { "url": "http://127.0.0.1:9002", "weight": 3 }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_valid_config() {
        assert!(validate_config(&minimal_config()).is_ok());
    }

    #[test]
    fn test_no_backends_is_valid() {
        let mut config = minimal_config();
        config.backends.clear();
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_same_ports() {
        let mut config = minimal_config();
        config.admin_port = config.port;
        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("cannot be the same"));
    }

    #[test]
    fn test_zero_port() {
        let mut config = minimal_config();
        config.port = 0;
        assert!(validate_config(&config).unwrap_err().contains("invalid port"));
    }

    #[test]
    fn test_probe_timeout_not_shorter_than_interval() {
        let mut config = minimal_config();
        config.health_check_timeout = Some(Duration::from_secs(10));
        let result = validate_config(&config);
        assert!(result.unwrap_err().contains("must be shorter than"));
    }

    #[test]
    fn test_invalid_backend_url() {
        let mut config = minimal_config();
        config.backends.push(BackendEntry {
            url: "not a url".to_string(),
            weight: 1,
        });
        assert!(validate_config(&config).unwrap_err().contains("invalid backend url"));
    }

    #[test]
    fn test_duplicate_backend_after_normalization() {
        let mut config = minimal_config();
        config.backends.push(BackendEntry {
            url: "HTTP://127.0.0.1:9001/".to_string(),
            weight: 1,
        });
        assert!(validate_config(&config).unwrap_err().contains("duplicate backend url"));
    }

    #[test]
    fn test_sticky_ttl_zero() {
        let mut config = minimal_config();
        config.enable_sticky_sessions = true;
        config.sticky_session_ttl = Duration::ZERO;
        assert!(validate_config(&config).unwrap_err().contains("sticky_session_ttl"));
    }

    #[test]
    fn test_errors_are_collected() {
        let mut config = minimal_config();
        config.port = 0;
        config.log_level = "loud".to_string();
        let err = validate_config(&config).unwrap_err();
        assert!(err.contains("invalid port"));
        assert!(err.contains("invalid log level"));
    }
}
