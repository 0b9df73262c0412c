use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use regex::Regex;
use thiserror::Error;

use crate::domain::models::config::Config;

/// Configuration error types
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Socket path cannot be empty")]
    EmptySocketPath,

    #[error("Invalid {field}: must be greater than zero")]
    ZeroValue { field: &'static str },

    #[error(
        "Invalid timeouts: default_timeout_ms ({0}) must not exceed max_timeout_ms ({1})"
    )]
    InvalidTimeouts(u64, u64),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid log rotation: {0}. Must be one of: daily, hourly, never")]
    InvalidLogRotation(String),

    #[error("Invalid provider kind: {0}. Must be one of: mock, claude_cli")]
    InvalidProviderKind(String),

    #[error("Invalid redaction pattern '{pattern}': {reason}")]
    InvalidRedactPattern { pattern: String, reason: String },
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .switchyard/config.yaml (project config)
    /// 3. .switchyard/local.yaml (local overrides, optional)
    /// 4. Environment variables (SWITCHYARD_* prefix, `__` separates sections)
    pub fn load() -> Result<Config> {
        let config: Config = Self::figment()
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// The layered figment used by [`ConfigLoader::load`]
    pub fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(".switchyard/config.yaml"))
            .merge(Yaml::file(".switchyard/local.yaml"))
            .merge(Env::prefixed("SWITCHYARD_").split("__"))
    }

    /// Load configuration from a specific file over the defaults
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed("SWITCHYARD_").split("__"))
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.daemon.socket_path.trim().is_empty() {
            return Err(ConfigError::EmptySocketPath);
        }

        let non_zero = [
            ("daemon.max_line_bytes", config.daemon.max_line_bytes as u64),
            ("router.handler_timeout_ms", config.router.handler_timeout_ms),
            ("router.broadcast_capacity", config.router.broadcast_capacity as u64),
            ("orchestrator.default_timeout_ms", config.orchestrator.default_timeout_ms),
            ("orchestrator.max_timeout_ms", config.orchestrator.max_timeout_ms),
            (
                "orchestrator.max_queue_per_session",
                config.orchestrator.max_queue_per_session as u64,
            ),
            ("locks.ttl_ms", config.locks.ttl_ms),
            ("injection.max_chain_depth", u64::from(config.injection.max_chain_depth)),
            (
                "injection.max_injections_per_window",
                u64::from(config.injection.max_injections_per_window),
            ),
            ("injection.window_secs", config.injection.window_secs),
            ("maintenance.interval_secs", config.maintenance.interval_secs),
        ];
        if let Some((field, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::ZeroValue { field: *field });
        }

        if config.orchestrator.default_timeout_ms > config.orchestrator.max_timeout_ms {
            return Err(ConfigError::InvalidTimeouts(
                config.orchestrator.default_timeout_ms,
                config.orchestrator.max_timeout_ms,
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        let valid_rotations = ["daily", "hourly", "never"];
        if !valid_rotations.contains(&config.logging.rotation.as_str()) {
            return Err(ConfigError::InvalidLogRotation(config.logging.rotation.clone()));
        }

        let valid_providers = ["mock", "claude_cli"];
        if !valid_providers.contains(&config.provider.kind.as_str()) {
            return Err(ConfigError::InvalidProviderKind(config.provider.kind.clone()));
        }

        for pattern in &config.tracer.redact_keys {
            if let Err(e) = Regex::new(pattern) {
                return Err(ConfigError::InvalidRedactPattern {
                    pattern: pattern.clone(),
                    reason: e.to_string(),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.daemon.socket_path, ".switchyard/switchyard.sock");
        assert_eq!(config.injection.max_chain_depth, 5);
        assert_eq!(config.logging.level, "info");
        ConfigLoader::validate(&config).expect("Default config should be valid");
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r"
daemon:
  socket_path: /tmp/sy.sock
injection:
  max_chain_depth: 3
  coalesce_window_ms: 50
provider:
  kind: mock
logging:
  level: debug
  format: pretty
";

        let config: Config = serde_yaml::from_str(yaml).expect("YAML should parse");

        assert_eq!(config.daemon.socket_path, "/tmp/sy.sock");
        assert_eq!(config.injection.max_chain_depth, 3);
        assert_eq!(config.injection.coalesce_window_ms, 50);
        assert_eq!(config.injection.window_secs, 60);
        assert_eq!(config.provider.kind, "mock");
        assert_eq!(config.logging.format, "pretty");

        ConfigLoader::validate(&config).expect("Parsed config should be valid");
    }

    #[test]
    fn test_validate_empty_socket_path() {
        let mut config = Config::default();
        config.daemon.socket_path = "  ".to_string();
        assert_eq!(ConfigLoader::validate(&config), Err(ConfigError::EmptySocketPath));
    }

    #[test]
    fn test_validate_zero_chain_depth() {
        let mut config = Config::default();
        config.injection.max_chain_depth = 0;
        assert_eq!(
            ConfigLoader::validate(&config),
            Err(ConfigError::ZeroValue {
                field: "injection.max_chain_depth"
            })
        );
    }

    #[test]
    fn test_validate_zero_timeout() {
        let mut config = Config::default();
        config.router.handler_timeout_ms = 0;
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::ZeroValue { .. })
        ));
    }

    #[test]
    fn test_validate_default_above_max_timeout() {
        let mut config = Config::default();
        config.orchestrator.default_timeout_ms = 10_000;
        config.orchestrator.max_timeout_ms = 5_000;
        assert_eq!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidTimeouts(10_000, 5_000))
        );
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "invalid".to_string();

        match ConfigLoader::validate(&config).unwrap_err() {
            ConfigError::InvalidLogLevel(level) => assert_eq!(level, "invalid"),
            other => panic!("Expected InvalidLogLevel error, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_invalid_provider_kind() {
        let mut config = Config::default();
        config.provider.kind = "carrier_pigeon".to_string();
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidProviderKind(_))
        ));
    }

    #[test]
    fn test_validate_bad_redact_pattern() {
        let mut config = Config::default();
        config.tracer.redact_keys = vec!["(unclosed".to_string()];
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidRedactPattern { .. })
        ));
    }

    #[test]
    fn test_env_override() {
        temp_env::with_vars(
            [
                ("SWITCHYARD_INJECTION__MAX_CHAIN_DEPTH", Some("7")),
                ("SWITCHYARD_LOGGING__LEVEL", Some("debug")),
            ],
            || {
                let config: Config = ConfigLoader::figment().extract().unwrap();
                assert_eq!(config.injection.max_chain_depth, 7);
                assert_eq!(config.logging.level, "debug");
            },
        );
    }

    #[test]
    fn test_hierarchical_merging() {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let mut base_file = NamedTempFile::new().unwrap();
        writeln!(
            base_file,
            "locks:\n  ttl_ms: 1000\nlogging:\n  level: info\n  format: json"
        )
        .unwrap();
        base_file.flush().unwrap();

        let mut override_file = NamedTempFile::new().unwrap();
        writeln!(override_file, "locks:\n  ttl_ms: 2000\nlogging:\n  level: debug").unwrap();
        override_file.flush().unwrap();

        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(base_file.path()))
            .merge(Yaml::file(override_file.path()))
            .extract()
            .unwrap();

        assert_eq!(config.locks.ttl_ms, 2000, "Override should win");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(
            config.logging.format, "json",
            "Base value should persist when not overridden"
        );
    }

    #[test]
    fn test_load_from_file() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "provider:\n  kind: mock\norchestrator:\n  max_queue_per_session: 4").unwrap();
        file.flush().unwrap();

        let config = ConfigLoader::load_from_file(file.path()).unwrap();
        assert_eq!(config.provider.kind, "mock");
        assert_eq!(config.orchestrator.max_queue_per_session, 4);
    }
}
