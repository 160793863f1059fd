use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use toml::Value;

use crate::logging::{LogLevel, LoggerConfig};

pub const DEFAULT_CONFIG_FILE: &str = "jobhop.toml";
pub const CONFIG_PATH_ARG: &str = "--config";

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub broker: BrokerConfig,
    pub maintenance: MaintenanceConfig,
    pub persistence: PersistenceConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub human_friendly: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            human_friendly: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct BrokerConfig {
    pub id: String,
    /// Zero leaves functions unbounded.
    pub default_max_queue_depth: usize,
    pub generated_id_prefix: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            id: "local".to_owned(),
            default_max_queue_depth: 0,
            generated_id_prefix: "anon-".to_owned(),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct MaintenanceConfig {
    pub sweep_interval_ms: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 5_000,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct PersistenceConfig {
    pub enabled: bool,
    pub engine: String,
    pub path: String,
    pub cache_capacity: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            engine: "sled".to_owned(),
            path: "~/.jobhop/data".to_owned(),
            cache_capacity: 64 * 1024 * 1024,
        }
    }
}

impl AppConfig {
    pub fn load_from_toml_with_args(
        path: impl AsRef<Path>,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let toml_content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string_lossy().to_string(),
            source,
        })?;

        let file_value: Value = toml_content
            .parse()
            .map_err(|source| ConfigError::TomlParse {
                path: path.to_string_lossy().to_string(),
                source,
            })?;

        let mut root_value = default_value()?;
        merge_values(&mut root_value, file_value);
        Self::from_value_with_args(root_value, args)
    }

    /// Uses `--config <path>` when given, then `./jobhop.toml` if it exists, then the
    /// built-in defaults. Every other argument is a `--section.key value` override.
    pub fn load_with_discovery(
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let (explicit_path, overrides) = split_config_path(args)?;

        if let Some(path) = explicit_path {
            return Self::load_from_toml_with_args(path, overrides);
        }

        let discovered = PathBuf::from(DEFAULT_CONFIG_FILE);
        if discovered.is_file() {
            return Self::load_from_toml_with_args(discovered, overrides);
        }

        Self::from_value_with_args(default_value()?, overrides)
    }

    pub fn logger_config(&self) -> Result<LoggerConfig, ConfigError> {
        let min_level = LogLevel::from_config_value(&self.logging.level).ok_or_else(|| {
            ConfigError::InvalidLogLevel {
                value: self.logging.level.clone(),
            }
        })?;
        Ok(LoggerConfig {
            min_level,
            human_friendly: self.logging.human_friendly,
        })
    }

    fn from_value_with_args(
        mut root_value: Value,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let overrides = parse_cli_overrides(args)?;
        for (key_path, raw_value) in overrides {
            apply_override(&mut root_value, &key_path, &raw_value)?;
        }

        root_value.try_into().map_err(ConfigError::Deserialize)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: String,
        source: std::io::Error,
    },
    TomlParse {
        path: String,
        source: toml::de::Error,
    },
    Deserialize(toml::de::Error),
    Serialize(toml::ser::Error),
    MissingValueForArg {
        key: String,
    },
    InvalidArgFormat {
        arg: String,
    },
    InvalidPath {
        key: String,
    },
    UnknownPath {
        key: String,
    },
    UnsupportedOverrideType {
        key: String,
    },
    InvalidValueForType {
        key: String,
        expected: &'static str,
        value: String,
    },
    InvalidLogLevel {
        value: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "failed to read config file '{path}': {source}")
            }
            Self::TomlParse { path, source } => {
                write!(f, "failed to parse TOML config '{path}': {source}")
            }
            Self::Deserialize(source) => write!(f, "failed to deserialize config: {source}"),
            Self::Serialize(source) => write!(f, "failed to render default config: {source}"),
            Self::MissingValueForArg { key } => {
                write!(f, "missing value for CLI override '--{key}'")
            }
            Self::InvalidArgFormat { arg } => write!(
                f,
                "invalid CLI argument format '{arg}', expected '--section.key value'"
            ),
            Self::InvalidPath { key } => write!(f, "invalid override key path '{key}'"),
            Self::UnknownPath { key } => write!(f, "unknown override key path '{key}'"),
            Self::UnsupportedOverrideType { key } => {
                write!(f, "override not supported for complex TOML type at '{key}'")
            }
            Self::InvalidValueForType {
                key,
                expected,
                value,
            } => write!(
                f,
                "invalid value '{value}' for '{key}', expected type {expected}"
            ),
            Self::InvalidLogLevel { value } => write!(
                f,
                "invalid logging.level '{value}'; allowed values: error, warn, info, debug, verbose"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

fn default_value() -> Result<Value, ConfigError> {
    Value::try_from(AppConfig::default()).map_err(ConfigError::Serialize)
}

// file tables are laid over the defaults key by key
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Table(base_table), Value::Table(overlay_table)) => {
            for (key, value) in overlay_table {
                match base_table.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_table.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn split_config_path(
    args: impl IntoIterator<Item = String>,
) -> Result<(Option<PathBuf>, Vec<String>), ConfigError> {
    let mut config_path = None;
    let mut remaining = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        if arg == CONFIG_PATH_ARG {
            let path = iter.next().ok_or_else(|| ConfigError::MissingValueForArg {
                key: "config".to_owned(),
            })?;
            config_path = Some(PathBuf::from(path));
        } else {
            remaining.push(arg);
        }
    }

    Ok((config_path, remaining))
}

fn parse_cli_overrides(
    args: impl IntoIterator<Item = String>,
) -> Result<Vec<(String, String)>, ConfigError> {
    let mut parsed = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        let Some(stripped) = arg.strip_prefix("--") else {
            return Err(ConfigError::InvalidArgFormat { arg });
        };

        if stripped.is_empty() {
            return Err(ConfigError::InvalidArgFormat { arg });
        }

        let value = iter.next().ok_or_else(|| ConfigError::MissingValueForArg {
            key: stripped.to_owned(),
        })?;

        parsed.push((stripped.to_owned(), value));
    }

    Ok(parsed)
}

fn apply_override(root: &mut Value, key_path: &str, raw_value: &str) -> Result<(), ConfigError> {
    let parts: Vec<&str> = key_path.split('.').collect();
    if parts.iter().any(|part| part.is_empty()) {
        return Err(ConfigError::InvalidPath {
            key: key_path.to_owned(),
        });
    }
    let unknown = || ConfigError::UnknownPath {
        key: key_path.to_owned(),
    };

    let mut current = root;
    for part in &parts {
        current = current
            .as_table_mut()
            .ok_or_else(unknown)?
            .get_mut(*part)
            .ok_or_else(unknown)?;
    }

    *current = parse_value_using_current_type(key_path, raw_value, current)?;
    Ok(())
}

fn parse_value_using_current_type(
    key_path: &str,
    raw_value: &str,
    current_value: &Value,
) -> Result<Value, ConfigError> {
    let invalid = |expected: &'static str| ConfigError::InvalidValueForType {
        key: key_path.to_owned(),
        expected,
        value: raw_value.to_owned(),
    };

    match current_value {
        Value::String(_) => Ok(Value::String(raw_value.to_owned())),
        Value::Integer(_) => raw_value
            .parse::<i64>()
            .map(Value::Integer)
            .map_err(|_| invalid("integer")),
        Value::Float(_) => raw_value
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| invalid("float")),
        Value::Boolean(_) => raw_value
            .parse::<bool>()
            .map(Value::Boolean)
            .map_err(|_| invalid("boolean")),
        Value::Datetime(_) | Value::Array(_) | Value::Table(_) => {
            Err(ConfigError::UnsupportedOverrideType {
                key: key_path.to_owned(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use crate::logging::LogLevel;

    use super::{AppConfig, ConfigError};

    fn write_temp_config(content: &str, suffix: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "jobhop-config-test-{suffix}-{}.toml",
            std::process::id()
        ));
        fs::write(&path, content).expect("failed to write temp config");
        path
    }

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| (*value).to_owned()).collect()
    }

    #[test]
    fn partial_file_is_laid_over_defaults() {
        let path = write_temp_config(
            r#"
[logging]
level = "debug"

[broker]
id = "edge-7"
"#,
            "partial",
        );

        let config = AppConfig::load_from_toml_with_args(&path, Vec::<String>::new())
            .expect("config should load");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        assert_eq!(config.logging.level, "debug");
        assert!(!config.logging.human_friendly);
        assert_eq!(config.broker.id, "edge-7");
        assert_eq!(config.broker.generated_id_prefix, "anon-");
        assert_eq!(config.maintenance.sweep_interval_ms, 5_000);
        assert!(!config.persistence.enabled);
    }

    #[test]
    fn argv_overrides_matching_toml_paths() {
        let path = write_temp_config(
            r#"
[logging]
level = "debug"
human_friendly = false

[broker]
default_max_queue_depth = 10
"#,
            "override",
        );

        let config = AppConfig::load_from_toml_with_args(
            &path,
            args(&[
                "--logging.level",
                "warn",
                "--logging.human_friendly",
                "true",
                "--broker.default_max_queue_depth",
                "250",
                "--persistence.enabled",
                "true",
            ]),
        )
        .expect("config with overrides should load");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        assert_eq!(config.logging.level, "warn");
        assert!(config.logging.human_friendly);
        assert_eq!(config.broker.default_max_queue_depth, 250);
        assert!(config.persistence.enabled);
    }

    #[test]
    fn rejects_unknown_override_path() {
        let err = AppConfig::load_with_discovery(args(&[
            "--config",
            "/nonexistent/jobhop.toml",
        ]))
        .expect_err("missing explicit config should fail");
        assert!(matches!(err, ConfigError::Io { .. }));

        let err = AppConfig::load_with_discovery(args(&["--logging.nonexistent", "x"]))
            .expect_err("unknown override key should fail");
        assert!(matches!(err, ConfigError::UnknownPath { .. }));
    }

    #[test]
    fn rejects_mistyped_override_values() {
        let err = AppConfig::load_with_discovery(args(&["--maintenance.sweep_interval_ms", "soon"]))
            .expect_err("non-numeric interval should fail");
        assert!(matches!(
            err,
            ConfigError::InvalidValueForType {
                expected: "integer",
                ..
            }
        ));

        let err = AppConfig::load_with_discovery(args(&["--config"]))
            .expect_err("dangling --config should fail");
        assert!(matches!(err, ConfigError::MissingValueForArg { .. }));
    }

    #[test]
    fn explicit_config_path_wins_and_remaining_args_override() {
        let path = write_temp_config(
            r#"
[maintenance]
sweep_interval_ms = 750
"#,
            "explicit",
        );

        let config = AppConfig::load_with_discovery(vec![
            "--broker.id".to_owned(),
            "east".to_owned(),
            "--config".to_owned(),
            path.to_string_lossy().to_string(),
        ])
        .expect("explicit config should load");
        fs::remove_file(path).expect("temp config cleanup should succeed");

        assert_eq!(config.maintenance.sweep_interval_ms, 750);
        assert_eq!(config.broker.id, "east");
    }

    #[test]
    fn logger_config_parses_level_and_rejects_garbage() {
        let mut config = AppConfig::default();
        config.logging.level = "verbose".to_owned();
        assert_eq!(
            config.logger_config().expect("level should parse").min_level,
            LogLevel::Verbose
        );

        config.logging.level = "chatty".to_owned();
        assert!(matches!(
            config.logger_config(),
            Err(ConfigError::InvalidLogLevel { .. })
        ));
    }
}
