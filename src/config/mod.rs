use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use toml::Value;

pub const DEFAULT_CONFIG_TOML: &str = include_str!("default.toml");
pub const CONFIG_PATH_ENV: &str = "BCP_BROKER_CONFIG";
pub const LOCAL_CONFIG_FILE: &str = "bcp-broker.toml";
pub const CONFIG_PATH_ARG: &str = "--config";

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub broker: BrokerConfig,
    pub heartbeat: HeartbeatConfig,
    pub transport: TransportConfig,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: String,
    pub human_friendly: bool,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    /// Verbosity count; anything above zero dumps every routed message.
    pub verbose: u8,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    pub liveness: u32,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
pub struct TransportConfig {
    pub max_message_size_bytes: usize,
    pub poll_step_ms: u64,
}

/// Where the base TOML document came from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    Embedded,
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Embedded => write!(f, "<embedded defaults>"),
        }
    }
}

impl AppConfig {
    /// Resolves the config document (`--config <path>`, `$BCP_BROKER_CONFIG`,
    /// `./bcp-broker.toml`, embedded defaults) and applies `--section.key value` overrides.
    pub fn load_with_discovery(
        args: impl IntoIterator<Item = String>,
    ) -> Result<(Self, ConfigSource), ConfigError> {
        let mut args: Vec<String> = args.into_iter().collect();

        let explicit_path = if args.first().map(String::as_str) == Some(CONFIG_PATH_ARG) {
            if args.len() < 2 {
                return Err(ConfigError::MissingValueForArg {
                    key: "config".to_owned(),
                });
            }
            let path = args.remove(1);
            args.remove(0);
            Some(PathBuf::from(path))
        } else {
            None
        };

        let source = explicit_path
            .or_else(|| std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from))
            .or_else(|| {
                let local = PathBuf::from(LOCAL_CONFIG_FILE);
                local.is_file().then_some(local)
            })
            .map(ConfigSource::File)
            .unwrap_or(ConfigSource::Embedded);

        let config = match &source {
            ConfigSource::File(path) => Self::load_from_toml_with_args(path, args)?,
            ConfigSource::Embedded => Self::from_toml_str_with_args(DEFAULT_CONFIG_TOML, "<embedded>", args)?,
        };

        Ok((config, source))
    }

    pub fn load_from_toml_with_args(
        path: impl AsRef<Path>,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let toml_content = fs::read_to_string(path.as_ref()).map_err(|source| ConfigError::Io {
            path: path.as_ref().to_string_lossy().to_string(),
            source,
        })?;

        Self::from_toml_str_with_args(&toml_content, &path.as_ref().to_string_lossy(), args)
    }

    pub fn from_toml_str_with_args(
        toml_content: &str,
        origin: &str,
        args: impl IntoIterator<Item = String>,
    ) -> Result<Self, ConfigError> {
        let mut root_value: Value =
            toml_content
                .parse()
                .map_err(|source| ConfigError::TomlParse {
                    path: origin.to_owned(),
                    source,
                })?;

        for (key_path, raw_value) in parse_cli_overrides(args)? {
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
            Self::MissingValueForArg { key } => {
                write!(f, "missing value for CLI argument '--{key}'")
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
        }
    }
}

impl std::error::Error for ConfigError {}

fn parse_cli_overrides(
    args: impl IntoIterator<Item = String>,
) -> Result<Vec<(String, String)>, ConfigError> {
    let mut parsed = Vec::new();
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        let Some(key) = arg.strip_prefix("--").filter(|key| !key.is_empty()) else {
            return Err(ConfigError::InvalidArgFormat { arg });
        };
        let key = key.to_owned();

        let value = iter
            .next()
            .ok_or_else(|| ConfigError::MissingValueForArg { key: key.clone() })?;

        parsed.push((key, value));
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
