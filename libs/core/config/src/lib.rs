pub mod nats;
pub mod tracing;

use std::env;
use std::str::FromStr;
use thiserror::Error;

/// Configuration error type
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Environment variable '{0}' is required but not set")]
    MissingEnvVar(String),

    #[error("Failed to parse environment variable '{key}': {details}")]
    ParseError { key: String, details: String },

    #[error("Invalid configuration for '{key}': {details}")]
    Invalid { key: String, details: String },
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, details: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.into(),
            details: details.into(),
        }
    }
}

/// Application environment tag.
///
/// Development and Test always log to the console; Production logs JSON.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Environment {
    Development, // Local dev or kind cluster
    Test,        // CI and test harnesses
    Production,  // Full k8s cluster
}

impl Environment {
    pub fn from_env() -> Self {
        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());
        Self::parse(&app_env)
    }

    /// Parse an environment tag. Unknown tags fall back to Development.
    pub fn parse(tag: &str) -> Self {
        match tag.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Environment::Production,
            "test" => Environment::Test,
            _ => Environment::Development,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }

    pub fn is_development(&self) -> bool {
        matches!(self, Environment::Development)
    }

    pub fn is_test(&self) -> bool {
        matches!(self, Environment::Test)
    }

    /// Whether operational logs must go to the console regardless of any
    /// subscriber the caller installed.
    pub fn forces_console(&self) -> bool {
        !self.is_production()
    }
}

/// Trait for configuration that can be loaded from environment variables
pub trait FromEnv: Sized {
    fn from_env() -> Result<Self, ConfigError>;
}

/// Helper to load and parse environment variable with a default value
pub fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Helper to load and parse environment variable or return error
///
/// Blank values count as missing.
pub fn env_required(key: &str) -> Result<String, ConfigError> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(ConfigError::MissingEnvVar(key.to_string())),
    }
}

/// Load an optional environment variable and parse it with `FromStr`.
pub fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map(Some)
                .map_err(|e: T::Err| ConfigError::ParseError {
                    key: key.to_string(),
                    details: e.to_string(),
                })
        }
        _ => Ok(None),
    }
}

/// Load a comma-separated environment variable as an ordered list.
///
/// A missing variable yields an empty list.
pub fn env_list(key: &str) -> Result<Vec<String>, ConfigError> {
    match env::var(key) {
        Ok(raw) => parse_list(key, &raw),
        Err(_) => Ok(Vec::new()),
    }
}

/// Split a comma-separated value into trimmed, non-empty items.
///
/// Order is preserved and duplicates are rejected.
pub fn parse_list(key: &str, raw: &str) -> Result<Vec<String>, ConfigError> {
    let mut items: Vec<String> = Vec::new();
    for item in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if items.iter().any(|existing| existing == item) {
            return Err(ConfigError::invalid(
                key,
                format!("duplicate entry '{}'", item),
            ));
        }
        items.push(item.to_string());
    }
    Ok(items)
}
