//! Configuration for a NATS function worker.
//!
//! `FunctionConfig` is read once at startup and never changes afterwards.
//! Validation happens in [`FunctionConfigBuilder::build`], before any
//! connection is attempted.

use crate::resilience::ReconnectPolicy;
use core_config::nats::NatsConfig;
use core_config::{env_list, env_parse, env_required, ConfigError, Environment, FromEnv};
use std::time::Duration;
use strum::{Display, EnumString};

/// When a delivered message counts as consumed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum AckPolicy {
    /// Every message is acknowledged individually
    #[default]
    Explicit,
    /// Acknowledging a message acknowledges all earlier ones
    All,
    /// Messages are considered consumed on delivery
    None,
}

/// How long the broker keeps messages in a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum RetentionPolicy {
    /// Keep messages until stream limits are reached
    #[default]
    Limits,
    /// Keep messages while consumers are interested
    Interest,
    /// Remove messages once acknowledged
    WorkQueue,
}

/// Storage medium of a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum StorageType {
    #[default]
    File,
    Memory,
}

/// What the consumption loop does with a message whose handler failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum HandlerFailurePolicy {
    /// Acknowledge anyway (at-most-once)
    #[default]
    Ack,
    /// Negatively acknowledge so the broker redelivers
    Nak,
}

/// Replace every character NATS does not allow in durable names with `_`.
///
/// Only ASCII alphanumerics, `-` and `_` survive.
pub fn sanitize_function_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Function worker configuration.
#[derive(Debug, Clone)]
pub struct FunctionConfig {
    /// NATS server address
    pub server: String,

    /// Connection name reported to the server
    pub client_name: String,

    /// Sanitized function name, used as the durable consumer name
    pub function_name: String,

    /// Stream the function publishes its responses to
    pub producer_stream: String,

    /// Streams the function consumes, in provisioning order
    pub consumer_streams: Vec<String>,

    /// Subjects captured by the consumer stream
    pub subjects: Vec<String>,

    /// Acknowledgment policy of the durable consumer
    pub ack_policy: AckPolicy,

    /// Retention policy of created streams
    pub retention: RetentionPolicy,

    /// Storage type of created streams
    pub storage: StorageType,

    /// Environment tag
    pub environment: Environment,

    /// Reconnect behaviour
    pub reconnect: ReconnectPolicy,

    /// Acknowledgment of messages whose handler failed
    pub on_handler_error: HandlerFailurePolicy,
}

impl FunctionConfig {
    /// Start building a configuration.
    pub fn builder() -> FunctionConfigBuilder {
        FunctionConfigBuilder::default()
    }

    /// Subjects the producer stream captures.
    pub fn producer_subjects(&self) -> Vec<String> {
        vec![self.producer_stream.clone()]
    }

    /// Subjects requested for a consumer stream, if any were configured.
    pub fn consumer_subjects(&self) -> Option<&[String]> {
        (!self.subjects.is_empty()).then_some(self.subjects.as_slice())
    }

    /// Whether this function consumes anything at all.
    pub fn has_consumer_role(&self) -> bool {
        !self.consumer_streams.is_empty()
    }
}

impl FromEnv for FunctionConfig {
    /// Reads:
    /// - `NATS_SERVER`, `FUNCTION_NAME`, `PRODUCER_STREAM` (required)
    /// - `CONSUMER_STREAM`, `SUBJECTS` (comma-separated, optional)
    /// - `ACK_POLICY`, `RETENTION_POLICY`, `STORAGE_TYPE`, `ON_HANDLER_ERROR`
    /// - `RECONNECT_INTERVAL_SECS` (default 5), `APP_ENV`
    fn from_env() -> Result<Self, ConfigError> {
        let nats = NatsConfig::from_env()?;

        let mut builder = FunctionConfig::builder()
            .server(nats.server)
            .function_name(env_required("FUNCTION_NAME")?)
            .producer_stream(env_required("PRODUCER_STREAM")?)
            .consumer_streams(env_list("CONSUMER_STREAM")?)
            .subjects(env_list("SUBJECTS")?)
            .environment(Environment::from_env());

        if let Some(name) = nats.client_name {
            builder = builder.client_name(name);
        }
        if let Some(policy) = env_parse::<AckPolicy>("ACK_POLICY")? {
            builder = builder.ack_policy(policy);
        }
        if let Some(retention) = env_parse::<RetentionPolicy>("RETENTION_POLICY")? {
            builder = builder.retention(retention);
        }
        if let Some(storage) = env_parse::<StorageType>("STORAGE_TYPE")? {
            builder = builder.storage(storage);
        }
        if let Some(policy) = env_parse::<HandlerFailurePolicy>("ON_HANDLER_ERROR")? {
            builder = builder.on_handler_error(policy);
        }
        if let Some(secs) = env_parse::<u64>("RECONNECT_INTERVAL_SECS")? {
            builder = builder.reconnect(ReconnectPolicy::fixed(Duration::from_secs(secs)));
        }

        builder.build()
    }
}

/// Builder for [`FunctionConfig`].
#[derive(Debug, Clone, Default)]
pub struct FunctionConfigBuilder {
    server: Option<String>,
    client_name: Option<String>,
    function_name: Option<String>,
    producer_stream: Option<String>,
    consumer_streams: Vec<String>,
    subjects: Vec<String>,
    ack_policy: AckPolicy,
    retention: RetentionPolicy,
    storage: StorageType,
    environment: Option<Environment>,
    reconnect: ReconnectPolicy,
    on_handler_error: HandlerFailurePolicy,
}

impl FunctionConfigBuilder {
    pub fn server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    pub fn client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    pub fn function_name(mut self, name: impl Into<String>) -> Self {
        self.function_name = Some(name.into());
        self
    }

    pub fn producer_stream(mut self, stream: impl Into<String>) -> Self {
        self.producer_stream = Some(stream.into());
        self
    }

    pub fn consumer_stream(mut self, stream: impl Into<String>) -> Self {
        self.consumer_streams.push(stream.into());
        self
    }

    pub fn consumer_streams(mut self, streams: Vec<String>) -> Self {
        self.consumer_streams = streams;
        self
    }

    pub fn subjects(mut self, subjects: Vec<String>) -> Self {
        self.subjects = subjects;
        self
    }

    pub fn ack_policy(mut self, policy: AckPolicy) -> Self {
        self.ack_policy = policy;
        self
    }

    pub fn retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn storage(mut self, storage: StorageType) -> Self {
        self.storage = storage;
        self
    }

    pub fn environment(mut self, environment: Environment) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn on_handler_error(mut self, policy: HandlerFailurePolicy) -> Self {
        self.on_handler_error = policy;
        self
    }

    /// Validate and freeze the configuration.
    pub fn build(self) -> Result<FunctionConfig, ConfigError> {
        let server = required("server", self.server)?;
        let raw_name = required("function_name", self.function_name)?;
        let producer_stream = required("producer_stream", self.producer_stream)?;

        let function_name = sanitize_function_name(&raw_name);
        validate_stream_name("producer_stream", &producer_stream)?;

        let consumer_streams: Vec<String> = self
            .consumer_streams
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        for (index, stream) in consumer_streams.iter().enumerate() {
            validate_stream_name("consumer_streams", stream)?;
            if consumer_streams[..index].contains(stream) {
                return Err(ConfigError::invalid(
                    "consumer_streams",
                    format!("duplicate stream '{}'", stream),
                ));
            }
        }

        let subjects: Vec<String> = self
            .subjects
            .iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        for (index, subject) in subjects.iter().enumerate() {
            if subject.chars().any(char::is_whitespace) {
                return Err(ConfigError::invalid(
                    "subjects",
                    format!("subject '{}' contains whitespace", subject),
                ));
            }
            if subjects[..index].contains(subject) {
                return Err(ConfigError::invalid(
                    "subjects",
                    format!("duplicate subject '{}'", subject),
                ));
            }
        }
        if !subjects.is_empty() && consumer_streams.len() > 1 {
            return Err(ConfigError::invalid(
                "subjects",
                "subjects can only be set with a single consumer stream",
            ));
        }

        if self.reconnect.interval.is_zero() {
            return Err(ConfigError::invalid(
                "reconnect_interval",
                "reconnect interval must be greater than zero",
            ));
        }

        let client_name = self
            .client_name
            .unwrap_or_else(|| format!("{}-{}", function_name, uuid::Uuid::new_v4()));

        Ok(FunctionConfig {
            server,
            client_name,
            function_name,
            producer_stream,
            consumer_streams,
            subjects,
            ack_policy: self.ack_policy,
            retention: self.retention,
            storage: self.storage,
            environment: self.environment.unwrap_or_else(Environment::from_env),
            reconnect: self.reconnect,
            on_handler_error: self.on_handler_error,
        })
    }
}

fn required(key: &str, value: Option<String>) -> Result<String, ConfigError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(ConfigError::invalid(key, "is required and must not be empty")),
    }
}

fn validate_stream_name(key: &str, name: &str) -> Result<(), ConfigError> {
    let forbidden = |c: char| c.is_whitespace() || matches!(c, '.' | '*' | '>' | '/' | '\\');
    if name.chars().any(forbidden) {
        return Err(ConfigError::invalid(
            key,
            format!("stream name '{}' contains a forbidden character", name),
        ));
    }
    Ok(())
}
