use crate::{env_or_default, env_required, ConfigError, FromEnv};

/// NATS server configuration
#[derive(Clone, Debug)]
pub struct NatsConfig {
    pub server: String,
    pub client_name: Option<String>,
}

impl FromEnv for NatsConfig {
    /// Requires NATS_SERVER to be set (no default).
    /// NATS_CLIENT_NAME is optional.
    fn from_env() -> Result<Self, ConfigError> {
        let client_name = env_or_default("NATS_CLIENT_NAME", "");
        Ok(Self {
            server: env_required("NATS_SERVER")?,
            client_name: (!client_name.is_empty()).then_some(client_name),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nats_config_from_env_success() {
        temp_env::with_vars(
            [
                ("NATS_SERVER", Some("nats://localhost:4222")),
                ("NATS_CLIENT_NAME", None),
            ],
            || {
                let config = NatsConfig::from_env().unwrap();
                assert_eq!(config.server, "nats://localhost:4222");
                assert_eq!(config.client_name, None);
            },
        );
    }

    #[test]
    fn test_nats_config_from_env_missing() {
        temp_env::with_var_unset("NATS_SERVER", || {
            let err = NatsConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("NATS_SERVER"));
            assert!(err.to_string().contains("required"));
        });
    }
}
