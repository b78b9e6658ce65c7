//! Rule Worker Service (NATS JetStream)
//!
//! A function that checks amount limits on incoming requests and publishes
//! the verdict downstream.
//!
//! ## Architecture
//!
//! ```text
//! NATS JetStream (CONSUMER_STREAM, e.g. RuleRequest)
//!   ↓ (Pull Consumer: durable = FUNCTION_NAME)
//! FunctionRuntime + RuleHandler
//!   ↓ ({"result": "pass" | "fail"})
//! NATS JetStream (PRODUCER_STREAM, e.g. RuleResponseX)
//! ```
//!
//! ## Features
//!
//! - Streams and the durable consumer are provisioned on startup
//! - Reconnects every `RECONNECT_INTERVAL_SECS` (default 5) and re-binds
//! - Graceful shutdown on SIGINT/SIGTERM
//! - Prometheus metrics recorder

pub mod rules;

use core_config::{env_parse, FromEnv};
use eyre::{Result, WrapErr};
use nats_function::{init_metrics, FunctionConfig, FunctionRuntime, NatsConnector};
use rules::{RuleHandler, DEFAULT_MAX_AMOUNT};
use tokio::signal;
use tracing::{info, warn};

/// Run the rule worker
///
/// 1. Reads and validates the function configuration
/// 2. Sets up structured logging (env-aware: JSON for prod, pretty for dev)
/// 3. Starts the function runtime and binds the rule handler
/// 4. Waits for SIGINT/SIGTERM and shuts down gracefully
///
/// # Errors
///
/// Returns an error if configuration is missing or invalid, or if the
/// streams or durable consumer cannot be provisioned.
pub async fn run() -> Result<()> {
    let config = FunctionConfig::from_env().wrap_err("Invalid function configuration")?;
    core_config::tracing::init_tracing(&config.environment);

    init_metrics().wrap_err("Failed to initialize metrics")?;

    let max_amount = env_parse::<u64>("RULE_MAX_AMOUNT")
        .wrap_err("Invalid RULE_MAX_AMOUNT")?
        .unwrap_or(DEFAULT_MAX_AMOUNT);

    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        function = %config.function_name,
        server = %config.server,
        max_amount,
        "Starting rule worker service"
    );
    info!("Environment: {:?}", config.environment);

    let connector = NatsConnector::from_config(&config);
    let runtime = FunctionRuntime::start(config.clone(), connector)
        .await
        .wrap_err("Failed to start function runtime")?;

    if config.has_consumer_role() {
        runtime
            .consume(RuleHandler::new(max_amount))
            .await
            .wrap_err("Failed to bind rule handler")?;
    } else {
        warn!("No CONSUMER_STREAM configured, running producer-only");
    }

    shutdown_signal().await?;

    runtime.shutdown().await.wrap_err("Shutdown failed")?;
    info!("Rule worker service stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .wrap_err("Failed to install Ctrl+C handler")
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install signal handler")?
            .recv()
            .await;
        Ok::<(), eyre::Report>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received Ctrl+C, initiating shutdown...");
        },
        result = terminate => {
            result?;
            info!("Received SIGTERM, initiating shutdown...");
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_fails_on_missing_config_before_connecting() {
        let result = temp_env::async_with_vars(
            [
                ("NATS_SERVER", None::<&str>),
                ("FUNCTION_NAME", Some("rule-checker")),
                ("PRODUCER_STREAM", Some("RuleResponseX")),
            ],
            run(),
        )
        .await;

        let err = result.unwrap_err();
        assert!(format!("{err:?}").contains("NATS_SERVER"));
    }
}
