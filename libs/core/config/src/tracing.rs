use crate::Environment;
use tracing::{debug, info};
use tracing_subscriber::{prelude::*, EnvFilter};

/// Install color-eyre with a project-standard configuration.
///
/// Call this early in the main() before any fallible operations to ensure
/// colored error output. Safe to call multiple times.
///
/// Configuration:
/// - Shows file:line where errors occur
/// - Hides environment variables (less noise)
pub fn install_color_eyre() {
    let _ = color_eyre::config::HookBuilder::default()
        .display_location_section(true)
        .display_env_section(false)
        .install();
}

/// Initialize tracing with environment-aware configuration and error span capture.
///
/// - **Production** (`APP_ENV=production`):
///   - JSON format (for log aggregation tools like ELK, Datadog, CloudWatch)
///   - Hides module targets for cleaner logs
///
/// - **Development / Test** (default):
///   - Pretty-printed console output (human-readable)
///
/// Both variants include the `ErrorLayer` so `eyre` reports carry span traces.
///
/// Environment variables:
/// - `APP_ENV`: `production`, `test` or `development` (default)
/// - `RUST_LOG`: Override log levels (e.g., "debug", "nats_function=trace")
///
/// Returns `true` when this call installed the global subscriber and `false`
/// when one was already present (common in tests, or when the embedding
/// application brought its own).
pub fn init_tracing(environment: &Environment) -> bool {
    let is_production = environment.is_production();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if is_production {
            EnvFilter::new("info")
        } else {
            EnvFilter::new("debug")
        }
    });

    let result = if is_production {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(false)
                    .flatten_event(true),
            )
            .with(tracing_error::ErrorLayer::default())
            .with(filter)
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_file(false)
                    .with_line_number(false)
                    .pretty(),
            )
            .with(tracing_error::ErrorLayer::default())
            .with(filter)
            .try_init()
    };

    match result {
        Ok(_) => {
            info!(?environment, "Tracing initialized");
            true
        }
        Err(_) => {
            debug!("Tracing already initialized, skipping re-initialization");
            false
        }
    }
}

/// Make sure operational logs reach a sink.
///
/// The subscriber installed by the embedding application is the
/// caller-supplied logger. When none is installed, or the environment tag
/// forces console output, the console subscriber from [`init_tracing`] is
/// installed. A subscriber that is already global cannot be replaced, so in
/// that case the existing one keeps receiving events.
pub fn ensure_tracing(environment: &Environment) -> bool {
    if environment.forces_console() || !tracing::dispatcher::has_been_set() {
        init_tracing(environment)
    } else {
        false
    }
}
