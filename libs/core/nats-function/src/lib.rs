//! Lifecycle helper that joins a worker function to a NATS JetStream pipeline.
//!
//! A function consumes requests from one or more durable streams, hands each
//! decoded message to a [`FunctionHandler`] and publishes results to a
//! producer stream. The runtime provisions what it needs and keeps the
//! binding alive across connection loss.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐     ┌─────────────────────┐     ┌──────────────────┐
//! │ Consumer       │────▶│  ConsumptionLoop    │────▶│ FunctionHandler  │
//! │ stream(s)      │     │  (one per stream)   │     │  (your logic)    │
//! └────────────────┘     └─────────────────────┘     └──────────────────┘
//!                                                             │
//!                                                             ▼
//! ┌────────────────┐     ┌─────────────────────┐     ┌──────────────────┐
//! │ Supervisor     │     │  Producer stream /  │◀────│    Responder     │
//! │ (reconnect +   │     │  explicit subjects  │     │                  │
//! │  rebind)       │     └─────────────────────┘     └──────────────────┘
//! └────────────────┘
//! ```
//!
//! # Key Features
//!
//! - **Idempotent provisioning**: streams are created on demand and only ever
//!   gain subjects; durable consumers are reused when they already exist
//! - **Self-healing connection**: closure triggers a reconnect loop (fixed 5s
//!   interval by default, optional backoff and circuit breaker) followed by
//!   re-provisioning and a fresh consumption loop
//! - **Fail-fast stale handles**: every connection carries a generation, and
//!   a responder or loop bound to a replaced connection errors immediately
//! - **Crash isolation**: handler errors and panics are logged and counted,
//!   never propagated into the loop
//!
//! # Example
//!
//! ```rust,ignore
//! use core_config::FromEnv;
//! use nats_function::{handler_fn, FunctionConfig, FunctionRuntime, NatsConnector};
//!
//! let config = FunctionConfig::from_env()?;
//! let runtime = FunctionRuntime::start(config.clone(), NatsConnector::from_config(&config)).await?;
//!
//! runtime
//!     .consume(handler_fn(|request, responder| async move {
//!         responder.respond(&serde_json::json!({"seen": request.sequence})).await?;
//!         Ok(())
//!     }))
//!     .await?;
//! ```

mod config;
mod connection;
mod consumer;
mod error;
mod handler;
pub mod metrics;
mod nats;
mod producer;
mod provisioner;
mod registrar;
mod resilience;
mod runtime;
mod session;

#[cfg(test)]
mod testing;

pub use config::{
    sanitize_function_name, AckPolicy, FunctionConfig, FunctionConfigBuilder,
    HandlerFailurePolicy, RetentionPolicy, StorageType,
};
pub use connection::{ClosureEvents, ConnectionHandle, ConnectionManager};
pub use error::{ErrorClass, FunctionError};
pub use handler::{handler_fn, FunctionHandler, HandlerFn, Request};
pub use metrics::{init_metrics, render_metrics, FunctionMetrics};
pub use nats::{NatsConnector, NatsSession};
pub use producer::Responder;
pub use provisioner::{Provisioned, StreamProvisioner};
pub use registrar::ensure_consumer;
pub use resilience::{
    Backoff, CircuitBreaker, CircuitBreakerConfig, CircuitState, ReconnectPolicy,
    DEFAULT_RECONNECT_INTERVAL,
};
pub use runtime::FunctionRuntime;
pub use session::{
    Acknowledge, ClosureObserver, Connector, ConsumerSpec, Delivery, DeliveryStream, Session,
    StreamSpec, StreamState,
};
