//! Durable consumer registration.

use crate::config::{sanitize_function_name, AckPolicy};
use crate::error::FunctionError;
use crate::session::{ConsumerSpec, Session};
use tracing::{debug, info};

/// Ensure a durable consumer named after the function exists on `stream`.
///
/// Returns the durable name. A consumer that already exists under that name
/// is not an error.
pub async fn ensure_consumer<S: Session + ?Sized>(
    session: &S,
    function_name: &str,
    stream: &str,
    ack_policy: AckPolicy,
) -> Result<String, FunctionError> {
    let durable_name = sanitize_function_name(function_name);
    if durable_name.is_empty() {
        return Err(FunctionError::provisioning(
            stream,
            "function name is empty after sanitizing",
        ));
    }

    let spec = ConsumerSpec {
        durable_name: durable_name.clone(),
        ack_policy,
    };

    match session.create_consumer(stream, spec).await {
        Ok(()) => {
            info!(stream = %stream, durable = %durable_name, ack_policy = %ack_policy, "Consumer ready");
            Ok(durable_name)
        }
        Err(FunctionError::AlreadyExists(_)) => {
            debug!(stream = %stream, durable = %durable_name, "Consumer already exists");
            Ok(durable_name)
        }
        Err(e) => Err(e),
    }
}
