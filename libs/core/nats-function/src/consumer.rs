//! Pull consumption loop.
//!
//! One loop per consumer stream. Messages are pulled one at a time and the
//! handler runs to completion before the next message is taken, so handler
//! calls are strictly sequential and in delivery order.

use crate::config::{AckPolicy, HandlerFailurePolicy};
use crate::connection::ConnectionHandle;
use crate::error::FunctionError;
use crate::handler::{FunctionHandler, Request};
use crate::metrics::FunctionMetrics;
use crate::producer::Responder;
use crate::session::{Delivery, Session};
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// How a single handler invocation ended.
#[derive(Debug)]
enum Outcome {
    Handled,
    Failed(FunctionError),
    Panicked(String),
    Undecodable(String),
}

/// Drives a handler from one durable consumer.
pub struct ConsumptionLoop<S: Session> {
    handle: ConnectionHandle<S>,
    stream: String,
    durable: String,
    handler: Arc<dyn FunctionHandler>,
    responder: Responder,
    ack_policy: AckPolicy,
    on_error: HandlerFailurePolicy,
    metrics: FunctionMetrics,
}

impl<S: Session> ConsumptionLoop<S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        handle: ConnectionHandle<S>,
        stream: impl Into<String>,
        durable: impl Into<String>,
        handler: Arc<dyn FunctionHandler>,
        responder: Responder,
        ack_policy: AckPolicy,
        on_error: HandlerFailurePolicy,
        metrics: FunctionMetrics,
    ) -> Self {
        Self {
            handle,
            stream: stream.into(),
            durable: durable.into(),
            handler,
            responder,
            ack_policy,
            on_error,
            metrics,
        }
    }

    /// Run until the connection closes or the delivery stream ends.
    ///
    /// Returns the number of messages handled. Handler failures never end
    /// the loop.
    pub async fn run(self) -> Result<u64, FunctionError> {
        let mut deliveries = self
            .handle
            .session()?
            .pull(&self.stream, &self.durable)
            .await?;

        info!(
            stream = %self.stream,
            durable = %self.durable,
            handler = self.handler.name(),
            generation = self.handle.generation(),
            "Consumption loop started"
        );

        let mut handled = 0u64;
        while let Some(item) = deliveries.next().await {
            if self.handle.is_closed() {
                break;
            }
            match item {
                Ok(delivery) => {
                    self.process(delivery).await;
                    handled += 1;
                }
                Err(e) => {
                    warn!(stream = %self.stream, error = %e, "Failed to receive message");
                }
            }
        }

        info!(
            stream = %self.stream,
            durable = %self.durable,
            handled,
            "Consumption loop stopped"
        );
        Ok(handled)
    }

    async fn process(&self, delivery: Delivery) {
        let sequence = delivery.sequence;
        self.metrics.message_received(&self.stream);

        let started = Instant::now();
        let outcome = match serde_json::from_slice::<Value>(&delivery.payload) {
            Ok(body) => {
                let request = Request {
                    sequence,
                    subject: delivery.subject.clone(),
                    body,
                };
                self.invoke(request).await
            }
            Err(e) => Outcome::Undecodable(e.to_string()),
        };

        match &outcome {
            Outcome::Handled => {
                self.metrics
                    .handler_succeeded(&self.stream, started.elapsed());
                debug!(stream = %self.stream, sequence, "Message handled");
            }
            Outcome::Failed(e) => {
                self.metrics.handler_failed(&self.stream, "error");
                error!(stream = %self.stream, sequence, error = %e, "Handler failed");
            }
            Outcome::Panicked(reason) => {
                self.metrics.handler_failed(&self.stream, "panic");
                error!(stream = %self.stream, sequence, panic = %reason, "Handler panicked");
            }
            Outcome::Undecodable(reason) => {
                self.metrics.message_undecodable(&self.stream);
                warn!(
                    stream = %self.stream,
                    sequence,
                    error = %reason,
                    "Payload is not valid JSON, skipping handler"
                );
            }
        }

        self.settle(delivery, &outcome).await;
    }

    async fn invoke(&self, request: Request) -> Outcome {
        let call = self.handler.handle(request, &self.responder);
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(())) => Outcome::Handled,
            Ok(Err(report)) => Outcome::Failed(FunctionError::Handler(format!("{report:#}"))),
            Err(panic) => Outcome::Panicked(panic_message(panic.as_ref())),
        }
    }

    async fn settle(&self, delivery: Delivery, outcome: &Outcome) {
        if self.ack_policy == AckPolicy::None {
            return;
        }

        let sequence = delivery.sequence;
        let redeliver = self.on_error == HandlerFailurePolicy::Nak
            && matches!(outcome, Outcome::Failed(_) | Outcome::Panicked(_));

        let (result, kind) = if redeliver {
            (delivery.nak().await, "nak")
        } else {
            (delivery.ack().await, "ack")
        };

        match result {
            Ok(()) => self.metrics.settled(&self.stream, kind),
            Err(e) => {
                self.metrics.settled(&self.stream, "error");
                warn!(stream = %self.stream, sequence, kind, error = %e, "Failed to settle message");
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
