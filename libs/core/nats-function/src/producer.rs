//! Response publishing.

use crate::connection::ConnectionHandle;
use crate::error::FunctionError;
use crate::metrics::FunctionMetrics;
use crate::session::Session;
use async_trait::async_trait;
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Where a responder sends its bytes.
#[async_trait]
pub(crate) trait PublishTarget: Send + Sync {
    async fn publish_bytes(&self, subject: &str, payload: Vec<u8>) -> Result<(), FunctionError>;
}

#[async_trait]
impl<S: Session> PublishTarget for ConnectionHandle<S> {
    async fn publish_bytes(&self, subject: &str, payload: Vec<u8>) -> Result<(), FunctionError> {
        self.session()?.publish(subject, payload).await
    }
}

/// Publishes responses to the producer stream or explicit subjects.
///
/// A responder is bound to one connection generation. Once that connection
/// is replaced, publishing fails with [`FunctionError::StaleConnection`].
#[derive(Clone)]
pub struct Responder {
    target: Arc<dyn PublishTarget>,
    producer_stream: Arc<str>,
    metrics: FunctionMetrics,
}

impl Responder {
    pub(crate) fn new<S: Session>(
        handle: ConnectionHandle<S>,
        producer_stream: &str,
        metrics: FunctionMetrics,
    ) -> Self {
        Self {
            target: Arc::new(handle),
            producer_stream: Arc::from(producer_stream),
            metrics,
        }
    }

    /// Name of the producer stream, the default destination subject.
    pub fn producer_stream(&self) -> &str {
        &self.producer_stream
    }

    /// Serialize `response` as JSON and publish it.
    ///
    /// Without subjects (or with an empty list) the response goes once to the
    /// producer stream's subject. Otherwise it goes once to every subject,
    /// concurrently; every publish is attempted and the first failure is
    /// returned.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        response: &T,
        subjects: Option<&[String]>,
    ) -> Result<(), FunctionError> {
        let payload = serde_json::to_vec(response)?;

        match subjects {
            Some(list) if !list.is_empty() => self.fan_out(list, payload).await,
            _ => self.publish_one(&self.producer_stream, payload).await,
        }
    }

    /// Publish to the producer stream.
    pub async fn respond<T: Serialize + ?Sized>(&self, response: &T) -> Result<(), FunctionError> {
        self.publish(response, None).await
    }

    /// Publish to explicit subjects.
    pub async fn respond_to<T, S>(&self, response: &T, subjects: &[S]) -> Result<(), FunctionError>
    where
        T: Serialize + ?Sized,
        S: AsRef<str>,
    {
        let subjects: Vec<String> = subjects.iter().map(|s| s.as_ref().to_string()).collect();
        self.publish(response, Some(&subjects)).await
    }

    async fn fan_out(&self, subjects: &[String], payload: Vec<u8>) -> Result<(), FunctionError> {
        let results = join_all(
            subjects
                .iter()
                .map(|subject| self.publish_one(subject, payload.clone())),
        )
        .await;

        results.into_iter().find(Result::is_err).unwrap_or(Ok(()))
    }

    async fn publish_one(&self, subject: &str, payload: Vec<u8>) -> Result<(), FunctionError> {
        match self.target.publish_bytes(subject, payload).await {
            Ok(()) => {
                self.metrics.response_published(subject);
                debug!(subject = %subject, "Response published");
                Ok(())
            }
            Err(e) => {
                self.metrics.response_failed(subject);
                warn!(subject = %subject, error = %e, "Failed to publish response");
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("producer_stream", &self.producer_stream)
            .finish()
    }
}
