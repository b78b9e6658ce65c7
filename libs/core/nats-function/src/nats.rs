//! NATS JetStream implementation of the broker seams.

use crate::config::{AckPolicy, FunctionConfig, RetentionPolicy, StorageType};
use crate::error::FunctionError;
use crate::session::{
    Acknowledge, ClosureObserver, Connector, ConsumerSpec, Delivery, DeliveryStream, Session,
    StreamSpec, StreamState,
};
use async_nats::jetstream::consumer::pull::Config as PullConfig;
use async_nats::jetstream::consumer::PullConsumer;
use async_nats::jetstream::stream::Config as StreamConfig;
use async_nats::jetstream::{self, AckKind, Context};
use async_nats::{Client, ConnectOptions, Event};
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;
use tracing::{debug, warn};

/// How long a single pull request waits for a message.
const FETCH_EXPIRES: Duration = Duration::from_secs(30);

impl From<AckPolicy> for jetstream::consumer::AckPolicy {
    fn from(policy: AckPolicy) -> Self {
        match policy {
            AckPolicy::Explicit => jetstream::consumer::AckPolicy::Explicit,
            AckPolicy::All => jetstream::consumer::AckPolicy::All,
            AckPolicy::None => jetstream::consumer::AckPolicy::None,
        }
    }
}

impl From<RetentionPolicy> for jetstream::stream::RetentionPolicy {
    fn from(policy: RetentionPolicy) -> Self {
        match policy {
            RetentionPolicy::Limits => jetstream::stream::RetentionPolicy::Limits,
            RetentionPolicy::Interest => jetstream::stream::RetentionPolicy::Interest,
            RetentionPolicy::WorkQueue => jetstream::stream::RetentionPolicy::WorkQueue,
        }
    }
}

impl From<StorageType> for jetstream::stream::StorageType {
    fn from(storage: StorageType) -> Self {
        match storage {
            StorageType::File => jetstream::stream::StorageType::File,
            StorageType::Memory => jetstream::stream::StorageType::Memory,
        }
    }
}

/// Dials NATS and opens JetStream sessions.
#[derive(Debug, Clone)]
pub struct NatsConnector {
    server: String,
    client_name: String,
}

impl NatsConnector {
    /// Create a connector for the given server address.
    pub fn new(server: impl Into<String>, client_name: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            client_name: client_name.into(),
        }
    }

    /// Create a connector from a function configuration.
    pub fn from_config(config: &FunctionConfig) -> Self {
        Self::new(config.server.clone(), config.client_name.clone())
    }

    /// Get the server address.
    pub fn server(&self) -> &str {
        &self.server
    }
}

#[async_trait]
impl Connector for NatsConnector {
    type Session = NatsSession;

    async fn connect(&self, observer: ClosureObserver) -> Result<NatsSession, FunctionError> {
        let generation = observer.generation();

        // The client's own reconnect is capped; the connection manager
        // replaces the whole session instead.
        let client = ConnectOptions::new()
            .name(&self.client_name)
            .max_reconnects(Some(1))
            .event_callback(move |event| {
                let observer = observer.clone();
                async move {
                    match event {
                        Event::Disconnected | Event::Closed => {
                            warn!(generation, event = %event, "NATS connection lost");
                            observer.notify_closed();
                        }
                        other => debug!(generation, event = %other, "NATS event"),
                    }
                }
            })
            .connect(self.server.as_str())
            .await
            .map_err(|e| FunctionError::connection(format!("{}: {}", self.server, e)))?;

        let jetstream = jetstream::new(client.clone());

        Ok(NatsSession { client, jetstream })
    }
}

/// A live NATS connection with its JetStream context.
pub struct NatsSession {
    client: Client,
    jetstream: Context,
}

#[async_trait]
impl Session for NatsSession {
    async fn stream_subjects(&self, stream: &str) -> Result<Option<Vec<String>>, FunctionError> {
        match self.jetstream.get_stream(stream).await {
            Ok(existing) => Ok(Some(existing.cached_info().config.subjects.clone())),
            Err(e) => {
                debug!(stream = %stream, error = %e, "Stream lookup failed, treating as absent");
                Ok(None)
            }
        }
    }

    async fn create_stream(&self, spec: StreamSpec) -> Result<(), FunctionError> {
        self.jetstream
            .create_stream(StreamConfig {
                name: spec.name.clone(),
                subjects: spec.subjects,
                retention: spec.retention.into(),
                storage: spec.storage.into(),
                ..Default::default()
            })
            .await
            .map_err(|e| {
                let message = e.to_string();
                if message.contains("already in use") {
                    FunctionError::AlreadyExists(spec.name.clone())
                } else {
                    FunctionError::provisioning(&spec.name, message)
                }
            })?;
        Ok(())
    }

    async fn update_stream_subjects(
        &self,
        stream: &str,
        subjects: Vec<String>,
    ) -> Result<(), FunctionError> {
        let existing = self
            .jetstream
            .get_stream(stream)
            .await
            .map_err(|e| FunctionError::provisioning(stream, e))?;

        let mut config = existing.cached_info().config.clone();
        config.subjects = subjects;

        self.jetstream
            .update_stream(&config)
            .await
            .map_err(|e| FunctionError::provisioning(stream, e))?;
        Ok(())
    }

    async fn create_consumer(
        &self,
        stream: &str,
        spec: ConsumerSpec,
    ) -> Result<(), FunctionError> {
        let existing = self
            .jetstream
            .get_stream(stream)
            .await
            .map_err(|e| FunctionError::provisioning(stream, e))?;

        existing
            .get_or_create_consumer::<PullConfig>(
                &spec.durable_name,
                PullConfig {
                    durable_name: Some(spec.durable_name.clone()),
                    ack_policy: spec.ack_policy.into(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| {
                let message = e.to_string();
                if message.contains("already exists") {
                    FunctionError::AlreadyExists(spec.durable_name.clone())
                } else {
                    FunctionError::provisioning(stream, message)
                }
            })?;
        Ok(())
    }

    async fn pull(
        &self,
        stream: &str,
        durable_name: &str,
    ) -> Result<DeliveryStream, FunctionError> {
        let consumer: PullConsumer = self
            .jetstream
            .get_stream(stream)
            .await
            .map_err(FunctionError::consumer)?
            .get_consumer(durable_name)
            .await
            .map_err(FunctionError::consumer)?;

        // One fetch per message so nothing is buffered while the handler runs
        Ok(futures::stream::unfold(consumer, |consumer| async move {
            loop {
                let mut batch = match consumer
                    .fetch()
                    .max_messages(1)
                    .expires(FETCH_EXPIRES)
                    .messages()
                    .await
                {
                    Ok(batch) => batch,
                    Err(e) => {
                        warn!(error = %e, "Pull request failed, ending delivery stream");
                        return None;
                    }
                };
                match batch.next().await {
                    Some(Ok(message)) => return Some((Ok(delivery(message)), consumer)),
                    Some(Err(e)) => return Some((Err(FunctionError::consumer(e)), consumer)),
                    // Expired without a message
                    None => continue,
                }
            }
        })
        .boxed())
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), FunctionError> {
        let ack = self
            .jetstream
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| FunctionError::publish(subject, e))?
            .await
            .map_err(|e| FunctionError::publish(subject, e))?;

        debug!(
            subject = %subject,
            stream = %ack.stream,
            sequence = ack.sequence,
            "Published response"
        );
        Ok(())
    }

    async fn stream_state(&self, stream: &str) -> Result<StreamState, FunctionError> {
        let mut existing = self
            .jetstream
            .get_stream(stream)
            .await
            .map_err(|e| FunctionError::provisioning(stream, e))?;

        let info = existing
            .info()
            .await
            .map_err(|e| FunctionError::provisioning(stream, e))?;

        Ok(StreamState {
            name: stream.to_string(),
            subjects: info.config.subjects.clone(),
            messages: info.state.messages,
            consumer_count: info.state.consumer_count,
        })
    }

    async fn close(&self) {
        if let Err(e) = self.client.flush().await {
            debug!(error = %e, "Flush on close failed");
        }
    }
}

fn delivery(message: jetstream::Message) -> Delivery {
    let sequence = match message.info() {
        Ok(info) => info.stream_sequence,
        Err(e) => {
            warn!(error = %e, "Failed to get message info, using sequence 0");
            0
        }
    };
    let subject = message.subject.to_string();
    let payload = message.payload.to_vec();
    Delivery::new(sequence, subject, payload, Box::new(NatsAck(message)))
}

/// Acknowledgment token backed by a JetStream message.
struct NatsAck(jetstream::Message);

#[async_trait]
impl Acknowledge for NatsAck {
    async fn ack(self: Box<Self>) -> Result<(), FunctionError> {
        self.0.ack().await.map_err(FunctionError::consumer)
    }

    async fn nak(self: Box<Self>) -> Result<(), FunctionError> {
        self.0
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(FunctionError::consumer)
    }
}
