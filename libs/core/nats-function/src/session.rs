//! Broker seams.
//!
//! `Connector` dials the broker and yields a `Session`; a `Session` is one
//! live transport with stream management, pull consumption and publishing.
//! The production implementation lives in [`crate::nats`].

use crate::config::{AckPolicy, RetentionPolicy, StorageType};
use crate::error::FunctionError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::mpsc;

/// Stream to be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSpec {
    pub name: String,
    pub subjects: Vec<String>,
    pub retention: RetentionPolicy,
    pub storage: StorageType,
}

/// Durable consumer to be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSpec {
    pub durable_name: String,
    pub ack_policy: AckPolicy,
}

/// Snapshot of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamState {
    pub name: String,
    pub subjects: Vec<String>,
    pub messages: u64,
    pub consumer_count: usize,
}

/// Acknowledgment token of a delivered message.
#[async_trait]
pub trait Acknowledge: Send {
    /// Acknowledge the message (consumed).
    async fn ack(self: Box<Self>) -> Result<(), FunctionError>;

    /// Negative acknowledge (request redelivery).
    async fn nak(self: Box<Self>) -> Result<(), FunctionError>;
}

/// A message delivered by the broker.
///
/// `ack` and `nak` consume the delivery, so a message is settled at most once.
pub struct Delivery {
    /// Stream sequence number.
    pub sequence: u64,
    /// Subject the message was published on.
    pub subject: String,
    /// Raw payload.
    pub payload: Vec<u8>,
    token: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(
        sequence: u64,
        subject: impl Into<String>,
        payload: Vec<u8>,
        token: Box<dyn Acknowledge>,
    ) -> Self {
        Self {
            sequence,
            subject: subject.into(),
            payload,
            token,
        }
    }

    /// Acknowledge the message.
    pub async fn ack(self) -> Result<(), FunctionError> {
        self.token.ack().await
    }

    /// Negative acknowledge the message.
    pub async fn nak(self) -> Result<(), FunctionError> {
        self.token.nak().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("sequence", &self.sequence)
            .field("subject", &self.subject)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Messages pulled from a durable consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, FunctionError>>;

/// One live broker transport.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Subjects of a stream, or `None` if the stream does not exist.
    async fn stream_subjects(&self, stream: &str) -> Result<Option<Vec<String>>, FunctionError>;

    /// Create a stream.
    async fn create_stream(&self, spec: StreamSpec) -> Result<(), FunctionError>;

    /// Replace the subject list of an existing stream, keeping its other settings.
    async fn update_stream_subjects(
        &self,
        stream: &str,
        subjects: Vec<String>,
    ) -> Result<(), FunctionError>;

    /// Create a durable consumer. Fails with `AlreadyExists` only if the
    /// broker refuses because of an existing consumer.
    async fn create_consumer(&self, stream: &str, spec: ConsumerSpec)
        -> Result<(), FunctionError>;

    /// Bind to a durable consumer and pull one message at a time.
    async fn pull(&self, stream: &str, durable_name: &str)
        -> Result<DeliveryStream, FunctionError>;

    /// Publish a payload and wait for the broker's answer.
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), FunctionError>;

    /// Snapshot of a stream.
    async fn stream_state(&self, stream: &str) -> Result<StreamState, FunctionError>;

    /// Flush pending traffic before the session is dropped.
    async fn close(&self);
}

/// Dials the broker.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Session: Session;

    /// Open a new session. The session must call
    /// [`ClosureObserver::notify_closed`] when its transport closes.
    async fn connect(&self, observer: ClosureObserver) -> Result<Self::Session, FunctionError>;
}

/// Reports the closure of one connection generation to the connection manager.
#[derive(Debug, Clone)]
pub struct ClosureObserver {
    generation: u64,
    tx: mpsc::UnboundedSender<u64>,
}

impl ClosureObserver {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<u64>) -> Self {
        Self { generation, tx }
    }

    /// Generation of the connection being observed.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Signal that the connection closed. Repeated calls are harmless.
    pub fn notify_closed(&self) {
        let _ = self.tx.send(self.generation);
    }
}
