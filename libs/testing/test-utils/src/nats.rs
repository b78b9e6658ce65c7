//! NATS test infrastructure
//!
//! Provides a `TestNats` helper that runs a JetStream-enabled NATS container
//! and a few shortcuts for inspecting what a function did to it.

use async_nats::Client;
use async_nats::jetstream::consumer::pull::Config as PullConfig;
use futures::StreamExt;
use std::time::Duration;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::nats::Nats;

/// Test NATS wrapper that ensures proper cleanup
///
/// The container is automatically stopped and removed when this struct is dropped.
/// JetStream is enabled so streams and durable consumers can be provisioned.
///
/// # Example
///
/// ```no_run
/// use test_utils::TestNats;
///
/// # async fn example() {
/// let nats = TestNats::new().await;
///
/// // Point the code under test at the container
/// let server = nats.connection_string();
///
/// // Inject a request and read back the response
/// nats.publish_json("RuleRequest", &serde_json::json!({"amt": 100})).await;
/// let responses = nats.read_stream("RuleResponseX", 1, std::time::Duration::from_secs(5)).await;
/// # }
/// ```
pub struct TestNats {
    #[allow(dead_code)]
    container: ContainerAsync<Nats>,
    client: Client,
    pub connection_string: String,
}

impl TestNats {
    /// Create a new test NATS instance with JetStream enabled
    ///
    /// Uses NATS latest image with JetStream (-js flag).
    pub async fn new() -> Self {
        let nats_image = Nats::default().with_tag("latest").with_cmd(["-js"]);

        let container = nats_image
            .start()
            .await
            .expect("Failed to start NATS container");

        let host_port = container
            .get_host_port_ipv4(4222)
            .await
            .expect("Failed to get NATS port");

        let connection_string = format!("nats://127.0.0.1:{}", host_port);

        let client = async_nats::connect(&connection_string)
            .await
            .expect("Failed to connect to NATS");

        tracing::info!(port = host_port, "Test NATS ready with JetStream");

        Self {
            container,
            client,
            connection_string,
        }
    }

    /// Get a cloned client (useful for passing to services)
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Get a JetStream context for stream operations
    pub fn jetstream(&self) -> async_nats::jetstream::Context {
        async_nats::jetstream::new(self.client.clone())
    }

    /// Get the connection string for manual client creation
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// Publish a JSON payload through JetStream and wait for the ack
    pub async fn publish_json(&self, subject: &str, value: &serde_json::Value) {
        let payload = serde_json::to_vec(value).expect("Failed to encode payload");
        self.jetstream()
            .publish(subject.to_string(), payload.into())
            .await
            .expect("Failed to publish")
            .await
            .expect("Failed to get publish ack");
    }

    /// Subjects of a stream, or `None` if it does not exist
    pub async fn stream_subjects(&self, stream: &str) -> Option<Vec<String>> {
        let mut stream = self.jetstream().get_stream(stream).await.ok()?;
        let info = stream.info().await.ok()?;
        Some(info.config.subjects.clone())
    }

    /// Read up to `count` messages from the start of a stream
    ///
    /// Uses an ephemeral consumer, so durable consumers under test are not
    /// disturbed. Returns `(subject, payload)` pairs in stream order.
    pub async fn read_stream(
        &self,
        stream: &str,
        count: usize,
        timeout: Duration,
    ) -> Vec<(String, Vec<u8>)> {
        let stream = self
            .jetstream()
            .get_stream(stream)
            .await
            .expect("Failed to get stream");

        let consumer = stream
            .create_consumer(PullConfig::default())
            .await
            .expect("Failed to create ephemeral consumer");

        let mut messages = consumer
            .fetch()
            .max_messages(count)
            .expires(timeout)
            .messages()
            .await
            .expect("Failed to fetch messages");

        let mut read = Vec::with_capacity(count);
        while let Some(Ok(message)) = messages.next().await {
            read.push((message.subject.to_string(), message.payload.to_vec()));
            message.ack().await.expect("Failed to ack");
        }
        read
    }
}

// Container is automatically cleaned up when TestNats is dropped
impl Drop for TestNats {
    fn drop(&mut self) {
        tracing::debug!("Cleaning up test NATS container");
    }
}
