//! In-memory broker for unit tests.
//!
//! Streams capture published subjects (exact match or `*`/`>` wildcards),
//! durable consumers keep a cursor plus a redelivery queue, and every
//! session can be killed at once to simulate a server restart.

use crate::config::AckPolicy;
use crate::error::FunctionError;
use crate::session::{
    Acknowledge, ClosureObserver, Connector, ConsumerSpec, Delivery, DeliveryStream, Session,
    StreamSpec, StreamState,
};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Default)]
struct MemoryConsumer {
    ack_policy: AckPolicy,
    next_index: usize,
    redeliver: VecDeque<u64>,
    acked: Vec<u64>,
    naked: Vec<u64>,
}

#[derive(Debug)]
struct MemoryStream {
    spec: StreamSpec,
    messages: Vec<(u64, String, Vec<u8>)>,
    consumers: HashMap<String, MemoryConsumer>,
}

#[derive(Default)]
struct BrokerState {
    streams: HashMap<String, MemoryStream>,
    published: Vec<(String, Vec<u8>)>,
    failing_subjects: HashSet<String>,
    failing_lookups: u32,
    sessions: Vec<(Arc<AtomicBool>, ClosureObserver)>,
    next_sequence: u64,
    stream_creates: usize,
    stream_updates: usize,
    consumer_creates: usize,
}

impl BrokerState {
    fn append(&mut self, subject: &str, payload: &[u8]) {
        for stream in self.streams.values_mut() {
            if stream
                .spec
                .subjects
                .iter()
                .any(|pattern| subject_matches(pattern, subject))
            {
                self.next_sequence += 1;
                stream
                    .messages
                    .push((self.next_sequence, subject.to_string(), payload.to_vec()));
            }
        }
    }
}

fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');
    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Shared in-memory broker.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    changes: Arc<watch::Sender<u64>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            changes: Arc::new(changes),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn changed(&self) {
        self.changes.send_modify(|version| *version += 1);
    }

    /// Publish a message as an upstream producer would.
    pub fn inject(&self, subject: &str, payload: impl AsRef<[u8]>) {
        self.lock().append(subject, payload.as_ref());
        self.changed();
    }

    /// Create a stream directly, bypassing any session.
    pub fn seed_stream(&self, name: &str, subjects: &[&str]) {
        let spec = StreamSpec {
            name: name.to_string(),
            subjects: subjects.iter().map(|s| s.to_string()).collect(),
            retention: Default::default(),
            storage: Default::default(),
        };
        self.lock().streams.insert(
            name.to_string(),
            MemoryStream {
                spec,
                messages: Vec::new(),
                consumers: HashMap::new(),
            },
        );
    }

    /// Every message published through a session, in order.
    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.lock().published.clone()
    }

    /// Make publishes to `subject` fail.
    pub fn fail_publish_to(&self, subject: &str) {
        self.lock().failing_subjects.insert(subject.to_string());
    }

    /// Make the next `count` stream lookups fail.
    pub fn fail_next_lookups(&self, count: u32) {
        self.lock().failing_lookups = count;
    }

    /// Subjects of a stream, if it exists.
    pub fn stream_subjects(&self, name: &str) -> Option<Vec<String>> {
        self.lock()
            .streams
            .get(name)
            .map(|stream| stream.spec.subjects.clone())
    }

    /// Sequences acknowledged on a durable consumer.
    pub fn acked(&self, stream: &str, durable: &str) -> Vec<u64> {
        self.consumer_view(stream, durable, |c| c.acked.clone())
    }

    /// Sequences negatively acknowledged on a durable consumer.
    pub fn naked(&self, stream: &str, durable: &str) -> Vec<u64> {
        self.consumer_view(stream, durable, |c| c.naked.clone())
    }

    /// Ack policy of a durable consumer, if it exists.
    pub fn consumer_policy(&self, stream: &str, durable: &str) -> Option<AckPolicy> {
        self.lock()
            .streams
            .get(stream)
            .and_then(|s| s.consumers.get(durable))
            .map(|c| c.ack_policy)
    }

    fn consumer_view<T: Default>(
        &self,
        stream: &str,
        durable: &str,
        view: impl FnOnce(&MemoryConsumer) -> T,
    ) -> T {
        self.lock()
            .streams
            .get(stream)
            .and_then(|s| s.consumers.get(durable))
            .map(view)
            .unwrap_or_default()
    }

    /// Number of stream create calls that succeeded.
    pub fn stream_creates(&self) -> usize {
        self.lock().stream_creates
    }

    /// Number of stream update calls that succeeded.
    pub fn stream_updates(&self) -> usize {
        self.lock().stream_updates
    }

    /// Number of consumer create calls, including refused ones.
    pub fn consumer_creates(&self) -> usize {
        self.lock().consumer_creates
    }

    /// Number of sessions that are still open.
    pub fn live_sessions(&self) -> usize {
        self.lock()
            .sessions
            .iter()
            .filter(|(alive, _)| alive.load(Ordering::SeqCst))
            .count()
    }

    /// Forget every stream, as a restart of a memory-backed server would.
    pub fn wipe_streams(&self) {
        self.lock().streams.clear();
    }

    /// Kill every open session, as a server restart would.
    pub fn drop_connections(&self) {
        let sessions = std::mem::take(&mut self.lock().sessions);
        for (alive, observer) in sessions {
            alive.store(false, Ordering::SeqCst);
            observer.notify_closed();
        }
        self.changed();
    }
}

/// Connector for [`MemoryBroker`] with scriptable failures.
#[derive(Clone)]
pub struct MemoryConnector {
    broker: MemoryBroker,
    attempts: Arc<AtomicUsize>,
    failures: Arc<AtomicU32>,
}

impl MemoryConnector {
    pub fn new(broker: MemoryBroker) -> Self {
        Self {
            broker,
            attempts: Arc::new(AtomicUsize::new(0)),
            failures: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Refuse the next `count` connection attempts.
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Total connection attempts so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Session = MemorySession;

    async fn connect(&self, observer: ClosureObserver) -> Result<MemorySession, FunctionError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Err(FunctionError::connection("connection refused"));
        }

        let alive = Arc::new(AtomicBool::new(true));
        self.broker
            .lock()
            .sessions
            .push((alive.clone(), observer));

        Ok(MemorySession {
            broker: self.broker.clone(),
            alive,
        })
    }
}

/// Session on a [`MemoryBroker`].
pub struct MemorySession {
    broker: MemoryBroker,
    alive: Arc<AtomicBool>,
}

impl MemorySession {
    fn ensure_alive(&self) -> Result<(), FunctionError> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(FunctionError::connection("session closed"))
        }
    }
}

#[async_trait]
impl Session for MemorySession {
    async fn stream_subjects(&self, stream: &str) -> Result<Option<Vec<String>>, FunctionError> {
        self.ensure_alive()?;
        let mut state = self.broker.lock();
        if state.failing_lookups > 0 {
            state.failing_lookups -= 1;
            return Err(FunctionError::provisioning(stream, "lookup failed"));
        }
        Ok(state.streams.get(stream).map(|s| s.spec.subjects.clone()))
    }

    async fn create_stream(&self, spec: StreamSpec) -> Result<(), FunctionError> {
        self.ensure_alive()?;
        let mut state = self.broker.lock();
        if state.streams.contains_key(&spec.name) {
            return Err(FunctionError::AlreadyExists(spec.name));
        }
        state.stream_creates += 1;
        state.streams.insert(
            spec.name.clone(),
            MemoryStream {
                spec,
                messages: Vec::new(),
                consumers: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn update_stream_subjects(
        &self,
        stream: &str,
        subjects: Vec<String>,
    ) -> Result<(), FunctionError> {
        self.ensure_alive()?;
        let mut state = self.broker.lock();
        let existing = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| FunctionError::provisioning(stream, "stream not found"))?;
        existing.spec.subjects = subjects;
        state.stream_updates += 1;
        Ok(())
    }

    async fn create_consumer(
        &self,
        stream: &str,
        spec: ConsumerSpec,
    ) -> Result<(), FunctionError> {
        self.ensure_alive()?;
        let mut state = self.broker.lock();
        state.consumer_creates += 1;
        let existing = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| FunctionError::provisioning(stream, "stream not found"))?;
        if existing.consumers.contains_key(&spec.durable_name) {
            return Err(FunctionError::AlreadyExists(spec.durable_name));
        }
        existing.consumers.insert(
            spec.durable_name,
            MemoryConsumer {
                ack_policy: spec.ack_policy,
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn pull(
        &self,
        stream: &str,
        durable_name: &str,
    ) -> Result<DeliveryStream, FunctionError> {
        self.ensure_alive()?;
        {
            let state = self.broker.lock();
            let known = state
                .streams
                .get(stream)
                .is_some_and(|s| s.consumers.contains_key(durable_name));
            if !known {
                return Err(FunctionError::consumer(format!(
                    "consumer {durable_name} not found on {stream}"
                )));
            }
        }

        let cursor = Cursor {
            broker: self.broker.clone(),
            alive: self.alive.clone(),
            stream: stream.to_string(),
            durable: durable_name.to_string(),
            changes: self.broker.changes.subscribe(),
        };

        Ok(futures::stream::unfold(cursor, |mut cursor| async move {
            let delivery = cursor.next_delivery().await?;
            Some((Ok(delivery), cursor))
        })
        .boxed())
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> Result<(), FunctionError> {
        self.ensure_alive()?;
        {
            let mut state = self.broker.lock();
            if state.failing_subjects.contains(subject) {
                return Err(FunctionError::publish(subject, "no responders"));
            }
            state.published.push((subject.to_string(), payload.clone()));
            state.append(subject, &payload);
        }
        self.broker.changed();
        Ok(())
    }

    async fn stream_state(&self, stream: &str) -> Result<StreamState, FunctionError> {
        self.ensure_alive()?;
        let state = self.broker.lock();
        let existing = state
            .streams
            .get(stream)
            .ok_or_else(|| FunctionError::provisioning(stream, "stream not found"))?;
        Ok(StreamState {
            name: stream.to_string(),
            subjects: existing.spec.subjects.clone(),
            messages: existing.messages.len() as u64,
            consumer_count: existing.consumers.len(),
        })
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

struct Cursor {
    broker: MemoryBroker,
    alive: Arc<AtomicBool>,
    stream: String,
    durable: String,
    changes: watch::Receiver<u64>,
}

impl Cursor {
    async fn next_delivery(&mut self) -> Option<Delivery> {
        loop {
            let _ = self.changes.borrow_and_update();
            if !self.alive.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(delivery) = self.take() {
                return Some(delivery);
            }
            self.changes.changed().await.ok()?;
        }
    }

    fn take(&self) -> Option<Delivery> {
        let mut state = self.broker.lock();
        let stream = state.streams.get_mut(&self.stream)?;
        let consumer = stream.consumers.get_mut(&self.durable)?;

        let sequence = match consumer.redeliver.pop_front() {
            Some(sequence) => sequence,
            None => {
                let (sequence, _, _) = stream.messages.get(consumer.next_index)?;
                consumer.next_index += 1;
                *sequence
            }
        };

        let (_, subject, payload) = stream
            .messages
            .iter()
            .find(|(seq, _, _)| *seq == sequence)?;

        Some(Delivery::new(
            sequence,
            subject.clone(),
            payload.clone(),
            Box::new(MemoryAck {
                broker: self.broker.clone(),
                stream: self.stream.clone(),
                durable: self.durable.clone(),
                sequence,
            }),
        ))
    }
}

struct MemoryAck {
    broker: MemoryBroker,
    stream: String,
    durable: String,
    sequence: u64,
}

impl MemoryAck {
    fn settle(&self, f: impl FnOnce(&mut MemoryConsumer, u64)) -> Result<(), FunctionError> {
        let mut state = self.broker.lock();
        let consumer = state
            .streams
            .get_mut(&self.stream)
            .and_then(|s| s.consumers.get_mut(&self.durable))
            .ok_or_else(|| FunctionError::consumer("consumer deleted"))?;
        f(consumer, self.sequence);
        Ok(())
    }
}

#[async_trait]
impl Acknowledge for MemoryAck {
    async fn ack(self: Box<Self>) -> Result<(), FunctionError> {
        self.settle(|consumer, sequence| consumer.acked.push(sequence))
    }

    async fn nak(self: Box<Self>) -> Result<(), FunctionError> {
        self.settle(|consumer, sequence| {
            consumer.naked.push(sequence);
            consumer.redeliver.push_back(sequence);
        })?;
        self.broker.changed();
        Ok(())
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` passes.
///
/// Works with paused time as well as real time.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_matching() {
        assert!(subject_matches("orders", "orders"));
        assert!(subject_matches("orders.*", "orders.new"));
        assert!(!subject_matches("orders.*", "orders.new.eu"));
        assert!(subject_matches("orders.>", "orders.new.eu"));
        assert!(!subject_matches("orders", "orders.new"));
    }
}
