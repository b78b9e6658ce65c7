//! Connection ownership and the reconnect loop.
//!
//! Every session gets a generation number. A [`ConnectionHandle`] is the only
//! way to reach a session, and it refuses service once its generation is
//! closed, so holders of a replaced handle fail fast instead of talking to a
//! dead transport.

use crate::error::FunctionError;
use crate::metrics::FunctionMetrics;
use crate::resilience::{CircuitBreaker, ReconnectPolicy};
use crate::session::{ClosureObserver, Connector, Session};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Shared reference to one connection generation.
pub struct ConnectionHandle<S> {
    generation: u64,
    session: Arc<S>,
    closed: Arc<AtomicBool>,
    observer: ClosureObserver,
}

impl<S> Clone for ConnectionHandle<S> {
    fn clone(&self) -> Self {
        Self {
            generation: self.generation,
            session: self.session.clone(),
            closed: self.closed.clone(),
            observer: self.observer.clone(),
        }
    }
}

impl<S: Session> ConnectionHandle<S> {
    pub(crate) fn new(generation: u64, session: S, observer: ClosureObserver) -> Self {
        Self {
            generation,
            session: Arc::new(session),
            closed: Arc::new(AtomicBool::new(false)),
            observer,
        }
    }

    /// Generation number of this connection.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether this connection has been closed or superseded.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Access the session, failing fast if the connection is gone.
    pub fn session(&self) -> Result<&S, FunctionError> {
        if self.is_closed() {
            Err(FunctionError::StaleConnection(self.generation))
        } else {
            Ok(&self.session)
        }
    }

    /// Mark this generation closed. Every clone observes it.
    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Ask the connection manager to replace this connection.
    pub(crate) fn report_closed(&self) {
        self.observer.notify_closed();
    }

    /// Flush the session regardless of the closed flag.
    pub(crate) async fn close_session(&self) {
        self.session.close().await;
    }
}

impl<S> std::fmt::Debug for ConnectionHandle<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("generation", &self.generation)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

/// Closure notifications from every generation.
pub struct ClosureEvents {
    rx: mpsc::UnboundedReceiver<u64>,
}

impl ClosureEvents {
    /// Wait until `generation` reports closure. Notifications for older
    /// generations are discarded. Returns `false` if no notification can
    /// arrive anymore.
    pub async fn wait_for(&mut self, generation: u64) -> bool {
        while let Some(closed) = self.rx.recv().await {
            if closed == generation {
                return true;
            }
            debug!(closed, current = generation, "Ignoring closure of an older connection");
        }
        false
    }
}

/// Opens connections and runs the reconnect loop.
pub struct ConnectionManager<C: Connector> {
    connector: C,
    policy: ReconnectPolicy,
    closures: mpsc::UnboundedSender<u64>,
    next_generation: AtomicU64,
    metrics: FunctionMetrics,
}

impl<C: Connector> ConnectionManager<C> {
    /// Create a manager and the receiver for its closure notifications.
    pub fn new(
        connector: C,
        policy: ReconnectPolicy,
        metrics: FunctionMetrics,
    ) -> (Self, ClosureEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Self {
            connector,
            policy,
            closures: tx,
            next_generation: AtomicU64::new(0),
            metrics,
        };
        (manager, ClosureEvents { rx })
    }

    /// Get the reconnect policy.
    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Make a single connection attempt.
    pub async fn connect(&self) -> Result<ConnectionHandle<C::Session>, FunctionError> {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let observer = ClosureObserver::new(generation, self.closures.clone());

        info!(generation, "Connecting to NATS");
        self.metrics.connection_attempt();

        match self.connector.connect(observer.clone()).await {
            Ok(session) => {
                info!(generation, "Connected to NATS");
                Ok(ConnectionHandle::new(generation, session, observer))
            }
            Err(e) => {
                warn!(generation, error = %e, "Connection attempt failed");
                self.metrics.connection_failed();
                Err(e)
            }
        }
    }

    /// Connect, retrying according to the policy.
    ///
    /// With the default policy this retries every 5 seconds forever and only
    /// returns once connected. An error is returned only when a configured
    /// attempt cap is exhausted.
    pub async fn connect_with_retry(&self) -> Result<ConnectionHandle<C::Session>, FunctionError> {
        let mut breaker = self.policy.circuit_breaker.clone().map(CircuitBreaker::new);
        let mut attempt: u32 = 0;

        loop {
            if let Some(breaker) = breaker.as_mut() {
                if !breaker.can_execute() {
                    let wait = breaker.remaining_cooldown();
                    warn!(
                        wait_ms = wait.as_millis() as u64,
                        "Reconnect circuit open, holding off"
                    );
                    tokio::time::sleep(wait).await;
                    continue;
                }
            }

            attempt += 1;
            match self.connect().await {
                Ok(handle) => {
                    if let Some(breaker) = breaker.as_mut() {
                        breaker.record_success();
                    }
                    if attempt > 1 {
                        info!(attempt, generation = handle.generation(), "Reconnected after retries");
                    }
                    return Ok(handle);
                }
                Err(e) => {
                    if let Some(breaker) = breaker.as_mut() {
                        breaker.record_failure();
                    }
                    if self.policy.exhausted(attempt) {
                        warn!(attempt, error = %e, "Giving up on connecting");
                        return Err(e);
                    }
                    let delay = self.policy.delay_for(attempt);
                    info!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying connection"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
