//! Function runtime.
//!
//! `FunctionRuntime` connects, provisions the producer stream and spawns a
//! supervisor task that owns connection replacement. When the connection
//! closes the supervisor marks the old handle closed, stops the consumption
//! loops, reconnects per the [`ReconnectPolicy`](crate::ReconnectPolicy), and
//! re-binds the handler if one was registered.

use crate::config::FunctionConfig;
use crate::connection::{ClosureEvents, ConnectionHandle, ConnectionManager};
use crate::consumer::ConsumptionLoop;
use crate::error::FunctionError;
use crate::handler::FunctionHandler;
use crate::metrics::FunctionMetrics;
use crate::producer::Responder;
use crate::provisioner::StreamProvisioner;
use crate::registrar::ensure_consumer;
use crate::session::{Connector, Session, StreamState};
use core_config::tracing::ensure_tracing;
use core_config::ConfigError;
use serde::Serialize;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Handler registration and the loops currently driving it.
#[derive(Default)]
struct Binding {
    handler: Option<Arc<dyn FunctionHandler>>,
    loops: Vec<JoinHandle<()>>,
}

impl Binding {
    fn stop_loops(&mut self) {
        for task in self.loops.drain(..) {
            task.abort();
        }
    }
}

struct Inner<C: Connector> {
    config: FunctionConfig,
    manager: ConnectionManager<C>,
    current: RwLock<ConnectionHandle<C::Session>>,
    binding: Mutex<Binding>,
    provisioner: StreamProvisioner,
    metrics: FunctionMetrics,
}

impl<C: Connector> Inner<C> {
    fn current(&self) -> ConnectionHandle<C::Session> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn install(&self, handle: ConnectionHandle<C::Session>) {
        match self.current.write() {
            Ok(mut guard) => *guard = handle,
            Err(poisoned) => *poisoned.into_inner() = handle,
        }
    }

    fn responder(&self, handle: &ConnectionHandle<C::Session>) -> Responder {
        Responder::new(
            handle.clone(),
            &self.config.producer_stream,
            self.metrics.clone(),
        )
    }

    async fn provision_producer(
        &self,
        handle: &ConnectionHandle<C::Session>,
    ) -> Result<(), FunctionError> {
        let subjects = self.config.producer_subjects();
        self.provisioner
            .ensure_stream(
                handle.session()?,
                &self.config.producer_stream,
                Some(&subjects),
            )
            .await?;
        Ok(())
    }

    /// Provision every consumer stream, register the durable consumer on
    /// each and spawn one consumption loop per stream.
    async fn bind(
        &self,
        handle: &ConnectionHandle<C::Session>,
        handler: Arc<dyn FunctionHandler>,
    ) -> Result<Vec<JoinHandle<()>>, FunctionError> {
        let session = handle.session()?;
        self.provisioner
            .ensure_streams(
                session,
                &self.config.consumer_streams,
                self.config.consumer_subjects(),
            )
            .await?;

        let mut durables = Vec::with_capacity(self.config.consumer_streams.len());
        for stream in &self.config.consumer_streams {
            let durable = ensure_consumer(
                session,
                &self.config.function_name,
                stream,
                self.config.ack_policy,
            )
            .await?;
            durables.push((stream.clone(), durable));
        }

        let loops = durables
            .into_iter()
            .map(|(stream, durable)| {
                let consumption = ConsumptionLoop::new(
                    handle.clone(),
                    stream.clone(),
                    durable,
                    handler.clone(),
                    self.responder(handle),
                    self.config.ack_policy,
                    self.config.on_handler_error,
                    self.metrics.clone(),
                );
                let handle = handle.clone();
                tokio::spawn(async move {
                    if let Err(e) = consumption.run().await {
                        warn!(stream = %stream, error = %e, "Consumption loop failed");
                    }
                    if !handle.is_closed() {
                        // Delivery stream ended on a live connection
                        warn!(stream = %stream, "Requesting reconnect to restore consumer");
                        handle.report_closed();
                    }
                })
            })
            .collect();

        Ok(loops)
    }
}

/// Running function: one connection, an optional handler binding and the
/// supervisor that keeps both alive.
pub struct FunctionRuntime<C: Connector> {
    inner: Arc<Inner<C>>,
    supervisor: std::sync::Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl<C: Connector> FunctionRuntime<C> {
    /// Connect, provision the producer stream and start supervising the
    /// connection.
    ///
    /// Connection failures are retried per the reconnect policy (forever by
    /// default). Provisioning failures abort startup.
    pub async fn start(config: FunctionConfig, connector: C) -> Result<Self, FunctionError> {
        ensure_tracing(&config.environment);

        let metrics = FunctionMetrics::new(config.function_name.clone());
        let (manager, events) =
            ConnectionManager::new(connector, config.reconnect.clone(), metrics.clone());

        info!(
            function = %config.function_name,
            producer_stream = %config.producer_stream,
            consumer_streams = ?config.consumer_streams,
            "Starting function runtime"
        );

        let handle = manager.connect_with_retry().await?;
        let inner = Arc::new(Inner {
            provisioner: StreamProvisioner::from_config(&config),
            config,
            manager,
            current: RwLock::new(handle.clone()),
            binding: Mutex::new(Binding::default()),
            metrics,
        });

        if let Err(e) = inner.provision_producer(&handle).await {
            error!(error = %e, "Failed to provision producer stream");
            handle.close_session().await;
            handle.mark_closed();
            return Err(e);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = tokio::spawn(supervise(inner.clone(), events, shutdown_rx));

        Ok(Self {
            inner,
            supervisor: std::sync::Mutex::new(Some(supervisor)),
            shutdown_tx,
        })
    }

    /// Configuration the runtime was started with.
    pub fn config(&self) -> &FunctionConfig {
        &self.inner.config
    }

    /// Generation of the current connection.
    pub fn generation(&self) -> u64 {
        self.inner.current().generation()
    }

    /// Bind `handler` to every consumer stream.
    ///
    /// Streams are provisioned in order and the first failure aborts the
    /// call. The binding is remembered and restored after every reconnect.
    pub async fn consume<H: FunctionHandler>(&self, handler: H) -> Result<(), FunctionError> {
        self.ensure_running()?;
        if !self.inner.config.has_consumer_role() {
            return Err(ConfigError::invalid(
                "CONSUMER_STREAM",
                "no consumer stream configured",
            )
            .into());
        }

        let mut binding = self.inner.binding.lock().await;
        if binding.handler.is_some() {
            return Err(FunctionError::Consumer(
                "a handler is already bound".to_string(),
            ));
        }

        let handler: Arc<dyn FunctionHandler> = Arc::new(handler);
        let handle = self.inner.current();
        let loops = match self.inner.bind(&handle, handler.clone()).await {
            Ok(loops) => loops,
            Err(e @ (FunctionError::Connection(_) | FunctionError::StaleConnection(_))) => {
                // The supervisor binds the handler once the connection is back
                warn!(
                    handler = handler.name(),
                    generation = handle.generation(),
                    error = %e,
                    "Connection unavailable, handler will be bound after reconnect"
                );
                binding.handler = Some(handler);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        info!(
            handler = handler.name(),
            streams = ?self.inner.config.consumer_streams,
            "Handler bound"
        );
        binding.handler = Some(handler);
        binding.loops = loops;
        Ok(())
    }

    /// Responder bound to the current connection.
    pub fn responder(&self) -> Responder {
        self.inner.responder(&self.inner.current())
    }

    /// Publish a response through the current connection.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        response: &T,
        subjects: Option<&[String]>,
    ) -> Result<(), FunctionError> {
        self.ensure_running()?;
        self.responder().publish(response, subjects).await
    }

    /// Snapshot of a stream.
    pub async fn stream_state(&self, stream: &str) -> Result<StreamState, FunctionError> {
        let handle = self.inner.current();
        handle.session()?.stream_state(stream).await
    }

    fn ensure_running(&self) -> Result<(), FunctionError> {
        let running = match self.supervisor.lock() {
            Ok(guard) => guard.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        };
        if running {
            Ok(())
        } else {
            Err(FunctionError::Shutdown)
        }
    }

    /// Stop the supervisor and the consumption loops, then flush and
    /// release the connection. Calling it again is a no-op.
    pub async fn shutdown(&self) -> Result<(), FunctionError> {
        let supervisor = match self.supervisor.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let Some(supervisor) = supervisor else {
            return Ok(());
        };

        info!("Shutting down function runtime");
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = supervisor.await {
            warn!(error = %e, "Supervisor task ended abnormally");
        }

        self.inner.binding.lock().await.stop_loops();

        let handle = self.inner.current();
        if !handle.is_closed() {
            handle.close_session().await;
            handle.mark_closed();
        }

        info!("Function runtime stopped");
        Ok(())
    }
}

impl<C: Connector> Drop for FunctionRuntime<C> {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Sleep unless shutdown is requested first. Returns `false` on shutdown.
async fn pause(delay: Duration, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = shutdown_rx.wait_for(|stop| *stop) => false,
    }
}

async fn supervise<C: Connector>(
    inner: Arc<Inner<C>>,
    mut events: ClosureEvents,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let interval = inner.manager.policy().interval;
    let mut connected_at = Instant::now();

    'supervise: loop {
        let generation = inner.current().generation();

        let closed = tokio::select! {
            _ = shutdown_rx.wait_for(|stop| *stop) => false,
            closed = events.wait_for(generation) => closed,
        };
        if !closed {
            break;
        }

        warn!(generation, "Connection closed, reconnecting");
        inner.current().mark_closed();
        inner.binding.lock().await.stop_loops();

        // Do not hammer a server that drops us right after connecting
        let since_connect = connected_at.elapsed();
        if since_connect < interval && !pause(interval - since_connect, &mut shutdown_rx).await {
            break;
        }

        loop {
            let handle = tokio::select! {
                _ = shutdown_rx.wait_for(|stop| *stop) => break 'supervise,
                result = inner.manager.connect_with_retry() => match result {
                    Ok(handle) => handle,
                    Err(e) => {
                        error!(error = %e, "Reconnect attempts exhausted, giving up");
                        break 'supervise;
                    }
                },
            };
            inner.install(handle.clone());

            match rebind(&inner, &handle).await {
                Ok(()) => {
                    inner.metrics.reconnected();
                    info!(generation = handle.generation(), "Connection restored");
                    connected_at = Instant::now();
                    break;
                }
                Err(e) => {
                    error!(
                        generation = handle.generation(),
                        error = %e,
                        "Failed to restore streams after reconnect, retrying"
                    );
                    handle.mark_closed();
                    if !pause(interval, &mut shutdown_rx).await {
                        break 'supervise;
                    }
                }
            }
        }
    }

    inner.binding.lock().await.stop_loops();
    info!("Connection supervisor stopped");
}

async fn rebind<C: Connector>(
    inner: &Inner<C>,
    handle: &ConnectionHandle<C::Session>,
) -> Result<(), FunctionError> {
    inner.provision_producer(handle).await?;

    let mut binding = inner.binding.lock().await;
    if let Some(handler) = binding.handler.clone() {
        binding.stop_loops();
        binding.loops = inner.bind(handle, handler).await?;
    }
    Ok(())
}
