//! Handler interface.
//!
//! A handler receives each decoded request together with a [`Responder`]
//! bound to the producer stream of the connection the message arrived on.

use crate::error::FunctionError;
use crate::producer::Responder;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::future::Future;

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// Stream sequence number
    pub sequence: u64,
    /// Subject the message was published on
    pub subject: String,
    /// Decoded JSON payload
    pub body: Value,
}

impl Request {
    /// Deserialize the body into a typed request.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, FunctionError> {
        Ok(T::deserialize(&self.body)?)
    }
}

/// Business logic invoked once per delivered message.
///
/// Errors are logged by the consumption loop and never stop it.
#[async_trait]
pub trait FunctionHandler: Send + Sync + 'static {
    async fn handle(&self, request: Request, responder: &Responder) -> eyre::Result<()>;

    /// Used for logging.
    fn name(&self) -> &str {
        "handler"
    }
}

/// Adapter that turns an async closure into a [`FunctionHandler`].
pub struct HandlerFn<F> {
    f: F,
}

/// Wrap `f` as a handler.
///
/// ```rust,ignore
/// runtime.consume(handler_fn(|request, responder| async move {
///     responder.respond(&request.body).await?;
///     Ok(())
/// })).await?;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Request, Responder) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = eyre::Result<()>> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> FunctionHandler for HandlerFn<F>
where
    F: Fn(Request, Responder) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = eyre::Result<()>> + Send + 'static,
{
    async fn handle(&self, request: Request, responder: &Responder) -> eyre::Result<()> {
        (self.f)(request, responder.clone()).await
    }

    fn name(&self) -> &str {
        "closure"
    }
}
