//! Processing modules: pluggable handlers for inbound non-reply messages.
//!
//! Every request or notification a [`Connection`] receives is offered, on its
//! own task, first to [`KeyExchangeModule`], then to [`PingModule`], then to
//! each user module in registration order. Modules ignore messages they do
//! not recognize.

use crate::connection::Connection;
use crate::error::WireError;
use crate::message::*;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

/// Handler for inbound messages on a connection.
#[async_trait]
pub trait ProcessingModule: Send + Sync + 'static {
    /// Name used in log lines.
    fn name(&self) -> &str;

    /// Inspect a message and optionally act or reply on `connection`.
    ///
    /// Must be a silent no-op for message types the module does not handle.
    async fn process(&self, message: &Message, connection: &Connection) -> Result<(), WireError>;
}

/// Answers `PingRequest`s by echoing their timestamp.
pub struct PingModule;

#[async_trait]
impl ProcessingModule for PingModule {
    fn name(&self) -> &str {
        "ping"
    }

    async fn process(&self, message: &Message, connection: &Connection) -> Result<(), WireError> {
        if let Message::Request(Request {
            id,
            body: RequestBody::Ping(ping),
        }) = message
        {
            connection
                .send(Response::new(
                    *id,
                    PingResponse {
                        timestamp: ping.timestamp,
                    },
                ))
                .await?;
        }
        Ok(())
    }
}

/// Answers `KeyExchangeRequest`s and adopts the generated session cipher.
pub struct KeyExchangeModule;

#[async_trait]
impl ProcessingModule for KeyExchangeModule {
    fn name(&self) -> &str {
        "key_exchange"
    }

    async fn process(&self, message: &Message, connection: &Connection) -> Result<(), WireError> {
        if let Message::Request(Request {
            id,
            body: RequestBody::KeyExchange(request),
        }) = message
        {
            connection.respond_to_key_exchange(*id, request).await?;
        }
        Ok(())
    }
}

/// Replies to custom requests of one name with the handler's output.
///
/// A handler returning `None` sends nothing; the requester then times out.
pub struct CustomRequestModule<F> {
    name: String,
    handler: F,
}

impl<F> CustomRequestModule<F>
where
    F: Fn(&serde_json::Value) -> Option<serde_json::Value> + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, handler: F) -> Self {
        Self {
            name: name.into(),
            handler,
        }
    }
}

#[async_trait]
impl<F> ProcessingModule for CustomRequestModule<F>
where
    F: Fn(&serde_json::Value) -> Option<serde_json::Value> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&self, message: &Message, connection: &Connection) -> Result<(), WireError> {
        let Message::Request(Request {
            id,
            body: RequestBody::Custom(request),
        }) = message
        else {
            return Ok(());
        };
        if request.name != self.name {
            return Ok(());
        }
        if let Some(payload) = (self.handler)(&request.payload) {
            connection
                .send(Response::new(
                    *id,
                    CustomResponse {
                        name: self.name.clone(),
                        payload,
                    },
                ))
                .await?;
        }
        Ok(())
    }
}

static KEY_EXCHANGE: KeyExchangeModule = KeyExchangeModule;
static PING: PingModule = PingModule;

/// Run the built-in modules, then the user modules, in order.
pub(crate) async fn dispatch(
    message: &Message,
    connection: &Connection,
    modules: &[Arc<dyn ProcessingModule>],
) {
    run_module(&KEY_EXCHANGE, message, connection).await;
    run_module(&PING, message, connection).await;
    for module in modules {
        run_module(module.as_ref(), message, connection).await;
    }
}

async fn run_module(module: &dyn ProcessingModule, message: &Message, connection: &Connection) {
    if let Err(e) = module.process(message, connection).await {
        warn!(
            conn = connection.id(),
            module = module.name(),
            error = %e,
            "Processing module failed"
        );
    }
}
