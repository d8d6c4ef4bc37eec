//! # Work Handler Variants
//!
//! Concrete handlers registered against the
//! [`HandlerRegistry`](crate::routing::HandlerRegistry). `PingHandler`
//! is the connectivity probe; [`SubscriptionImportHandler`](import::SubscriptionImportHandler)
//! is the bulk-import path that feeds the creation queue.

pub mod import;

use async_trait::async_trait;
use serde_json::Value;

use crate::routing::{HandlerError, WorkHandler};

pub use import::SubscriptionImportHandler;

/// Trivial probe handler; echoes its payload back
#[derive(Debug, Default)]
pub struct PingHandler;

#[async_trait]
impl WorkHandler for PingHandler {
    async fn handle(
        &self,
        payload: &Value,
        _username: &str,
        _destination: &str,
    ) -> Result<Value, HandlerError> {
        Ok(payload.clone())
    }

    fn response_type(&self) -> &str {
        "PONG"
    }

    fn name(&self) -> &str {
        "ping"
    }
}
