//! # Typed Work Dispatch
//!
//! The handler contract, the request-type registry, and the
//! [`MessageRouter`](router::MessageRouter) that turns one validated inbound
//! frame into exactly one handler execution and one outbound response, with
//! cross-process idempotency.

pub mod router;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::protocol::RequestType;
use crate::queue::QueueError;
use crate::services::ServiceError;

pub use router::{MessageRouter, RouteOutcome, RouterStatsSnapshot};

/// A typed work handler: payload in, response value out
///
/// The contract is total: a handler always returns a response value or an
/// explicit error, never hangs on a missing case.
#[async_trait]
pub trait WorkHandler: Send + Sync {
    async fn handle(
        &self,
        payload: &Value,
        username: &str,
        destination: &str,
    ) -> Result<Value, HandlerError>;

    /// Tag stamped on the outbound `{responseType, message}` body
    fn response_type(&self) -> &str;

    /// Handler name for logging
    fn name(&self) -> &str;
}

/// Request-type tag to handler mapping
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<RequestType, Arc<dyn WorkHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a request type
    pub async fn register(&self, request_type: RequestType, handler: Arc<dyn WorkHandler>) {
        let mut handlers = self.handlers.write().await;
        if handlers.contains_key(&request_type) {
            warn!(request_type = %request_type, "replacing existing work handler");
        }
        info!(request_type = %request_type, handler = handler.name(), "registered work handler");
        handlers.insert(request_type, handler);
    }

    pub async fn lookup(&self, request_type: RequestType) -> Option<Arc<dyn WorkHandler>> {
        self.handlers.read().await.get(&request_type).cloned()
    }

    pub async fn has_handler(&self, request_type: RequestType) -> bool {
        self.handlers.read().await.contains_key(&request_type)
    }

    pub async fn registered_types(&self) -> Vec<RequestType> {
        self.handlers.read().await.keys().copied().collect()
    }
}

/// Handler execution failures, caught and logged at the router level
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("invalid handler payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}
