//! # Feedbridge Work-Intake Core
//!
//! Asynchronous work-intake subsystem of the Feedbridge API server. It keeps
//! one persistent STOMP-style session to the central broker over WebSocket,
//! receives typed work requests from the control plane, executes them against
//! local services, and publishes results, entirely off the HTTP request path.
//!
//! ## Architecture
//!
//! - [`connection`]: session lifecycle, from the token handshake and
//!   session-scoped subscription through the read loop and fixed-delay
//!   reconnection
//! - [`routing`]: frame validation, typed handler dispatch, cross-process
//!   dedup, explicit acknowledgment
//! - [`queue`]: unbounded creation queue plus its single consumer, so bulk
//!   work never stalls the connection
//! - [`handlers`]: the registered work handler variants
//! - [`dedup`]: shared-storage mutual exclusion keyed by request digest
//! - [`protocol`]: frame codec and fail-closed work-envelope decoding
//! - [`services`]: narrow seams to the domain layer (resolution,
//!   persistence, import)
//!
//! ## Guarantees
//!
//! A given (request type, payload) pair executes on at most one handler
//! system-wide at a time; frames on one connection are processed strictly in
//! arrival order; background tasks are at-most-once and best-effort. Failures
//! here never surface as HTTP errors; visibility is logs plus the absence of
//! an expected completion message.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use feedbridge_core::auth::JwtTokenIssuer;
//! use feedbridge_core::config::IntakeConfig;
//! use feedbridge_core::connection::{ConnectionManager, SessionHandle, WsTransport};
//! use feedbridge_core::dedup::InMemoryDedupStore;
//! use feedbridge_core::routing::{HandlerRegistry, MessageRouter};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = IntakeConfig::load()?;
//! let session = SessionHandle::new();
//! let registry = Arc::new(HandlerRegistry::new());
//! let router = Arc::new(MessageRouter::new(
//!     registry,
//!     Arc::new(InMemoryDedupStore::new()),
//!     Arc::new(session.clone()),
//! ));
//! let issuer = Arc::new(JwtTokenIssuer::new(
//!     &config.auth.secret,
//!     config.auth.audience.clone(),
//!     config.auth.token_ttl_minutes,
//! ));
//! let manager = ConnectionManager::new(
//!     config.broker,
//!     Arc::new(WsTransport::new()),
//!     issuer,
//!     router,
//!     session,
//! );
//! manager.connect().await;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod connection;
pub mod dedup;
pub mod handlers;
pub mod protocol;
pub mod queue;
pub mod routing;
pub mod services;
pub mod telemetry;

pub use config::IntakeConfig;
pub use connection::{ConnectionManager, ConnectionState, ResponsePublisher, SessionHandle};
pub use protocol::{Frame, FrameCommand, RequestType, WorkEnvelope};
pub use queue::{CreationTask, TaskProcessor, TaskQueue};
pub use routing::{HandlerRegistry, MessageRouter, RouteOutcome, WorkHandler};
