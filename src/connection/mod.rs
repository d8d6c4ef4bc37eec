//! # Broker Connection Management
//!
//! Owns the single live session to the central broker: token issuance, the
//! CONNECT/CONNECTED handshake, the session-scoped subscription, the read
//! loop feeding the message router, and fixed-delay reconnection.
//!
//! The current session lives behind one synchronized handle. Reconnection
//! installs a fresh session value rather than mutating shared state, so
//! concurrent publishers see either the old session or the new one, never a
//! half-built in-between. Publishing against a session that just died is a
//! best-effort miss by contract.

pub mod memory;
pub mod transport;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{AuthError, TokenIssuer};
use crate::config::BrokerConfig;
use crate::protocol::{Frame, FrameCommand, FrameError};
use crate::routing::MessageRouter;

pub use transport::{BrokerTransport, FrameSink, FrameSource, WsTransport};

/// Lifecycle of the broker connection
///
/// Transitions are monotonic within one connection lifetime and never skip
/// `Connecting`; any transport or session error drops back to `Disconnected`
/// with exactly one retry scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
        }
    }
}

/// One live broker session: its id and the channel into its writer task
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    out_tx: mpsc::UnboundedSender<Frame>,
}

impl Session {
    fn send(&self, frame: Frame) -> Result<(), ConnectionError> {
        self.out_tx
            .send(frame)
            .map_err(|_| ConnectionError::SessionClosed)
    }
}

/// Outbound seam: publish responses and acknowledge frames over the live
/// session
///
/// Implemented by [`SessionHandle`] in production; tests substitute a
/// recorder.
#[async_trait]
pub trait ResponsePublisher: Send + Sync {
    async fn publish(&self, destination: &str, body: &str) -> Result<(), ConnectionError>;

    async fn ack(&self, message_id: &str) -> Result<(), ConnectionError>;
}

/// Synchronized slot holding the current session, shared by every publisher
#[derive(Debug, Clone, Default)]
pub struct SessionHandle {
    inner: Arc<RwLock<Option<Session>>>,
}

impl SessionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id of the current session, if connected
    pub async fn current_session_id(&self) -> Option<String> {
        self.inner.read().await.as_ref().map(|s| s.id.clone())
    }

    async fn install(&self, session: Session) {
        *self.inner.write().await = Some(session);
    }

    /// Drop the session if `session_id` is still the one installed. Returns
    /// whether anything was cleared, so only the first failing task of a
    /// session triggers reconnection.
    async fn clear(&self, session_id: &str) -> bool {
        let mut guard = self.inner.write().await;
        match guard.as_ref() {
            Some(session) if session.id == session_id => {
                *guard = None;
                true
            }
            _ => false,
        }
    }

    async fn send(&self, frame: Frame) -> Result<(), ConnectionError> {
        match self.inner.read().await.as_ref() {
            Some(session) => session.send(frame),
            None => Err(ConnectionError::NotConnected),
        }
    }
}

#[async_trait]
impl ResponsePublisher for SessionHandle {
    async fn publish(&self, destination: &str, body: &str) -> Result<(), ConnectionError> {
        self.send(
            Frame::new(FrameCommand::Send)
                .header("destination", destination)
                .header("content-type", "application/json")
                .with_body(body),
        )
        .await
    }

    async fn ack(&self, message_id: &str) -> Result<(), ConnectionError> {
        self.send(Frame::new(FrameCommand::Ack).header("id", message_id))
            .await
    }
}

/// Owns the broker session lifecycle: connect, feed frames to the router,
/// reconnect on failure
pub struct ConnectionManager {
    config: BrokerConfig,
    transport: Arc<dyn BrokerTransport>,
    token_issuer: Arc<dyn TokenIssuer>,
    router: Arc<MessageRouter>,
    session: SessionHandle,
    state: RwLock<ConnectionState>,
    reconnect_pending: AtomicBool,
}

impl ConnectionManager {
    pub fn new(
        config: BrokerConfig,
        transport: Arc<dyn BrokerTransport>,
        token_issuer: Arc<dyn TokenIssuer>,
        router: Arc<MessageRouter>,
        session: SessionHandle,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            transport,
            token_issuer,
            router,
            session,
            state: RwLock::new(ConnectionState::Disconnected),
            reconnect_pending: AtomicBool::new(false),
        })
    }

    /// Handle to the current-session slot; implements [`ResponsePublisher`]
    pub fn session(&self) -> SessionHandle {
        self.session.clone()
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Establish the session. Failure is logged and non-fatal: one retry is
    /// scheduled at the fixed delay, never attempted immediately.
    pub async fn connect(self: Arc<Self>) {
        self.set_state(ConnectionState::Connecting).await;

        match Arc::clone(&self).establish().await {
            Ok(session_id) => {
                self.set_state(ConnectionState::Connected).await;
                info!(session_id = %session_id, url = %self.config.url, "broker session established");
            }
            Err(e) => {
                warn!(error = %e, url = %self.config.url, "broker connect failed");
                self.set_state(ConnectionState::Disconnected).await;
                self.schedule_reconnect();
            }
        }
    }

    async fn establish(self: Arc<Self>) -> Result<String, ConnectionError> {
        let token = self.token_issuer.issue(&self.config.principal)?;
        let (mut sink, mut source) = self
            .transport
            .open(
                &self.config.url,
                &token,
                (&self.config.app_header, &self.config.app_name),
            )
            .await?;

        sink.send(
            Frame::new(FrameCommand::Connect)
                .header("accept-version", "1.2")
                .header("host", &self.config.url),
        )
        .await?;

        let first = source
            .recv()
            .await
            .ok_or_else(|| ConnectionError::Handshake {
                message: "connection closed during handshake".to_string(),
            })??;
        if first.command != FrameCommand::Connected {
            return Err(ConnectionError::Handshake {
                message: format!("expected CONNECTED, got {}", first.command),
            });
        }
        let session_id = first
            .get_header("session")
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let destination = format!("{}{}", self.config.subscribe_prefix, session_id);
        sink.send(
            Frame::new(FrameCommand::Subscribe)
                .header("id", "work")
                .header("destination", &destination)
                .header("ack", "client"),
        )
        .await?;
        debug!(destination = %destination, "subscribed to work destination");

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        self.session
            .install(Session {
                id: session_id.clone(),
                out_tx,
            })
            .await;

        let mgr = Arc::clone(&self);
        let writer_session = session_id.clone();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = sink.send(frame).await {
                    warn!(error = %e, session_id = %writer_session, "broker write failed");
                    break;
                }
            }
            mgr.on_session_error(writer_session).await;
        });

        let mgr = Arc::clone(&self);
        let reader_session = session_id.clone();
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Some(Ok(frame)) => match frame.command {
                        FrameCommand::Message => {
                            // Frames are processed strictly one at a time, in
                            // delivery order.
                            let outcome = mgr.router.route(&frame).await;
                            debug!(session_id = %reader_session, ?outcome, "frame routed");
                        }
                        FrameCommand::Error => {
                            warn!(
                                session_id = %reader_session,
                                body = %frame.body,
                                "broker reported an error frame"
                            );
                        }
                        other => {
                            debug!(session_id = %reader_session, command = %other, "ignoring frame");
                        }
                    },
                    Some(Err(e)) => {
                        warn!(error = %e, session_id = %reader_session, "broker read failed");
                        break;
                    }
                    None => {
                        info!(session_id = %reader_session, "broker connection closed");
                        break;
                    }
                }
            }
            mgr.on_session_error(reader_session).await;
        });

        Ok(session_id)
    }

    async fn on_session_error(self: Arc<Self>, session_id: String) {
        if self.session.clear(&session_id).await {
            self.set_state(ConnectionState::Disconnected).await;
            self.schedule_reconnect();
        }
    }

    /// Schedule exactly one `connect()` retry after the fixed delay
    ///
    /// No backoff, no jitter: one timer per failure, guarded so overlapping
    /// failures collapse into a single pending retry.
    pub fn schedule_reconnect(self: Arc<Self>) {
        if self.reconnect_pending.swap(true, Ordering::SeqCst) {
            debug!("reconnect already scheduled");
            return;
        }

        let delay = Duration::from_secs(self.config.reconnect_delay_secs);
        info!(delay_secs = self.config.reconnect_delay_secs, "scheduling broker reconnect");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            self.reconnect_pending.store(false, Ordering::SeqCst);
            self.connect().await;
        });
    }

    async fn set_state(&self, state: ConnectionState) {
        let mut guard = self.state.write().await;
        if *guard != state {
            debug!(from = %*guard, to = %state, "connection state change");
            *guard = state;
        }
    }
}

/// Connection and session errors
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("handshake failed: {message}")]
    Handshake { message: String },

    #[error("transport failure: {message}")]
    Transport { message: String },

    #[error("not connected to broker")]
    NotConnected,

    #[error("session closed")]
    SessionClosed,

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Auth(#[from] AuthError),
}
