//! In-memory broker transport for tests
//!
//! Each `open()` produces a fresh channel pair and hands the broker-side ends
//! to the test through an accept queue, so a test can play the broker:
//! answer CONNECT with CONNECTED, deliver MESSAGE frames, and observe ACK and
//! SEND frames coming back.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::protocol::Frame;

use super::transport::{BrokerTransport, FrameSink, FrameSource};
use super::ConnectionError;

/// Broker-side ends of one accepted connection
pub struct BrokerEnd {
    /// Frames the broker delivers to the client
    pub to_client: mpsc::UnboundedSender<Frame>,
    /// Frames the client sent to the broker
    pub from_client: mpsc::UnboundedReceiver<Frame>,
    /// Bearer token the client presented on this open
    pub bearer_token: String,
}

/// Channel-backed transport; every open is surfaced on the accept queue
pub struct MemoryTransport {
    accepts: mpsc::UnboundedSender<BrokerEnd>,
    opens: AtomicUsize,
    fail_opens: Arc<AtomicUsize>,
}

impl MemoryTransport {
    /// Create the transport and the accept queue the test drains
    pub fn pair() -> (Arc<Self>, mpsc::UnboundedReceiver<BrokerEnd>) {
        let (accepts, accept_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                accepts,
                opens: AtomicUsize::new(0),
                fail_opens: Arc::new(AtomicUsize::new(0)),
            }),
            accept_rx,
        )
    }

    /// Fail the next `n` opens with a transport error
    pub fn fail_next_opens(&self, n: usize) {
        self.fail_opens.store(n, Ordering::SeqCst);
    }

    /// Total `open()` attempts, including failed ones
    pub fn open_attempts(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerTransport for MemoryTransport {
    async fn open(
        &self,
        _url: &str,
        bearer_token: &str,
        _app_header: (&str, &str),
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), ConnectionError> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        let remaining = self.fail_opens.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_opens.store(remaining - 1, Ordering::SeqCst);
            return Err(ConnectionError::Transport {
                message: "simulated connect failure".to_string(),
            });
        }

        let (to_client, client_rx) = mpsc::unbounded_channel();
        let (client_tx, from_client) = mpsc::unbounded_channel();

        self.accepts
            .send(BrokerEnd {
                to_client,
                from_client,
                bearer_token: bearer_token.to_string(),
            })
            .map_err(|_| ConnectionError::Transport {
                message: "broker accept queue closed".to_string(),
            })?;

        Ok((
            Box::new(ChannelFrameSink { tx: client_tx }),
            Box::new(ChannelFrameSource { rx: client_rx }),
        ))
    }
}

struct ChannelFrameSink {
    tx: mpsc::UnboundedSender<Frame>,
}

#[async_trait]
impl FrameSink for ChannelFrameSink {
    async fn send(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        self.tx.send(frame).map_err(|_| ConnectionError::Transport {
            message: "peer closed".to_string(),
        })
    }
}

struct ChannelFrameSource {
    rx: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl FrameSource for ChannelFrameSource {
    async fn recv(&mut self) -> Option<Result<Frame, ConnectionError>> {
        self.rx.recv().await.map(Ok)
    }
}
