//! Transport seam for the broker channel
//!
//! Abstracts the duplex frame channel so the connection manager can run over
//! a real WebSocket in production and an in-memory channel in tests. A
//! transport opens into a split sink/source pair; the handshake happens above
//! this layer in frames.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use http::header::{HeaderName, HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::protocol::Frame;

use super::ConnectionError;

/// Write half of a broker channel
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), ConnectionError>;
}

/// Read half of a broker channel; `None` means the peer closed
#[async_trait]
pub trait FrameSource: Send {
    async fn recv(&mut self) -> Option<Result<Frame, ConnectionError>>;
}

/// Opens duplex frame channels to the broker
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Open a channel, presenting the bearer token and the application header
    /// on the handshake
    async fn open(
        &self,
        url: &str,
        bearer_token: &str,
        app_header: (&str, &str),
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), ConnectionError>;
}

/// WebSocket transport used in production
#[derive(Debug, Default, Clone)]
pub struct WsTransport;

impl WsTransport {
    pub fn new() -> Self {
        Self
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct WsFrameSink {
    sink: futures::stream::SplitSink<WsStream, Message>,
}

struct WsFrameSource {
    stream: futures::stream::SplitStream<WsStream>,
}

#[async_trait]
impl BrokerTransport for WsTransport {
    async fn open(
        &self,
        url: &str,
        bearer_token: &str,
        app_header: (&str, &str),
    ) -> Result<(Box<dyn FrameSink>, Box<dyn FrameSource>), ConnectionError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| ConnectionError::Handshake {
                message: format!("invalid broker url {url}: {e}"),
            })?;

        let headers = request.headers_mut();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {bearer_token}")).map_err(|e| {
                ConnectionError::Handshake {
                    message: format!("invalid bearer token: {e}"),
                }
            })?,
        );
        let (name, value) = app_header;
        headers.insert(
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| ConnectionError::Handshake {
                message: format!("invalid application header name {name}: {e}"),
            })?,
            HeaderValue::from_str(value).map_err(|e| ConnectionError::Handshake {
                message: format!("invalid application header value: {e}"),
            })?,
        );

        let (ws, response) =
            tokio_tungstenite::connect_async(request)
                .await
                .map_err(|e| ConnectionError::Handshake {
                    message: e.to_string(),
                })?;
        debug!(status = %response.status(), url, "websocket upgrade complete");

        let (sink, stream) = ws.split();
        Ok((
            Box::new(WsFrameSink { sink }),
            Box::new(WsFrameSource { stream }),
        ))
    }
}

#[async_trait]
impl FrameSink for WsFrameSink {
    async fn send(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        self.sink
            .send(Message::Text(frame.serialize()))
            .await
            .map_err(|e| ConnectionError::Transport {
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl FrameSource for WsFrameSource {
    async fn recv(&mut self) -> Option<Result<Frame, ConnectionError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => {
                    return Some(Frame::parse(&text).map_err(ConnectionError::from))
                }
                Ok(Message::Binary(bytes)) => {
                    return Some(match String::from_utf8(bytes) {
                        Ok(text) => Frame::parse(&text).map_err(ConnectionError::from),
                        Err(e) => Err(ConnectionError::Transport {
                            message: format!("non-utf8 frame: {e}"),
                        }),
                    })
                }
                // Keepalive traffic is handled by tungstenite itself
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => continue,
                Ok(Message::Close(_)) => return None,
                Err(e) => {
                    return Some(Err(ConnectionError::Transport {
                        message: e.to_string(),
                    }))
                }
            }
        }
    }
}
