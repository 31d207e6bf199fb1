//! Message-framed duplex channel to the management server
//!
//! The rest of the agent only sees [`Frame`]s. The WebSocket specifics
//! (ping/pong, binary text, close codes) stay inside [`WsConnector`].

use crate::error::{AgentError, AgentResult};
use crate::protocol::OutboundMessage;
use futures::future::{BoxFuture, FutureExt};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Close,
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = AgentError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = AgentResult<Frame>> + Send>>;

/// An open connection, split into its write and read halves
pub struct Connection {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens connections to the management server
pub trait Connector: Send + Sync {
    fn connect(&self) -> BoxFuture<'_, AgentResult<Connection>>;
}

/// WebSocket connector
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Connector for WsConnector {
    fn connect(&self) -> BoxFuture<'_, AgentResult<Connection>> {
        async move {
            debug!("Connecting to {}", self.url);
            let (socket, _response) = connect_async(self.url.as_str()).await?;
            let (sink, stream) = socket.split();

            let sink = sink
                .sink_map_err(AgentError::from)
                .with(|frame: Frame| async move {
                    Ok::<_, AgentError>(match frame {
                        Frame::Text(text) => Message::Text(text),
                        Frame::Close => Message::Close(None),
                    })
                });

            let stream = stream.filter_map(|message| async move {
                match message {
                    Ok(Message::Text(text)) => Some(Ok(Frame::Text(text))),
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => Some(Ok(Frame::Text(text))),
                        Err(_) => {
                            warn!("Dropping non UTF-8 binary frame");
                            None
                        }
                    },
                    Ok(Message::Close(_)) => Some(Ok(Frame::Close)),
                    Ok(_) => None,
                    Err(e) => Some(Err(AgentError::from(e))),
                }
            });

            Ok(Connection {
                sink: Box::pin(sink),
                stream: Box::pin(stream),
            })
        }
        .boxed()
    }
}

/// Exclusive writer for one connection
///
/// Every frame is serialized before the lock is taken and written whole
/// while it is held, so concurrent senders never interleave.
#[derive(Clone)]
pub struct Outbound {
    sink: Arc<Mutex<FrameSink>>,
}

impl Outbound {
    pub fn new(sink: FrameSink) -> Self {
        Self {
            sink: Arc::new(Mutex::new(sink)),
        }
    }

    pub async fn send(&self, message: &OutboundMessage) -> AgentResult<()> {
        let text = serde_json::to_string(message)?;
        let mut sink = self.sink.lock().await;
        sink.send(Frame::Text(text)).await
    }

    /// Send and log on failure; for handlers with nobody to report to
    pub async fn deliver(&self, message: &OutboundMessage) {
        if let Err(e) = self.send(message).await {
            warn!("Failed to send message! ({})", e);
        }
    }

    pub async fn close(&self) -> AgentResult<()> {
        let mut sink = self.sink.lock().await;
        sink.send(Frame::Close).await
    }
}
