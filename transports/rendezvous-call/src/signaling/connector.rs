//! Control channel transports
//!
//! A [`Connector`] dials the rendezvous server and hands back a pair of text
//! frame halves. The link owns the halves for the lifetime of one connection.

use crate::{Error, Result};
use async_trait::async_trait;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info};
use url::Url;

/// Outgoing half of a control channel
pub type FrameSink = Pin<Box<dyn Sink<String, Error = Error> + Send>>;

/// Incoming half of a control channel; the stream ends when the channel closes
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Both halves of a dialed control channel
pub struct FramePair {
    /// Outgoing frames
    pub sink: FrameSink,
    /// Incoming frames
    pub stream: FrameStream,
}

/// Dials a control channel to the rendezvous server
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a channel to `url`
    async fn dial(&self, url: &Url) -> Result<FramePair>;
}

/// WebSocket control channel
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    /// Create a new WebSocket connector
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn dial(&self, url: &Url) -> Result<FramePair> {
        info!("Connecting to rendezvous server: {}", url);

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::WebSocketError(format!("Failed to connect: {}", e)))?;

        let (write, read) = ws_stream.split();

        let sink = write
            .sink_map_err(|e| Error::WebSocketError(format!("Failed to send frame: {}", e)))
            .with(|text: String| future::ready(Ok::<_, Error>(Message::Text(text))));

        let stream = read
            .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
            .filter_map(|msg| {
                future::ready(match msg {
                    Ok(Message::Text(text)) => Some(Ok(text)),
                    Ok(other) => {
                        debug!("Ignoring non-text frame ({} bytes)", other.len());
                        None
                    }
                    Err(e) => Some(Err(Error::WebSocketError(e.to_string()))),
                })
            });

        Ok(FramePair {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}
