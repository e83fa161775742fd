use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use crate::channel::ChannelError;
use crate::types::{ClientFrame, ServerFrame};

pub type FrameSink = Pin<Box<dyn Sink<ClientFrame, Error = ChannelError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<ServerFrame, ChannelError>> + Send>>;

/// Opens one framed duplex link to the real-time endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self) -> Result<(FrameSink, FrameStream), ChannelError>;
}

pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self) -> Result<(FrameSink, FrameStream), ChannelError> {
        let (ws, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| ChannelError::Connection(e.to_string()))?;
        debug!(url = %self.url, "websocket open");

        let (ws_sink, ws_stream) = ws.split();

        let sink = ws_sink
            .sink_map_err(|e| ChannelError::Connection(e.to_string()))
            .with(|frame: ClientFrame| async move {
                let text = serde_json::to_string(&frame)?;
                Ok::<_, ChannelError>(Message::Text(text.into()))
            });

        let stream = ws_stream.filter_map(|msg| async move {
            match msg {
                Ok(Message::Text(text)) => {
                    Some(serde_json::from_str::<ServerFrame>(&text).map_err(ChannelError::from))
                }
                Ok(Message::Close(_)) => {
                    Some(Err(ChannelError::Connection("closed by server".into())))
                }
                Ok(_) => None,
                Err(e) => Some(Err(ChannelError::Connection(e.to_string()))),
            }
        });

        Ok((Box::pin(sink), Box::pin(stream)))
    }
}
