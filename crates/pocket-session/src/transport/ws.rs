/*
[INPUT]:  Endpoint URL, upgrade headers (Origin, User-Agent, Cookie)
[OUTPUT]: WebSocket-backed transport handles
[POS]:    Transport layer - tokio-tungstenite implementation
[UPDATE]: When changing TLS setup, upgrade headers, or frame mapping
*/

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info};

use super::{Connector, FrameSink, FrameStream, RawFrame, TransportHandle};
use crate::error::{Result, SessionError};
use crate::region::Endpoint;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens WebSocket connections with the configured upgrade headers
#[derive(Debug, Clone, Default)]
pub struct WsConnector {
    headers: Vec<(String, String)>,
}

impl WsConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector that adds `headers` to every upgrade request.
    pub fn with_headers(headers: Vec<(String, String)>) -> Self {
        Self { headers }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, endpoint: &Endpoint, timeout: Duration) -> Result<TransportHandle> {
        let url = endpoint.url.as_str();
        let mut request = url
            .into_client_request()
            .map_err(|err| SessionError::connect(url, err))?;

        for (name, value) in &self.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| SessionError::Config(format!("invalid header name {name}: {err}")))?;
            let header_value = HeaderValue::from_str(value)
                .map_err(|err| SessionError::Config(format!("invalid value for {name}: {err}")))?;
            request.headers_mut().insert(header_name, header_value);
        }

        debug!(region = %endpoint.region, %url, "opening websocket");
        let (ws_stream, response) = tokio::time::timeout(timeout, connect_async(request))
            .await
            .map_err(|_| {
                SessionError::connect(url, format!("timed out after {}ms", timeout.as_millis()))
            })?
            .map_err(|err| SessionError::connect(url, err))?;
        info!(region = %endpoint.region, status = %response.status(), "websocket opened");

        let (write, read) = ws_stream.split();
        Ok(TransportHandle {
            sink: Box::new(WsSink { write }),
            stream: Box::new(WsStream { read }),
        })
    }
}

struct WsSink {
    write: SplitSink<Socket, WsMessage>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: RawFrame) -> Result<()> {
        let message = match frame {
            RawFrame::Text(text) => WsMessage::Text(text.into()),
            RawFrame::Binary(bytes) => WsMessage::Binary(bytes.into()),
        };
        self.write
            .send(message)
            .await
            .map_err(|err| SessionError::Transport(err.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.write.send(WsMessage::Close(None)).await;
        let _ = self.write.close().await;
    }
}

struct WsStream {
    read: SplitStream<Socket>,
}

#[async_trait]
impl FrameStream for WsStream {
    async fn receive(&mut self) -> Option<Result<RawFrame>> {
        loop {
            match self.read.next().await {
                Some(Ok(WsMessage::Text(text))) => return Some(Ok(RawFrame::Text(text.to_string()))),
                Some(Ok(WsMessage::Binary(bytes))) => return Some(Ok(RawFrame::Binary(bytes.to_vec()))),
                Some(Ok(WsMessage::Close(_))) | None => return None,
                // websocket-level ping/pong is answered by tungstenite itself
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Some(Err(SessionError::Transport(err.to_string()))),
            }
        }
    }
}
