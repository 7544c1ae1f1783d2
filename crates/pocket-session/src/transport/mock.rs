/*
[INPUT]:  Scripted per-region open behavior, frames pushed by a simulated venue
[OUTPUT]: In-memory transport handles plus the server-side peer of each one
[POS]:    Transport layer - deterministic simulation for tests and dry runs
[UPDATE]: When the handshake sequence or transport contract changes
*/

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Connector, FrameSink, FrameStream, RawFrame, TransportHandle};
use crate::codec::{self, Control, FrameDecoder, Frame, Packet};
use crate::error::{Result, SessionError};
use crate::region::Endpoint;

/// How `MockConnector::open` treats a region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenBehavior {
    #[default]
    Accept,
    /// Fail immediately, like a refused TCP connection
    Refuse,
    /// Never answer; the open fails once its timeout elapses
    Hang,
}

/// In-memory connector; every accepted open hands a `MockPeer` to the test.
#[derive(Debug)]
pub struct MockConnector {
    behaviors: Mutex<HashMap<String, OpenBehavior>>,
    attempts: Mutex<Vec<String>>,
    peers_tx: mpsc::UnboundedSender<MockPeer>,
    peers_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MockPeer>>,
}

impl MockConnector {
    pub fn new() -> Self {
        let (peers_tx, peers_rx) = mpsc::unbounded_channel();
        Self {
            behaviors: Mutex::new(HashMap::new()),
            attempts: Mutex::new(Vec::new()),
            peers_tx,
            peers_rx: tokio::sync::Mutex::new(peers_rx),
        }
    }

    /// Set how opens to `region` behave from now on.
    pub fn set_behavior(&self, region: &str, behavior: OpenBehavior) {
        self.behaviors.lock().insert(region.to_string(), behavior);
    }

    /// Regions of every open attempt so far, in order.
    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().clone()
    }

    /// Wait for the next accepted connection.
    pub async fn accept(&self) -> Option<MockPeer> {
        self.peers_rx.lock().await.recv().await
    }
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, endpoint: &Endpoint, timeout: Duration) -> Result<TransportHandle> {
        self.attempts.lock().push(endpoint.region.clone());
        let behavior = self
            .behaviors
            .lock()
            .get(&endpoint.region)
            .copied()
            .unwrap_or_default();

        match behavior {
            OpenBehavior::Refuse => Err(SessionError::connect(
                endpoint.url.as_str(),
                "connection refused",
            )),
            OpenBehavior::Hang => {
                tokio::time::sleep(timeout).await;
                Err(SessionError::connect(
                    endpoint.url.as_str(),
                    format!("timed out after {}ms", timeout.as_millis()),
                ))
            }
            OpenBehavior::Accept => {
                let (client_tx, server_rx) = mpsc::unbounded_channel();
                let (server_tx, client_rx) = mpsc::unbounded_channel();
                let closed = CancellationToken::new();

                let peer = MockPeer {
                    endpoint: endpoint.clone(),
                    inbound: server_rx,
                    outbound: Some(server_tx),
                    closed: closed.clone(),
                    decoder: FrameDecoder::new(),
                };
                self.peers_tx
                    .send(peer)
                    .map_err(|_| SessionError::connect(endpoint.url.as_str(), "mock listener gone"))?;

                Ok(TransportHandle {
                    sink: Box::new(MockSink {
                        tx: client_tx,
                        closed,
                    }),
                    stream: Box::new(MockStream { rx: client_rx }),
                })
            }
        }
    }
}

struct MockSink {
    tx: mpsc::UnboundedSender<RawFrame>,
    closed: CancellationToken,
}

#[async_trait]
impl FrameSink for MockSink {
    async fn send(&mut self, frame: RawFrame) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(SessionError::Transport("sink already closed".to_string()));
        }
        self.tx
            .send(frame)
            .map_err(|_| SessionError::Transport("peer went away".to_string()))
    }

    async fn close(&mut self) {
        self.closed.cancel();
    }
}

struct MockStream {
    rx: mpsc::UnboundedReceiver<Result<RawFrame>>,
}

#[async_trait]
impl FrameStream for MockStream {
    async fn receive(&mut self) -> Option<Result<RawFrame>> {
        self.rx.recv().await
    }
}

/// Server side of one mock connection
#[derive(Debug)]
pub struct MockPeer {
    endpoint: Endpoint,
    inbound: mpsc::UnboundedReceiver<RawFrame>,
    outbound: Option<mpsc::UnboundedSender<Result<RawFrame>>>,
    closed: CancellationToken,
    decoder: FrameDecoder,
}

impl MockPeer {
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Push a raw frame to the client. Returns false once the client is gone.
    pub fn send(&self, frame: RawFrame) -> bool {
        match &self.outbound {
            Some(tx) => tx.send(Ok(frame)).is_ok(),
            None => false,
        }
    }

    pub fn send_text(&self, text: &str) -> bool {
        self.send(RawFrame::text(text))
    }

    /// Push an application event.
    pub fn emit(&self, tag: &str, payload: Value) -> bool {
        self.send(codec::encode_event(tag, &payload))
    }

    /// Inject a read error, then hang up.
    pub fn fail(&mut self, message: &str) {
        if let Some(tx) = self.outbound.take() {
            let _ = tx.send(Err(SessionError::Transport(message.to_string())));
        }
    }

    /// Hang up; the client's stream ends.
    pub fn close(&mut self) {
        self.outbound = None;
    }

    /// True once the client closed its sink.
    pub fn is_closed_by_client(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Wait until the client closes its sink.
    pub async fn closed_by_client(&self) {
        self.closed.cancelled().await;
    }

    /// Next raw frame written by the client.
    pub async fn recv(&mut self) -> Option<RawFrame> {
        self.inbound.recv().await
    }

    /// Next application event written by the client, skipping control frames
    /// and keep-alive probes.
    pub async fn recv_event(&mut self) -> Option<Frame> {
        loop {
            let raw = self.inbound.recv().await?;
            match self.decoder.decode(raw) {
                Ok(Some(Packet::Event(frame))) if frame.tag != codec::KEEP_ALIVE_TAG => {
                    return Some(frame);
                }
                _ => continue,
            }
        }
    }

    /// Play the venue side of the handshake and accept the credentials.
    ///
    /// Returns the auth payload the client sent.
    pub async fn handshake(&mut self) -> Option<Value> {
        let auth = self.open_namespace_and_read_auth().await?;
        self.send_text(r#"451-["successauth",{"_placeholder":true,"num":0}]"#);
        self.send(RawFrame::Binary(br#"{"id":"mock-session"}"#.to_vec()));
        Some(auth)
    }

    /// Play the venue side of the handshake and reject the credentials.
    pub async fn handshake_reject(&mut self) -> Option<Value> {
        let auth = self.open_namespace_and_read_auth().await?;
        self.emit(codec::AUTH_REJECTED_TAG, Value::Null);
        Some(auth)
    }

    async fn open_namespace_and_read_auth(&mut self) -> Option<Value> {
        let open = json!({
            "sid": "mock-sid",
            "upgrades": [],
            "pingInterval": 25000,
            "pingTimeout": 20000,
            "maxPayload": 1000000,
        });
        self.send_text(&format!("0{open}"));

        loop {
            let raw = self.inbound.recv().await?;
            if let Ok(Some(Packet::Control(Control::Connect(_)))) = self.decoder.decode(raw) {
                break;
            }
        }
        self.send_text(r#"40{"sid":"mock-namespace"}"#);

        loop {
            let frame = self.recv_event().await?;
            if frame.tag == codec::AUTH_TAG {
                return Some(frame.payload);
            }
        }
    }
}
