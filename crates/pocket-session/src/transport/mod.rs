/*
[INPUT]:  Endpoint to open, raw frames to write
[OUTPUT]: Independent full-duplex frame handles (sink + stream)
[POS]:    Transport layer - physical connection abstraction
[UPDATE]: When adding transport implementations or changing handle semantics
*/

pub mod mock;
pub mod ws;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::region::Endpoint;

pub use mock::{MockConnector, MockPeer};
pub use ws::WsConnector;

/// One raw message of the underlying stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFrame {
    Text(String),
    Binary(Vec<u8>),
}

impl RawFrame {
    pub fn text(value: impl Into<String>) -> Self {
        RawFrame::Text(value.into())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            RawFrame::Text(text) => Some(text),
            RawFrame::Binary(_) => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            RawFrame::Text(text) => text.len(),
            RawFrame::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Opens physical connections.
///
/// Every call yields a fresh, independent handle; handles are never reused after
/// they close or fail.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, endpoint: &Endpoint, timeout: Duration) -> Result<TransportHandle>;
}

/// Write half of an open connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: RawFrame) -> Result<()>;

    /// Best-effort close; never fails.
    async fn close(&mut self);
}

/// Read half of an open connection.
#[async_trait]
pub trait FrameStream: Send {
    /// `None` once the peer closed the connection.
    async fn receive(&mut self) -> Option<Result<RawFrame>>;
}

/// An open connection, split so reads and writes can run on different tasks.
pub struct TransportHandle {
    pub sink: Box<dyn FrameSink>,
    pub stream: Box<dyn FrameStream>,
}

impl std::fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHandle").finish_non_exhaustive()
    }
}
