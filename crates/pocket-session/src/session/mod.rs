/*
[INPUT]:  Session configuration, credentials, connector
[OUTPUT]: Shared session state driven by the supervisor and read by the facade
[POS]:    Session layer - lifecycle state machine and its bookkeeping
[UPDATE]: When adding states, stats, or changing who may mutate what
*/

pub mod backoff;
pub mod correlator;
pub mod keep_alive;
pub(crate) mod supervisor;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::auth::Credentials;
use crate::config::SessionConfig;
use crate::deals::DealBook;
use crate::dispatcher::EventDispatcher;
use crate::error::SessionError;
use crate::region::Endpoint;
use crate::transport::{Connector, RawFrame};

pub use backoff::Backoff;
pub use correlator::{CorrelationKey, Correlator, Resolution};
pub use keep_alive::{KeepAlive, KeepAliveAction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Recovering,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Authenticating => "authenticating",
            SessionState::Connected => "connected",
            SessionState::Recovering => "recovering",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of the session
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub state: SessionState,
    pub endpoint: Option<Endpoint>,
    pub generation: u64,
    pub connected_since: Option<DateTime<Utc>>,
    /// Time since the last CONNECTED transition, while connected
    pub uptime: Option<Duration>,
    /// Reconnect attempts since the last stable connection
    pub consecutive_reconnects: u32,
    /// Successful reconnects over the session's life
    pub total_reconnects: u64,
    pub pending_requests: usize,
    pub subscriptions: usize,
    pub frames_received: u64,
    pub frames_sent: u64,
    /// Control frames the read loop could not queue (pongs, probes)
    pub frames_dropped: u64,
    pub decode_errors: u64,
    pub handler_failures: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub frames_received: AtomicU64,
    pub frames_sent: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub decode_errors: AtomicU64,
}

impl Counters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Default)]
struct Bookkeeping {
    endpoint: Option<Endpoint>,
    connected_since: Option<DateTime<Utc>>,
    connected_at: Option<Instant>,
    consecutive_reconnects: u32,
    last_error: Option<String>,
}

/// Sender side of the current generation's writer task
#[derive(Debug, Clone)]
pub(crate) struct Link {
    pub generation: u64,
    pub outbound: mpsc::Sender<RawFrame>,
    /// Cancelled when the writer fails or the generation is torn down
    pub lost: CancellationToken,
}

pub(crate) struct Shared {
    pub config: SessionConfig,
    pub credentials: Credentials,
    pub connector: Arc<dyn Connector>,
    pub state: watch::Sender<SessionState>,
    pub generation: AtomicU64,
    pub link: RwLock<Option<Link>>,
    pub correlator: Arc<Correlator>,
    pub dispatcher: EventDispatcher,
    pub deals: DealBook,
    pub counters: Counters,
    pub shutdown: CancellationToken,
    bookkeeping: Mutex<Bookkeeping>,
}

impl Shared {
    pub fn new(config: SessionConfig, credentials: Credentials, connector: Arc<dyn Connector>) -> Self {
        let (state, _rx) = watch::channel(SessionState::Disconnected);
        Self {
            config,
            credentials,
            connector,
            state,
            generation: AtomicU64::new(0),
            link: RwLock::new(None),
            correlator: Arc::new(Correlator::new()),
            dispatcher: EventDispatcher::new(),
            deals: DealBook::new(),
            counters: Counters::default(),
            shutdown: CancellationToken::new(),
            bookkeeping: Mutex::new(Bookkeeping::default()),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Move to `next`. CLOSED is terminal and never left.
    pub fn set_state(&self, next: SessionState) -> bool {
        let mut previous = next;
        let changed = self.state.send_if_modified(|current| {
            if *current == next || *current == SessionState::Closed {
                return false;
            }
            previous = *current;
            *current = next;
            true
        });
        if changed {
            info!(from = %previous, to = %next, "session state changed");
        }
        changed
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn current_link(&self) -> Option<Link> {
        self.link.read().clone()
    }

    /// Queue a frame from the read loop without waiting.
    ///
    /// A full queue drops the frame and counts it in `frames_dropped`.
    pub fn send_now(&self, generation: u64, frame: RawFrame) -> bool {
        let queued = match self.link.read().as_ref() {
            Some(link) if link.generation == generation => link.outbound.try_send(frame).is_ok(),
            _ => return false,
        };
        if !queued {
            Counters::bump(&self.counters.frames_dropped);
        }
        queued
    }

    pub fn set_endpoint(&self, endpoint: &Endpoint) {
        self.bookkeeping.lock().endpoint = Some(endpoint.clone());
    }

    pub fn mark_connected(&self) {
        let mut bookkeeping = self.bookkeeping.lock();
        bookkeeping.connected_since = Some(Utc::now());
        bookkeeping.connected_at = Some(Instant::now());
    }

    pub fn note_reconnect_attempt(&self) -> u32 {
        let mut bookkeeping = self.bookkeeping.lock();
        bookkeeping.consecutive_reconnects = bookkeeping.consecutive_reconnects.saturating_add(1);
        bookkeeping.consecutive_reconnects
    }

    pub fn reset_reconnects(&self) {
        self.bookkeeping.lock().consecutive_reconnects = 0;
    }

    pub fn record_error(&self, err: &SessionError) {
        self.bookkeeping.lock().last_error = Some(err.to_string());
    }

    pub fn last_error(&self) -> Option<String> {
        self.bookkeeping.lock().last_error.clone()
    }

    pub fn stats(&self) -> SessionStats {
        let state = self.state();
        let generation = self.current_generation();
        let bookkeeping = self.bookkeeping.lock();
        let connected = state == SessionState::Connected;
        SessionStats {
            state,
            endpoint: bookkeeping.endpoint.clone(),
            generation,
            connected_since: bookkeeping.connected_since,
            uptime: bookkeeping
                .connected_at
                .filter(|_| connected)
                .map(|at| at.elapsed()),
            consecutive_reconnects: bookkeeping.consecutive_reconnects,
            total_reconnects: generation.saturating_sub(1),
            pending_requests: self.correlator.pending_count(),
            subscriptions: self.dispatcher.len(),
            frames_received: self.counters.frames_received.load(Ordering::Relaxed),
            frames_sent: self.counters.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.counters.frames_dropped.load(Ordering::Relaxed),
            decode_errors: self.counters.decode_errors.load(Ordering::Relaxed),
            handler_failures: self.dispatcher.failures(),
            last_error: bookkeeping.last_error.clone(),
        }
    }
}
