/*
[INPUT]:  Session configuration, venue credentials, an optional connector
[OUTPUT]: Connect/disconnect, commands with correlated responses, push subscriptions
[POS]:    Facade layer - the public session handle
[UPDATE]: When changing the public API or how submitters wait for a connection
*/

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::Credentials;
use crate::codec::{self, Frame};
use crate::commands::Command;
use crate::config::SessionConfig;
use crate::deals;
use crate::dispatcher::{EventHandler, SubscriptionId};
use crate::error::{Result, SessionError};
use crate::session::correlator::CorrelationKey;
use crate::session::{Correlator, Link, SessionState, SessionStats, Shared, supervisor};
use crate::transport::{Connector, RawFrame, WsConnector};

struct Supervisor {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Persistent session against the venue.
///
/// One client owns one logical session. It survives transport loss by
/// reconnecting (when enabled); requests issued on a lost connection fail
/// with [`SessionError::ConnectionLost`] instead of hanging.
pub struct SessionClient {
    shared: Arc<Shared>,
    supervisor: Mutex<Option<Supervisor>>,
}

impl std::fmt::Debug for SessionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionClient")
            .field("state", &self.state())
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

impl SessionClient {
    /// Create a client that connects over WebSocket.
    pub fn new(config: SessionConfig, credentials: Credentials) -> Result<Self> {
        let connector = Arc::new(WsConnector::with_headers(config.headers.clone()));
        Self::with_connector(config, credentials, connector)
    }

    /// Create a client over a custom transport.
    pub fn with_connector(
        config: SessionConfig,
        credentials: Credentials,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared::new(config, credentials, connector)),
            supervisor: Mutex::new(None),
        })
    }

    /// Connect and authenticate, returning once the session is CONNECTED.
    ///
    /// Calling this while a connection is already being established waits for
    /// that attempt instead of starting another one.
    pub async fn connect(&self) -> Result<()> {
        let timeout = self.shared.config.connect_timeout;
        let mut supervisor = self.supervisor.lock().await;
        match self.state() {
            SessionState::Closed => return Err(SessionError::Closed),
            SessionState::Connected => return Ok(()),
            _ => {}
        }

        let in_progress = self.state() != SessionState::Disconnected;
        if in_progress && supervisor.as_ref().is_some_and(|running| !running.handle.is_finished()) {
            drop(supervisor);
            return self.wait_connected(timeout).await;
        }
        // a supervisor exits right after reporting DISCONNECTED
        if let Some(finished) = supervisor.take() {
            if let Err(err) = finished.handle.await {
                warn!(error = %err, "previous session supervisor failed");
            }
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let cancel = self.shared.shutdown.child_token();
        self.shared.set_state(SessionState::Connecting);
        let handle = tokio::spawn(supervisor::run(
            Arc::clone(&self.shared),
            cancel.clone(),
            ready_tx,
        ));
        *supervisor = Some(Supervisor {
            handle,
            cancel: cancel.clone(),
        });
        drop(supervisor);

        match tokio::time::timeout(timeout, ready_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(self.not_connected_error()),
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "connect timed out");
                self.stop_supervisor().await;
                self.shared.set_state(SessionState::Disconnected);
                let err = SessionError::ConnectTimeout { timeout };
                self.shared.record_error(&err);
                Err(err)
            }
        }
    }

    /// Close the session for good. Pending requests fail with `Closed`.
    ///
    /// Idempotent; once it returns no handler runs again.
    pub async fn disconnect(&self) {
        let first = self.shared.set_state(SessionState::Closed);
        let failed = self.shared.correlator.close();
        self.shared.deals.close();
        self.shared.shutdown.cancel();
        self.stop_supervisor().await;
        if let Some(link) = self.shared.link.write().take() {
            link.lost.cancel();
        }
        if first {
            info!(failed_requests = failed, "session closed");
        }
    }

    /// Send `command` and wait for its response, with the command's own
    /// timeout or the configured default.
    ///
    /// Fire-and-forget commands resolve to `Value::Null` once queued for the
    /// writer; a later write failure surfaces only as a connection loss.
    pub async fn send_command(&self, command: Command) -> Result<Value> {
        let timeout = command
            .timeout
            .unwrap_or(self.shared.config.command_timeout_default);
        self.send_command_with_timeout(command, timeout).await
    }

    pub async fn send_command_with_timeout(&self, command: Command, timeout: Duration) -> Result<Value> {
        let tag = command.tag.clone();
        let (key, payload) = Correlator::prepare(&command)?;
        let frame = codec::encode_event(&tag, &payload);

        let submission = async {
            match key {
                Some(key) => self.exchange(&tag, key, frame).await,
                None => self.write(frame).await.map(|_| Value::Null),
            }
        };

        let outcome = tokio::time::timeout(timeout, submission).await;
        match outcome {
            Ok(outcome) => outcome,
            Err(_) => {
                debug!(command = %tag, timeout_ms = timeout.as_millis() as u64, "command timed out");
                Err(SessionError::CommandTimeout { tag, timeout })
            }
        }
    }

    /// Emit an event that expects no answer.
    pub async fn send_event(&self, tag: &str, payload: Value) -> Result<()> {
        self.send_command(Command::new(tag, payload)).await.map(|_| ())
    }

    /// Register `handler` for push events tagged `tag`.
    pub fn subscribe(&self, tag: &str, handler: impl EventHandler) -> SubscriptionId {
        self.shared.dispatcher.subscribe(tag, handler)
    }

    /// Receive push events tagged `tag` through a channel.
    pub fn subscribe_channel(&self, tag: &str) -> (SubscriptionId, mpsc::UnboundedReceiver<Frame>) {
        self.shared.dispatcher.subscribe_channel(tag)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.dispatcher.unsubscribe(id)
    }

    /// Wait until deal `order_id` settles and return the settled deal.
    ///
    /// Results that already arrived are returned at once.
    pub async fn check_order_result(&self, order_id: &str, timeout: Duration) -> Result<Value> {
        if self.state() == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        let rx = match self.shared.deals.result_or_wait(order_id) {
            Ok(deal) => return Ok(deal),
            Err(rx) => rx,
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(deal)) => Ok(deal),
            Ok(Err(_)) => Err(SessionError::Closed),
            Err(_) => Err(SessionError::CommandTimeout {
                tag: deals::ORDER_CLOSED_TAG.to_string(),
                timeout,
            }),
        }
    }

    /// Deals the venue reported open and not yet settled.
    pub fn active_orders(&self) -> Vec<Value> {
        self.shared.deals.opened()
    }

    /// Latest `successupdateBalance` payload, if one arrived.
    pub fn balance(&self) -> Option<Value> {
        self.shared.deals.balance()
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Observe state transitions.
    pub fn state_changes(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    /// Connection generation: 0 before the first CONNECTED, +1 per reconnect.
    pub fn generation(&self) -> u64 {
        self.shared.current_generation()
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.stats()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    async fn exchange(&self, tag: &str, key: CorrelationKey, frame: RawFrame) -> Result<Value> {
        // one request per response event when the venue echoes no id
        let _permit = match key.id {
            None => Some(
                self.shared
                    .correlator
                    .class_slot(&key.response_tag)
                    .acquire_owned()
                    .await
                    .map_err(|_| SessionError::Closed)?,
            ),
            Some(_) => None,
        };

        let link = self.ready_link().await?;
        let (_guard, rx) = self.shared.correlator.register(link.generation, tag, key)?;
        enqueue(&link, frame).await?;

        rx.await.unwrap_or(Err(SessionError::ConnectionLost {
            generation: link.generation,
        }))
    }

    async fn write(&self, frame: RawFrame) -> Result<()> {
        let link = self.ready_link().await?;
        enqueue(&link, frame).await
    }

    /// The current generation's link, waiting for one if queueing is enabled.
    async fn ready_link(&self) -> Result<Link> {
        let mut states = self.shared.state.subscribe();
        loop {
            let state = *states.borrow_and_update();
            match state {
                SessionState::Closed => return Err(SessionError::Closed),
                SessionState::Connected => {
                    if let Some(link) = self.shared.current_link() {
                        return Ok(link);
                    }
                }
                _ if !self.shared.config.queue_while_disconnected => {
                    return Err(SessionError::NotConnected);
                }
                _ => {}
            }
            if states.changed().await.is_err() {
                return Err(SessionError::Closed);
            }
        }
    }

    async fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let mut states = self.shared.state.subscribe();
        let settled = tokio::time::timeout(
            timeout,
            states.wait_for(|state| {
                matches!(
                    state,
                    SessionState::Connected | SessionState::Disconnected | SessionState::Closed
                )
            }),
        )
        .await;

        let state = match settled {
            Err(_) => return Err(SessionError::ConnectTimeout { timeout }),
            Ok(Err(_)) => return Err(SessionError::Closed),
            Ok(Ok(state)) => *state,
        };
        match state {
            SessionState::Connected => Ok(()),
            _ => Err(self.not_connected_error()),
        }
    }

    fn not_connected_error(&self) -> SessionError {
        match self.state() {
            SessionState::Closed => SessionError::Closed,
            _ => self
                .shared
                .last_error()
                .map(SessionError::Transport)
                .unwrap_or(SessionError::NotConnected),
        }
    }

    async fn stop_supervisor(&self) {
        let running = self.supervisor.lock().await.take();
        if let Some(running) = running {
            running.cancel.cancel();
            if let Err(err) = running.handle.await {
                warn!(error = %err, "session supervisor failed");
            }
        }
    }
}

/// Queue `frame` on the link's writer; gives up once the generation is lost.
async fn enqueue(link: &Link, frame: RawFrame) -> Result<()> {
    let generation = link.generation;
    tokio::select! {
        biased;
        _ = link.lost.cancelled() => Err(SessionError::ConnectionLost { generation }),
        sent = link.outbound.send(frame) => {
            sent.map_err(|_| SessionError::ConnectionLost { generation })
        }
    }
}

impl Drop for SessionClient {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}
