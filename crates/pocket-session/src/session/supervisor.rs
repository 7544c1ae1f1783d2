/*
[INPUT]:  Shared session state, a cancellation token for this run
[OUTPUT]: Connect cycles, the per-generation read/write loops, recovery
[POS]:    Session layer - the single task that owns the connection
[UPDATE]: When changing the handshake, liveness handling, or reconnect policy
*/

use std::sync::Arc;

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Backoff, Counters, KeepAlive, KeepAliveAction, Link, Resolution, SessionState, Shared};
use crate::codec::{self, Control, Frame, FrameDecoder, Packet};
use crate::error::{Result, SessionError};
use crate::region::{Endpoint, RegionSelector};
use crate::transport::{FrameSink, FrameStream, RawFrame, TransportHandle};

/// Upper bound on the close handshake of a generation's sink.
const SINK_CLOSE_GRACE: Duration = Duration::from_secs(1);
/// Upper bound on joining a generation's writer after it was told to stop.
const WRITER_JOIN_GRACE: Duration = Duration::from_secs(2);

/// A transport that completed the handshake
struct Established {
    endpoint: Endpoint,
    sink: Box<dyn FrameSink>,
    stream: Box<dyn FrameStream>,
    decoder: FrameDecoder,
    /// Application events that arrived before the auth answer
    early: Vec<Frame>,
}

/// Leaves no CONNECTED state behind if the supervisor unwinds.
struct UnwindGuard<'a>(&'a Shared);

impl Drop for UnwindGuard<'_> {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            return;
        }
        if let Some(link) = self.0.link.write().take() {
            link.lost.cancel();
            self.0.correlator.fail_generation(link.generation);
        }
        self.0.set_state(SessionState::Disconnected);
    }
}

enum LoopExit {
    Shutdown,
    Lost(SessionError),
}

/// Own the connection until `cancel` fires or reconnecting is off.
///
/// `ready` receives the outcome of the first connect cycle.
pub(crate) async fn run(
    shared: Arc<Shared>,
    cancel: CancellationToken,
    ready: oneshot::Sender<Result<()>>,
) {
    let _unwind = UnwindGuard(&shared);
    let mut ready = Some(ready);
    let mut selector = RegionSelector::new(shared.config.endpoints.clone());
    let mut backoff = Backoff::new(shared.config.backoff.clone());

    loop {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = connect_cycle(&shared, &mut selector, &mut backoff) => outcome,
        };

        let established = match outcome {
            Ok(established) => established,
            Err(err) => {
                warn!(error = %err, "giving up on connecting");
                shared.record_error(&err);
                shared.set_state(SessionState::Disconnected);
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Err(err));
                }
                return;
            }
        };

        let Established {
            endpoint,
            sink,
            stream,
            decoder,
            early,
        } = established;

        let generation = shared.generation.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        shared.correlator.begin_generation(generation);
        let lost = CancellationToken::new();
        let (outbound, outbound_rx) = mpsc::channel(shared.config.outbound_capacity);
        let writer = tokio::spawn(write_loop(
            Arc::clone(&shared),
            generation,
            sink,
            outbound_rx,
            lost.clone(),
        ));
        *shared.link.write() = Some(Link {
            generation,
            outbound,
            lost: lost.clone(),
        });
        shared.mark_connected();
        selector.reset();
        shared.set_state(SessionState::Connected);
        info!(generation, region = %endpoint.region, url = %endpoint.url, "session connected");
        if let Some(ready) = ready.take() {
            let _ = ready.send(Ok(()));
        }

        let exit = read_loop(
            &shared,
            &cancel,
            generation,
            stream,
            decoder,
            early,
            &lost,
            &mut backoff,
        )
        .await;

        shared.link.write().take();
        lost.cancel();

        let reason = match exit {
            LoopExit::Shutdown => {
                shared.correlator.fail_generation(generation);
                join_writer(generation, writer).await;
                break;
            }
            LoopExit::Lost(reason) => reason,
        };

        shared.set_state(SessionState::Recovering);
        let failed = shared.correlator.fail_generation(generation);
        warn!(generation, failed_requests = failed, reason = %reason, "connection lost");
        shared.record_error(&reason);
        join_writer(generation, writer).await;

        if !shared.config.auto_reconnect {
            shared.set_state(SessionState::Disconnected);
            return;
        }

        let attempt = shared.note_reconnect_attempt();
        let delay = backoff.next_delay();
        info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting after back-off");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    debug!("session supervisor stopped");
}

/// Wait for the writer to close its sink; abandon it if the sink is wedged.
async fn join_writer(generation: u64, mut writer: JoinHandle<()>) {
    match tokio::time::timeout(WRITER_JOIN_GRACE, &mut writer).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(generation, error = %err, "writer task failed"),
        Err(_) => {
            warn!(generation, "writer did not stop; aborting it");
            writer.abort();
        }
    }
}

/// Walk the endpoints until one completes the handshake.
async fn connect_cycle(
    shared: &Shared,
    selector: &mut RegionSelector,
    backoff: &mut Backoff,
) -> Result<Established> {
    let mut last_error: Option<SessionError> = None;
    loop {
        let Some(endpoint) = selector.next_endpoint() else {
            let err = SessionError::ExhaustedEndpoints {
                attempts: selector.len(),
                last_error: last_error
                    .take()
                    .map(|err| err.to_string())
                    .unwrap_or_else(|| "none".to_string()),
            };
            if !shared.config.auto_reconnect {
                return Err(err);
            }
            let delay = backoff.next_delay();
            warn!(error = %err, delay_ms = delay.as_millis() as u64, "endpoint cycle exhausted");
            shared.record_error(&err);
            tokio::time::sleep(delay).await;
            continue;
        };

        shared.set_state(SessionState::Connecting);
        shared.set_endpoint(&endpoint);
        debug!(region = %endpoint.region, url = %endpoint.url, "opening transport");

        match open_and_authenticate(shared, &endpoint).await {
            Ok(established) => return Ok(established),
            Err(err) => {
                warn!(region = %endpoint.region, error = %err, "connection attempt failed");
                last_error = Some(err);
            }
        }
    }
}

async fn open_and_authenticate(shared: &Shared, endpoint: &Endpoint) -> Result<Established> {
    let TransportHandle {
        mut sink,
        mut stream,
    } = shared
        .connector
        .open(endpoint, shared.config.connect_attempt_timeout)
        .await?;

    shared.set_state(SessionState::Authenticating);
    let mut decoder = FrameDecoder::new();
    let timeout = shared.config.auth_timeout;
    let handshake = tokio::time::timeout(
        timeout,
        authenticate(shared, sink.as_mut(), stream.as_mut(), &mut decoder),
    )
    .await;

    match handshake {
        Ok(Ok(early)) => Ok(Established {
            endpoint: endpoint.clone(),
            sink,
            stream,
            decoder,
            early,
        }),
        Ok(Err(err)) => {
            sink.close().await;
            Err(err)
        }
        Err(_) => {
            sink.close().await;
            Err(SessionError::auth(format!(
                "no answer within {}ms",
                timeout.as_millis()
            )))
        }
    }
}

/// engine.io open, namespace connect, then the auth event.
async fn authenticate(
    shared: &Shared,
    sink: &mut dyn FrameSink,
    stream: &mut dyn FrameStream,
    decoder: &mut FrameDecoder,
) -> Result<Vec<Frame>> {
    let mut early = Vec::new();
    let mut auth_sent = false;

    loop {
        let raw = match stream.receive().await {
            Some(Ok(raw)) => raw,
            Some(Err(err)) => {
                return Err(SessionError::auth(format!("transport failed during handshake: {err}")));
            }
            None => return Err(SessionError::auth("connection closed during handshake")),
        };
        Counters::bump(&shared.counters.frames_received);

        let packet = match decoder.decode(raw) {
            Ok(Some(packet)) => packet,
            Ok(None) => continue,
            Err(err) => {
                return Err(SessionError::auth(format!("unreadable handshake frame: {err}")));
            }
        };

        match packet {
            Packet::Control(Control::Open(info)) => {
                debug!(sid = %info.sid, ping_interval = info.ping_interval, "engine open");
                send_direct(shared, sink, codec::namespace_connect()).await?;
            }
            Packet::Control(Control::Ping) => {
                send_direct(shared, sink, codec::engine_pong()).await?;
            }
            Packet::Control(Control::Connect(_)) if !auth_sent => {
                send_direct(shared, sink, shared.credentials.auth_frame()).await?;
                auth_sent = true;
            }
            Packet::Control(Control::ConnectError(reason)) => {
                return Err(SessionError::auth(format!("namespace refused: {reason}")));
            }
            Packet::Control(Control::Close | Control::Disconnect) => {
                return Err(SessionError::auth("closed by venue during handshake"));
            }
            Packet::Control(_) => {}
            Packet::Event(frame) if frame.tag == codec::AUTH_ACCEPTED_TAG => {
                debug!(buffered = early.len(), "credentials accepted");
                return Ok(early);
            }
            Packet::Event(frame) if frame.tag == codec::AUTH_REJECTED_TAG => {
                return Err(SessionError::auth("credentials rejected"));
            }
            Packet::Event(frame) => early.push(frame),
        }
    }
}

async fn send_direct(shared: &Shared, sink: &mut dyn FrameSink, frame: RawFrame) -> Result<()> {
    sink.send(frame).await?;
    Counters::bump(&shared.counters.frames_sent);
    Ok(())
}

/// Read one generation's frames until it dies or the run is cancelled.
async fn read_loop(
    shared: &Shared,
    cancel: &CancellationToken,
    generation: u64,
    mut stream: Box<dyn FrameStream>,
    mut decoder: FrameDecoder,
    early: Vec<Frame>,
    lost: &CancellationToken,
    backoff: &mut Backoff,
) -> LoopExit {
    for frame in early {
        route(shared, generation, frame);
    }

    let interval = shared.config.heartbeat_interval;
    let mut keep_alive = KeepAlive::new(
        generation,
        interval,
        shared.config.heartbeat_miss_threshold,
        Instant::now(),
    );
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let deadline = tokio::time::sleep_until(keep_alive.expires_at());
    tokio::pin!(deadline);
    let stable = tokio::time::sleep(interval);
    tokio::pin!(stable);
    let mut is_stable = false;
    let mut decode_errors = 0u32;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => return LoopExit::Shutdown,

            _ = lost.cancelled() => {
                return LoopExit::Lost(SessionError::Transport("write failed".to_string()));
            }

            () = &mut stable, if !is_stable => {
                is_stable = true;
                backoff.reset();
                shared.reset_reconnects();
                debug!(generation, "connection stable; back-off reset");
            }

            () = &mut deadline, if shared.config.keep_alive => {
                match keep_alive.on_deadline(Instant::now()) {
                    KeepAliveAction::Expired { silent_for } => {
                        return LoopExit::Lost(SessionError::Transport(format!(
                            "no traffic for {}ms",
                            silent_for.as_millis()
                        )));
                    }
                    _ => deadline.as_mut().reset(keep_alive.expires_at()),
                }
            }

            _ = ticker.tick(), if shared.config.keep_alive => {
                let now = Instant::now();
                match keep_alive.on_tick(generation, now) {
                    KeepAliveAction::SendProbe => {
                        if shared.send_now(generation, codec::keep_alive_probe()) {
                            keep_alive.record_probe(now);
                        } else {
                            debug!(generation, "outbound queue full; probe skipped");
                        }
                    }
                    KeepAliveAction::Expired { silent_for } => {
                        return LoopExit::Lost(SessionError::Transport(format!(
                            "no traffic for {}ms",
                            silent_for.as_millis()
                        )));
                    }
                    KeepAliveAction::Ignore => {}
                }
            }

            incoming = stream.receive() => {
                let raw = match incoming {
                    Some(Ok(raw)) => raw,
                    Some(Err(err)) => return LoopExit::Lost(err),
                    None => {
                        return LoopExit::Lost(SessionError::Transport("closed by peer".to_string()));
                    }
                };
                keep_alive.record_frame(Instant::now());
                deadline.as_mut().reset(keep_alive.expires_at());
                Counters::bump(&shared.counters.frames_received);

                match decoder.decode(raw) {
                    Ok(None) => {}
                    Ok(Some(Packet::Event(frame))) => route(shared, generation, frame),
                    Ok(Some(Packet::Control(control))) => match control {
                        Control::Ping => {
                            if !shared.send_now(generation, codec::engine_pong()) {
                                warn!(generation, "outbound queue full; pong dropped");
                            }
                        }
                        Control::Close | Control::Disconnect => {
                            return LoopExit::Lost(SessionError::Transport(
                                "venue closed the session".to_string(),
                            ));
                        }
                        Control::ConnectError(reason) => {
                            return LoopExit::Lost(SessionError::Transport(format!(
                                "namespace dropped: {reason}"
                            )));
                        }
                        _ => {}
                    },
                    Err(err) => {
                        decode_errors += 1;
                        Counters::bump(&shared.counters.decode_errors);
                        warn!(generation, decode_errors, error = %err, "dropping malformed frame");
                        if decode_errors > shared.config.decode_error_tolerance {
                            return LoopExit::Lost(SessionError::Decode(format!(
                                "{decode_errors} malformed frames on one connection"
                            )));
                        }
                    }
                }
            }
        }
    }
}

/// Responses complete their request; everything else is a push event.
fn route(shared: &Shared, generation: u64, frame: Frame) {
    shared.deals.observe(&frame);
    match shared.correlator.resolve(generation, &frame) {
        Resolution::Unmatched => {
            shared.dispatcher.dispatch(&frame);
        }
        Resolution::Completed | Resolution::Late | Resolution::Stale => {}
    }
}

/// Sole owner of the sink for one generation.
async fn write_loop(
    shared: Arc<Shared>,
    generation: u64,
    mut sink: Box<dyn FrameSink>,
    mut rx: mpsc::Receiver<RawFrame>,
    lost: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = lost.cancelled() => break,

            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                let sent = tokio::select! {
                    biased;
                    _ = lost.cancelled() => break,
                    sent = sink.send(frame) => sent,
                };
                if let Err(err) = sent {
                    warn!(generation, error = %err, "write failed");
                    lost.cancel();
                    break;
                }
                Counters::bump(&shared.counters.frames_sent);
            }
        }
    }
    if tokio::time::timeout(SINK_CLOSE_GRACE, sink.close()).await.is_err() {
        debug!(generation, "sink close timed out");
    }
    debug!(generation, "writer stopped");
}
