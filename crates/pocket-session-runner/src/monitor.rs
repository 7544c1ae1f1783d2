/*
[INPUT]:  A session client, watched tags, symbols, stats interval, shutdown token
[OUTPUT]: Logged push events, per-connect symbol requests, periodic stats lines
[POS]:    Runner layer - keeps a session observed until shutdown
[UPDATE]: When changing what the runner logs or requests after connect
*/

use std::sync::Arc;
use std::time::Duration;

use pocket_session::commands;
use pocket_session::{Frame, HandlerError, SessionClient, SessionState, SubscriptionId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SymbolConfig;

const PAYLOAD_LOG_MAX_BYTES: usize = 512;

/// Log every push event tagged with one of `tags`.
pub fn watch_tags(client: &SessionClient, tags: &[String]) -> Vec<SubscriptionId> {
    tags.iter()
        .map(|tag| {
            client.subscribe(tag, |frame: &Frame| -> Result<(), HandlerError> {
                info!(tag = %frame.tag, payload = %truncate(&frame.payload.to_string()), "push event");
                Ok(())
            })
        })
        .collect()
}

/// Re-request symbols after each CONNECTED and log stats until `shutdown`.
pub async fn run(
    client: Arc<SessionClient>,
    symbols: Vec<SymbolConfig>,
    stats_interval: Duration,
    shutdown: CancellationToken,
) {
    let mut states = client.state_changes();
    let mut stats_timer = tokio::time::interval_at(tokio::time::Instant::now() + stats_interval, stats_interval);
    let mut last_generation = 0;

    let initial = *states.borrow_and_update();
    if initial == SessionState::Connected {
        last_generation = client.generation();
        request_symbols(&client, &symbols).await;
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,

            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = *states.borrow_and_update();
                let generation = client.generation();
                if state == SessionState::Connected && generation != last_generation {
                    last_generation = generation;
                    request_symbols(&client, &symbols).await;
                }
                if state == SessionState::Closed {
                    break;
                }
            }

            _ = stats_timer.tick() => log_stats(&client),
        }
    }
    debug!("monitor stopped");
}

async fn request_symbols(client: &SessionClient, symbols: &[SymbolConfig]) {
    for symbol in symbols {
        let command = commands::change_symbol(&symbol.asset, Duration::from_secs(symbol.period_secs));
        match client.send_command(command).await {
            Ok(_) => info!(asset = %symbol.asset, period_secs = symbol.period_secs, "symbol requested"),
            Err(err) => warn!(asset = %symbol.asset, error = %err, "symbol request failed"),
        }
    }
}

fn log_stats(client: &SessionClient) {
    let stats = client.stats();
    info!(
        state = %stats.state,
        region = stats.endpoint.as_ref().map(|endpoint| endpoint.region.as_str()).unwrap_or("-"),
        generation = stats.generation,
        uptime_secs = stats.uptime.map(|uptime| uptime.as_secs()).unwrap_or(0),
        reconnects = stats.total_reconnects,
        pending = stats.pending_requests,
        frames_in = stats.frames_received,
        frames_out = stats.frames_sent,
        frames_dropped = stats.frames_dropped,
        decode_errors = stats.decode_errors,
        handler_failures = stats.handler_failures,
        "session stats"
    );
}

fn truncate(text: &str) -> &str {
    if text.len() <= PAYLOAD_LOG_MAX_BYTES {
        return text;
    }
    let mut end = PAYLOAD_LOG_MAX_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use pocket_session::{Credentials, Endpoint, MockConnector, SessionConfig};

    fn mock_client(connector: &Arc<MockConnector>) -> Arc<SessionClient> {
        let endpoint = Endpoint::new("wss://mock.invalid/socket.io/", "MOCK", 0).unwrap();
        let config = SessionConfig::with_endpoints(vec![endpoint]);
        Arc::new(
            SessionClient::with_connector(config, Credentials::new("t", true, 1), connector.clone())
                .unwrap(),
        )
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let long = "é".repeat(PAYLOAD_LOG_MAX_BYTES);
        let cut = truncate(&long);
        assert!(cut.len() <= PAYLOAD_LOG_MAX_BYTES);
        assert!(long.starts_with(cut));
        assert_eq!(truncate("short"), "short");
    }

    #[tokio::test]
    async fn symbols_are_requested_after_connect() {
        let connector = Arc::new(MockConnector::new());
        let client = mock_client(&connector);
        let shutdown = CancellationToken::new();
        let symbols = vec![SymbolConfig {
            asset: "EURUSD_otc".to_string(),
            period_secs: 60,
        }];
        let monitor = tokio::spawn(run(
            Arc::clone(&client),
            symbols,
            Duration::from_secs(3600),
            shutdown.clone(),
        ));

        let serve = async {
            let mut peer = connector.accept().await.unwrap();
            peer.handshake().await.unwrap();
            peer
        };
        let (connected, mut peer) = tokio::join!(client.connect(), serve);
        connected.unwrap();

        let request = peer.recv_event().await.unwrap();
        assert_eq!(request.tag, "changeSymbol");
        assert_eq!(request.payload["asset"], "EURUSD_otc");
        assert_eq!(request.payload["period"], 60);

        shutdown.cancel();
        monitor.await.unwrap();
        client.disconnect().await;
    }

    #[tokio::test]
    async fn watched_tags_subscribe_once_each() {
        let connector = Arc::new(MockConnector::new());
        let client = mock_client(&connector);
        let ids = watch_tags(&client, &["successupdateBalance".to_string(), "updateStream".to_string()]);
        assert_eq!(ids.len(), 2);
        assert_eq!(client.stats().subscriptions, 2);
    }
}
