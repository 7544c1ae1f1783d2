/*
[INPUT]:  Test scenarios needing a session against a simulated venue
[OUTPUT]: Shared fixtures: endpoints, fast configs, connected client/peer pairs
[POS]:    Test infrastructure - shared across all test modules
[UPDATE]: When adding new test patterns or fixtures
*/

//! Common test utilities for pocket-session tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use pocket_session::{
    BackoffConfig, Credentials, Endpoint, MockConnector, MockPeer, SessionClient, SessionConfig,
};

/// Mock endpoints named after `regions`, in priority order
pub fn endpoints(regions: &[&str]) -> Vec<Endpoint> {
    regions
        .iter()
        .enumerate()
        .map(|(priority, region)| {
            let url = format!(
                "wss://{}.mock.invalid/socket.io/?EIO=4&transport=websocket",
                region.to_lowercase()
            );
            Endpoint::new(&url, *region, priority as u32).expect("valid mock endpoint")
        })
        .collect()
}

/// Config with short back-off and handshake bounds for `regions`
pub fn fast_config(regions: &[&str]) -> SessionConfig {
    let mut config = SessionConfig::with_endpoints(endpoints(regions));
    config.backoff = BackoffConfig {
        min: Duration::from_millis(10),
        max: Duration::from_millis(50),
        jitter: 0.0,
    };
    config.connect_attempt_timeout = Duration::from_millis(500);
    config.auth_timeout = Duration::from_secs(1);
    config.connect_timeout = Duration::from_secs(5);
    config
}

pub fn credentials() -> Credentials {
    Credentials::new("test-session", true, 42)
}

pub fn client(connector: &Arc<MockConnector>, config: SessionConfig) -> SessionClient {
    SessionClient::with_connector(config, credentials(), connector.clone()).expect("valid config")
}

/// Connect `client` while playing the venue side; returns the accepted peer.
pub async fn connect_pair(client: &SessionClient, connector: &MockConnector) -> MockPeer {
    let serve = async {
        let mut peer = connector.accept().await.expect("incoming connection");
        peer.handshake().await.expect("handshake");
        peer
    };
    let (connected, peer) = tokio::join!(client.connect(), serve);
    connected.expect("connect");
    peer
}

/// Accept the next connection and complete its handshake.
pub async fn serve_next(connector: &MockConnector) -> MockPeer {
    let mut peer = connector.accept().await.expect("incoming connection");
    peer.handshake().await.expect("handshake");
    peer
}
