/*
[INPUT]:  Crate modules and public type definitions
[OUTPUT]: Public session-client crate surface
[POS]:    Crate root - module wiring
[UPDATE]: When public modules or exports change
*/

pub mod auth;
pub mod client;
pub mod codec;
pub mod commands;
pub mod config;
pub mod deals;
pub mod dispatcher;
pub mod error;
pub mod region;
pub mod session;
pub mod transport;

// Re-export commonly used types from the facade
pub use client::SessionClient;

pub use auth::Credentials;
pub use codec::Frame;
pub use commands::{Command, Correlation, OrderDirection};
pub use config::{BackoffConfig, SessionConfig};
pub use deals::DealBook;
pub use dispatcher::{EventHandler, HandlerError, SubscriptionId};
pub use error::{Result, SessionError};
pub use region::{Endpoint, RegionSelector};
pub use session::{SessionState, SessionStats};
pub use transport::{Connector, MockConnector, MockPeer, RawFrame, WsConnector};
