//! Reconnecting sync client for the agent chat backend.
//!
//! Provides:
//! - `SyncClient` - Facade over one persistent connection
//! - Reconnection with capped exponential backoff
//! - Topic subscriptions replayed on every (re)connect
//! - Routing of inbound events to subscribers and the execution tracker
//! - WebSocket transport (feature: websocket)
//! - In-process test transport (feature: test-util)

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod reconnect;
pub mod registry;
pub mod router;

#[cfg(feature = "websocket")]
pub mod websocket;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use client::{ClientEvent, SyncClient};
pub use config::{BackoffPolicy, ClientConfig, ConfigError};
pub use connection::{Connection, ConnectionState, Transport};
pub use error::{ClientError, TransportError};
pub use registry::{ChannelHandler, SubscriptionRegistry, TopicHandler};
pub use router::{MessageRouter, SharedTracker};

#[cfg(feature = "websocket")]
pub use websocket::WsTransport;
