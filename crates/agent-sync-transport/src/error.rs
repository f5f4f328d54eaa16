//! Error types for the transport layer.

use agent_sync_core::ProtocolError;
use thiserror::Error;

/// Connection-level failure.
///
/// Handled inside the client by the reconnection controller; never returned
/// from [`crate::SyncClient::send`].
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("WebSocket error: {0}")]
    WebSocket(String),
    #[error("Connection timeout after {0:?}")]
    Timeout(std::time::Duration),
    #[error("Connection closed")]
    Closed,
}

/// Error returned to callers of the client facade.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Not connected")]
    NotConnected,
    #[error("Reconnection gave up after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("Client has shut down")]
    Closed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub type Result<T> = std::result::Result<T, ClientError>;
