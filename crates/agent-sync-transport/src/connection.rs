//! Transport abstraction.
//!
//! A [`Transport`] opens one duplex [`Connection`] carrying text frames.
//! Retry policy lives in the client; a transport only opens.

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, Stream};
use serde::Serialize;
use url::Url;

use crate::error::TransportError;

/// Outbound half of a connection.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;

/// Inbound half of a connection. Ends when the peer closes.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// One open physical connection.
pub struct Connection {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Connection {
    #[must_use]
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        Self { sink, stream }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Never connected, or manually disconnected.
    Idle,
    Connecting,
    Open,
    /// Lost; a reconnect may be pending.
    Closed,
}

impl ConnectionState {
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open)
    }
}

/// Opens connections to an endpoint.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open a connection to `url`.
    async fn open(&self, url: &Url) -> Result<Connection, TransportError>;
}
