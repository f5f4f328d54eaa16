//! In-process transport for tests.
//!
//! [`TestTransport`] hands each opened connection to a [`TestServer`], which
//! lets the test play the server: read what the client sent, push frames to
//! it and drop the connection.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::time::Instant;
use url::Url;

use agent_sync_core::Envelope;

use crate::connection::{Connection, Transport};
use crate::error::TransportError;

#[derive(Debug, Default)]
struct Shared {
    fail_next: u32,
    opens: Vec<Instant>,
}

/// Transport whose connections are served by a [`TestServer`].
#[derive(Debug, Clone)]
pub struct TestTransport {
    shared: Arc<Mutex<Shared>>,
    accepted: mpsc::UnboundedSender<ServerConnection>,
}

/// Server side of a [`TestTransport`].
#[derive(Debug)]
pub struct TestServer {
    shared: Arc<Mutex<Shared>>,
    accepted: mpsc::UnboundedReceiver<ServerConnection>,
}

/// Server end of one connection.
#[derive(Debug)]
pub struct ServerConnection {
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<Result<String, TransportError>>,
}

impl TestTransport {
    #[must_use]
    pub fn new() -> (Self, TestServer) {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let (tx, rx) = mpsc::unbounded();
        (
            Self {
                shared: Arc::clone(&shared),
                accepted: tx,
            },
            TestServer {
                shared,
                accepted: rx,
            },
        )
    }
}

#[async_trait]
impl Transport for TestTransport {
    async fn open(&self, _url: &Url) -> Result<Connection, TransportError> {
        {
            let mut shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
            shared.opens.push(Instant::now());
            if shared.fail_next > 0 {
                shared.fail_next -= 1;
                return Err(TransportError::Connect("connection refused".into()));
            }
        }

        let (client_tx, from_client) = mpsc::unbounded::<String>();
        let (to_client, client_rx) = mpsc::unbounded();
        self.accepted
            .unbounded_send(ServerConnection {
                from_client,
                to_client,
            })
            .map_err(|_| TransportError::Connect("test server dropped".into()))?;

        let sink = client_tx.sink_map_err(|_| TransportError::Closed);
        Ok(Connection::new(Box::pin(sink), Box::pin(client_rx)))
    }
}

impl TestServer {
    /// Wait for the client's next successful open.
    ///
    /// # Panics
    /// Panics if the transport was dropped.
    pub async fn accept(&mut self) -> ServerConnection {
        self.accepted.next().await.expect("transport dropped")
    }

    /// Make the next `n` opens fail.
    pub fn fail_next(&self, n: u32) {
        self.shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fail_next = n;
    }

    /// When each open was attempted, successful or not.
    #[must_use]
    pub fn opens(&self) -> Vec<Instant> {
        self.shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .opens
            .clone()
    }
}

impl ServerConnection {
    /// Push a raw text frame to the client.
    pub fn push(&self, frame: impl Into<String>) {
        let _ = self.to_client.unbounded_send(Ok(frame.into()));
    }

    /// Push `{"type": kind, "data": data}` to the client.
    pub fn push_event(&self, kind: &str, data: Value) {
        if let Ok(frame) = Envelope::new(kind, data).to_frame() {
            self.push(frame);
        }
    }

    /// Fail the client's read side with a transport error.
    pub fn push_error(&self) {
        let _ = self
            .to_client
            .unbounded_send(Err(TransportError::WebSocket("reset by peer".into())));
    }

    /// Next frame the client sent, or `None` once it dropped the connection.
    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.next().await
    }

    /// Next frame the client sent, decoded.
    ///
    /// # Panics
    /// Panics if the connection closed or the frame is not an envelope.
    pub async fn recv_envelope(&mut self) -> Envelope {
        let frame = self.recv().await.expect("client closed the connection");
        Envelope::parse(&frame).expect("client sent a malformed frame")
    }

    /// Drop the connection from the server side.
    pub fn close(self) {
        drop(self);
    }
}
