//! Client facade and its event loop.
//!
//! [`SyncClient`] is a cheap handle. All connection state lives in one
//! spawned task that serializes commands from the handles, connection
//! results, inbound frames and the reconnect timer. Handlers for frame N
//! finish before frame N+1 is read.

use std::future::pending;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use agent_sync_core::{Envelope, EventSink, Execution, UserMessage, execution_topic};
use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{BackoffPolicy, ClientConfig, ConfigError};
use crate::connection::{Connection, ConnectionState, FrameSink, FrameStream, Transport};
use crate::error::{ClientError, Result, TransportError};
use crate::reconnect::{CloseOutcome, ReconnectController};
use crate::registry::{ChannelHandler, SubscriptionRegistry, TopicHandler};
use crate::router::{MessageRouter, SharedTracker};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Connection notifications for the host application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected,
    /// The connection dropped without a [`SyncClient::disconnect`].
    ConnectionLost,
    /// Closed by [`SyncClient::disconnect`].
    Disconnected,
    ReconnectScheduled { attempt: u32, delay: Duration },
    ReconnectExhausted { attempts: u32 },
}

enum Command {
    Connect,
    Disconnect {
        done: oneshot::Sender<()>,
    },
    Subscribe {
        topic: String,
        handler: Arc<dyn TopicHandler>,
    },
    Unsubscribe {
        topic: String,
    },
    Send {
        frame: String,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Send only if open; never reconnects or reports.
    Announce {
        frame: String,
    },
    CancelExecution {
        execution_id: String,
        frame: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Handle to a sync client.
///
/// Clones share one connection. The event loop stops when the last handle
/// is dropped.
#[derive(Clone)]
pub struct SyncClient {
    commands: mpsc::UnboundedSender<Command>,
    tracker: SharedTracker,
    events: broadcast::Sender<ClientEvent>,
    state: watch::Receiver<ConnectionState>,
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

impl SyncClient {
    /// Create a client over `transport` and spawn its event loop.
    ///
    /// Must be called from within a tokio runtime. Does not connect.
    ///
    /// # Errors
    /// Returns error if the configured endpoint is invalid.
    pub fn new<T, S>(config: &ClientConfig, transport: T, sink: S) -> std::result::Result<Self, ConfigError>
    where
        T: Transport,
        S: EventSink + 'static,
    {
        let url = config.websocket_url()?;
        Ok(Self::spawn(
            url,
            config.reconnect.clone(),
            &config.routing.code_execution_tool,
            Arc::new(transport),
            Box::new(sink),
        ))
    }

    /// Create a WebSocket client from configuration.
    ///
    /// # Errors
    /// Returns error if the configured endpoint is invalid.
    #[cfg(feature = "websocket")]
    pub fn websocket<S>(config: &ClientConfig, sink: S) -> std::result::Result<Self, ConfigError>
    where
        S: EventSink + 'static,
    {
        let transport = crate::websocket::WsTransport::new(config.connection.connect_timeout());
        Self::new(config, transport, sink)
    }

    fn spawn(
        url: Url,
        policy: BackoffPolicy,
        code_tool: &str,
        transport: Arc<dyn Transport>,
        sink: Box<dyn EventSink>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);
        let tracker = SharedTracker::default();

        let event_loop = EventLoop {
            url,
            transport,
            commands: commands_rx,
            registry: SubscriptionRegistry::new(),
            router: MessageRouter::new(Arc::clone(&tracker), sink, code_tool),
            reconnect: ReconnectController::new(policy),
            connecting: None,
            sink: None,
            stream: None,
            active: false,
            state: state_tx,
            events: events.clone(),
        };
        tokio::spawn(event_loop.run());

        Self {
            commands: commands_tx,
            tracker,
            events,
            state: state_rx,
        }
    }

    fn command(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| ClientError::Closed)
    }

    /// Start connecting. No-op while connecting or open.
    ///
    /// Resets the reconnect backoff.
    ///
    /// # Errors
    /// Returns error if the event loop has stopped.
    pub fn connect(&self) -> Result<()> {
        self.command(Command::Connect)
    }

    /// Close the connection and cancel any pending reconnect.
    ///
    /// Subscriptions are kept and replayed on the next `connect`.
    ///
    /// # Errors
    /// Returns error if the event loop has stopped.
    pub async fn disconnect(&self) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.command(Command::Disconnect { done })?;
        rx.await.map_err(|_| ClientError::Closed)
    }

    /// Register `handler` for `topic`, replacing any previous handler.
    ///
    /// # Errors
    /// Returns error if the event loop has stopped.
    pub fn subscribe<H>(&self, topic: impl Into<String>, handler: H) -> Result<()>
    where
        H: TopicHandler + 'static,
    {
        self.command(Command::Subscribe {
            topic: topic.into(),
            handler: Arc::new(handler),
        })
    }

    /// Subscribe to `topic` and receive matching payloads on a channel.
    ///
    /// # Errors
    /// Returns error if the event loop has stopped.
    pub fn subscribe_channel(&self, topic: impl Into<String>) -> Result<mpsc::UnboundedReceiver<Value>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe(topic, ChannelHandler(tx))?;
        Ok(rx)
    }

    /// Remove the handler for `topic`.
    ///
    /// # Errors
    /// Returns error if the event loop has stopped.
    pub fn unsubscribe(&self, topic: impl Into<String>) -> Result<()> {
        self.command(Command::Unsubscribe {
            topic: topic.into(),
        })
    }

    /// Send one envelope.
    ///
    /// Nothing is queued: while not open this fails with
    /// [`ClientError::NotConnected`] and the message is lost.
    ///
    /// # Errors
    /// Returns error if not connected, the envelope cannot be encoded or the
    /// event loop has stopped.
    pub async fn send(&self, envelope: &Envelope) -> Result<()> {
        let frame = envelope.to_frame()?;
        let (reply, rx) = oneshot::channel();
        self.command(Command::Send { frame, reply })?;
        rx.await.map_err(|_| ClientError::Closed)?
    }

    /// Send a chat message.
    ///
    /// # Errors
    /// See [`SyncClient::send`].
    pub async fn send_user_message(&self, message: &UserMessage) -> Result<()> {
        self.send(&Envelope::user_message(message)).await
    }

    /// Follow one execution: subscribe to `execution_<id>` and ask the
    /// server to stream its events.
    ///
    /// # Errors
    /// Returns error if the event loop has stopped.
    pub fn watch_execution<H>(&self, execution_id: &str, handler: H) -> Result<()>
    where
        H: TopicHandler + 'static,
    {
        self.subscribe(execution_topic(execution_id), handler)?;
        let frame = Envelope::subscribe_execution(execution_id).to_frame()?;
        self.command(Command::Announce { frame })
    }

    /// Stop following an execution.
    ///
    /// # Errors
    /// Returns error if the event loop has stopped.
    pub fn unwatch_execution(&self, execution_id: &str) -> Result<()> {
        self.unsubscribe(execution_topic(execution_id))
    }

    /// Mark an execution cancelled locally and ask the server to stop it.
    ///
    /// The local transition happens even when the request cannot be sent.
    ///
    /// # Errors
    /// Returns error if the request could not be sent.
    pub async fn cancel_execution(&self, execution_id: &str) -> Result<()> {
        let frame = Envelope::cancel_execution(execution_id).to_frame()?;
        let (reply, rx) = oneshot::channel();
        self.command(Command::CancelExecution {
            execution_id: execution_id.to_string(),
            frame,
            reply,
        })?;
        rx.await.map_err(|_| ClientError::Closed)?
    }

    /// Snapshot of one execution.
    #[must_use]
    pub fn execution(&self, execution_id: &str) -> Option<Execution> {
        self.tracker
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(execution_id)
            .cloned()
    }

    /// Snapshots of all executions in creation order.
    #[must_use]
    pub fn executions(&self) -> Vec<Execution> {
        self.tracker
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Drop every execution record.
    pub fn clear_executions(&self) {
        self.tracker
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Subscribe to connection notifications.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Watch the connection state.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    #[must_use]
    pub fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Wait until the connection is open.
    ///
    /// # Errors
    /// Returns [`ClientError::ReconnectExhausted`] if retries run out while
    /// waiting, or [`ClientError::Closed`] if the event loop stops.
    pub async fn wait_open(&self) -> Result<()> {
        let mut events = self.events.subscribe();
        let mut state = self.state.clone();
        loop {
            if state.borrow_and_update().is_open() {
                return Ok(());
            }
            tokio::select! {
                changed = state.changed() => changed.map_err(|_| ClientError::Closed)?,
                event = events.recv() => match event {
                    Ok(ClientEvent::ReconnectExhausted { attempts }) => {
                        return Err(ClientError::ReconnectExhausted { attempts });
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(ClientError::Closed),
                    _ => {}
                },
            }
        }
    }
}

type ConnectFuture = BoxFuture<'static, std::result::Result<Connection, TransportError>>;

struct EventLoop {
    url: Url,
    transport: Arc<dyn Transport>,
    commands: mpsc::UnboundedReceiver<Command>,
    registry: SubscriptionRegistry,
    router: MessageRouter,
    reconnect: ReconnectController,
    connecting: Option<ConnectFuture>,
    sink: Option<FrameSink>,
    stream: Option<FrameStream>,
    /// Set by `connect`, cleared by `disconnect`. Retries only while set.
    active: bool,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ClientEvent>,
}

impl EventLoop {
    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                result = next_connect(&mut self.connecting) => self.on_connect_result(result).await,
                frame = next_frame(&mut self.stream) => self.on_frame(frame),
                () = wait_deadline(self.reconnect.deadline()) => self.on_retry_due(),
            }
        }
        debug!("All client handles dropped, stopping event loop");
        self.close_connection().await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => {
                self.active = true;
                self.reconnect.reset();
                self.start_open();
            }
            Command::Disconnect { done } => {
                self.disconnect().await;
                let _ = done.send(());
            }
            Command::Subscribe { topic, handler } => {
                let replaced = self.registry.insert(topic.clone(), handler);
                debug!(%topic, replaced, "Subscribed");
                if self.is_open() {
                    self.write(Envelope::subscribe(&topic)).await;
                }
            }
            Command::Unsubscribe { topic } => {
                if self.registry.remove(&topic) {
                    debug!(%topic, "Unsubscribed");
                    if self.is_open() {
                        self.write(Envelope::unsubscribe(&topic)).await;
                    }
                }
            }
            Command::Send { frame, reply } => {
                let result = self.send_frame(frame).await;
                let _ = reply.send(result);
            }
            Command::Announce { frame } => {
                if self.is_open() {
                    self.write_frame(frame).await;
                }
            }
            Command::CancelExecution {
                execution_id,
                frame,
                reply,
            } => {
                if self.router.cancel_execution(&execution_id) {
                    info!(%execution_id, "Execution cancelled locally");
                }
                let result = self.send_frame(frame).await;
                let _ = reply.send(result);
            }
        }
    }

    fn is_open(&self) -> bool {
        self.sink.is_some()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    /// Begin opening a connection unless one is open or in flight.
    fn start_open(&mut self) {
        if self.connecting.is_some() || self.is_open() {
            return;
        }
        info!(url = %self.url, "Connecting");
        self.set_state(ConnectionState::Connecting);
        let transport = Arc::clone(&self.transport);
        let url = self.url.clone();
        self.connecting = Some(Box::pin(async move { transport.open(&url).await }));
    }

    async fn on_connect_result(&mut self, result: std::result::Result<Connection, TransportError>) {
        match result {
            Ok(connection) => {
                info!(url = %self.url, "Connected");
                self.sink = Some(connection.sink);
                self.stream = Some(connection.stream);
                self.reconnect.on_open();
                self.set_state(ConnectionState::Open);
                self.emit(ClientEvent::Connected);

                let topics: Vec<String> = self.registry.topics().map(str::to_owned).collect();
                for topic in topics {
                    if !self.write(Envelope::subscribe(&topic)).await {
                        break;
                    }
                }
            }
            Err(e) => {
                warn!(url = %self.url, error = %e, "Connection attempt failed");
                self.set_state(ConnectionState::Closed);
                self.schedule_retry();
            }
        }
    }

    fn on_frame(&mut self, frame: Option<std::result::Result<String, TransportError>>) {
        match frame {
            Some(Ok(text)) => {
                if let Err(e) = self.router.route(&self.registry, &text) {
                    warn!(error = %e, "Dropping inbound frame");
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, "Connection error");
                self.connection_lost();
            }
            None => {
                info!("Connection closed by server");
                self.connection_lost();
            }
        }
    }

    fn on_retry_due(&mut self) {
        let attempt = self.reconnect.fire();
        info!(attempt, "Reconnecting");
        self.start_open();
    }

    fn connection_lost(&mut self) {
        self.sink = None;
        self.stream = None;
        self.set_state(ConnectionState::Closed);
        self.emit(ClientEvent::ConnectionLost);
        self.schedule_retry();
    }

    fn schedule_retry(&mut self) {
        if !self.active {
            return;
        }
        match self.reconnect.on_close(Instant::now()) {
            CloseOutcome::Scheduled { attempt, delay } => {
                info!(attempt, ?delay, "Reconnect scheduled");
                self.emit(ClientEvent::ReconnectScheduled { attempt, delay });
            }
            CloseOutcome::Exhausted { attempts } => {
                warn!(attempts, "Reconnect attempts exhausted");
                self.emit(ClientEvent::ReconnectExhausted { attempts });
            }
            CloseOutcome::AlreadyPending | CloseOutcome::GaveUp => {}
        }
    }

    async fn disconnect(&mut self) {
        self.active = false;
        self.reconnect.cancel();
        self.connecting = None;
        let was_open = self.is_open();
        self.close_connection().await;
        self.set_state(ConnectionState::Idle);
        if was_open {
            info!("Disconnected");
            self.emit(ClientEvent::Disconnected);
        }
    }

    async fn close_connection(&mut self) {
        self.stream = None;
        if let Some(mut sink) = self.sink.take() {
            if let Err(e) = sink.close().await {
                debug!(error = %e, "Error closing connection");
            }
        }
    }

    /// Send a caller's frame. Not open means the frame is dropped.
    async fn send_frame(&mut self, frame: String) -> Result<()> {
        if !self.is_open() {
            if self.active && !self.reconnect.is_exhausted() {
                self.start_open();
            }
            return Err(ClientError::NotConnected);
        }
        if self.write_frame(frame).await {
            Ok(())
        } else {
            Err(ClientError::NotConnected)
        }
    }

    async fn write(&mut self, envelope: Envelope) -> bool {
        match envelope.to_frame() {
            Ok(frame) => self.write_frame(frame).await,
            Err(e) => {
                warn!(error = %e, "Failed to encode frame");
                false
            }
        }
    }

    /// Write to the open connection. A failed write drops the connection.
    async fn write_frame(&mut self, frame: String) -> bool {
        let Some(sink) = self.sink.as_mut() else {
            return false;
        };
        let result = sink.send(frame).await;
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Write failed");
                self.connection_lost();
                false
            }
        }
    }
}

async fn next_connect(slot: &mut Option<ConnectFuture>) -> std::result::Result<Connection, TransportError> {
    let Some(connecting) = slot.as_mut() else {
        return pending().await;
    };
    let result = connecting.await;
    *slot = None;
    result
}

async fn next_frame(stream: &mut Option<FrameStream>) -> Option<std::result::Result<String, TransportError>> {
    match stream.as_mut() {
        Some(stream) => stream.next().await,
        None => pending().await,
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ServerConnection, TestServer, TestTransport};
    use agent_sync_core::{ExecutionStatus, NoopSink};
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    fn client_with(policy: BackoffPolicy) -> (SyncClient, TestServer) {
        let mut config = ClientConfig::default();
        config.reconnect = policy;
        let (transport, server) = TestTransport::new();
        let client = SyncClient::new(&config, transport, NoopSink).unwrap();
        (client, server)
    }

    fn client() -> (SyncClient, TestServer) {
        client_with(BackoffPolicy::default())
    }

    async fn expect_topic(conn: &mut ServerConnection, kind: &str, topic: &str) {
        let envelope = conn.recv_envelope().await;
        assert_eq!(envelope.kind, kind);
        assert_eq!(envelope.data, json!({ "topic": topic }));
    }

    /// Round-trip a marker frame so everything sent before it has arrived.
    async fn sync_point(client: &SyncClient, conn: &mut ServerConnection) -> Vec<Envelope> {
        client.send(&Envelope::new("marker", json!({}))).await.unwrap();
        let mut seen = Vec::new();
        loop {
            let envelope = conn.recv_envelope().await;
            if envelope.kind == "marker" {
                return seen;
            }
            seen.push(envelope);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn replays_each_topic_once_per_open() {
        let (client, mut server) = client();
        client.subscribe("assistant_message", |_: &Value| {}).unwrap();
        client.subscribe("execution_e1", |_: &Value| {}).unwrap();
        client.subscribe("assistant_message", |_: &Value| {}).unwrap();
        client.connect().unwrap();

        let mut conn = server.accept().await;
        let replayed = sync_point(&client, &mut conn).await;
        let topics: Vec<_> = replayed.iter().map(|e| e.data["topic"].clone()).collect();
        assert_eq!(topics, [json!("assistant_message"), json!("execution_e1")]);

        conn.close();
        let mut conn = server.accept().await;
        let replayed = sync_point(&client, &mut conn).await;
        assert_eq!(replayed.len(), 2);
        assert!(replayed.iter().all(|e| e.kind == "subscribe"));
    }

    #[tokio::test(start_paused = true)]
    async fn subscribe_and_unsubscribe_while_open() {
        let (client, mut server) = client();
        client.connect().unwrap();
        let mut conn = server.accept().await;
        client.wait_open().await.unwrap();

        client.subscribe("done", |_: &Value| {}).unwrap();
        expect_topic(&mut conn, "subscribe", "done").await;

        client.unsubscribe("never-subscribed").unwrap();
        client.unsubscribe("done").unwrap();
        expect_topic(&mut conn, "unsubscribe", "done").await;
    }

    #[tokio::test(start_paused = true)]
    async fn send_while_idle_is_not_connected() {
        let (client, _server) = client();
        let err = assert_err!(client.send(&Envelope::new("user_message", json!({}))).await);
        assert!(matches!(err, ClientError::NotConnected));
        assert_eq!(client.current_state(), ConnectionState::Idle);
        assert!(client.executions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn send_while_closed_reconnects_immediately() {
        let (client, mut server) = client();
        let mut events = client.events();
        client.subscribe("done", |_: &Value| {}).unwrap();
        client.subscribe("execution_e1", |_: &Value| {}).unwrap();
        client.connect().unwrap();
        let mut conn = server.accept().await;
        sync_point(&client, &mut conn).await;

        server.fail_next(1);
        conn.close();
        loop {
            if let ClientEvent::ReconnectScheduled { attempt: 1, .. } = events.recv().await.unwrap() {
                break;
            }
        }
        assert_eq!(client.current_state(), ConnectionState::Closed);
        assert_eq!(server.opens().len(), 2);

        let before = Instant::now();
        let err = assert_err!(client.send(&Envelope::new("user_message", json!({}))).await);
        assert!(matches!(err, ClientError::NotConnected));

        let mut conn = server.accept().await;
        let opens = server.opens();
        assert_eq!(opens.len(), 3);
        assert!(opens[2] - before < Duration::from_millis(1000));

        let replayed = sync_point(&client, &mut conn).await;
        let topics: Vec<_> = replayed.iter().map(|e| e.data["topic"].clone()).collect();
        assert_eq!(topics, [json!("done"), json!("execution_e1")]);
        // the dropped message is not resent
        assert!(replayed.iter().all(|e| e.kind == "subscribe"));
    }

    #[tokio::test(start_paused = true)]
    async fn manual_disconnect_is_not_a_loss() {
        let (client, mut server) = client();
        let mut events = client.events();
        client.connect().unwrap();
        let _conn = server.accept().await;
        assert_eq!(events.recv().await.unwrap(), ClientEvent::Connected);

        assert_ok!(client.disconnect().await);
        assert_eq!(events.recv().await.unwrap(), ClientEvent::Disconnected);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_with_backoff() {
        let (client, mut server) = client();
        let mut events = client.events();
        client.connect().unwrap();
        let conn = server.accept().await;
        assert_eq!(events.recv().await.unwrap(), ClientEvent::Connected);

        server.fail_next(2);
        conn.close();
        let _conn = server.accept().await;

        let opens = server.opens();
        assert_eq!(opens.len(), 4);
        assert!(opens[1] - opens[0] >= Duration::from_millis(1000));
        assert!(opens[2] - opens[1] >= Duration::from_millis(2000));
        assert!(opens[3] - opens[2] >= Duration::from_millis(4000));

        assert_eq!(events.recv().await.unwrap(), ClientEvent::ConnectionLost);
        assert_eq!(
            events.recv().await.unwrap(),
            ClientEvent::ReconnectScheduled {
                attempt: 0,
                delay: Duration::from_millis(1000)
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            ClientEvent::ReconnectScheduled {
                attempt: 1,
                delay: Duration::from_millis(2000)
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            ClientEvent::ReconnectScheduled {
                attempt: 2,
                delay: Duration::from_millis(4000)
            }
        );
        assert_eq!(events.recv().await.unwrap(), ClientEvent::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_open_resets_backoff() {
        let (client, mut server) = client();
        client.connect().unwrap();
        let conn = server.accept().await;

        server.fail_next(1);
        conn.close();
        let conn = server.accept().await;
        conn.close();
        let _conn = server.accept().await;

        let opens = server.opens();
        assert_eq!(opens.len(), 4);
        // attempt counter restarted at zero after the third open succeeded
        let last = opens[3] - opens[2];
        assert!(last >= Duration::from_millis(1000));
        assert!(last < Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_retries_exhaust() {
        let (client, mut server) = client_with(BackoffPolicy {
            max_attempts: Some(2),
            ..BackoffPolicy::default()
        });
        client.connect().unwrap();
        let conn = server.accept().await;
        client.wait_open().await.unwrap();

        server.fail_next(10);
        conn.close();
        client
            .state()
            .wait_for(|s| *s == ConnectionState::Closed)
            .await
            .unwrap();
        let err = assert_err!(client.wait_open().await);
        assert!(matches!(err, ClientError::ReconnectExhausted { attempts: 2 }));
        assert_eq!(server.opens().len(), 3);

        // no further attempts, even on send
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(client.send(&Envelope::new("x", json!({}))).await.is_err());
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(server.opens().len(), 3);

        // manual connect starts over
        server.fail_next(0);
        client.connect().unwrap();
        let _conn = server.accept().await;
        client.wait_open().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn read_error_triggers_reconnect() {
        let (client, mut server) = client();
        let mut events = client.events();
        client.connect().unwrap();
        let conn = server.accept().await;
        assert_eq!(events.recv().await.unwrap(), ClientEvent::Connected);

        conn.push_error();
        let _conn = server.accept().await;
        assert_eq!(events.recv().await.unwrap(), ClientEvent::ConnectionLost);
        assert!(matches!(
            events.recv().await.unwrap(),
            ClientEvent::ReconnectScheduled { attempt: 0, .. }
        ));
        assert_eq!(events.recv().await.unwrap(), ClientEvent::Connected);
        assert_eq!(server.opens().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_retry() {
        let (client, mut server) = client();
        client.connect().unwrap();
        let conn = server.accept().await;
        client.wait_open().await.unwrap();

        conn.close();
        let mut state = client.state();
        state
            .wait_for(|s| *s == ConnectionState::Closed)
            .await
            .unwrap();
        client.disconnect().await.unwrap();
        assert_eq!(client.current_state(), ConnectionState::Idle);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(server.opens().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_idempotent() {
        let (client, mut server) = client();
        client.connect().unwrap();
        client.connect().unwrap();
        let _conn = server.accept().await;
        client.wait_open().await.unwrap();
        client.connect().unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(server.opens().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn routes_frames_in_order() {
        let (client, mut server) = client();
        let mut scoped = client.subscribe_channel("execution_e1").unwrap();
        let mut global = client.subscribe_channel("code_execution_output").unwrap();
        client.connect().unwrap();
        let mut conn = server.accept().await;
        sync_point(&client, &mut conn).await;

        conn.push_event("code_execution_start", json!({"execution_id": "e1", "code": "print(1)"}));
        conn.push("not json at all");
        for i in 0..3 {
            conn.push_event(
                "code_execution_output",
                json!({"execution_id": "e1", "output": {"type": "stdout", "content": i.to_string()}}),
            );
        }
        conn.push_event("code_execution_end", json!({"execution_id": "e1", "status": "completed"}));

        // start, three outputs and end reach the execution topic
        for _ in 0..5 {
            scoped.recv().await.unwrap();
        }
        for _ in 0..3 {
            global.recv().await.unwrap();
        }

        let execution = client.execution("e1").unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        let contents: Vec<_> = execution.outputs.iter().map(|o| o.content.as_str()).collect();
        assert_eq!(contents, ["0", "1", "2"]);
        assert_eq!(client.current_state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn watch_and_cancel_execution() {
        let (client, mut server) = client();
        client.connect().unwrap();
        let mut conn = server.accept().await;
        client.wait_open().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        client.watch_execution("e5", ChannelHandler(tx)).unwrap();
        expect_topic(&mut conn, "subscribe", "execution_e5").await;
        let envelope = conn.recv_envelope().await;
        assert_eq!(envelope.kind, "subscribe_execution");
        assert_eq!(envelope.data, json!({"execution_id": "e5"}));

        conn.push_event("code_execution_start", json!({"execution_id": "e5", "code": ""}));
        assert_eq!(rx.recv().await.unwrap()["execution_id"], "e5");
        assert!(client.execution("e5").unwrap().is_running());

        client.cancel_execution("e5").await.unwrap();
        let envelope = conn.recv_envelope().await;
        assert_eq!(envelope.kind, "cancel_execution");
        assert_eq!(
            client.execution("e5").unwrap().status,
            ExecutionStatus::Cancelled
        );

        conn.push_event("code_execution_end", json!({"execution_id": "e5", "status": "completed"}));
        rx.recv().await.unwrap();
        assert_eq!(
            client.execution("e5").unwrap().status,
            ExecutionStatus::Cancelled
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_while_closed_still_cancels_locally() {
        let (client, mut server) = client();
        let mut starts = client.subscribe_channel("code_execution_start").unwrap();
        client.connect().unwrap();
        let conn = server.accept().await;
        conn.push_event("code_execution_start", json!({"execution_id": "e2", "code": ""}));
        starts.recv().await.unwrap();
        client.disconnect().await.unwrap();

        let err = assert_err!(client.cancel_execution("e2").await);
        assert!(matches!(err, ClientError::NotConnected));
        let execution = client.execution("e2").unwrap();
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
        assert_eq!(execution.error.as_deref(), Some("execution cancelled"));

        client.clear_executions();
        assert!(client.execution("e2").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn instances_are_independent() {
        let (a, mut server_a) = client();
        let (b, mut server_b) = client();
        let mut starts = a.subscribe_channel("code_execution_start").unwrap();
        a.connect().unwrap();
        b.connect().unwrap();
        let conn_a = server_a.accept().await;
        let _conn_b = server_b.accept().await;

        conn_a.push_event("code_execution_start", json!({"execution_id": "only-a", "code": ""}));
        starts.recv().await.unwrap();
        assert!(a.execution("only-a").is_some());
        assert!(b.execution("only-a").is_none());
        assert_eq!(b.current_state(), ConnectionState::Open);
    }
}
