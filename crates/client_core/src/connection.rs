use std::{
    collections::HashMap,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex, PoisonError,
    },
    task::{Context, Poll},
};

use futures::{Sink, SinkExt, Stream, StreamExt};
use shared::protocol::{ClientRequest, EventClass, ServerEvent};
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
    time::sleep,
};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        self,
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Message as WsMessage,
    },
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::{websocket_url, ConnectionSettings},
    error::ConnectionError,
    session::Session,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    /// Failed attempts in the current streak; reset on every successful connect.
    pub retry_count: u32,
    pub last_error: Option<ConnectionError>,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    fn connected() -> Self {
        Self {
            status: ConnectionStatus::Connected,
            retry_count: 0,
            last_error: None,
        }
    }
}

#[derive(Default)]
struct ListenerRegistry {
    counts: StdMutex<HashMap<EventClass, usize>>,
}

impl ListenerRegistry {
    fn register(&self, classes: &[EventClass]) {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        for class in classes {
            *counts.entry(*class).or_default() += 1;
        }
    }

    fn release(&self, classes: &[EventClass]) {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        for class in classes {
            if let Some(count) = counts.get_mut(class) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    counts.remove(class);
                }
            }
        }
    }

    fn count(&self, class: EventClass) -> usize {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&class)
            .copied()
            .unwrap_or(0)
    }
}

/// Live registration for a set of server event classes. Dropping it
/// deregisters the listener.
pub struct Subscription {
    classes: Vec<EventClass>,
    inner: BroadcastStream<ServerEvent>,
    registry: Arc<ListenerRegistry>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        self.next().await
    }

    #[cfg(test)]
    pub(crate) fn classes(&self) -> &[EventClass] {
        &self.classes
    }
}

impl Stream for Subscription {
    type Item = ServerEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match self.inner.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(event))) => {
                    if self.classes.contains(&event.class()) {
                        return Poll::Ready(Some(event));
                    }
                }
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(skipped)))) => {
                    warn!(skipped, "connection: subscriber lagged, events dropped");
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.release(&self.classes);
    }
}

struct HandleShared {
    outbound: mpsc::UnboundedSender<ClientRequest>,
    events: broadcast::Sender<ServerEvent>,
    state: watch::Receiver<ConnectionState>,
    shutdown: watch::Sender<bool>,
    closed: AtomicBool,
    listeners: Arc<ListenerRegistry>,
}

/// Shared handle to the session's realtime connection. Any holder may
/// subscribe or emit; only [`ConnectionManager`] opens connections.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<HandleShared>,
}

/// Receiving side of a handle's channels, owned by whatever drives the wire.
struct HandlePorts {
    outbound: mpsc::UnboundedReceiver<ClientRequest>,
    events: broadcast::Sender<ServerEvent>,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Receiver<bool>,
}

impl ConnectionHandle {
    fn with_ports(event_buffer: usize, initial: ConnectionState) -> (Self, HandlePorts) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(event_buffer.max(1));
        let (state_tx, state_rx) = watch::channel(initial);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = Self {
            shared: Arc::new(HandleShared {
                outbound: outbound_tx,
                events: events_tx.clone(),
                state: state_rx,
                shutdown: shutdown_tx,
                closed: AtomicBool::new(false),
                listeners: Arc::new(ListenerRegistry::default()),
            }),
        };
        let ports = HandlePorts {
            outbound: outbound_rx,
            events: events_tx,
            state: state_tx,
            shutdown: shutdown_rx,
        };
        (handle, ports)
    }

    /// In-memory connection, already `Connected`, whose far end is driven by
    /// the returned peer instead of a websocket.
    pub fn loopback() -> (Self, LoopbackPeer) {
        let (handle, ports) = Self::with_ports(256, ConnectionState::connected());
        (handle, LoopbackPeer { ports })
    }

    pub fn subscribe(&self, classes: &[EventClass]) -> Subscription {
        self.shared.listeners.register(classes);
        Subscription {
            classes: classes.to_vec(),
            inner: BroadcastStream::new(self.shared.events.subscribe()),
            registry: Arc::clone(&self.shared.listeners),
        }
    }

    /// Queues a request for the server. Fails without side effects while the
    /// connection is not up; callers stay usable in that degraded mode.
    pub fn emit(&self, request: ClientRequest) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        if !self.shared.state.borrow().is_connected() {
            return Err(ConnectionError::NotConnected);
        }
        self.shared
            .outbound
            .send(request)
            .map_err(|_| ConnectionError::Closed)
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.clone()
    }

    pub fn current_state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state.borrow().is_connected()
    }

    pub fn listener_count(&self, class: EventClass) -> usize {
        self.shared.listeners.count(class)
    }

    /// Idempotent; safe on an already-closed handle.
    pub fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            self.shared.shutdown.send_replace(true);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn same_connection(&self, other: &ConnectionHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

/// Far end of [`ConnectionHandle::loopback`].
pub struct LoopbackPeer {
    ports: HandlePorts,
}

impl LoopbackPeer {
    pub fn push(&self, event: ServerEvent) {
        let _ = self.ports.events.send(event);
    }

    pub async fn next_request(&mut self) -> Option<ClientRequest> {
        self.ports.outbound.recv().await
    }

    pub fn try_next_request(&mut self) -> Option<ClientRequest> {
        self.ports.outbound.try_recv().ok()
    }

    pub fn set_status(&self, status: ConnectionStatus) {
        self.ports.state.send_modify(|state| state.status = status);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.ports.shutdown.borrow()
    }
}

pub struct ConnectionManager {
    settings: ConnectionSettings,
}

impl ConnectionManager {
    pub fn new(settings: ConnectionSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    /// Starts connecting in the background and returns immediately. Failures
    /// show up in the handle's state, never as an error here.
    pub fn open(&self, session: &Session) -> ConnectionHandle {
        let (handle, ports) =
            ConnectionHandle::with_ports(self.settings.event_buffer, ConnectionState::default());
        let supervisor = Supervisor {
            settings: self.settings.clone(),
            session: session.clone(),
            ports,
        };
        tokio::spawn(supervisor.run());
        handle
    }

    pub fn close(&self, handle: &ConnectionHandle) {
        handle.close();
    }

    /// Keeps exactly one connection open per non-null session published on
    /// `sessions`, tearing it down as soon as the session goes away.
    pub fn follow_session(
        self: Arc<Self>,
        mut sessions: watch::Receiver<Option<Session>>,
    ) -> SessionConnection {
        let (handles_tx, handles_rx) = watch::channel(None);
        let task = tokio::spawn(async move {
            let mut current: Option<(Session, ConnectionHandle)> = None;
            loop {
                let next = sessions.borrow_and_update().clone();
                let unchanged = matches!(
                    (&current, &next),
                    (Some((active, _)), Some(session)) if active == session
                );
                if !unchanged {
                    if let Some((ended, handle)) = current.take() {
                        self.close(&handle);
                        info!(email = %ended.email, "connection: session ended, connection closed");
                    }
                    match next {
                        Some(session) => {
                            let handle = self.open(&session);
                            current = Some((session, handle.clone()));
                            handles_tx.send_replace(Some(handle));
                        }
                        None => {
                            handles_tx.send_replace(None);
                        }
                    }
                }

                if sessions.changed().await.is_err() {
                    break;
                }
            }

            if let Some((_, handle)) = current.take() {
                self.close(&handle);
            }
            handles_tx.send_replace(None);
        });

        SessionConnection {
            handles: handles_rx,
            task: Some(task),
        }
    }
}

/// Connection bound to the lifetime of the session context's current value.
pub struct SessionConnection {
    handles: watch::Receiver<Option<ConnectionHandle>>,
    task: Option<JoinHandle<()>>,
}

impl SessionConnection {
    pub fn handles(&self) -> watch::Receiver<Option<ConnectionHandle>> {
        self.handles.clone()
    }

    pub fn current(&self) -> Option<ConnectionHandle> {
        self.handles.borrow().clone()
    }

    pub async fn shutdown(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        if let Some(handle) = self.current() {
            handle.close();
        }
    }
}

impl Drop for SessionConnection {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(handle) = self.handles.borrow().as_ref() {
            handle.close();
        }
    }
}

enum PumpExit {
    Shutdown,
    Lost(String),
}

struct Supervisor {
    settings: ConnectionSettings,
    session: Session,
    ports: HandlePorts,
}

impl Supervisor {
    async fn run(mut self) {
        let url = match websocket_url(&self.settings.server_url) {
            Ok(url) => url,
            Err(err) => {
                warn!("connection: not connecting: {err}");
                self.ports.state.send_modify(|state| {
                    state.status = ConnectionStatus::Disconnected;
                    state.last_error = Some(err);
                });
                return;
            }
        };

        let mut failures: u32 = 0;
        loop {
            if *self.ports.shutdown.borrow() {
                break;
            }

            self.ports.state.send_modify(|state| {
                state.status = ConnectionStatus::Connecting;
                state.retry_count = failures;
            });
            debug!(url = %url, attempt = failures + 1, "connection: connecting");

            let attempt = tokio::select! {
                result = connect(&url, &self.session) => result,
                _ = self.ports.shutdown.changed() => break,
            };

            match attempt {
                Ok(stream) => {
                    failures = 0;
                    self.ports.state.send_replace(ConnectionState::connected());
                    info!(url = %url, email = %self.session.email, "connection: connected");

                    match self.pump(stream).await {
                        PumpExit::Shutdown => break,
                        PumpExit::Lost(reason) => {
                            warn!("connection: lost: {reason}");
                            self.ports.state.send_modify(|state| {
                                state.status = ConnectionStatus::Disconnected;
                                state.last_error = Some(ConnectionError::Lost(reason));
                            });
                        }
                    }
                }
                Err(err) => {
                    failures += 1;
                    warn!(attempt = failures, "connection: attempt failed: {err}");
                    let rejected = matches!(err, ConnectionError::AuthRejected { .. });
                    self.ports.state.send_modify(|state| {
                        state.status = ConnectionStatus::Disconnected;
                        state.retry_count = failures;
                        state.last_error = Some(err);
                    });

                    if rejected {
                        break;
                    }
                    if failures > self.settings.reconnect_attempts {
                        warn!(attempts = failures, "connection: giving up");
                        self.ports.state.send_modify(|state| {
                            state.last_error =
                                Some(ConnectionError::RetriesExhausted { attempts: failures });
                        });
                        break;
                    }
                }
            }

            tokio::select! {
                _ = sleep(self.settings.reconnect_delay) => {}
                _ = self.ports.shutdown.changed() => break,
            }
        }

        self.ports
            .state
            .send_modify(|state| state.status = ConnectionStatus::Disconnected);
        info!(email = %self.session.email, "connection: supervisor stopped");
    }

    async fn pump<S>(&mut self, stream: S) -> PumpExit
    where
        S: Stream<Item = Result<WsMessage, tungstenite::Error>>
            + Sink<WsMessage, Error = tungstenite::Error>
            + Unpin,
    {
        let (mut writer, mut reader) = stream.split();

        let announce = ClientRequest::SetOnline(self.session.email.clone());
        if let Err(reason) = send_request(&mut writer, &announce).await {
            return PumpExit::Lost(reason);
        }
        debug!(email = %self.session.email, "connection: presence announced");

        loop {
            tokio::select! {
                _ = self.ports.shutdown.changed() => {
                    let _ = writer.send(WsMessage::Close(None)).await;
                    return PumpExit::Shutdown;
                }
                request = self.ports.outbound.recv() => match request {
                    Some(request) => {
                        if let Err(reason) = send_request(&mut writer, &request).await {
                            return PumpExit::Lost(reason);
                        }
                    }
                    None => return PumpExit::Shutdown,
                },
                frame = reader.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => self.dispatch(&text),
                    Some(Ok(WsMessage::Close(_))) | None => {
                        return PumpExit::Lost("server closed the connection".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return PumpExit::Lost(err.to_string()),
                },
            }
        }
    }

    fn dispatch(&self, text: &str) {
        match serde_json::from_str::<ServerEvent>(text) {
            Ok(event) => {
                if let ServerEvent::Error(error) = &event {
                    warn!("connection: server reported an error: {}", error.message);
                }
                let class = event.class();
                if self.ports.events.send(event).is_err() {
                    debug!(?class, "connection: no listeners for server event");
                }
            }
            Err(err) => warn!("connection: invalid server event: {err}"),
        }
    }
}

async fn connect(
    url: &Url,
    session: &Session,
) -> Result<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    ConnectionError,
> {
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|err| ConnectionError::Connect(err.to_string()))?;
    if let Some(token) = session.auth_token.as_deref() {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|err| ConnectionError::Connect(err.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    match connect_async(request).await {
        Ok((stream, _)) => Ok(stream),
        Err(tungstenite::Error::Http(response))
            if matches!(response.status().as_u16(), 401 | 403) =>
        {
            Err(ConnectionError::AuthRejected {
                status: response.status().as_u16(),
            })
        }
        Err(err) => Err(ConnectionError::Connect(err.to_string())),
    }
}

async fn send_request<W>(writer: &mut W, request: &ClientRequest) -> Result<(), String>
where
    W: Sink<WsMessage, Error = tungstenite::Error> + Unpin,
{
    let json = match serde_json::to_string(request) {
        Ok(json) => json,
        Err(err) => {
            warn!("connection: dropping unserializable request: {err}");
            return Ok(());
        }
    };
    writer
        .send(WsMessage::Text(json))
        .await
        .map_err(|err| err.to_string())
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
