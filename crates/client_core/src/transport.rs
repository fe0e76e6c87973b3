use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::protocol::{ClientRequest, ServerEvent};
use tokio::{
    sync::{broadcast, mpsc, watch, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue, StatusCode},
        Error as WsError, Message,
    },
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::{ChatError, Result},
    types::Credential,
};

const LINK_CAPACITY: usize = 256;
pub(crate) const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    AuthRejected(String),
    Server(ServerEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Connection,
    MessageReceived,
    TypingStarted,
    TypingStopped,
    ThreadUpdated,
    SendRejected,
    ServerError,
}

impl TransportEvent {
    pub fn topic(&self) -> Topic {
        match self {
            Self::Connected | Self::Disconnected | Self::AuthRejected(_) => Topic::Connection,
            Self::Server(event) => match event {
                ServerEvent::MessageReceived { .. } => Topic::MessageReceived,
                ServerEvent::TypingStarted { .. } => Topic::TypingStarted,
                ServerEvent::TypingStopped { .. } => Topic::TypingStopped,
                ServerEvent::ThreadUpdated { .. } => Topic::ThreadUpdated,
                ServerEvent::SendRejected { .. } => Topic::SendRejected,
                ServerEvent::Error(_) => Topic::ServerError,
            },
        }
    }
}

/// Client half of an open connection.
pub struct TransportLink {
    outbound: mpsc::Sender<ClientRequest>,
    inbound: mpsc::Receiver<ServerEvent>,
}

/// Remote half of a [`TransportLink`], driven by a connector.
pub struct LinkPeer {
    pub inbound: mpsc::Sender<ServerEvent>,
    pub outbound: mpsc::Receiver<ClientRequest>,
}

pub fn link_pair(capacity: usize) -> (TransportLink, LinkPeer) {
    let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
    let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
    (
        TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        },
        LinkPeer {
            inbound: inbound_tx,
            outbound: outbound_rx,
        },
    )
}

#[async_trait]
pub trait TransportConnector: Send + Sync {
    /// Returns [`ChatError::Auth`] when the server rejects the credential.
    async fn open(&self, credential: &Credential) -> Result<TransportLink>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectBackoff {
    pub initial: Duration,
    pub max: Duration,
}

impl ReconnectBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
        }
    }

    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.min(16));
        self.initial.saturating_mul(factor).min(self.max)
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

pub struct TransportSession {
    connector: Arc<dyn TransportConnector>,
    backoff: ReconnectBackoff,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<TransportEvent>,
    outbound: Mutex<Option<mpsc::Sender<ClientRequest>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl TransportSession {
    pub fn new(connector: Arc<dyn TransportConnector>, backoff: ReconnectBackoff) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            connector,
            backoff,
            state,
            events,
            outbound: Mutex::new(None),
            supervisor: Mutex::new(None),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    pub fn on(&self, topic: Topic) -> TopicSubscription {
        TopicSubscription {
            topic,
            receiver: self.events.subscribe(),
        }
    }

    /// Any failure other than a rejected credential is retried in the
    /// background.
    pub async fn connect(self: &Arc<Self>, credential: Credential) -> Result<()> {
        let mut supervisor = self.supervisor.lock().await;
        if supervisor.as_ref().is_some_and(|task| !task.is_finished()) {
            debug!("transport: connect ignored, session already active");
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        let (first, failures) = match self.connector.open(&credential).await {
            Ok(link) => (Some(link), 0),
            Err(ChatError::Auth(reason)) => {
                warn!("transport: credential rejected: {reason}");
                self.set_state(ConnectionState::Disconnected);
                return Err(ChatError::Auth(reason));
            }
            Err(err) => {
                warn!("transport: initial connect failed, retrying in background: {err}");
                self.set_state(ConnectionState::Disconnected);
                (None, 1)
            }
        };

        let session = Arc::clone(self);
        *supervisor = Some(tokio::spawn(session.supervise(credential, first, failures)));
        Ok(())
    }

    pub async fn disconnect(&self) {
        if let Some(task) = self.supervisor.lock().await.take() {
            task.abort();
        }
        self.outbound.lock().await.take();
        self.set_state(ConnectionState::Disconnected);
    }

    /// Envelopes sent while disconnected are dropped.
    pub async fn send(&self, request: ClientRequest) {
        let outbound = self.outbound.lock().await.clone();
        let Some(outbound) = outbound else {
            debug!(
                room_id = %request.room_id(),
                "transport: dropping envelope while disconnected"
            );
            return;
        };
        if outbound.send(request).await.is_err() {
            debug!("transport: link closed before envelope was written");
        }
    }

    async fn supervise(
        self: Arc<Self>,
        credential: Credential,
        mut pending: Option<TransportLink>,
        mut failures: u32,
    ) {
        loop {
            let link = match pending.take() {
                Some(link) => link,
                None => {
                    if failures > 0 {
                        let delay = self.backoff.delay(failures - 1);
                        debug!(attempt = failures, ?delay, "transport: waiting before redial");
                        tokio::time::sleep(delay).await;
                    }
                    self.set_state(ConnectionState::Connecting);
                    match self.connector.open(&credential).await {
                        Ok(link) => link,
                        Err(ChatError::Auth(reason)) => {
                            warn!("transport: credential rejected on redial: {reason}");
                            self.set_state(ConnectionState::Disconnected);
                            let _ = self.events.send(TransportEvent::AuthRejected(reason));
                            return;
                        }
                        Err(err) => {
                            failures = failures.saturating_add(1);
                            warn!(attempt = failures, "transport: connect failed: {err}");
                            self.set_state(ConnectionState::Disconnected);
                            continue;
                        }
                    }
                }
            };

            self.pump(link).await;
            failures = 1;
        }
    }

    async fn pump(&self, link: TransportLink) {
        let TransportLink {
            outbound,
            mut inbound,
        } = link;
        *self.outbound.lock().await = Some(outbound);
        self.set_state(ConnectionState::Connected);

        while let Some(event) = inbound.recv().await {
            let _ = self.events.send(TransportEvent::Server(event));
        }

        self.outbound.lock().await.take();
        self.set_state(ConnectionState::Disconnected);
    }

    fn set_state(&self, next: ConnectionState) {
        let mut previous = next;
        let changed = self.state.send_if_modified(|current| {
            previous = *current;
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if !changed {
            return;
        }

        match (previous, next) {
            (_, ConnectionState::Connected) => {
                info!("transport: connected");
                let _ = self.events.send(TransportEvent::Connected);
            }
            (ConnectionState::Connected, _) => {
                info!("transport: disconnected");
                let _ = self.events.send(TransportEvent::Disconnected);
            }
            _ => {}
        }
    }
}

pub struct TopicSubscription {
    topic: Topic,
    receiver: broadcast::Receiver<TransportEvent>,
}

impl TopicSubscription {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub async fn recv(&mut self) -> Option<TransportEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.topic() == self.topic => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(topic = ?self.topic, skipped, "transport: subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

pub struct WebSocketConnector {
    endpoint: Url,
}

impl WebSocketConnector {
    pub fn new(endpoint: Url) -> Self {
        Self { endpoint }
    }

    pub fn from_server_url(server_url: &str, ws_path: &str) -> Result<Self> {
        let base = if let Some(rest) = server_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = server_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else if server_url.starts_with("ws://") || server_url.starts_with("wss://") {
            server_url.to_string()
        } else {
            return Err(ChatError::Connection(format!(
                "server_url must start with http:// or https://: {server_url}"
            )));
        };
        let endpoint = Url::parse(&format!("{}{ws_path}", base.trim_end_matches('/')))
            .map_err(|err| ChatError::Connection(format!("invalid websocket url: {err}")))?;
        Ok(Self::new(endpoint))
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl TransportConnector for WebSocketConnector {
    async fn open(&self, credential: &Credential) -> Result<TransportLink> {
        let mut request = self
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|err| ChatError::Connection(format!("invalid websocket request: {err}")))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.expose()))
            .map_err(|_| ChatError::Auth("credential is not a valid header value".into()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (stream, _) = connect_async(request)
            .await
            .map_err(classify_handshake_error)?;
        let (mut writer, mut reader) = stream.split();
        let (link, peer) = link_pair(LINK_CAPACITY);
        let LinkPeer {
            inbound,
            mut outbound,
        } = peer;

        tokio::spawn(async move {
            while let Some(request) = outbound.recv().await {
                let text = match serde_json::to_string(&request) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!("transport: failed to encode envelope: {err}");
                        continue;
                    }
                };
                if let Err(err) = writer.send(Message::Text(text)).await {
                    warn!("transport: websocket send failed: {err}");
                    break;
                }
            }
            let _ = writer.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => {
                            if inbound.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!("transport: ignoring invalid server event: {err}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("transport: websocket receive failed: {err}");
                        break;
                    }
                }
            }
        });

        Ok(link)
    }
}

fn classify_handshake_error(err: WsError) -> ChatError {
    if let WsError::Http(response) = &err {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return ChatError::Auth(format!("websocket handshake rejected with {status}"));
        }
    }
    ChatError::Connection(format!("failed to connect websocket: {err}"))
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
