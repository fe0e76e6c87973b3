use std::sync::Arc;

use shared::{
    domain::{ParticipantId, RoomId},
    protocol::{
        ClientRequest, CreateThreadRequest, MessageContent, MessageRecord, Participant,
        ProductContext, ServerEvent, ThreadRecord,
    },
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, info, warn};

pub mod backend;
pub mod config;
pub mod error;
pub mod membership;
pub mod reconcile;
pub mod threads;
pub mod transport;
pub mod types;
pub mod typing;

pub use backend::{ChatBackend, HttpChatBackend};
pub use config::{load_settings, ClientSettings, SendRoute};
pub use error::{ChatError, Result};
pub use transport::{
    ConnectionState, ReconnectBackoff, TransportConnector, TransportEvent, TransportSession,
    WebSocketConnector,
};
pub use types::{ChatMessage, Credential, DeliveryState, LocalId, SessionContext};

use membership::RoomMembership;
use reconcile::{MessageLog, Reconciled};
use threads::ThreadList;
use types::OutboundDraft;
use typing::TypingPresence;

const CLIENT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    ConnectionChanged(ConnectionState),
    MessagesChanged {
        room_id: RoomId,
    },
    HistoryFailed {
        room_id: RoomId,
        error: ChatError,
    },
    SendFailed {
        room_id: RoomId,
        local_id: LocalId,
        reason: String,
    },
    ThreadsChanged,
    RemoteTypingChanged {
        room_id: RoomId,
        typing: Vec<ParticipantId>,
    },
    SessionExpired(String),
    Error(String),
}

struct ChatState {
    membership: RoomMembership,
    log: MessageLog,
    typing: TypingPresence,
    threads: ThreadList,
    typing_timer: Option<JoinHandle<()>>,
    presence_timer: Option<JoinHandle<()>>,
}

impl ChatState {
    fn stop_typing(&mut self) -> Option<ClientRequest> {
        if let Some(timer) = self.typing_timer.take() {
            timer.abort();
        }
        self.typing.stop()
    }
}

pub struct ChatClient {
    context: SessionContext,
    settings: ClientSettings,
    backend: Arc<dyn ChatBackend>,
    transport: Arc<TransportSession>,
    inner: Mutex<ChatState>,
    events: broadcast::Sender<ClientEvent>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ChatClient {
    pub fn new(
        context: SessionContext,
        settings: ClientSettings,
        backend: Arc<dyn ChatBackend>,
        connector: Arc<dyn TransportConnector>,
    ) -> Arc<Self> {
        let backoff = ReconnectBackoff::new(settings.reconnect_initial(), settings.reconnect_max());
        let transport = TransportSession::new(connector, backoff);
        let me = context.participant_id.clone();
        let state = ChatState {
            membership: RoomMembership::new(),
            log: MessageLog::new(me.clone()),
            typing: TypingPresence::new(
                me.clone(),
                settings.typing_idle(),
                settings.typing_display(),
            ),
            threads: ThreadList::new(me),
            typing_timer: None,
            presence_timer: None,
        };
        let (events, _) = broadcast::channel(CLIENT_EVENT_CAPACITY);

        Arc::new(Self {
            context,
            settings,
            backend,
            transport,
            inner: Mutex::new(state),
            events,
            pump: Mutex::new(None),
        })
    }

    pub fn me(&self) -> &ParticipantId {
        &self.context.participant_id
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn transport(&self) -> &Arc<TransportSession> {
        &self.transport
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.transport.state()
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut pump = self.pump.lock().await;
            if pump.as_ref().map_or(true, |task| task.is_finished()) {
                let receiver = self.transport.subscribe();
                let client = Arc::clone(self);
                *pump = Some(tokio::spawn(client.run_pump(receiver)));
            }
        }

        let result = self
            .transport
            .connect(self.context.credential.clone())
            .await;
        if let Err(err) = &result {
            self.report_auth(err);
        }
        result
    }

    pub async fn shutdown(&self) {
        if let Some(task) = self.pump.lock().await.take() {
            task.abort();
        }
        {
            let mut state = self.inner.lock().await;
            if let Some(timer) = state.presence_timer.take() {
                timer.abort();
            }
            if let Some(stop) = state.stop_typing() {
                self.transport.send(stop).await;
            }
        }
        self.transport.disconnect().await;
        info!("chat: session closed");
    }

    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.inner.lock().await.log.messages().to_vec()
    }

    pub async fn focused_room(&self) -> Option<RoomId> {
        self.inner.lock().await.membership.focused().cloned()
    }

    pub async fn threads(&self) -> Vec<ThreadRecord> {
        self.inner.lock().await.threads.threads().to_vec()
    }

    pub async fn filter_threads(&self, query: &str) -> Vec<ThreadRecord> {
        self.inner
            .lock()
            .await
            .threads
            .filter(query)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn contacts(&self) -> Vec<Participant> {
        self.inner
            .lock()
            .await
            .threads
            .contacts()
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn total_unread(&self) -> u32 {
        self.inner.lock().await.threads.total_unread()
    }

    pub async fn remote_typing(&self) -> Vec<ParticipantId> {
        let state = self.inner.lock().await;
        match state.membership.focused() {
            Some(room_id) => state.typing.remote_typists(room_id, Instant::now()),
            None => Vec::new(),
        }
    }

    pub async fn load_threads(&self) -> Result<()> {
        let (threads, directory) = tokio::join!(
            self.backend.fetch_threads(),
            self.backend.fetch_directory()
        );
        let threads = threads.inspect_err(|err| {
            warn!("chat: thread list fetch failed: {err}");
            self.report_auth(err);
        })?;

        {
            let mut state = self.inner.lock().await;
            state.threads.replace_all(threads);
            if let Some(room_id) = state.membership.focused().cloned() {
                state.threads.mark_read(&room_id);
            }
            match directory {
                Ok(participants) => state.threads.set_directory(participants),
                Err(err) => {
                    warn!("chat: participant directory fetch failed: {err}");
                    state.threads.set_directory(Vec::new());
                }
            }
        }
        self.emit(ClientEvent::ThreadsChanged);
        Ok(())
    }

    pub async fn focus_room(&self, room_id: RoomId) -> Result<()> {
        let epoch = {
            let mut state = self.inner.lock().await;
            let requests = state.membership.focus(room_id.clone());
            if requests.is_empty() {
                debug!(%room_id, "chat: room already focused");
                return Ok(());
            }

            let stop = state.stop_typing();
            let epoch = state.log.reset(room_id.clone());
            state.typing.clear_remote();
            state.threads.mark_read(&room_id);

            if let Some(stop) = stop {
                self.transport.send(stop).await;
            }
            for request in requests {
                self.transport.send(request).await;
            }
            self.transport
                .send(ClientRequest::MarkRead {
                    room_id: room_id.clone(),
                })
                .await;
            epoch
        };

        info!(%room_id, "chat: focused room");
        self.emit(ClientEvent::MessagesChanged {
            room_id: room_id.clone(),
        });
        self.emit(ClientEvent::ThreadsChanged);
        self.load_history(room_id, epoch).await
    }

    pub async fn blur(&self) {
        let room_id = {
            let mut state = self.inner.lock().await;
            let requests = state.membership.blur();
            if requests.is_empty() {
                return;
            }
            let stop = state.stop_typing();
            let room_id = state.log.room_id().cloned();
            state.log.clear();
            state.typing.clear_remote();

            if let Some(stop) = stop {
                self.transport.send(stop).await;
            }
            for request in requests {
                self.transport.send(request).await;
            }
            room_id
        };

        if let Some(room_id) = room_id {
            info!(%room_id, "chat: left room");
            self.emit(ClientEvent::MessagesChanged { room_id });
        }
    }

    pub async fn refresh_history(&self) -> Result<()> {
        let (room_id, epoch) = {
            let mut state = self.inner.lock().await;
            let room_id = state
                .log
                .room_id()
                .cloned()
                .ok_or(ChatError::NoFocusedRoom)?;
            (room_id, state.log.begin_resync())
        };
        self.load_history(room_id, epoch).await
    }

    /// The returned id stays valid until the message is confirmed.
    pub async fn send_text(self: &Arc<Self>, text: impl Into<String>) -> Result<LocalId> {
        self.send_content(MessageContent::Text(text.into())).await
    }

    pub async fn send_product(self: &Arc<Self>, product: ProductContext) -> Result<LocalId> {
        self.send_content(MessageContent::Product(product)).await
    }

    async fn send_content(self: &Arc<Self>, content: MessageContent) -> Result<LocalId> {
        let draft = {
            let mut state = self.inner.lock().await;
            let draft = state
                .log
                .send_local(content)
                .ok_or(ChatError::NoFocusedRoom)?;
            if let Some(stop) = state.stop_typing() {
                self.transport.send(stop).await;
            }
            draft
        };

        debug!(room_id = %draft.message.room_id, local_id = %draft.local_id, "chat: queued send");
        self.emit(ClientEvent::MessagesChanged {
            room_id: draft.message.room_id.clone(),
        });
        self.dispatch(draft).await
    }

    pub async fn retry(self: &Arc<Self>, local_id: LocalId) -> Result<()> {
        let draft = self
            .inner
            .lock()
            .await
            .log
            .retry(local_id)
            .ok_or(ChatError::UnknownLocalMessage(local_id))?;

        info!(%local_id, "chat: retrying send");
        self.emit(ClientEvent::MessagesChanged {
            room_id: draft.message.room_id.clone(),
        });
        self.dispatch(draft).await.map(|_| ())
    }

    pub async fn discard(&self, local_id: LocalId) -> Result<()> {
        let room_id = {
            let mut state = self.inner.lock().await;
            if !state.log.discard(local_id) {
                return Err(ChatError::UnknownLocalMessage(local_id));
            }
            state.log.room_id().cloned()
        };
        if let Some(room_id) = room_id {
            self.emit(ClientEvent::MessagesChanged { room_id });
        }
        Ok(())
    }

    /// Call on every edit of the composer.
    pub async fn input_changed(self: &Arc<Self>) -> Result<()> {
        let mut state = self.inner.lock().await;
        let room_id = state
            .membership
            .focused()
            .cloned()
            .ok_or(ChatError::NoFocusedRoom)?;

        for request in state.typing.on_input(&room_id, Instant::now()) {
            self.transport.send(request).await;
        }
        if state.typing_timer.is_none() {
            let client = Arc::clone(self);
            state.typing_timer = Some(tokio::spawn(client.run_typing_timer()));
        }
        Ok(())
    }

    pub async fn open_thread_with(
        &self,
        participant_id: ParticipantId,
        product_context: Option<ProductContext>,
    ) -> Result<RoomId> {
        let existing = {
            let state = self.inner.lock().await;
            state
                .threads
                .threads()
                .iter()
                .find(|thread| {
                    thread
                        .counterpart(self.me())
                        .is_some_and(|participant| participant.id == participant_id)
                })
                .map(|thread| thread.id.clone())
        };

        let room_id = match existing {
            Some(room_id) => room_id,
            None => {
                let request = CreateThreadRequest {
                    participant_id,
                    product_context,
                };
                let thread = self
                    .backend
                    .create_thread(&request)
                    .await
                    .inspect_err(|err| self.report_auth(err))?;
                let room_id = thread.id.clone();
                info!(%room_id, "chat: created thread");
                self.inner.lock().await.threads.upsert(thread);
                self.emit(ClientEvent::ThreadsChanged);
                room_id
            }
        };

        self.focus_room(room_id.clone()).await?;
        Ok(room_id)
    }

    async fn dispatch(self: &Arc<Self>, draft: OutboundDraft) -> Result<LocalId> {
        let local_id = draft.local_id;
        match self.settings.send_route {
            SendRoute::Socket => {
                if self.transport.state() != ConnectionState::Connected {
                    let reason = "not connected".to_string();
                    self.fail_pending(&draft.message.room_id, local_id, reason.clone())
                        .await;
                    return Err(ChatError::Send(reason));
                }
                self.transport
                    .send(ClientRequest::SendMessage(draft.message))
                    .await;
            }
            SendRoute::Rest => {
                let client = Arc::clone(self);
                tokio::spawn(async move {
                    match client.backend.post_message(&draft.message).await {
                        Ok(record) => client.apply_remote_message(record).await,
                        Err(err) => {
                            client.report_auth(&err);
                            client
                                .fail_pending(&draft.message.room_id, local_id, err.to_string())
                                .await;
                        }
                    }
                });
            }
        }
        Ok(local_id)
    }

    async fn fail_pending(&self, room_id: &RoomId, local_id: LocalId, reason: String) {
        let marked = self.inner.lock().await.log.mark_failed(local_id);
        if marked {
            warn!(%room_id, %local_id, "chat: send failed: {reason}");
            self.emit(ClientEvent::MessagesChanged {
                room_id: room_id.clone(),
            });
            self.emit(ClientEvent::SendFailed {
                room_id: room_id.clone(),
                local_id,
                reason,
            });
        }
    }

    async fn load_history(&self, room_id: RoomId, epoch: u64) -> Result<()> {
        match self.backend.fetch_history(&room_id).await {
            Ok(records) => {
                let applied = self.inner.lock().await.log.apply_history(epoch, records);
                if applied {
                    self.emit(ClientEvent::MessagesChanged { room_id });
                } else {
                    debug!(%room_id, epoch, "chat: discarded stale history");
                }
                Ok(())
            }
            Err(err) => {
                warn!(%room_id, "chat: history fetch failed: {err}");
                self.report_auth(&err);
                let current = self.inner.lock().await.log.epoch() == epoch;
                if current {
                    self.emit(ClientEvent::HistoryFailed {
                        room_id,
                        error: err.clone(),
                    });
                }
                Err(err)
            }
        }
    }

    async fn run_pump(self: Arc<Self>, mut receiver: broadcast::Receiver<TransportEvent>) {
        loop {
            match receiver.recv().await {
                Ok(event) => self.handle_transport_event(event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "chat: event pump lagged, resyncing");
                    self.resync(Vec::new());
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    async fn handle_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                self.emit(ClientEvent::ConnectionChanged(ConnectionState::Connected));
                self.rejoin().await;
            }
            TransportEvent::Disconnected => {
                let focused = {
                    let mut state = self.inner.lock().await;
                    state.typing.clear_remote();
                    state.membership.focused().cloned()
                };
                self.emit(ClientEvent::ConnectionChanged(ConnectionState::Disconnected));
                if let Some(room_id) = focused {
                    self.emit(ClientEvent::RemoteTypingChanged {
                        room_id,
                        typing: Vec::new(),
                    });
                }
            }
            TransportEvent::AuthRejected(reason) => {
                warn!("chat: session expired: {reason}");
                self.emit(ClientEvent::SessionExpired(reason));
            }
            TransportEvent::Server(event) => self.handle_server_event(event).await,
        }
    }

    async fn rejoin(self: &Arc<Self>) {
        let stranded = {
            let state = self.inner.lock().await;
            let requests = state.membership.on_reconnected();
            if let Some(room_id) = state.membership.focused() {
                info!(%room_id, "chat: rejoining focused room");
            }
            for request in requests {
                self.transport.send(request).await;
            }
            // Socket sends still pending went out on the dropped link.
            match self.settings.send_route {
                SendRoute::Socket => state.log.pending_ids(),
                SendRoute::Rest => Vec::new(),
            }
        };
        self.resync(stranded);
    }

    fn resync(self: &Arc<Self>, stranded: Vec<LocalId>) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let history = {
                let mut state = client.inner.lock().await;
                state
                    .log
                    .room_id()
                    .cloned()
                    .map(|room_id| (room_id, state.log.begin_resync()))
            };
            if let Some((room_id, epoch)) = history {
                let _ = client.load_history(room_id.clone(), epoch).await;
                for local_id in stranded {
                    let reason = "connection lost before delivery".to_string();
                    client.fail_pending(&room_id, local_id, reason).await;
                }
            }
            if let Err(err) = client.load_threads().await {
                debug!("chat: thread resync failed: {err}");
            }
        });
    }

    async fn handle_server_event(self: &Arc<Self>, event: ServerEvent) {
        match event {
            ServerEvent::MessageReceived { room_id, message } => {
                if message.room_id != room_id {
                    warn!(%room_id, message_room = %message.room_id, "chat: envelope room does not match message");
                }
                self.apply_remote_message(message).await;
            }
            ServerEvent::TypingStarted {
                room_id,
                participant_id,
            } => {
                let typing = {
                    let mut state = self.inner.lock().await;
                    if !state.membership.is_focused(&room_id) {
                        return;
                    }
                    let now = Instant::now();
                    let before = state.typing.remote_typists(&room_id, now);
                    state.typing.remote_started(&room_id, &participant_id, now);
                    let after = state.typing.remote_typists(&room_id, now);
                    if state.presence_timer.is_none() && state.typing.next_remote_expiry().is_some()
                    {
                        let client = Arc::clone(self);
                        state.presence_timer = Some(tokio::spawn(client.run_presence_timer()));
                    }
                    (before != after).then_some(after)
                };
                if let Some(typing) = typing {
                    self.emit(ClientEvent::RemoteTypingChanged { room_id, typing });
                }
            }
            ServerEvent::TypingStopped {
                room_id,
                participant_id,
            } => {
                let typing = {
                    let mut state = self.inner.lock().await;
                    let now = Instant::now();
                    let before = state.typing.remote_typists(&room_id, now);
                    state.typing.remote_stopped(&room_id, &participant_id);
                    let after = state.typing.remote_typists(&room_id, now);
                    (before != after).then_some(after)
                };
                if let Some(typing) = typing {
                    self.emit(ClientEvent::RemoteTypingChanged { room_id, typing });
                }
            }
            ServerEvent::ThreadUpdated { thread } => {
                let changed = {
                    let mut state = self.inner.lock().await;
                    let room_id = thread.id.clone();
                    let changed = state.threads.upsert(thread);
                    if changed && state.membership.is_focused(&room_id) {
                        state.threads.mark_read(&room_id);
                    }
                    changed
                };
                if changed {
                    self.emit(ClientEvent::ThreadsChanged);
                }
            }
            ServerEvent::SendRejected {
                room_id,
                client_token,
                error,
            } => {
                let failed = self
                    .inner
                    .lock()
                    .await
                    .log
                    .mark_failed_by_token(client_token);
                match failed {
                    Some(local_id) => {
                        warn!(%room_id, %local_id, "chat: send rejected: {}", error.message);
                        self.emit(ClientEvent::MessagesChanged {
                            room_id: room_id.clone(),
                        });
                        self.emit(ClientEvent::SendFailed {
                            room_id,
                            local_id,
                            reason: error.message.clone(),
                        });
                    }
                    None => debug!(%room_id, %client_token, "chat: rejection for unknown send"),
                }
                if error.is_auth() {
                    self.emit(ClientEvent::SessionExpired(error.message));
                }
            }
            ServerEvent::Error(error) => {
                warn!("chat: server error: {error}");
                if error.is_auth() {
                    self.emit(ClientEvent::SessionExpired(error.message));
                } else {
                    self.emit(ClientEvent::Error(error.to_string()));
                }
            }
        }
    }

    async fn apply_remote_message(self: &Arc<Self>, record: MessageRecord) {
        let room_id = record.room_id.clone();
        let (log_changed, known_thread, typing) = {
            let mut state = self.inner.lock().await;
            let focused = state.membership.is_focused(&room_id);
            let known_thread = state.threads.apply_message(&record, focused);

            let now = Instant::now();
            let typing = if focused
                && state
                    .typing
                    .remote_typists(&room_id, now)
                    .contains(&record.sender_id)
            {
                state.typing.remote_stopped(&room_id, &record.sender_id);
                Some(state.typing.remote_typists(&room_id, now))
            } else {
                None
            };

            let log_changed = state.log.reconcile(record) != Reconciled::Ignored;
            (log_changed, known_thread, typing)
        };

        if log_changed {
            self.emit(ClientEvent::MessagesChanged {
                room_id: room_id.clone(),
            });
        }
        if let Some(typing) = typing {
            self.emit(ClientEvent::RemoteTypingChanged {
                room_id: room_id.clone(),
                typing,
            });
        }
        if known_thread {
            self.emit(ClientEvent::ThreadsChanged);
        } else {
            let client = Arc::clone(self);
            tokio::spawn(async move { client.fetch_missing_thread(room_id).await });
        }
    }

    async fn fetch_missing_thread(&self, room_id: RoomId) {
        debug!(%room_id, "chat: fetching unknown thread");
        match self.backend.fetch_thread(&room_id).await {
            Ok(thread) => {
                let changed = {
                    let mut state = self.inner.lock().await;
                    let changed = state.threads.upsert(thread);
                    if changed && state.membership.is_focused(&room_id) {
                        state.threads.mark_read(&room_id);
                    }
                    changed
                };
                if changed {
                    self.emit(ClientEvent::ThreadsChanged);
                }
            }
            Err(err) => {
                warn!(%room_id, "chat: thread fetch failed: {err}");
                self.report_auth(&err);
            }
        }
    }

    async fn run_typing_timer(self: Arc<Self>) {
        loop {
            let deadline = {
                let mut state = self.inner.lock().await;
                match state.typing.deadline() {
                    Some(deadline) => deadline,
                    None => {
                        state.typing_timer = None;
                        return;
                    }
                }
            };
            tokio::time::sleep_until(deadline).await;

            let mut state = self.inner.lock().await;
            if let Some(stop) = state.typing.on_idle(Instant::now()) {
                debug!(room_id = %stop.room_id(), "chat: typing went idle");
                state.typing_timer = None;
                self.transport.send(stop).await;
                return;
            }
        }
    }

    async fn run_presence_timer(self: Arc<Self>) {
        loop {
            let next = {
                let mut state = self.inner.lock().await;
                match state.typing.next_remote_expiry() {
                    Some(next) => next,
                    None => {
                        state.presence_timer = None;
                        return;
                    }
                }
            };
            tokio::time::sleep_until(next).await;

            let cleared = self.inner.lock().await.typing.prune(Instant::now());
            for room_id in cleared {
                self.emit(ClientEvent::RemoteTypingChanged {
                    room_id,
                    typing: Vec::new(),
                });
            }
        }
    }

    fn report_auth(&self, err: &ChatError) {
        if let ChatError::Auth(reason) = err {
            self.emit(ClientEvent::SessionExpired(reason.clone()));
        }
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
