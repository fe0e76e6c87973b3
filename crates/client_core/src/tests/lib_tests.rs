use std::{
    collections::{HashMap, HashSet},
    sync::Mutex as StdMutex,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use shared::{
    domain::{ClientToken, MessageId},
    error::{ApiError, ErrorCode},
    protocol::OutgoingMessage,
};
use tokio::{
    sync::{mpsc, oneshot},
    time::timeout,
};

use super::*;
use crate::transport::{link_pair, LinkPeer, TransportLink, EVENT_CAPACITY};

fn me() -> ParticipantId {
    ParticipantId::new("staff-1")
}

fn room(id: &str) -> RoomId {
    RoomId::new(id)
}

fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 9, minute, 0).unwrap()
}

fn participant(id: &str, name: &str) -> Participant {
    Participant {
        id: ParticipantId::new(id),
        name: name.into(),
        avatar_url: None,
    }
}

fn thread(id: &str, with: &str, minute: u32) -> ThreadRecord {
    ThreadRecord {
        id: room(id),
        participants: vec![participant("staff-1", "Support"), participant(with, with)],
        last_message: None,
        unread_count: 0,
        product_context: None,
        updated_at: at(minute),
    }
}

fn record(id: &str, room_id: &str, sender: &str, text: &str) -> MessageRecord {
    MessageRecord {
        id: MessageId::new(id),
        room_id: room(room_id),
        sender_id: ParticipantId::new(sender),
        sender_name: None,
        content: MessageContent::text(text),
        created_at: at(30),
        client_token: None,
    }
}

#[derive(Default)]
struct MockBackend {
    threads: StdMutex<Vec<ThreadRecord>>,
    single_threads: StdMutex<HashMap<RoomId, ThreadRecord>>,
    directory: StdMutex<Vec<Participant>>,
    history: StdMutex<HashMap<RoomId, Vec<MessageRecord>>>,
    history_gates: StdMutex<HashMap<RoomId, oneshot::Receiver<()>>>,
    failing_history: StdMutex<HashSet<RoomId>>,
    history_calls: StdMutex<Vec<RoomId>>,
    failing_directory: StdMutex<bool>,
    fail_posts: StdMutex<bool>,
    posted: StdMutex<Vec<OutgoingMessage>>,
    created: StdMutex<Vec<CreateThreadRequest>>,
}

impl MockBackend {
    fn with_threads(threads: Vec<ThreadRecord>) -> Self {
        let backend = Self::default();
        *backend.threads.lock().expect("lock") = threads;
        backend
    }

    fn gate_history(&self, room_id: &str) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.history_gates
            .lock()
            .expect("lock")
            .insert(room(room_id), rx);
        tx
    }

    fn history_calls(&self) -> Vec<RoomId> {
        self.history_calls.lock().expect("lock").clone()
    }
}

#[async_trait]
impl ChatBackend for MockBackend {
    async fn fetch_threads(&self) -> Result<Vec<ThreadRecord>> {
        Ok(self.threads.lock().expect("lock").clone())
    }

    async fn fetch_thread(&self, room_id: &RoomId) -> Result<ThreadRecord> {
        self.single_threads
            .lock()
            .expect("lock")
            .get(room_id)
            .cloned()
            .ok_or_else(|| ChatError::Fetch(format!("404 {room_id}")))
    }

    async fn fetch_history(&self, room_id: &RoomId) -> Result<Vec<MessageRecord>> {
        self.history_calls.lock().expect("lock").push(room_id.clone());
        let gate = self.history_gates.lock().expect("lock").remove(room_id);
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        if self.failing_history.lock().expect("lock").contains(room_id) {
            return Err(ChatError::Fetch("503 Service Unavailable".into()));
        }
        Ok(self
            .history
            .lock()
            .expect("lock")
            .get(room_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_directory(&self) -> Result<Vec<Participant>> {
        if *self.failing_directory.lock().expect("lock") {
            return Err(ChatError::Fetch("500 Internal Server Error".into()));
        }
        Ok(self.directory.lock().expect("lock").clone())
    }

    async fn post_message(&self, message: &OutgoingMessage) -> Result<MessageRecord> {
        if *self.fail_posts.lock().expect("lock") {
            return Err(ChatError::Send("503 Service Unavailable".into()));
        }
        let mut posted = self.posted.lock().expect("lock");
        posted.push(message.clone());
        Ok(MessageRecord {
            id: MessageId::new(format!("srv-{}", posted.len())),
            room_id: message.room_id.clone(),
            sender_id: me(),
            sender_name: Some("Support".into()),
            content: message.content.clone(),
            created_at: at(31),
            client_token: Some(message.client_token),
        })
    }

    async fn create_thread(&self, request: &CreateThreadRequest) -> Result<ThreadRecord> {
        self.created.lock().expect("lock").push(request.clone());
        let mut created = thread("chat_created", request.participant_id.as_str(), 40);
        created.product_context = request.product_context.clone();
        Ok(created)
    }
}

struct MockConnector {
    reject: bool,
    peers: mpsc::UnboundedSender<LinkPeer>,
}

#[async_trait]
impl TransportConnector for MockConnector {
    async fn open(&self, _credential: &Credential) -> Result<TransportLink> {
        if self.reject {
            return Err(ChatError::Auth("401 Unauthorized".into()));
        }
        let (link, peer) = link_pair(64);
        self.peers
            .send(peer)
            .map_err(|_| ChatError::Connection("test finished".into()))?;
        Ok(link)
    }
}

fn settings(route: SendRoute) -> ClientSettings {
    ClientSettings {
        reconnect_initial_ms: 10,
        reconnect_max_ms: 50,
        send_route: route,
        ..ClientSettings::default()
    }
}

fn client_with(
    backend: Arc<MockBackend>,
    route: SendRoute,
    reject: bool,
) -> (Arc<ChatClient>, mpsc::UnboundedReceiver<LinkPeer>) {
    let (peers_tx, peers) = mpsc::unbounded_channel();
    let connector = Arc::new(MockConnector {
        reject,
        peers: peers_tx,
    });
    let context = SessionContext::new(Credential::new("staff-token"), me());
    let client = ChatClient::new(context, settings(route), backend, connector);
    (client, peers)
}

struct Harness {
    client: Arc<ChatClient>,
    backend: Arc<MockBackend>,
    peer: LinkPeer,
    peers: mpsc::UnboundedReceiver<LinkPeer>,
    events: broadcast::Receiver<ClientEvent>,
}

impl Harness {
    /// Connected, with the post-connect sidebar refresh already applied.
    async fn start(backend: MockBackend, route: SendRoute) -> Self {
        let backend = Arc::new(backend);
        let (client, mut peers) = client_with(backend.clone(), route, false);
        let mut events = client.subscribe_events();
        client.start().await.expect("start");
        let peer = peers.recv().await.expect("peer");

        wait_for(&mut events, |event| {
            event == &ClientEvent::ConnectionChanged(ConnectionState::Connected)
        })
        .await;
        wait_for(&mut events, |event| event == &ClientEvent::ThreadsChanged).await;
        Self {
            client,
            backend,
            peer,
            peers,
            events,
        }
    }

    fn sent(&mut self) -> Vec<ClientRequest> {
        let mut sent = Vec::new();
        while let Ok(request) = self.peer.outbound.try_recv() {
            sent.push(request);
        }
        sent
    }

    async fn push(&self, event: ServerEvent) {
        self.peer.inbound.send(event).await.expect("client listening");
    }

    async fn wait_for(&mut self, matches: impl Fn(&ClientEvent) -> bool) -> ClientEvent {
        wait_for(&mut self.events, matches).await
    }

    async fn wait_messages(&mut self, done: impl Fn(&[ChatMessage]) -> bool) -> Vec<ChatMessage> {
        loop {
            let messages = self.client.messages().await;
            if done(&messages) {
                return messages;
            }
            self.wait_for(|event| matches!(event, ClientEvent::MessagesChanged { .. }))
                .await;
        }
    }

    async fn wait_threads(&mut self, done: impl Fn(&[ThreadRecord]) -> bool) -> Vec<ThreadRecord> {
        loop {
            let threads = self.client.threads().await;
            if done(&threads) {
                return threads;
            }
            self.wait_for(|event| event == &ClientEvent::ThreadsChanged)
                .await;
        }
    }
}

async fn wait_for(
    events: &mut broadcast::Receiver<ClientEvent>,
    matches: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) => {}
                Err(err) => panic!("client event stream failed: {err}"),
            }
        }
    })
    .await
    .expect("client event in time")
}

#[tokio::test]
async fn clicking_another_room_twice_sends_one_leave_and_one_join() {
    let mut harness = Harness::start(MockBackend::default(), SendRoute::Rest).await;

    harness.client.focus_room(room("chat_42")).await.expect("focus");
    assert_eq!(
        harness.sent(),
        vec![
            ClientRequest::Join {
                room_id: room("chat_42")
            },
            ClientRequest::MarkRead {
                room_id: room("chat_42")
            },
        ]
    );

    harness.client.focus_room(room("chat_77")).await.expect("focus");
    harness.client.focus_room(room("chat_77")).await.expect("refocus");

    assert_eq!(
        harness.sent(),
        vec![
            ClientRequest::Leave {
                room_id: room("chat_42")
            },
            ClientRequest::Join {
                room_id: room("chat_77")
            },
            ClientRequest::MarkRead {
                room_id: room("chat_77")
            },
        ]
    );
    assert_eq!(harness.client.focused_room().await, Some(room("chat_77")));
    assert_eq!(
        harness.backend.history_calls(),
        vec![room("chat_42"), room("chat_77")]
    );
}

#[tokio::test]
async fn reconnect_rejoins_focused_room_without_user_action() {
    let mut harness = Harness::start(MockBackend::default(), SendRoute::Rest).await;
    harness.client.focus_room(room("chat_5")).await.expect("focus");
    harness.sent();

    let Harness {
        peer,
        mut peers,
        mut events,
        ..
    } = harness;
    drop(peer);
    wait_for(&mut events, |event| {
        event == &ClientEvent::ConnectionChanged(ConnectionState::Disconnected)
    })
    .await;

    let mut peer = timeout(Duration::from_secs(5), peers.recv())
        .await
        .expect("redial in time")
        .expect("peer");
    wait_for(&mut events, |event| {
        event == &ClientEvent::ConnectionChanged(ConnectionState::Connected)
    })
    .await;

    let rejoin = timeout(Duration::from_secs(5), async {
        let join = peer.outbound.recv().await;
        let mark_read = peer.outbound.recv().await;
        (join, mark_read)
    })
    .await
    .expect("rejoin in time");
    assert_eq!(
        rejoin,
        (
            Some(ClientRequest::Join {
                room_id: room("chat_5")
            }),
            Some(ClientRequest::MarkRead {
                room_id: room("chat_5")
            }),
        )
    );
}

#[tokio::test]
async fn lagging_event_pump_refetches_focused_history() {
    let harness = Harness::start(MockBackend::default(), SendRoute::Rest).await;
    harness.client.focus_room(room("chat_1")).await.expect("focus");
    assert_eq!(harness.backend.history_calls(), vec![room("chat_1")]);

    let guard = harness.client.inner.lock().await;
    for _ in 0..EVENT_CAPACITY + 300 {
        harness
            .push(ServerEvent::TypingStopped {
                room_id: room("chat_other"),
                participant_id: ParticipantId::new("u9"),
            })
            .await;
    }
    drop(guard);

    timeout(Duration::from_secs(5), async {
        while harness.backend.history_calls().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("history refetched after lag");
    assert_eq!(
        harness.backend.history_calls(),
        vec![room("chat_1"), room("chat_1")]
    );
}

#[tokio::test]
async fn socket_sends_lost_with_the_link_fail_after_reconnect() {
    let harness = Harness::start(MockBackend::default(), SendRoute::Socket).await;
    harness.client.focus_room(room("chat_1")).await.expect("focus");
    let lost = harness.client.send_text("lost").await.expect("send");
    harness.client.send_text("arrived").await.expect("send");
    harness.backend.history.lock().expect("lock").insert(
        room("chat_1"),
        vec![record("m7", "chat_1", "staff-1", "arrived")],
    );

    let Harness {
        client,
        peer,
        mut peers,
        mut events,
        ..
    } = harness;
    drop(peer);
    let mut peer = timeout(Duration::from_secs(5), peers.recv())
        .await
        .expect("redial in time")
        .expect("peer");

    let failed = wait_for(&mut events, |event| {
        matches!(event, ClientEvent::SendFailed { .. })
    })
    .await;
    assert_eq!(
        failed,
        ClientEvent::SendFailed {
            room_id: room("chat_1"),
            local_id: lost,
            reason: "connection lost before delivery".into(),
        }
    );
    let messages = client.messages().await;
    let states: Vec<_> = messages
        .iter()
        .map(|m| (m.content.clone(), m.delivery))
        .collect();
    assert_eq!(
        states,
        vec![
            (MessageContent::text("arrived"), DeliveryState::Confirmed),
            (MessageContent::text("lost"), DeliveryState::Failed),
        ]
    );
    let token = messages[1].client_token;

    client.retry(lost).await.expect("retry");
    let resent = timeout(Duration::from_secs(5), async {
        loop {
            match peer.outbound.recv().await {
                Some(ClientRequest::SendMessage(message)) => return message,
                Some(_) => {}
                None => panic!("link closed"),
            }
        }
    })
    .await
    .expect("resend in time");
    assert_eq!(Some(resent.client_token), token);
}

#[tokio::test]
async fn rest_ack_and_push_echo_leave_one_confirmed_entry() {
    let backend = MockBackend::with_threads(vec![thread("chat_42", "u9", 0)]);
    let mut harness = Harness::start(backend, SendRoute::Rest).await;
    harness.client.focus_room(room("chat_42")).await.expect("focus");

    harness.client.send_text("Hello").await.expect("send");
    let pending = harness.client.messages().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].content, MessageContent::text("Hello"));

    let confirmed = harness
        .wait_messages(|messages| messages.iter().all(ChatMessage::is_confirmed))
        .await;
    assert_eq!(confirmed.len(), 1);
    assert_eq!(confirmed[0].id(), Some(&MessageId::new("srv-1")));

    // The push echo of the same send, without the client token.
    let mut echo = record("srv-1", "chat_42", "staff-1", "Hello");
    echo.created_at = at(31);
    harness
        .push(ServerEvent::MessageReceived {
            room_id: room("chat_42"),
            message: echo,
        })
        .await;
    harness
        .wait_for(|event| matches!(event, ClientEvent::MessagesChanged { .. }))
        .await;

    let messages = harness.client.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, MessageContent::text("Hello"));
    assert_eq!(messages[0].delivery, DeliveryState::Confirmed);
    let threads = harness.client.threads().await;
    assert_eq!(threads[0].unread_count, 0, "own messages are never unread");
    assert_eq!(
        threads[0].last_message.as_ref().map(|m| m.content.as_str()),
        Some("Hello")
    );
}

#[tokio::test]
async fn failed_rest_send_stays_visible_and_retry_reuses_token() {
    let backend = MockBackend::default();
    *backend.fail_posts.lock().expect("lock") = true;
    let mut harness = Harness::start(backend, SendRoute::Rest).await;
    harness.client.focus_room(room("chat_1")).await.expect("focus");

    let local_id = harness.client.send_text("are you there?").await.expect("queued");
    let failed = harness
        .wait_for(|event| matches!(event, ClientEvent::SendFailed { .. }))
        .await;
    assert_eq!(
        failed,
        ClientEvent::SendFailed {
            room_id: room("chat_1"),
            local_id,
            reason: "send failed: 503 Service Unavailable".into(),
        }
    );
    let messages = harness.client.messages().await;
    assert_eq!(messages[0].delivery, DeliveryState::Failed);
    let token = messages[0].client_token;

    *harness.backend.fail_posts.lock().expect("lock") = false;
    harness.client.retry(local_id).await.expect("retry");
    let messages = harness
        .wait_messages(|messages| messages.iter().all(ChatMessage::is_confirmed))
        .await;

    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].client_token, token);
    let posted = harness.backend.posted.lock().expect("lock").clone();
    assert_eq!(Some(posted[0].client_token), token);
    assert!(matches!(
        harness.client.retry(local_id).await,
        Err(ChatError::UnknownLocalMessage(_))
    ));
}

#[tokio::test]
async fn discard_removes_failed_message() {
    let backend = MockBackend::default();
    *backend.fail_posts.lock().expect("lock") = true;
    let mut harness = Harness::start(backend, SendRoute::Rest).await;
    harness.client.focus_room(room("chat_1")).await.expect("focus");

    let local_id = harness.client.send_text("typo").await.expect("queued");
    harness
        .wait_for(|event| matches!(event, ClientEvent::SendFailed { .. }))
        .await;

    harness.client.discard(local_id).await.expect("discard");
    assert!(harness.client.messages().await.is_empty());
    assert!(harness.client.discard(local_id).await.is_err());
}

#[tokio::test]
async fn socket_send_is_confirmed_by_echo_and_stops_typing_first() {
    let mut harness = Harness::start(MockBackend::default(), SendRoute::Socket).await;
    harness.client.focus_room(room("chat_1")).await.expect("focus");
    harness.sent();

    harness.client.input_changed().await.expect("typing");
    let local_id = harness.client.send_text("same").await.expect("send");
    harness.client.send_text("same").await.expect("send again");

    let sent = harness.sent();
    assert_eq!(
        sent[..2],
        [
            ClientRequest::Typing {
                room_id: room("chat_1")
            },
            ClientRequest::StopTyping {
                room_id: room("chat_1")
            },
        ]
    );
    let tokens: Vec<ClientToken> = sent[2..]
        .iter()
        .map(|request| match request {
            ClientRequest::SendMessage(message) => message.client_token,
            other => panic!("unexpected envelope: {other:?}"),
        })
        .collect();
    assert_eq!(tokens.len(), 2);

    // Echoes arrive in reverse order; tokens pair each with its own send.
    for (id, token) in [("m2", tokens[1]), ("m1", tokens[0])] {
        let mut echo = record(id, "chat_1", "staff-1", "same");
        echo.client_token = Some(token);
        harness
            .push(ServerEvent::MessageReceived {
                room_id: room("chat_1"),
                message: echo,
            })
            .await;
    }

    let messages = harness
        .wait_messages(|messages| messages.iter().all(ChatMessage::is_confirmed))
        .await;
    let ids: Vec<_> = messages.iter().filter_map(|m| m.id().cloned()).collect();
    assert_eq!(ids, vec![MessageId::new("m1"), MessageId::new("m2")]);
    assert_eq!(messages[0].client_token, Some(tokens[0]));
    assert!(harness.client.discard(local_id).await.is_err());
}

#[tokio::test]
async fn socket_rejection_marks_message_failed() {
    let mut harness = Harness::start(MockBackend::default(), SendRoute::Socket).await;
    harness.client.focus_room(room("chat_1")).await.expect("focus");
    harness.sent();

    let local_id = harness.client.send_text("buy followers").await.expect("send");
    let token = match harness.sent().pop() {
        Some(ClientRequest::SendMessage(message)) => message.client_token,
        other => panic!("expected send-message, got {other:?}"),
    };

    harness
        .push(ServerEvent::SendRejected {
            room_id: room("chat_1"),
            client_token: token,
            error: ApiError::new(ErrorCode::Validation, "message blocked"),
        })
        .await;

    let failed = harness
        .wait_for(|event| matches!(event, ClientEvent::SendFailed { .. }))
        .await;
    assert_eq!(
        failed,
        ClientEvent::SendFailed {
            room_id: room("chat_1"),
            local_id,
            reason: "message blocked".into(),
        }
    );
}

#[tokio::test]
async fn sending_without_focus_is_refused() {
    let harness = Harness::start(MockBackend::default(), SendRoute::Rest).await;

    assert_eq!(
        harness.client.send_text("hello?").await,
        Err(ChatError::NoFocusedRoom)
    );
    assert_eq!(
        harness.client.input_changed().await,
        Err(ChatError::NoFocusedRoom)
    );
}

#[tokio::test]
async fn history_for_abandoned_room_is_ignored() {
    let backend = MockBackend::default();
    backend
        .history
        .lock()
        .expect("lock")
        .insert(room("chat_1"), vec![record("m1", "chat_1", "u9", "old room")]);
    backend
        .history
        .lock()
        .expect("lock")
        .insert(room("chat_2"), vec![record("m2", "chat_2", "u3", "new room")]);
    let release_first = backend.gate_history("chat_1");
    let harness = Harness::start(backend, SendRoute::Rest).await;

    let client = harness.client.clone();
    let slow_focus = tokio::spawn(async move { client.focus_room(room("chat_1")).await });
    while !harness.backend.history_calls().contains(&room("chat_1")) {
        tokio::task::yield_now().await;
    }

    harness.client.focus_room(room("chat_2")).await.expect("focus");
    release_first.send(()).expect("release");
    slow_focus.await.expect("join").expect("stale fetch is not an error");

    let ids: Vec<_> = harness
        .client
        .messages()
        .await
        .iter()
        .filter_map(|m| m.id().cloned())
        .collect();
    assert_eq!(ids, vec![MessageId::new("m2")]);
}

#[tokio::test]
async fn history_failure_is_reported_and_refresh_recovers() {
    let backend = MockBackend::default();
    backend
        .failing_history
        .lock()
        .expect("lock")
        .insert(room("chat_9"));
    backend
        .history
        .lock()
        .expect("lock")
        .insert(room("chat_9"), vec![record("m1", "chat_9", "u9", "hi")]);
    let mut harness = Harness::start(backend, SendRoute::Rest).await;

    let err = harness
        .client
        .focus_room(room("chat_9"))
        .await
        .expect_err("history fails");
    assert!(matches!(err, ChatError::Fetch(_)));
    harness
        .wait_for(|event| matches!(event, ClientEvent::HistoryFailed { .. }))
        .await;
    assert_eq!(harness.client.focused_room().await, Some(room("chat_9")));

    harness.backend.failing_history.lock().expect("lock").clear();
    harness.client.refresh_history().await.expect("refresh");
    assert_eq!(harness.client.messages().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn stop_typing_is_sent_once_after_idle() {
    let mut harness = Harness::start(MockBackend::default(), SendRoute::Rest).await;
    harness.client.focus_room(room("chat_1")).await.expect("focus");
    harness.sent();

    harness.client.input_changed().await.expect("input");
    tokio::time::sleep(Duration::from_millis(1000)).await;
    harness.client.input_changed().await.expect("input");
    assert_eq!(
        harness.sent(),
        vec![ClientRequest::Typing {
            room_id: room("chat_1")
        }]
    );

    tokio::time::sleep(Duration::from_millis(1400)).await;
    assert!(harness.sent().is_empty(), "input 1.4s ago is still fresh");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        harness.sent(),
        vec![ClientRequest::StopTyping {
            room_id: room("chat_1")
        }]
    );

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(harness.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn remote_typing_expires_and_is_cleared_by_message() {
    let mut harness = Harness::start(MockBackend::default(), SendRoute::Rest).await;
    harness.client.focus_room(room("chat_1")).await.expect("focus");
    let nora = ParticipantId::new("u9");

    harness
        .push(ServerEvent::TypingStarted {
            room_id: room("chat_1"),
            participant_id: nora.clone(),
        })
        .await;
    harness
        .wait_for(|event| matches!(event, ClientEvent::RemoteTypingChanged { .. }))
        .await;
    assert_eq!(harness.client.remote_typing().await, vec![nora.clone()]);

    let started = tokio::time::Instant::now();
    let cleared = harness
        .wait_for(|event| matches!(event, ClientEvent::RemoteTypingChanged { .. }))
        .await;
    assert_eq!(
        cleared,
        ClientEvent::RemoteTypingChanged {
            room_id: room("chat_1"),
            typing: Vec::new(),
        }
    );
    assert!(started.elapsed() >= Duration::from_millis(2900));

    harness
        .push(ServerEvent::TypingStarted {
            room_id: room("chat_1"),
            participant_id: nora.clone(),
        })
        .await;
    harness
        .wait_for(|event| matches!(event, ClientEvent::RemoteTypingChanged { .. }))
        .await;
    harness
        .push(ServerEvent::MessageReceived {
            room_id: room("chat_1"),
            message: record("m1", "chat_1", "u9", "done typing"),
        })
        .await;
    let cleared = harness
        .wait_for(|event| matches!(event, ClientEvent::RemoteTypingChanged { .. }))
        .await;
    assert_eq!(
        cleared,
        ClientEvent::RemoteTypingChanged {
            room_id: room("chat_1"),
            typing: Vec::new(),
        }
    );
}

#[tokio::test]
async fn typing_in_unfocused_room_is_ignored() {
    let mut harness = Harness::start(MockBackend::default(), SendRoute::Rest).await;
    harness.client.focus_room(room("chat_1")).await.expect("focus");

    harness
        .push(ServerEvent::TypingStarted {
            room_id: room("chat_2"),
            participant_id: ParticipantId::new("u9"),
        })
        .await;
    harness
        .push(ServerEvent::Error(ApiError::new(ErrorCode::Internal, "marker")))
        .await;
    harness
        .wait_for(|event| matches!(event, ClientEvent::Error(_)))
        .await;

    assert!(harness.client.remote_typing().await.is_empty());
}

#[tokio::test]
async fn thread_list_keeps_newest_per_participant_and_counts_unread() {
    let backend = MockBackend::with_threads(vec![
        thread("chat_old", "u9", 0),
        thread("chat_b", "u3", 1),
        thread("chat_new", "u9", 5),
    ]);
    let mut harness = Harness::start(backend, SendRoute::Rest).await;

    let ids: Vec<_> = harness
        .client
        .threads()
        .await
        .iter()
        .map(|t| t.id.clone())
        .collect();
    assert_eq!(ids, vec![room("chat_new"), room("chat_b")]);

    harness
        .push(ServerEvent::MessageReceived {
            room_id: room("chat_b"),
            message: record("m9", "chat_b", "u3", "still available?"),
        })
        .await;
    let threads = harness
        .wait_threads(|threads| threads.first().is_some_and(|t| t.id == room("chat_b")))
        .await;
    assert_eq!(threads[0].unread_count, 1);
    assert_eq!(harness.client.total_unread().await, 1);
    assert_eq!(harness.client.filter_threads("AVAILABLE").await.len(), 1);

    harness.client.focus_room(room("chat_b")).await.expect("focus");
    assert_eq!(harness.client.total_unread().await, 0);
}

#[tokio::test]
async fn message_for_unknown_thread_fetches_it() {
    let backend = MockBackend::default();
    backend
        .single_threads
        .lock()
        .expect("lock")
        .insert(room("chat_z"), thread("chat_z", "u7", 20));
    let mut harness = Harness::start(backend, SendRoute::Rest).await;

    harness
        .push(ServerEvent::MessageReceived {
            room_id: room("chat_z"),
            message: record("m1", "chat_z", "u7", "first contact"),
        })
        .await;

    let threads = harness
        .wait_threads(|threads| threads.iter().any(|t| t.id == room("chat_z")))
        .await;
    assert_eq!(threads.len(), 1);
}

#[tokio::test]
async fn thread_update_push_keeps_known_product_context() {
    let mut lamp = thread("chat_1", "u9", 0);
    lamp.product_context = Some(ProductContext {
        product_id: Some("sku-1".into()),
        title: "Lamp".into(),
        image_url: None,
        price: Some(19.0),
    });
    let mut harness = Harness::start(MockBackend::with_threads(vec![lamp]), SendRoute::Rest).await;

    let mut update = thread("chat_1", "u9", 10);
    update.unread_count = 4;
    harness
        .push(ServerEvent::ThreadUpdated { thread: update })
        .await;

    let threads = harness
        .wait_threads(|threads| threads[0].unread_count == 4)
        .await;
    assert_eq!(
        threads[0].product_context.as_ref().map(|p| p.title.as_str()),
        Some("Lamp")
    );
}

#[tokio::test]
async fn contacts_open_new_thread_with_product_context() {
    let backend = MockBackend::with_threads(vec![thread("chat_1", "u9", 0)]);
    *backend.directory.lock().expect("lock") =
        vec![participant("u9", "Nora"), participant("u3", "Ilya")];
    let mut harness = Harness::start(backend, SendRoute::Rest).await;

    let contacts = harness.client.contacts().await;
    assert_eq!(contacts, vec![participant("u3", "Ilya")]);

    let product = ProductContext {
        product_id: Some("sku-7".into()),
        title: "Desk lamp".into(),
        image_url: None,
        price: Some(39.5),
    };
    let room_id = harness
        .client
        .open_thread_with(ParticipantId::new("u3"), Some(product))
        .await
        .expect("open");

    assert_eq!(room_id, room("chat_created"));
    assert_eq!(harness.client.focused_room().await, Some(room_id.clone()));
    assert!(harness.sent().contains(&ClientRequest::Join {
        room_id: room_id.clone()
    }));
    assert!(harness.client.contacts().await.is_empty());

    // An existing conversation is reused.
    let existing = harness
        .client
        .open_thread_with(ParticipantId::new("u9"), None)
        .await
        .expect("open existing");
    assert_eq!(existing, room("chat_1"));
    assert_eq!(harness.backend.created.lock().expect("lock").len(), 1);
}

#[tokio::test]
async fn directory_failure_still_loads_threads() {
    let backend = MockBackend::with_threads(vec![thread("chat_1", "u9", 0)]);
    *backend.directory.lock().expect("lock") = vec![participant("u3", "Ilya")];
    *backend.failing_directory.lock().expect("lock") = true;
    let harness = Harness::start(backend, SendRoute::Rest).await;

    harness
        .client
        .load_threads()
        .await
        .expect("threads load without directory");

    let ids: Vec<_> = harness
        .client
        .threads()
        .await
        .iter()
        .map(|t| t.id.clone())
        .collect();
    assert_eq!(ids, vec![room("chat_1")]);
    assert!(harness.client.contacts().await.is_empty());
}

#[tokio::test]
async fn rejected_credential_expires_session_on_start() {
    let (client, _peers) = client_with(Arc::new(MockBackend::default()), SendRoute::Rest, true);
    let mut events = client.subscribe_events();

    let err = client.start().await.expect_err("rejected");

    assert!(err.is_auth());
    assert!(matches!(
        wait_for(&mut events, |event| matches!(event, ClientEvent::SessionExpired(_))).await,
        ClientEvent::SessionExpired(_)
    ));
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
}
