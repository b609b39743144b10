//! One connection's lifecycle: `Connecting → Active → Closing → Closed`.

use std::{fmt::Display, pin::pin, sync::Arc};

use futures_util::{Stream, StreamExt};
use tokio::sync::{Notify, mpsc, watch};
use tracing::{error, info, warn};

use crate::error::ChatError;

use super::{
    ChatHub, ConnectionHandle, ConnectionId, Outbox, RoomId, ServerEvent, UserId,
    connection::{self, Channel, Frame},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    PeerClosed,
    ReadError,
    /// A delivery to this connection failed or its writer went away.
    Evicted,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub connection: ConnectionId,
    pub reason: CloseReason,
    pub sent: usize,
}

pub struct ChatSession {
    hub: Arc<ChatHub>,
    room: RoomId,
    user: UserId,
    display_name: String,
    handle: ConnectionHandle,
    sender: mpsc::Sender<Frame>,
    evicted: Arc<Notify>,
    state: SessionState,
}

/// Deregisters on drop, whether or not registration went through.
struct Registration {
    hub: Arc<ChatHub>,
    room: RoomId,
    connection: ConnectionId,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.hub.registry().deregister(self.room, self.connection);
    }
}

impl ChatSession {
    /// Fails with [`ChatError::NotAuthorized`] for non-participants; nothing
    /// is registered in that case.
    pub async fn connect(hub: Arc<ChatHub>, room: RoomId, user: UserId) -> Result<(Self, Outbox), ChatError> {
        hub.authorize(room, user).await?;
        let display_name = hub.display_name(user).await;

        let id = hub.next_connection_id();
        let Channel { sender, handle, outbox, evicted } = connection::channel(id, user, hub.limits().outbox_capacity);

        let session = Self {
            hub,
            room,
            user,
            display_name,
            handle,
            sender,
            evicted,
            state: SessionState::Connecting,
        };
        Ok((session, outbox))
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Drives the session until the peer leaves, a read fails, the hub shuts
    /// down or the connection is evicted. Backend failures end the session
    /// and are returned.
    pub async fn run<S, E>(mut self, inbound: S) -> Result<SessionSummary, ChatError>
    where
        S: Stream<Item = Result<String, E>>,
        E: Display,
    {
        let registration = Registration {
            hub: self.hub.clone(),
            room: self.room,
            connection: self.handle.id(),
        };

        let outcome = match self.hub.registry().register(self.room, &self.handle) {
            Ok(()) => {
                self.state = SessionState::Active;
                info!(
                    room_id = %self.room,
                    user_id = self.user,
                    connection_id = %self.handle.id(),
                    "session active"
                );
                self.read_loop(inbound).await
            }
            Err(e) => {
                error!(room_id = %self.room, connection_id = %self.handle.id(), error = %e, "registration refused");
                Err(e)
            }
        };

        self.state = SessionState::Closing;
        drop(registration);
        self.state = SessionState::Closed;

        match &outcome {
            Ok(summary) => info!(
                room_id = %self.room,
                user_id = self.user,
                connection_id = %summary.connection,
                reason = ?summary.reason,
                sent = summary.sent,
                "session closed"
            ),
            Err(e) => warn!(room_id = %self.room, user_id = self.user, error = %e, "session failed"),
        }
        outcome
    }

    async fn read_loop<S, E>(&self, inbound: S) -> Result<SessionSummary, ChatError>
    where
        S: Stream<Item = Result<String, E>>,
        E: Display,
    {
        let mut inbound = pin!(inbound);
        let mut shutdown = pin!(shutdown_requested(self.hub.subscribe_shutdown()));
        let mut sent = 0;

        let reason = loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break CloseReason::Shutdown,
                _ = self.evicted.notified() => break CloseReason::Evicted,
                frame = inbound.next() => match frame {
                    None => break CloseReason::PeerClosed,
                    Some(Err(e)) => {
                        warn!(connection_id = %self.handle.id(), error = %e, "read failed");
                        break CloseReason::ReadError;
                    }
                    // A stuck publish must not hold the session open.
                    Some(Ok(text)) => tokio::select! {
                        biased;
                        _ = &mut shutdown => break CloseReason::Shutdown,
                        _ = self.evicted.notified() => break CloseReason::Evicted,
                        accepted = self.handle_text(&text) => if accepted? {
                            sent += 1;
                        },
                    },
                },
            }
        };

        Ok(SessionSummary { connection: self.handle.id(), reason, sent })
    }

    /// `Ok(false)` when the payload was rejected but the session stays open.
    async fn handle_text(&self, text: &str) -> Result<bool, ChatError> {
        match self.hub.publish(self.room, self.user, &self.display_name, text).await {
            Ok(_) => Ok(true),
            Err(
                err @ (ChatError::PersistenceFailure(_)
                | ChatError::PayloadTooLarge { .. }
                | ChatError::NotAuthorized { .. }),
            ) => {
                warn!(room_id = %self.room, user_id = self.user, error = %err, "message rejected");
                self.reply(ServerEvent::error(&err));
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    fn reply(&self, event: ServerEvent) {
        if self.sender.try_send(Arc::new(event)).is_err() {
            warn!(connection_id = %self.handle.id(), "reply not delivered");
            self.handle.evict();
        }
    }
}

async fn shutdown_requested(mut shutdown: watch::Receiver<bool>) {
    let signalled = shutdown.wait_for(|stop| *stop).await.is_ok();
    if !signalled {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use std::{
        convert::Infallible,
        sync::atomic::{AtomicBool, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;
    use futures_util::stream;
    use tokio::task::JoinHandle;

    use super::*;
    use crate::{
        chat::connection,
        config::Limits,
        db,
        error::StoreError,
        store::{ChatMessage, MessageStore, SqliteStore},
    };

    /// Delegates to sqlite unless told to fail or hang.
    struct FlakyStore {
        inner: SqliteStore,
        failing: AtomicBool,
        stuck: AtomicBool,
        entered: Notify,
    }

    #[async_trait]
    impl MessageStore for FlakyStore {
        async fn append(&self, room_id: RoomId, sender_id: UserId, content: &str) -> Result<ChatMessage, StoreError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::Corrupt("disk on fire".into()));
            }
            if self.stuck.load(Ordering::SeqCst) {
                self.entered.notify_one();
                std::future::pending::<()>().await;
            }
            self.inner.append(room_id, sender_id, content).await
        }

        async fn list_ordered(&self, room_id: RoomId) -> Result<Vec<ChatMessage>, StoreError> {
            self.inner.list_ordered(room_id).await
        }
    }

    struct Fixture {
        hub: Arc<ChatHub>,
        store: SqliteStore,
        flaky: Arc<FlakyStore>,
        room: RoomId,
    }

    const ALICE: UserId = 1;
    const BOB: UserId = 2;
    const MALLORY: UserId = 3;

    async fn fixture(limits: Limits) -> Fixture {
        let store = SqliteStore::new(db::memory().await);
        store.upsert_user(ALICE, "Alice").await.unwrap();
        let room = store.create_conversation(ALICE, Some("r1"), true).await.unwrap().room_id;
        store.add_participant(room, BOB).await.unwrap();

        let flaky = Arc::new(FlakyStore {
            inner: store.clone(),
            failing: AtomicBool::new(false),
            stuck: AtomicBool::new(false),
            entered: Notify::new(),
        });
        let shared = Arc::new(store.clone());
        let hub = Arc::new(ChatHub::new(flaky.clone(), shared.clone(), shared, limits));
        Fixture { hub, store, flaky, room }
    }

    /// A live session fed from a channel, as a socket would.
    struct Client {
        input: mpsc::UnboundedSender<String>,
        outbox: Outbox,
        task: JoinHandle<Result<SessionSummary, ChatError>>,
    }

    impl Client {
        async fn open(hub: &Arc<ChatHub>, room: RoomId, user: UserId) -> Client {
            let (session, outbox) = ChatSession::connect(hub.clone(), room, user).await.unwrap();
            let id = session.connection().id();
            let (input, rx) = mpsc::unbounded_channel::<String>();
            let inbound = stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|text| (Ok::<_, Infallible>(text), rx))
            });
            let task = tokio::spawn(session.run(inbound));

            wait_until(|| hub.registry().room_of(id) == Some(room)).await;
            Client { input, outbox, task }
        }

        fn send(&self, text: &str) {
            self.input.send(text.to_owned()).unwrap();
        }

        async fn next(&mut self) -> ServerEvent {
            let frame = tokio::time::timeout(Duration::from_secs(2), self.outbox.recv())
                .await
                .expect("no frame")
                .expect("outbox closed");
            (*frame).clone()
        }

        async fn close(self) -> SessionSummary {
            let Client { input, outbox: _outbox, task } = self;
            drop(input);
            task.await.unwrap().unwrap()
        }
    }

    async fn wait_until(mut ready: impl FnMut() -> bool) {
        for _ in 0..200 {
            if ready() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never held");
    }

    fn content_of(event: ServerEvent) -> String {
        match event {
            ServerEvent::Message(message) => message.content,
            other => panic!("expected a message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn hello_reaches_both_participants() {
        let fx = fixture(Limits::default()).await;
        let mut alice = Client::open(&fx.hub, fx.room, ALICE).await;
        let mut bob = Client::open(&fx.hub, fx.room, BOB).await;

        alice.send("hello");

        let ServerEvent::Message(to_alice) = alice.next().await else { panic!("expected message") };
        let ServerEvent::Message(to_bob) = bob.next().await else { panic!("expected message") };
        assert_eq!(to_alice, to_bob);
        assert_eq!(to_bob.room_id, fx.room);
        assert_eq!(to_bob.sender_id, ALICE);
        assert_eq!(to_bob.sender_name, "Alice");
        assert_eq!(to_bob.content, "hello");

        let stored = fx.store.list_ordered(fx.room).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].message_id, to_bob.message_id);
        assert_eq!(stored[0].sent_at, to_bob.sent_at);

        assert_eq!(alice.close().await.sent, 1);
        bob.close().await;
    }

    #[tokio::test]
    async fn unknown_sender_gets_placeholder_name() {
        let fx = fixture(Limits::default()).await;
        let (session, _outbox) = ChatSession::connect(fx.hub.clone(), fx.room, BOB).await.unwrap();
        assert_eq!(session.display_name(), "User-2");
        assert_eq!(session.state(), SessionState::Connecting);
    }

    #[tokio::test]
    async fn outsiders_are_not_connected() {
        let fx = fixture(Limits::default()).await;
        let err = ChatSession::connect(fx.hub.clone(), fx.room, MALLORY).await.err().unwrap();
        assert!(matches!(err, ChatError::NotAuthorized { user: MALLORY, .. }));
        assert_eq!(fx.hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn disconnect_deregisters() {
        let fx = fixture(Limits::default()).await;
        let alice = Client::open(&fx.hub, fx.room, ALICE).await;

        let summary = alice.close().await;
        assert_eq!(summary.reason, CloseReason::PeerClosed);
        assert!(fx.hub.registry().list_connections(fx.room).is_empty());
        assert_eq!(fx.hub.room_count(), 0);
    }

    #[tokio::test]
    async fn read_error_closes_and_deregisters() {
        let fx = fixture(Limits::default()).await;
        let (session, _outbox) = ChatSession::connect(fx.hub.clone(), fx.room, ALICE).await.unwrap();
        let inbound = stream::iter(vec![Err::<String, _>("connection reset")]);

        let summary = session.run(inbound).await.unwrap();
        assert_eq!(summary.reason, CloseReason::ReadError);
        assert_eq!(fx.hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn persistence_failure_is_reported_and_not_broadcast() {
        let fx = fixture(Limits::default()).await;
        let mut alice = Client::open(&fx.hub, fx.room, ALICE).await;
        let mut bob = Client::open(&fx.hub, fx.room, BOB).await;

        fx.flaky.failing.store(true, Ordering::SeqCst);
        alice.send("lost");
        match alice.next().await {
            ServerEvent::Error { kind, .. } => assert_eq!(kind, "persistence_failure"),
            other => panic!("expected error, got {other:?}"),
        }

        fx.flaky.failing.store(false, Ordering::SeqCst);
        alice.send("retry");
        assert_eq!(content_of(alice.next().await), "retry");
        assert_eq!(content_of(bob.next().await), "retry");
        assert!(bob.outbox.try_recv().is_none());

        assert_eq!(fx.store.list_ordered(fx.room).await.unwrap().len(), 1);
        assert_eq!(alice.close().await.sent, 1);
        bob.close().await;
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected() {
        let fx = fixture(Limits { max_message_bytes: 4, ..Limits::default() }).await;
        let mut alice = Client::open(&fx.hub, fx.room, ALICE).await;

        alice.send("too long");
        match alice.next().await {
            ServerEvent::Error { kind, .. } => assert_eq!(kind, "payload_too_large"),
            other => panic!("expected error, got {other:?}"),
        }
        assert!(fx.store.list_ordered(fx.room).await.unwrap().is_empty());
        alice.close().await;
    }

    #[tokio::test]
    async fn messages_arrive_in_persistence_order() {
        let fx = fixture(Limits::default()).await;
        let mut alice = Client::open(&fx.hub, fx.room, ALICE).await;
        let mut bob = Client::open(&fx.hub, fx.room, BOB).await;

        for i in 0..10 {
            alice.send(&format!("a{i}"));
            bob.send(&format!("b{i}"));
        }

        let mut seen_by_alice = Vec::new();
        let mut seen_by_bob = Vec::new();
        for _ in 0..20 {
            seen_by_alice.push(content_of(alice.next().await));
            seen_by_bob.push(content_of(bob.next().await));
        }

        let stored: Vec<String> = fx.store.list_ordered(fx.room).await.unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(seen_by_alice, stored);
        assert_eq!(seen_by_bob, stored);

        let alice_own: Vec<_> = stored.iter().filter(|c| c.starts_with('a')).cloned().collect();
        assert_eq!(alice_own, (0..10).map(|i| format!("a{i}")).collect::<Vec<_>>());

        alice.close().await;
        bob.close().await;
    }

    #[tokio::test]
    async fn writer_gone_evicts_the_session() {
        let fx = fixture(Limits::default()).await;
        let mut alice = Client::open(&fx.hub, fx.room, ALICE).await;
        let bob = Client::open(&fx.hub, fx.room, BOB).await;

        // Bob's writer is gone but his socket has not reported it yet.
        let Client { input: _bob_input, outbox, task: bob_task } = bob;
        drop(outbox);

        alice.send("anyone?");
        assert_eq!(content_of(alice.next().await), "anyone?");

        let bob_summary = bob_task.await.unwrap().unwrap();
        assert_eq!(bob_summary.reason, CloseReason::Evicted);
        wait_until(|| fx.hub.connection_count() == 1).await;

        alice.close().await;
    }

    #[tokio::test]
    async fn full_queue_evicts_the_session() {
        let fx = fixture(Limits { outbox_capacity: 1, ..Limits::default() }).await;
        let mut alice = Client::open(&fx.hub, fx.room, ALICE).await;
        let bob = Client::open(&fx.hub, fx.room, BOB).await;
        // Bob's writer is alive but never drains.
        let Client { input: _bob_input, outbox: _bob_outbox, task: bob_task } = bob;

        alice.send("one");
        assert_eq!(content_of(alice.next().await), "one");
        assert_eq!(fx.hub.connection_count(), 2);

        alice.send("two");
        assert_eq!(content_of(alice.next().await), "two");

        let bob_summary = tokio::time::timeout(Duration::from_secs(2), bob_task)
            .await
            .expect("bob was not evicted")
            .unwrap()
            .unwrap();
        assert_eq!(bob_summary.reason, CloseReason::Evicted);
        wait_until(|| fx.hub.connection_count() == 1).await;

        alice.close().await;
    }

    #[tokio::test]
    async fn stalled_peer_does_not_delay_the_others() {
        let fx = fixture(Limits::default()).await;
        let stalled = connection::channel(fx.hub.next_connection_id(), BOB, 1);
        let mut fast = connection::channel(fx.hub.next_connection_id(), ALICE, 4);
        fx.hub.registry().register(fx.room, &stalled.handle).unwrap();
        fx.hub.registry().register(fx.room, &fast.handle).unwrap();

        for i in 0..3 {
            let content = format!("m{i}");
            let published = tokio::time::timeout(
                Duration::from_millis(500),
                fx.hub.publish(fx.room, ALICE, "Alice", &content),
            )
            .await
            .expect("publish waited on a stalled peer")
            .unwrap();

            let frame = fast.outbox.try_recv().expect("fast peer got nothing");
            assert_eq!(content_of((*frame).clone()), content);
            assert_eq!(published.report.delivered, if i == 0 { 2 } else { 1 });
        }

        tokio::time::timeout(Duration::from_secs(1), stalled.evicted.notified())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_interrupts_a_stuck_publish() {
        let fx = fixture(Limits::default()).await;
        let alice = Client::open(&fx.hub, fx.room, ALICE).await;

        fx.flaky.stuck.store(true, Ordering::SeqCst);
        alice.send("a");
        tokio::time::timeout(Duration::from_secs(2), fx.flaky.entered.notified())
            .await
            .unwrap();

        fx.hub.shutdown();
        let Client { input: _input, outbox: _outbox, task } = alice;
        let summary = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("session ignored shutdown")
            .unwrap()
            .unwrap();
        assert_eq!(summary.reason, CloseReason::Shutdown);
        assert_eq!(summary.sent, 0);
        assert_eq!(fx.hub.connection_count(), 0);

        // The abandoned publish gave the room back.
        fx.flaky.stuck.store(false, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(1), fx.hub.publish(fx.room, ALICE, "Alice", "b"))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn shutdown_closes_every_session() {
        let fx = fixture(Limits::default()).await;
        let alice = Client::open(&fx.hub, fx.room, ALICE).await;
        let bob = Client::open(&fx.hub, fx.room, BOB).await;

        fx.hub.shutdown();

        for client in [alice, bob] {
            let Client { input: _input, outbox: _outbox, task } = client;
            assert_eq!(task.await.unwrap().unwrap().reason, CloseReason::Shutdown);
        }
        assert_eq!(fx.hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn sessions_after_shutdown_close_at_once() {
        let fx = fixture(Limits::default()).await;
        fx.hub.shutdown();

        let (session, _outbox) = ChatSession::connect(fx.hub.clone(), fx.room, ALICE).await.unwrap();
        let summary = session.run(stream::pending::<Result<String, Infallible>>()).await.unwrap();
        assert_eq!(summary.reason, CloseReason::Shutdown);
        assert_eq!(fx.hub.connection_count(), 0);
    }
}
