/// Trainer inbox tests
/// Thread routing, summaries, unread counts and the shared cursor
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use coachlink_core::backend::{MessageBackend, RemoteMessage};
use coachlink_core::error::{ChatError, Result};
use coachlink_core::events::EventEmitter;
use coachlink_core::types::{DeliveryState, MessageId};
use coachlink_core::{Config, Role, Session, TrainerInbox};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;

const TRAINER: i64 = 10;

struct MockBackend {
    polls: Mutex<VecDeque<Vec<RemoteMessage>>>,
    sends: Mutex<VecDeque<RemoteMessage>>,
    send_calls: AtomicUsize,
    last_since: Mutex<Option<Option<DateTime<Utc>>>>,
}

impl MockBackend {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            polls: Mutex::new(VecDeque::new()),
            sends: Mutex::new(VecDeque::new()),
            send_calls: AtomicUsize::new(0),
            last_since: Mutex::new(None),
        })
    }

    async fn queue_poll(&self, messages: Vec<RemoteMessage>) {
        self.polls.lock().await.push_back(messages);
    }

    async fn queue_send(&self, remote: RemoteMessage) {
        self.sends.lock().await.push_back(remote);
    }
}

#[async_trait]
impl MessageBackend for MockBackend {
    async fn fetch_conversation(&self, _trainer_id: i64) -> Result<Vec<RemoteMessage>> {
        Ok(Vec::new())
    }

    async fn fetch_messages_since(
        &self,
        _trainer_id: i64,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteMessage>> {
        *self.last_since.lock().await = Some(since);
        Ok(self.polls.lock().await.pop_front().unwrap_or_default())
    }

    async fn send_message(
        &self,
        _sender_id: i64,
        _receiver_id: i64,
        _text: &str,
    ) -> Result<RemoteMessage> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        match self.sends.lock().await.pop_front() {
            Some(remote) => Ok(remote),
            None => Err(ChatError::Api {
                status: 500,
                body: "send failed".to_string(),
            }),
        }
    }
}

fn remote(id: i64, sender: i64, receiver: i64, text: &str, secs: i64, read: bool) -> RemoteMessage {
    RemoteMessage {
        id,
        sender_id: sender,
        receiver_id: receiver,
        text: text.to_string(),
        timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
        read,
    }
}

fn inbox(backend: Arc<MockBackend>) -> TrainerInbox<MockBackend> {
    let config = Config {
        poll_interval: Duration::from_millis(50),
        send_grace: Duration::from_millis(30),
        ..Default::default()
    };
    let session = Session::new(TRAINER, Role::Trainer, "test-token");
    TrainerInbox::new(backend, session, &config, EventEmitter::new(0))
}

#[tokio::test]
async fn test_records_route_to_client_threads() {
    let backend = MockBackend::new();
    let inbox = inbox(backend.clone());

    backend
        .queue_poll(vec![
            remote(1, 3, TRAINER, "from client 3", 100, false),
            remote(2, 4, TRAINER, "from client 4", 110, false),
            // Our own reply routes to the client's thread, not a "10" thread
            remote(3, TRAINER, 3, "reply to 3", 120, true),
        ])
        .await;

    let merged = inbox.initialize(None).await.unwrap();
    assert_eq!(merged, 3);
    assert_eq!(inbox.thread_count().await, 2);
    assert_eq!(inbox.total_messages().await, 3);

    let thread = inbox.history(3, None).await;
    assert_eq!(thread.len(), 2);
    assert_eq!(thread[0].text, "from client 3");
    assert_eq!(thread[1].text, "reply to 3");
}

#[tokio::test]
async fn test_summaries_order_and_unread_counts() {
    let backend = MockBackend::new();
    let inbox = inbox(backend.clone());

    backend
        .queue_poll(vec![
            remote(1, 3, TRAINER, "needs reply", 100, false),
            remote(2, 3, TRAINER, "still waiting", 150, false),
            remote(3, 4, TRAINER, "all read", 200, true),
        ])
        .await;
    inbox.initialize(None).await.unwrap();

    let summaries = inbox.summaries().await;
    assert_eq!(summaries.len(), 2);

    // Newest activity first
    assert_eq!(summaries[0].peer_id, 4);
    assert_eq!(summaries[0].unread, 0);
    assert_eq!(summaries[0].last_preview, "all read");

    assert_eq!(summaries[1].peer_id, 3);
    assert_eq!(summaries[1].unread, 2);
    assert_eq!(summaries[1].last_preview, "still waiting");
}

#[tokio::test]
async fn test_cursor_is_shared_across_threads() {
    let backend = MockBackend::new();
    let inbox = inbox(backend.clone());

    backend
        .queue_poll(vec![
            remote(1, 3, TRAINER, "a", 100, false),
            remote(2, 4, TRAINER, "b", 250, false),
        ])
        .await;
    inbox.initialize(None).await.unwrap();
    assert_eq!(
        inbox.watermark().await,
        Some(Utc.timestamp_opt(250, 0).unwrap())
    );

    // The next poll resumes from the global high-water mark
    backend.queue_poll(Vec::new()).await;
    inbox.poll().await.unwrap();
    assert_eq!(
        *backend.last_since.lock().await,
        Some(Some(Utc.timestamp_opt(250, 0).unwrap()))
    );
}

#[tokio::test]
async fn test_duplicate_records_merge_once_across_polls() {
    let backend = MockBackend::new();
    let inbox = inbox(backend.clone());

    let record = remote(7, 3, TRAINER, "hello", 100, false);
    backend.queue_poll(vec![record.clone()]).await;
    backend.queue_poll(vec![record]).await;

    assert_eq!(inbox.initialize(None).await.unwrap(), 1);
    assert_eq!(inbox.poll().await.unwrap(), 0);
    assert_eq!(inbox.total_messages().await, 1);
}

#[tokio::test]
async fn test_send_converges_to_single_confirmed_entry() {
    let backend = MockBackend::new();
    let inbox = inbox(backend.clone());

    backend
        .queue_send(remote(20, TRAINER, 3, "see you at 6", 300, false))
        .await;
    let temp_id = inbox.send(3, "see you at 6").await.unwrap();
    assert_eq!(
        inbox.delivery_of(temp_id).await,
        Some(DeliveryState::Sent)
    );

    sleep(Duration::from_millis(120)).await;

    let thread = inbox.history(3, None).await;
    assert_eq!(thread.len(), 1);
    assert_eq!(thread[0].id, MessageId::Server(20));

    // The poll echoing the record back is absorbed by the known-id skip
    backend
        .queue_poll(vec![remote(20, TRAINER, 3, "see you at 6", 300, false)])
        .await;
    assert_eq!(inbox.poll().await.unwrap(), 0);
    assert_eq!(inbox.history(3, None).await.len(), 1);
}

#[tokio::test]
async fn test_failed_send_stays_in_thread() {
    let backend = MockBackend::new();
    let inbox = inbox(backend.clone());

    // No scripted send: rejected
    inbox.send(3, "lost").await.unwrap();

    let thread = inbox.history(3, None).await;
    assert_eq!(thread.len(), 1);
    assert_eq!(thread[0].delivery, DeliveryState::Failed);
    assert_eq!(backend.send_calls.load(Ordering::SeqCst), 1);

    // An unrelated refresh leaves the failed entry alone
    backend
        .queue_poll(vec![remote(8, 3, TRAINER, "are you there?", 400, false)])
        .await;
    inbox.poll().await.unwrap();
    let thread = inbox.history(3, None).await;
    assert_eq!(thread.len(), 2);
    assert!(thread.iter().any(|m| m.delivery == DeliveryState::Failed));
}

#[tokio::test]
async fn test_empty_send_is_rejected() {
    let backend = MockBackend::new();
    let inbox = inbox(backend.clone());

    assert!(matches!(
        inbox.send(3, "  ").await,
        Err(ChatError::EmptyMessage)
    ));
    assert_eq!(inbox.thread_count().await, 0);
    assert_eq!(backend.send_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_history_limit_returns_tail() {
    let backend = MockBackend::new();
    let inbox = inbox(backend.clone());

    backend
        .queue_poll(vec![
            remote(1, 3, TRAINER, "one", 100, true),
            remote(2, 3, TRAINER, "two", 200, true),
            remote(3, 3, TRAINER, "three", 300, true),
        ])
        .await;
    inbox.initialize(None).await.unwrap();

    let tail = inbox.history(3, Some(2)).await;
    assert_eq!(tail.len(), 2);
    assert_eq!(tail[0].text, "two");
    assert_eq!(tail[1].text, "three");

    assert!(inbox.history(99, Some(2)).await.is_empty());
}

#[tokio::test]
async fn test_scheduled_polling_and_teardown() {
    let backend = MockBackend::new();
    let inbox = inbox(backend.clone());

    backend
        .queue_poll(vec![remote(1, 3, TRAINER, "tick", 100, false)])
        .await;

    inbox.start_polling().await;
    sleep(Duration::from_millis(80)).await;
    inbox.stop_polling().await;
    inbox.stop_polling().await;

    assert_eq!(inbox.total_messages().await, 1);
}
